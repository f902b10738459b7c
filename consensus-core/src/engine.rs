//! The round state machine.
//!
//! Implements the Tendermint agreement rules: Propose → Prevote → Precommit,
//! with locking on prevote quorums, valid-value tracking for later proposers,
//! and commit on a precommit quorum from any round of the height.
//!
//! The core is single-threaded and deterministic: given the same sequence of
//! events and the same backend answers it makes the same transitions and asks
//! the backend for the same broadcasts and commits. Own votes are recorded
//! locally as soon as they are signed, so quorum checks never wait for the
//! network to echo them back.

use {
    crate::{
        backend::ConsensusBackend,
        committee::Committee,
        config::BftConfig,
        error::{CoreError, Result},
        evidence::{Equivocation, EvidenceCollector},
        message::{
            committed_seal_payload, AuthenticatedEnvelope, Codec, ConsensusPayload, Envelope,
            MessageKind, Proposal, Vote,
        },
        message_log::{HeightMessageLog, RoundMessageSet, VoteKind, VoteStatus},
        timeout::{TimeoutEvent, TimeoutKind, TimeoutScheduler, TimerHandle},
        types::{ConsensusState, ConsensusStep, ProposedBlock, RoundValue, RoundView},
    },
    log::*,
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::collections::BTreeMap,
};

/// Input to the core. Produced by the network, the timer thread and the
/// commit collaborator; consumed on the consensus thread only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// Signed envelope bytes from a peer.
    Message(Vec<u8>),
    Timeout(TimeoutEvent),
    /// The chain applied `block`; move to the next height.
    CommitConfirmed(ProposedBlock),
}

/// Tendermint agreement core for one replica.
pub struct ConsensusCore<B> {
    config: BftConfig,
    codec: Codec,
    backend: B,
    identity: Pubkey,
    committee: Committee,
    state: ConsensusState,
    messages: HeightMessageLog,
    timeouts: TimeoutScheduler,
    evidence: EvidenceCollector,
    /// Decoded but unauthenticated envelopes for upcoming heights.
    backlog: BTreeMap<u64, Vec<(Envelope, ConsensusPayload)>>,
    backlog_len: usize,
    started: bool,
}

impl<B: ConsensusBackend> ConsensusCore<B> {
    /// Create a core positioned at `last_committed_height + 1`. Nothing is
    /// sent until [`start`](Self::start).
    pub fn new(config: BftConfig, backend: B, last_committed_height: u64) -> Result<Self> {
        config.validate()?;
        let height = last_committed_height.saturating_add(1);
        let committee = backend.committee_for_height(height)?;
        let identity = backend.address();
        if !committee.contains(&identity) {
            info!("{identity} is not in the committee for height {height}; running as observer");
        }

        Ok(Self {
            codec: Codec::new(&config),
            timeouts: TimeoutScheduler::new(config.clone()),
            messages: HeightMessageLog::new(height, committee.quorum()),
            state: ConsensusState::new(height),
            evidence: EvidenceCollector::new(),
            backlog: BTreeMap::new(),
            backlog_len: 0,
            started: false,
            config,
            backend,
            identity,
            committee,
        })
    }

    /// Deliver timeouts through a timer thread instead of only recording them.
    pub fn with_timer(mut self, timer: TimerHandle) -> Self {
        self.timeouts.attach(timer);
        self
    }

    /// Enter round 0 of the current height.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        info!("Starting consensus for height {}", self.state.height);
        self.start_round(0);
    }

    pub fn handle_event(&mut self, event: ConsensusEvent) -> Result<()> {
        let result = match event {
            ConsensusEvent::Message(bytes) => self.handle_message(&bytes),
            ConsensusEvent::Timeout(timeout) => self.handle_timeout(timeout),
            ConsensusEvent::CommitConfirmed(block) => self.handle_commit_confirmed(block),
        };
        self.retry_commit();
        result
    }

    /// Decode, authenticate and apply one envelope.
    pub fn handle_message(&mut self, bytes: &[u8]) -> Result<()> {
        let (envelope, payload) = self.codec.decode(bytes).map_err(|err| {
            debug!("Dropping malformed message: {err}");
            err
        })?;

        let height = payload.height();
        if height < self.state.height {
            debug!(
                "Dropping {} for past height {height} (current {})",
                envelope.kind, self.state.height
            );
            return Err(CoreError::StaleEvent {
                height,
                round: payload.round(),
            });
        }
        if height > self.state.height {
            return self.backlog_message(envelope, payload);
        }

        let (kind, sender) = (envelope.kind, envelope.sender);
        let message = self
            .codec
            .authenticate(envelope, payload, &self.committee)
            .map_err(|err| {
                warn!("Rejecting {kind} from {sender}: {err}");
                err
            })?;
        self.process(message)
    }

    pub fn handle_timeout(&mut self, event: TimeoutEvent) -> Result<()> {
        let stale = CoreError::StaleEvent {
            height: event.height,
            round: event.round,
        };
        if !self.timeouts.take_if_live(&event)
            || event.height != self.state.height
            || event.round != self.state.round
            || self.state.step == ConsensusStep::Commit
        {
            debug!(
                "Dropping stale {:?} timeout for h={} r={}",
                event.kind, event.height, event.round
            );
            return Err(stale);
        }
        if let Some(step) = event.kind.required_step() {
            if self.state.step != step {
                debug!(
                    "Dropping {:?} timeout at h={} r={}: already in {}",
                    event.kind, event.height, event.round, self.state.step
                );
                return Err(stale);
            }
        }

        match event.kind {
            TimeoutKind::Propose => {
                info!(
                    "Propose timeout at h={} r={}, prevoting nil",
                    event.height, event.round
                );
                self.prevote(None);
            }
            TimeoutKind::Prevote => {
                info!(
                    "Prevote timeout at h={} r={}, precommitting nil",
                    event.height, event.round
                );
                self.precommit(None);
            }
            TimeoutKind::Precommit => {
                info!(
                    "Precommit timeout at h={} r={}, moving to next round",
                    event.height, event.round
                );
                self.start_round(event.round.saturating_add(1));
                return Ok(());
            }
        }
        self.evaluate_current_round();
        Ok(())
    }

    /// The chain applied `block`. Advances to the next height whether or not
    /// the block was decided locally (a node that synced it also moves on).
    pub fn handle_commit_confirmed(&mut self, block: ProposedBlock) -> Result<()> {
        if block.height != self.state.height {
            debug!(
                "Ignoring commit confirmation for height {} at height {}",
                block.height, self.state.height
            );
            return Err(CoreError::StaleEvent {
                height: block.height,
                round: self.state.round,
            });
        }
        let hash = block.hash();
        if let Some(decision) = &self.state.decision {
            if decision.block.hash() != hash {
                warn!(
                    "Confirmed block {hash} differs from decided block {} at height {}",
                    decision.block.hash(),
                    block.height
                );
            }
        }

        info!("Block {hash} committed at height {}", block.height);
        self.advance_height(block.height);
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn height(&self) -> u64 {
        self.state.height
    }

    pub fn round(&self) -> u32 {
        self.state.round
    }

    pub fn step(&self) -> ConsensusStep {
        self.state.step
    }

    pub fn view(&self) -> RoundView {
        self.state.view()
    }

    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    pub fn config(&self) -> &BftConfig {
        &self.config
    }

    pub fn identity(&self) -> &Pubkey {
        &self.identity
    }

    pub fn committee(&self) -> &Committee {
        &self.committee
    }

    pub fn message_log(&self) -> &HeightMessageLog {
        &self.messages
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.timeouts
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn evidence(&self) -> &EvidenceCollector {
        &self.evidence
    }

    pub fn drain_evidence(&mut self) -> Vec<Equivocation> {
        self.evidence.drain_evidence()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog_len
    }

    /// Whether this node votes at the current height.
    pub fn is_voter(&self) -> bool {
        self.committee.contains(&self.identity)
    }

    // ── Height and round transitions ────────────────────────────────────────

    fn advance_height(&mut self, committed_height: u64) {
        let height = committed_height.saturating_add(1);
        match self.backend.committee_for_height(height) {
            Ok(committee) => self.committee = committee,
            Err(err) => {
                error!("Failed to load committee for height {height}, keeping previous: {err}")
            }
        }

        self.state = ConsensusState::new(height);
        self.messages = HeightMessageLog::new(height, self.committee.quorum());
        self.timeouts.cancel_all();
        self.evidence
            .prune(height.saturating_sub(self.config.evidence_retention_heights));

        info!("Starting consensus for height {height}");
        self.start_round(0);
        self.replay_backlog();
    }

    fn start_round(&mut self, round: u32) {
        let height = self.state.height;
        if round > self.config.max_round {
            warn!(
                "Round {round} at height {height} exceeds max_round {}, peers will drop it",
                self.config.max_round
            );
        }

        self.state.advance_round(round);
        self.timeouts.cancel_all();

        let proposer = self.committee.proposer(round).address;
        info!("Starting round {round} at height {height}, proposer {proposer}");
        if proposer == self.identity {
            self.propose(round);
        } else {
            self.timeouts.schedule(TimeoutKind::Propose, height, round);
        }

        // Messages for this round may have arrived while it was in the future.
        self.evaluate_current_round();
    }

    fn propose(&mut self, round: u32) {
        let height = self.state.height;
        let (block, valid_round) = match &self.state.valid {
            Some(valid) => (valid.block.clone(), Some(valid.round)),
            None => match self.backend.candidate_block(height) {
                Ok(block) => (block, None),
                Err(err) => {
                    error!("Failed to build a block for h={height} r={round}: {err}");
                    self.timeouts.schedule(TimeoutKind::Propose, height, round);
                    return;
                }
            },
        };

        info!(
            "Proposing block {} at h={height} r={round} (valid round {valid_round:?})",
            block.hash()
        );
        let payload = ConsensusPayload::Proposal(Proposal {
            height,
            round,
            valid_round,
            block,
        });
        match self.sign_and_broadcast(payload, None) {
            Some(message) => {
                self.state.sent_proposal = true;
                self.messages.get_or_create(round).set_proposal(message);
            }
            None => {
                self.timeouts.schedule(TimeoutKind::Propose, height, round);
            }
        }
    }

    // ── Inbound messages ────────────────────────────────────────────────────

    fn backlog_message(&mut self, envelope: Envelope, payload: ConsensusPayload) -> Result<()> {
        let height = payload.height();
        let current = self.state.height;
        if height > current.saturating_add(self.config.future_height_backlog) {
            debug!(
                "Dropping {} for height {height}, too far ahead of {current}",
                envelope.kind
            );
            return Err(CoreError::FutureHeight { height, current });
        }
        if self.backlog_len >= self.config.max_backlog_messages {
            debug!("Backlog full, dropping {} for height {height}", envelope.kind);
            return Err(CoreError::BacklogFull(self.backlog_len));
        }

        trace!("Backlogging {} from {} for height {height}", envelope.kind, envelope.sender);
        self.backlog
            .entry(height)
            .or_default()
            .push((envelope, payload));
        self.backlog_len = self.backlog_len.saturating_add(1);
        Ok(())
    }

    /// Authenticate and apply messages buffered for the new height; drop
    /// anything left over for heights already passed.
    fn replay_backlog(&mut self) {
        let height = self.state.height;
        self.backlog = self.backlog.split_off(&height);
        let ready = self.backlog.remove(&height).unwrap_or_default();
        self.backlog_len = self.backlog.values().map(Vec::len).sum();
        if ready.is_empty() {
            return;
        }

        debug!("Replaying {} backlogged messages for height {height}", ready.len());
        for (envelope, payload) in ready {
            let (kind, sender) = (envelope.kind, envelope.sender);
            match self.codec.authenticate(envelope, payload, &self.committee) {
                Ok(message) => {
                    if let Err(err) = self.process(message) {
                        debug!("Backlogged {kind} from {sender} rejected: {err}");
                    }
                }
                Err(err) => warn!("Dropping backlogged {kind} from {sender}: {err}"),
            }
        }
    }

    fn process(&mut self, message: AuthenticatedEnvelope) -> Result<()> {
        let round = message.round();
        match message.kind() {
            MessageKind::Proposal => self.on_proposal(message)?,
            MessageKind::Prevote => self.on_vote(VoteKind::Prevote, message),
            MessageKind::Precommit => self.on_vote(VoteKind::Precommit, message),
        }
        self.evaluate(round);
        Ok(())
    }

    fn on_proposal(&mut self, message: AuthenticatedEnvelope) -> Result<()> {
        let round = message.round();
        let sender = *message.sender();
        if !self.committee.is_proposer(&sender, round) {
            warn!(
                "Proposal from {sender} at h={} r={round}, expected proposer {}",
                self.state.height,
                self.committee.proposer(round).address
            );
            return Err(CoreError::NotFromProposer { sender, round });
        }

        if self.messages.get_or_create(round).set_proposal(message) {
            debug!(
                "Stored proposal from {sender} at h={} r={round}",
                self.state.height
            );
        } else {
            debug!(
                "Ignoring additional proposal from {sender} at h={} r={round}",
                self.state.height
            );
        }
        Ok(())
    }

    fn on_vote(&mut self, kind: VoteKind, message: AuthenticatedEnvelope) {
        let round = message.round();
        let sender = *message.sender();
        let set = self.messages.get_or_create(round);
        let outcome = match kind {
            VoteKind::Prevote => set.add_prevote(message),
            VoteKind::Precommit => set.add_precommit(message),
        };

        match outcome.status {
            VoteStatus::Counted => trace!(
                "{kind:?} from {sender} at h={} r={round}: {}/{} power for its value",
                self.state.height,
                outcome.power,
                self.committee.total_power()
            ),
            VoteStatus::Duplicate => {
                trace!("Duplicate {kind:?} from {sender} at r={round}")
            }
            VoteStatus::Equivocation(evidence) => {
                warn!(
                    "Equivocation by {} at h={} r={}: {}",
                    evidence.offender, evidence.height, evidence.round, evidence.kind
                );
                self.evidence.record(*evidence);
            }
        }
    }

    // ── Upon rules ──────────────────────────────────────────────────────────

    /// Re-check the rules a message at `round` can trigger. Old rounds feed
    /// the commit rule and valid-round look-back; future rounds stay inert
    /// until the core reaches them.
    fn evaluate(&mut self, round: u32) {
        if !self.started {
            return;
        }
        self.try_decide(round);
        if round <= self.state.round {
            self.evaluate_current_round();
        }
    }

    fn evaluate_current_round(&mut self) {
        if self.state.step == ConsensusStep::Commit {
            return;
        }
        let (height, round) = (self.state.height, self.state.round);

        if self.state.step == ConsensusStep::Propose {
            self.try_prevote_proposal(round);
        }

        if self.state.step == ConsensusStep::Prevote
            && !self.state.prevote_timeout_scheduled
            && self.round_has(round, |set| set.any_quorum(VoteKind::Prevote))
        {
            self.state.prevote_timeout_scheduled = true;
            self.timeouts.schedule(TimeoutKind::Prevote, height, round);
        }

        if self.state.step >= ConsensusStep::Prevote && !self.state.polka_observed {
            self.try_polka(round);
        }

        if self.state.step == ConsensusStep::Prevote
            && self.round_has(round, |set| set.nil_quorum(VoteKind::Prevote))
        {
            info!("Nil prevote quorum at h={height} r={round}");
            self.precommit(None);
        }

        if !self.state.precommit_timeout_scheduled
            && self.round_has(round, |set| set.any_quorum(VoteKind::Precommit))
        {
            self.state.precommit_timeout_scheduled = true;
            self.timeouts.schedule(TimeoutKind::Precommit, height, round);
        }

        self.try_decide(round);
    }

    fn round_has(&self, round: u32, check: impl Fn(&RoundMessageSet) -> bool) -> bool {
        self.messages.get(round).is_some_and(check)
    }

    /// Prevote on the round's proposal, applying the locking rule.
    fn try_prevote_proposal(&mut self, round: u32) {
        let Some((block_hash, valid_round)) = self
            .messages
            .get(round)
            .and_then(RoundMessageSet::proposal)
            .map(|proposal| (proposal.block.hash(), proposal.valid_round))
        else {
            return;
        };

        if !self.proposal_verified(round) {
            info!(
                "Proposal {block_hash} at h={} r={round} failed verification, prevoting nil",
                self.state.height
            );
            self.prevote(None);
            return;
        }

        let locked = self
            .state
            .locked
            .as_ref()
            .map(|locked| (locked.round, locked.block.hash()));
        let acceptable = match valid_round {
            None => locked.map_or(true, |(_, locked_hash)| locked_hash == block_hash),
            Some(valid_round) => {
                let quorum_at_valid_round = self
                    .messages
                    .get(valid_round)
                    .and_then(|set| set.quorum_hash(VoteKind::Prevote));
                if quorum_at_valid_round != Some(block_hash) {
                    debug!(
                        "Proposal at r={round} cites valid round {valid_round} without a quorum"
                    );
                    return;
                }
                locked.map_or(true, |(locked_round, locked_hash)| {
                    locked_round <= valid_round || locked_hash == block_hash
                })
            }
        };

        if !acceptable {
            debug!(
                "Locked on a different value at r={:?}, prevoting nil against {block_hash}",
                self.state.locked_round()
            );
        }
        self.prevote(acceptable.then_some(block_hash));
    }

    /// Lock and precommit once a prevote quorum names the round's verified
    /// proposal. Also records it as the valid value.
    fn try_polka(&mut self, round: u32) {
        let Some(set) = self.messages.get(round) else {
            return;
        };
        let Some(block_hash) = set.quorum_hash(VoteKind::Prevote) else {
            return;
        };
        let Some(block) = set.proposal().map(|proposal| proposal.block.clone()) else {
            return;
        };
        if block.hash() != block_hash || !self.proposal_verified(round) {
            return;
        }

        info!(
            "Prevote quorum for {block_hash} at h={} r={round}",
            self.state.height
        );
        self.state.polka_observed = true;
        if self.state.step == ConsensusStep::Prevote {
            self.state.locked = Some(RoundValue {
                round,
                block: block.clone(),
            });
            self.precommit(Some(block_hash));
        }
        self.state.valid = Some(RoundValue { round, block });
    }

    /// Decide if `round` holds a precommit quorum for its proposal.
    fn try_decide(&mut self, round: u32) {
        if self.state.decision.is_some() {
            return;
        }
        let Some(set) = self.messages.get(round) else {
            return;
        };
        let Some(block_hash) = set.quorum_hash(VoteKind::Precommit) else {
            return;
        };
        let Some(block) = set.proposal().map(|proposal| proposal.block.clone()) else {
            debug!("Precommit quorum for {block_hash} at r={round}, waiting for its proposal");
            return;
        };
        if block.hash() != block_hash {
            debug!("Precommit quorum for {block_hash} at r={round} differs from the proposal");
            return;
        }
        if !self.proposal_verified(round) {
            error!(
                "Precommit quorum for {block_hash} at h={} r={round} on an invalid block",
                self.state.height
            );
            return;
        }

        info!(
            "Decided block {block_hash} at h={} r={round}",
            self.state.height
        );
        self.state.decision = Some(RoundValue { round, block });
        self.state.step = ConsensusStep::Commit;
        self.timeouts.cancel_all();
        self.retry_commit();
    }

    /// Hand the decision to the chain, unless it already accepted it.
    fn retry_commit(&mut self) {
        if self.state.commit_requested {
            return;
        }
        let Some(decision) = &self.state.decision else {
            return;
        };
        let seals = self
            .messages
            .get(decision.round)
            .map(|set| set.committed_seals(&decision.block.hash()))
            .unwrap_or_default();
        match self.backend.commit(&decision.block, decision.round, seals) {
            Ok(()) => self.state.commit_requested = true,
            Err(err) => error!(
                "Commit of block at height {} failed, retrying on next event: {err}",
                decision.block.height
            ),
        }
    }

    /// Cached external verification of the round's proposal.
    fn proposal_verified(&mut self, round: u32) -> bool {
        let Some(set) = self.messages.get(round) else {
            return false;
        };
        if let Some(verified) = set.proposal_verified() {
            return verified;
        }
        let Some(proposal) = set.proposal() else {
            return false;
        };

        let verified = if proposal.block.height != proposal.height {
            warn!(
                "Proposal at r={round} carries a block for height {} at height {}",
                proposal.block.height, proposal.height
            );
            false
        } else {
            match self.backend.verify_proposal(&proposal.block) {
                Ok(elapsed) => {
                    debug!("Verified proposal at r={round} in {elapsed:?}");
                    true
                }
                Err(err) => {
                    warn!("Proposal at h={} r={round} rejected: {err}", proposal.height);
                    false
                }
            }
        };
        if let Some(set) = self.messages.get_mut(round) {
            set.set_proposal_verified(verified);
        }
        verified
    }

    // ── Outbound messages ───────────────────────────────────────────────────

    fn prevote(&mut self, block_hash: Option<Hash>) {
        let (height, round) = (self.state.height, self.state.round);
        self.state.sent_prevote = true;
        self.state.step = ConsensusStep::Prevote;
        debug!("Prevote {block_hash:?} at h={height} r={round}");

        let payload = ConsensusPayload::Prevote(Vote {
            height,
            round,
            block_hash,
        });
        if let Some(message) = self.sign_and_broadcast(payload, None) {
            self.messages.get_or_create(round).add_prevote(message);
        }
    }

    fn precommit(&mut self, block_hash: Option<Hash>) {
        let (height, round) = (self.state.height, self.state.round);
        self.state.sent_precommit = true;
        self.state.step = ConsensusStep::Precommit;
        debug!("Precommit {block_hash:?} at h={height} r={round}");

        let seal = match block_hash {
            Some(hash) if self.is_voter() => {
                match self.sign_seal(height, round, &hash) {
                    Some(seal) => Some(seal),
                    None => return,
                }
            }
            _ => None,
        };
        let payload = ConsensusPayload::Precommit(Vote {
            height,
            round,
            block_hash,
        });
        if let Some(message) = self.sign_and_broadcast(payload, seal) {
            self.messages.get_or_create(round).add_precommit(message);
        }
    }

    fn sign_seal(&self, height: u64, round: u32, hash: &Hash) -> Option<Signature> {
        self.backend
            .sign(&committed_seal_payload(height, round, hash))
            .map_err(|err| warn!("Failed to seal precommit at h={height} r={round}: {err}"))
            .ok()
    }

    /// Sign `payload`, gossip it and return it for local recording. Observers
    /// and signing failures send nothing.
    fn sign_and_broadcast(
        &self,
        payload: ConsensusPayload,
        committed_seal: Option<Signature>,
    ) -> Option<AuthenticatedEnvelope> {
        let kind = payload.kind();
        let power = self.committee.power_of(&self.identity);
        if power == 0 {
            trace!("Observer, not sending {kind}");
            return None;
        }

        let envelope = Envelope::new_signed::<_, CoreError>(
            &payload,
            self.identity,
            committed_seal,
            |bytes| Ok(self.backend.sign(bytes)?),
        )
        .and_then(|envelope| Ok((envelope.encode()?, envelope)));
        let (bytes, envelope) = match envelope {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    "Failed to sign {kind} at h={} r={}: {err}",
                    payload.height(),
                    payload.round()
                );
                return None;
            }
        };

        if let Err(err) = self.backend.broadcast(&self.committee, bytes) {
            warn!("Failed to broadcast {kind}: {err}");
        }
        Some(AuthenticatedEnvelope::local(envelope, payload, power))
    }
}
