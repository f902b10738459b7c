//! Per-round and per-height message storage with power aggregation.
//!
//! A [`VoteSet`] counts at most one vote per sender and keeps running power
//! totals per value, so quorum checks never rescan the votes. A
//! [`RoundMessageSet`] holds the proposal and both vote sets of one round;
//! the [`HeightMessageLog`] keeps every round seen at the current height and
//! is dropped wholesale when the height advances.

use {
    crate::{
        evidence::{Equivocation, EvidenceKind},
        message::{AuthenticatedEnvelope, Proposal},
        types::CommittedSeal,
    },
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::collections::{BTreeMap, HashMap, HashSet},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteKind {
    Prevote,
    Precommit,
}

impl VoteKind {
    fn evidence_kind(self) -> EvidenceKind {
        match self {
            VoteKind::Prevote => EvidenceKind::ConflictingPrevote,
            VoteKind::Precommit => EvidenceKind::ConflictingPrecommit,
        }
    }
}

/// How an added vote was treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteStatus {
    /// First vote from this sender; its power was counted.
    Counted,
    /// Identical to the sender's counted vote, or a further conflict from a
    /// sender already reported; ignored.
    Duplicate,
    /// Differs from the sender's counted vote; kept as evidence only.
    Equivocation(Box<Equivocation>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    pub status: VoteStatus,
    /// Power now behind the hash the vote named.
    pub power: u64,
    /// Power across all values, nil included.
    pub total_power: u64,
    /// Whether this vote made its hash reach quorum.
    pub reached_quorum: bool,
}

/// Votes of one kind in one round.
#[derive(Debug, Clone)]
pub struct VoteSet {
    kind: VoteKind,
    quorum: u64,
    votes: HashMap<Pubkey, AuthenticatedEnvelope>,
    power_by_hash: HashMap<Option<Hash>, u64>,
    total_power: u64,
    equivocations: Vec<Equivocation>,
    /// Senders already reported; at most one piece of evidence each.
    reported: HashSet<Pubkey>,
}

impl VoteSet {
    pub fn new(kind: VoteKind, quorum: u64) -> Self {
        Self {
            kind,
            quorum,
            votes: HashMap::new(),
            power_by_hash: HashMap::new(),
            total_power: 0,
            equivocations: Vec::new(),
            reported: HashSet::new(),
        }
    }

    /// Count `message` unless its sender already voted. The first conflicting
    /// vote of a sender yields evidence; later ones, like proposals, are
    /// reported as duplicates.
    pub fn add(&mut self, message: AuthenticatedEnvelope) -> VoteOutcome {
        let Some(block_hash) = message.payload().vote().map(|vote| vote.block_hash) else {
            return self.outcome(VoteStatus::Duplicate, &None, false);
        };

        if let Some(existing) = self.votes.get(message.sender()) {
            let existing_hash = existing.payload().vote().and_then(|vote| vote.block_hash);
            if existing_hash == block_hash || self.reported.contains(message.sender()) {
                return self.outcome(VoteStatus::Duplicate, &block_hash, false);
            }
            let evidence = Equivocation::new(self.kind.evidence_kind(), existing, &message);
            self.reported.insert(*message.sender());
            self.equivocations.push(evidence.clone());
            return self.outcome(
                VoteStatus::Equivocation(Box::new(evidence)),
                &block_hash,
                false,
            );
        }

        let before = self.power_for(&block_hash);
        let after = before.saturating_add(message.power());
        self.power_by_hash.insert(block_hash, after);
        self.total_power = self.total_power.saturating_add(message.power());
        self.votes.insert(*message.sender(), message);

        let reached_quorum = before < self.quorum && after >= self.quorum;
        self.outcome(VoteStatus::Counted, &block_hash, reached_quorum)
    }

    fn outcome(
        &self,
        status: VoteStatus,
        block_hash: &Option<Hash>,
        reached_quorum: bool,
    ) -> VoteOutcome {
        VoteOutcome {
            status,
            power: self.power_for(block_hash),
            total_power: self.total_power,
            reached_quorum,
        }
    }

    pub fn power_for(&self, block_hash: &Option<Hash>) -> u64 {
        self.power_by_hash.get(block_hash).copied().unwrap_or(0)
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Total counted power, nil included, reaches quorum.
    pub fn any_quorum(&self) -> bool {
        self.total_power >= self.quorum
    }

    /// The non-nil hash with quorum power, if any. At most one hash can reach
    /// quorum while faulty power stays within bounds.
    pub fn quorum_hash(&self) -> Option<Hash> {
        self.power_by_hash
            .iter()
            .find_map(|(hash, power)| match hash {
                Some(hash) if *power >= self.quorum => Some(*hash),
                _ => None,
            })
    }

    pub fn nil_quorum(&self) -> bool {
        self.power_for(&None) >= self.quorum
    }

    pub fn contains(&self, sender: &Pubkey) -> bool {
        self.votes.contains_key(sender)
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Seals of the counted precommits for `block_hash`.
    pub fn committed_seals(&self, block_hash: &Hash) -> Vec<CommittedSeal> {
        self.votes
            .values()
            .filter(|message| {
                message.payload().vote().and_then(|vote| vote.block_hash) == Some(*block_hash)
            })
            .filter_map(AuthenticatedEnvelope::committed_seal)
            .collect()
    }

    pub fn equivocations(&self) -> &[Equivocation] {
        &self.equivocations
    }
}

#[derive(Debug, Clone)]
struct StoredProposal {
    message: AuthenticatedEnvelope,
    /// Cached verdict of the external verifier.
    verified: Option<bool>,
}

/// Proposal and votes of a single round.
#[derive(Debug, Clone)]
pub struct RoundMessageSet {
    proposal: Option<StoredProposal>,
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl RoundMessageSet {
    pub fn new(quorum: u64) -> Self {
        Self {
            proposal: None,
            prevotes: VoteSet::new(VoteKind::Prevote, quorum),
            precommits: VoteSet::new(VoteKind::Precommit, quorum),
        }
    }

    /// Store `message` as the round's proposal. Only the first one sticks.
    pub fn set_proposal(&mut self, message: AuthenticatedEnvelope) -> bool {
        if self.proposal.is_some() || message.payload().proposal().is_none() {
            return false;
        }
        self.proposal = Some(StoredProposal {
            message,
            verified: None,
        });
        true
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal
            .as_ref()
            .and_then(|stored| stored.message.payload().proposal())
    }

    pub fn proposal_message(&self) -> Option<&AuthenticatedEnvelope> {
        self.proposal.as_ref().map(|stored| &stored.message)
    }

    pub fn proposal_verified(&self) -> Option<bool> {
        self.proposal.as_ref().and_then(|stored| stored.verified)
    }

    pub fn set_proposal_verified(&mut self, valid: bool) {
        if let Some(stored) = self.proposal.as_mut() {
            stored.verified = Some(valid);
        }
    }

    pub fn add_prevote(&mut self, message: AuthenticatedEnvelope) -> VoteOutcome {
        self.prevotes.add(message)
    }

    pub fn add_precommit(&mut self, message: AuthenticatedEnvelope) -> VoteOutcome {
        self.precommits.add(message)
    }

    pub fn votes(&self, kind: VoteKind) -> &VoteSet {
        match kind {
            VoteKind::Prevote => &self.prevotes,
            VoteKind::Precommit => &self.precommits,
        }
    }

    pub fn any_quorum(&self, kind: VoteKind) -> bool {
        self.votes(kind).any_quorum()
    }

    pub fn quorum_hash(&self, kind: VoteKind) -> Option<Hash> {
        self.votes(kind).quorum_hash()
    }

    pub fn nil_quorum(&self, kind: VoteKind) -> bool {
        self.votes(kind).nil_quorum()
    }

    pub fn power_for(&self, kind: VoteKind, block_hash: &Option<Hash>) -> u64 {
        self.votes(kind).power_for(block_hash)
    }

    pub fn committed_seals(&self, block_hash: &Hash) -> Vec<CommittedSeal> {
        self.precommits.committed_seals(block_hash)
    }

    pub fn equivocations(&self) -> impl Iterator<Item = &Equivocation> {
        self.prevotes
            .equivocations()
            .iter()
            .chain(self.precommits.equivocations())
    }
}

/// Every round seen at one height.
#[derive(Debug, Clone)]
pub struct HeightMessageLog {
    height: u64,
    quorum: u64,
    rounds: BTreeMap<u32, RoundMessageSet>,
}

impl HeightMessageLog {
    pub fn new(height: u64, quorum: u64) -> Self {
        Self {
            height,
            quorum,
            rounds: BTreeMap::new(),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn quorum(&self) -> u64 {
        self.quorum
    }

    pub fn get_or_create(&mut self, round: u32) -> &mut RoundMessageSet {
        let quorum = self.quorum;
        self.rounds
            .entry(round)
            .or_insert_with(|| RoundMessageSet::new(quorum))
    }

    pub fn get(&self, round: u32) -> Option<&RoundMessageSet> {
        self.rounds.get(&round)
    }

    pub fn get_mut(&mut self, round: u32) -> Option<&mut RoundMessageSet> {
        self.rounds.get_mut(&round)
    }

    pub fn rounds(&self) -> impl Iterator<Item = (u32, &RoundMessageSet)> {
        self.rounds.iter().map(|(round, set)| (*round, set))
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
