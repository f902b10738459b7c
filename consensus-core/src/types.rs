//! Core types for the agreement protocol.
//!
//! Defines the block type agreed upon, the step and per-height state of the
//! round state machine, committed seals, and the read-only snapshot published
//! to other threads.

use {
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::fmt,
};

// ---------------------------------------------------------------------------
// Block types
// ---------------------------------------------------------------------------

/// A block proposed by a leader during the Propose step.
///
/// The core treats transactions as opaque bytes; semantic validation is the
/// backend's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedBlock {
    /// Hash of the parent (previous committed) block.
    pub parent_hash: Hash,
    /// Block height (monotonically increasing).
    pub height: u64,
    /// Unix timestamp in milliseconds when the block was proposed.
    pub timestamp: i64,
    /// Serialized transactions included in this block.
    pub transactions: Vec<Vec<u8>>,
    /// Merkle root of the post-execution state.
    pub state_root: Hash,
    /// Public key of the proposer.
    pub proposer: Pubkey,
}

impl ProposedBlock {
    /// Compute a deterministic hash for this block.
    pub fn hash(&self) -> Hash {
        let transactions_root = self.transactions_root();
        solana_sha256_hasher::hashv(&[
            self.parent_hash.as_ref(),
            &self.height.to_le_bytes(),
            &self.timestamp.to_le_bytes(),
            transactions_root.as_ref(),
            self.state_root.as_ref(),
            self.proposer.as_ref(),
        ])
    }

    /// Hash of the transaction count followed by one length-framed digest
    /// per transaction.
    fn transactions_root(&self) -> Hash {
        let count = (self.transactions.len() as u64).to_le_bytes();
        let leaves: Vec<Hash> = self
            .transactions
            .iter()
            .map(|tx| {
                let len = (tx.len() as u64).to_le_bytes();
                solana_sha256_hasher::hashv(&[&len[..], tx.as_slice()])
            })
            .collect();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(leaves.len().saturating_add(1));
        parts.push(&count[..]);
        parts.extend(leaves.iter().map(|leaf| leaf.as_ref()));
        solana_sha256_hasher::hashv(&parts)
    }
}

/// A precommit signature over `(Precommit, round, height, hash)`, collected
/// from the precommit quorum and handed to the commit collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSeal {
    pub signer: Pubkey,
    pub signature: Signature,
}

// ---------------------------------------------------------------------------
// Consensus state
// ---------------------------------------------------------------------------

/// The step within a single consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConsensusStep {
    /// Waiting for a proposal from the designated leader.
    Propose,
    /// Prevote sent, collecting prevotes.
    Prevote,
    /// Precommit sent, collecting precommits.
    Precommit,
    /// A decision was handed to the commit collaborator; waiting for the
    /// confirmation that ends the height.
    Commit,
}

impl fmt::Display for ConsensusStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusStep::Propose => write!(f, "Propose"),
            ConsensusStep::Prevote => write!(f, "Prevote"),
            ConsensusStep::Precommit => write!(f, "Precommit"),
            ConsensusStep::Commit => write!(f, "Commit"),
        }
    }
}

/// A block together with the round it was locked on or observed valid in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundValue {
    pub round: u32,
    pub block: ProposedBlock,
}

/// Full state of the round state machine at one height.
///
/// `locked` and `valid` pair the value with its round so that one is never
/// present without the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusState {
    pub height: u64,
    pub round: u32,
    pub step: ConsensusStep,
    /// Value this node precommitted and will not prevote against.
    pub locked: Option<RoundValue>,
    /// Most recent value seen with a prevote quorum and a verified proposal.
    pub valid: Option<RoundValue>,
    pub sent_proposal: bool,
    pub sent_prevote: bool,
    pub sent_precommit: bool,
    /// Set once the prevote timeout has been armed in this round.
    pub prevote_timeout_scheduled: bool,
    /// Set once the precommit timeout has been armed in this round.
    pub precommit_timeout_scheduled: bool,
    /// Set once a prevote quorum for the round's proposal was acted upon.
    pub polka_observed: bool,
    pub decision: Option<RoundValue>,
    /// Whether the commit collaborator accepted the current decision.
    pub commit_requested: bool,
}

impl ConsensusState {
    /// Create a fresh state for a new height.
    pub fn new(height: u64) -> Self {
        Self {
            height,
            round: 0,
            step: ConsensusStep::Propose,
            locked: None,
            valid: None,
            sent_proposal: false,
            sent_prevote: false,
            sent_precommit: false,
            prevote_timeout_scheduled: false,
            precommit_timeout_scheduled: false,
            polka_observed: false,
            decision: None,
            commit_requested: false,
        }
    }

    /// Move to `round` within the same height. Locked and valid values are
    /// carried over; per-round flags are cleared.
    pub fn advance_round(&mut self, round: u32) {
        self.round = round;
        self.step = ConsensusStep::Propose;
        self.sent_proposal = false;
        self.sent_prevote = false;
        self.sent_precommit = false;
        self.prevote_timeout_scheduled = false;
        self.precommit_timeout_scheduled = false;
        self.polka_observed = false;
    }

    pub fn locked_round(&self) -> Option<u32> {
        self.locked.as_ref().map(|locked| locked.round)
    }

    pub fn valid_round(&self) -> Option<u32> {
        self.valid.as_ref().map(|valid| valid.round)
    }

    pub fn view(&self) -> RoundView {
        RoundView {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}

/// Snapshot of the core's position, published for readers on other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundView {
    pub height: u64,
    pub round: u32,
    pub step: ConsensusStep,
}

impl Default for RoundView {
    fn default() -> Self {
        ConsensusState::new(0).view()
    }
}
