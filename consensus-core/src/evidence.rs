//! Equivocation evidence.
//!
//! Validators must not cast conflicting votes (two different prevotes or
//! precommits for the same height+round). The vote sets detect such pairs
//! while counting; this module keeps them, signed envelopes included, until
//! they are drained or fall out of the retention window.

use {
    crate::message::{AuthenticatedEnvelope, Envelope},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    std::{collections::HashSet, fmt},
};

/// The type of double-sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceKind {
    /// Two different prevotes in the same round.
    ConflictingPrevote,
    /// Two different precommits in the same round.
    ConflictingPrecommit,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceKind::ConflictingPrevote => write!(f, "ConflictingPrevote"),
            EvidenceKind::ConflictingPrecommit => write!(f, "ConflictingPrecommit"),
        }
    }
}

/// Two signed votes by the same validator for the same (height, round, kind)
/// naming different values. Only `first` was counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Equivocation {
    pub offender: Pubkey,
    pub height: u64,
    pub round: u32,
    pub kind: EvidenceKind,
    pub first: Envelope,
    pub second: Envelope,
    pub first_hash: Option<Hash>,
    pub second_hash: Option<Hash>,
}

impl Equivocation {
    /// Pair an already counted vote with a conflicting one.
    pub(crate) fn new(
        kind: EvidenceKind,
        first: &AuthenticatedEnvelope,
        second: &AuthenticatedEnvelope,
    ) -> Self {
        let hash_of = |message: &AuthenticatedEnvelope| {
            message.payload().vote().and_then(|vote| vote.block_hash)
        };
        Self {
            offender: *second.sender(),
            height: second.height(),
            round: second.round(),
            kind,
            first_hash: hash_of(first),
            second_hash: hash_of(second),
            first: first.envelope().clone(),
            second: second.envelope().clone(),
        }
    }
}

/// Identifies one offence: a sender's conflicting votes of one kind in one
/// round. Further conflicts for the same offence add nothing.
type OffenceKey = (Pubkey, EvidenceKind, u64, u32);

/// Collects equivocation evidence across heights.
#[derive(Debug, Default)]
pub struct EvidenceCollector {
    evidence: Vec<Equivocation>,
    /// Offences already recorded, drained or not.
    seen: HashSet<OffenceKey>,
    /// Evidence below this height is discarded.
    min_height: u64,
}

impl EvidenceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `evidence`. Returns false if it is below the retention window or
    /// the same offence is already known.
    pub fn record(&mut self, evidence: Equivocation) -> bool {
        if evidence.height < self.min_height {
            return false;
        }
        let key = (
            evidence.offender,
            evidence.kind,
            evidence.height,
            evidence.round,
        );
        if !self.seen.insert(key) {
            return false;
        }
        self.evidence.push(evidence);
        true
    }

    /// Drop evidence older than `min_height`.
    pub fn prune(&mut self, min_height: u64) {
        self.min_height = min_height;
        self.evidence.retain(|e| e.height >= min_height);
        self.seen.retain(|(_, _, height, _)| *height >= min_height);
    }

    pub fn evidence(&self) -> &[Equivocation] {
        &self.evidence
    }

    /// Drain all evidence (for handing to an accountability layer).
    pub fn drain_evidence(&mut self) -> Vec<Equivocation> {
        std::mem::take(&mut self.evidence)
    }

    pub fn len(&self) -> usize {
        self.evidence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evidence.is_empty()
    }

    pub fn has_evidence_against(&self, validator: &Pubkey) -> bool {
        self.evidence.iter().any(|e| e.offender == *validator)
    }
}
