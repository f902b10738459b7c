//! Boundary to the collaborators the core drives but does not implement:
//! block building and validation, signing, gossip, and block commit.
//!
//! All calls are synchronous on the consensus thread. A commit request is
//! answered later with `ConsensusEvent::CommitConfirmed`.

use {
    crate::{
        committee::Committee,
        error::BackendError,
        types::{CommittedSeal, ProposedBlock},
    },
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{sync::Arc, time::Duration},
};

pub trait ConsensusBackend {
    /// Address this node signs as.
    fn address(&self) -> Pubkey;

    /// Semantic validation of a proposed block. `Ok` carries the time the
    /// check took.
    fn verify_proposal(&self, block: &ProposedBlock) -> Result<Duration, BackendError>;

    fn sign(&self, payload: &[u8]) -> Result<Signature, BackendError>;

    /// Gossip an encoded envelope to the committee. Failures are logged by
    /// the caller and never stall the state machine.
    fn broadcast(&self, committee: &Committee, payload: Vec<u8>) -> Result<(), BackendError>;

    /// Hand a decided block and its quorum of seals to the chain.
    fn commit(
        &self,
        block: &ProposedBlock,
        round: u32,
        seals: Vec<CommittedSeal>,
    ) -> Result<(), BackendError>;

    fn committee_for_height(&self, height: u64) -> Result<Committee, BackendError>;

    /// Build a fresh block to propose at `height`.
    fn candidate_block(&self, height: u64) -> Result<ProposedBlock, BackendError>;
}

impl<T: ConsensusBackend + ?Sized> ConsensusBackend for Arc<T> {
    fn address(&self) -> Pubkey {
        (**self).address()
    }

    fn verify_proposal(&self, block: &ProposedBlock) -> Result<Duration, BackendError> {
        (**self).verify_proposal(block)
    }

    fn sign(&self, payload: &[u8]) -> Result<Signature, BackendError> {
        (**self).sign(payload)
    }

    fn broadcast(&self, committee: &Committee, payload: Vec<u8>) -> Result<(), BackendError> {
        (**self).broadcast(committee, payload)
    }

    fn commit(
        &self,
        block: &ProposedBlock,
        round: u32,
        seals: Vec<CommittedSeal>,
    ) -> Result<(), BackendError> {
        (**self).commit(block, round, seals)
    }

    fn committee_for_height(&self, height: u64) -> Result<Committee, BackendError> {
        (**self).committee_for_height(height)
    }

    fn candidate_block(&self, height: u64) -> Result<ProposedBlock, BackendError> {
        (**self).candidate_block(height)
    }
}
