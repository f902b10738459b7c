//! TRv1 Property-Based Invariant Tests
//!
//! Uses proptest to check the agreement core against:
//! - Committee arithmetic (quorum intersection, proposer rotation)
//! - Vote accounting and envelope authentication
//! - Agreement across replicas under reordering, loss and a Byzantine proposer

pub mod consensus_invariants;
