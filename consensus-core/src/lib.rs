//! TRv1 Tendermint-style BFT agreement core
//!
//! A fixed, weighted committee agrees on one block per height. Each height
//! runs in numbered rounds with a designated proposer, and every round has
//! three steps:
//!
//! 1. **Propose**: the round's proposer broadcasts a block (or re-proposes the
//!    value it saw a prevote quorum for in an earlier round).
//! 2. **Prevote**: members prevote the proposal if it is valid and compatible
//!    with their lock, otherwise nil.
//! 3. **Precommit**: on a prevote quorum for a block, members lock on it and
//!    precommit it with a committed seal.
//!
//! A precommit quorum for a block in any round of the height decides it. The
//! block and its seals go to the backend, and the core moves to the next
//! height once the commit is confirmed.
//!
//! # Key Properties
//!
//! - **Safety**: with less than 1/3 of voting power Byzantine, no two honest
//!   members decide different blocks at one height.
//! - **Liveness**: rounds advance on timeouts that grow with the round, so
//!   the protocol progresses once the network is synchronous.
//! - **Accountability**: conflicting votes from one signer are kept as
//!   [`Equivocation`] evidence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 ConsensusService                  │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │               ConsensusCore                │  │
//! │  │  ┌────────┐  ┌───────────┐  ┌───────────┐  │  │
//! │  │  │ Codec  │  │ Committee │  │ Evidence  │  │  │
//! │  │  │        │  │           │  │ Collector │  │  │
//! │  │  └────────┘  └───────────┘  └───────────┘  │  │
//! │  │  ┌──────────────────┐  ┌────────────────┐  │  │
//! │  │  │ HeightMessageLog │  │ConsensusState  │  │  │
//! │  │  └──────────────────┘  └────────────────┘  │  │
//! │  │  ┌──────────────────┐                      │  │
//! │  │  │ TimeoutScheduler │◀──── TimerThread     │  │
//! │  │  └──────────────────┘                      │  │
//! │  └──────────────────────┬─────────────────────┘  │
//! └─────────────────────────┼────────────────────────┘
//!                           ▼
//!                  ConsensusBackend
//!       (validate, sign, broadcast, commit)
//! ```

pub mod backend;
pub mod committee;
pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod message;
pub mod message_log;
pub mod service;
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod test_utils;
pub mod timeout;
pub mod types;

// Re-exports for convenience
pub use backend::ConsensusBackend;
pub use committee::{Committee, CommitteeMember};
pub use config::{BftConfig, ConfigError};
pub use engine::{ConsensusCore, ConsensusEvent};
pub use error::{BackendError, CommitteeError, CoreError, MessageError, ServiceError};
pub use evidence::{Equivocation, EvidenceCollector, EvidenceKind};
pub use message::{
    AuthenticatedEnvelope, Codec, ConsensusPayload, Envelope, MessageKind, Proposal, Vote,
};
pub use message_log::{HeightMessageLog, RoundMessageSet, VoteKind, VoteSet};
pub use service::{ConsensusHandle, ConsensusService, ConsensusServiceConfig};
pub use timeout::{TimeoutEvent, TimeoutKind, TimeoutScheduler, TimerThread};
pub use types::{
    CommittedSeal, ConsensusState, ConsensusStep, ProposedBlock, RoundValue, RoundView,
};
