use {
    crate::{config::ConfigError, message::MessageKind},
    solana_pubkey::Pubkey,
    solana_signer::SignerError,
    thiserror::Error,
};

/// Reasons an inbound envelope is rejected before it reaches the state machine.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Decode(#[from] bincode::Error),

    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("round {round} outside [0, {max}]")]
    RoundOutOfRange { round: i64, max: u32 },

    #[error("valid round {valid_round} is not below round {round}")]
    InvalidValidRound { valid_round: i64, round: u32 },

    #[error("signature does not match claimed sender {0}")]
    SignatureMismatch(Pubkey),

    #[error("sender {0} is not a committee member")]
    UnauthorizedSender(Pubkey),

    #[error("precommit from {0} is missing its committed seal")]
    MissingCommittedSeal(Pubkey),

    #[error("committed seal from {0} does not verify")]
    InvalidCommittedSeal(Pubkey),

    #[error("{kind} from {sender} carries a committed seal")]
    UnexpectedCommittedSeal { kind: MessageKind, sender: Pubkey },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitteeError {
    #[error("committee is empty")]
    Empty,

    #[error("duplicate committee member {0}")]
    DuplicateMember(Pubkey),

    #[error("committee member {0} has zero voting power")]
    ZeroPower(Pubkey),

    #[error("total voting power overflows u64")]
    PowerOverflow,

    #[error("unknown sender {0}")]
    UnknownSender(Pubkey),
}

/// Failures reported by the external collaborators.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Committee(#[from] CommitteeError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("stale event for height {height} round {round}")]
    StaleEvent { height: u64, round: u32 },

    #[error("proposal for round {round} from {sender}, which is not the proposer")]
    NotFromProposer { sender: Pubkey, round: u32 },

    #[error("height {height} is beyond the backlog window (current {current})")]
    FutureHeight { height: u64, current: u64 },

    #[error("future-height backlog full ({0} messages)")]
    BacklogFull(usize),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("consensus event channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, CoreError>;
