//! BFT agreement configuration.
//!
//! Timing parameters for the three step timeouts, the round bound applied at
//! decode time, and the limits that keep the message log and the future-height
//! backlog bounded.

use {
    crate::timeout::TimeoutKind,
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// Configuration for the agreement core.
///
/// All timeouts are in milliseconds. A step timeout for round `r` lasts
/// `base + delta * r`, so every round waits a little longer than the last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BftConfig {
    /// Base timeout for the propose step.
    /// Default: 3000.
    pub propose_timeout_base_ms: u64,

    /// Additional propose timeout per round.
    /// Default: 500.
    pub propose_timeout_delta_ms: u64,

    /// Base timeout for the prevote step, armed once any prevote quorum is seen.
    /// Default: 1000.
    pub prevote_timeout_base_ms: u64,

    /// Additional prevote timeout per round.
    /// Default: 500.
    pub prevote_timeout_delta_ms: u64,

    /// Base timeout for the precommit step, armed once any precommit quorum is seen.
    /// Default: 1000.
    pub precommit_timeout_base_ms: u64,

    /// Additional precommit timeout per round.
    /// Default: 500.
    pub precommit_timeout_delta_ms: u64,

    /// Highest round number accepted from the wire. Messages above it are
    /// rejected as malformed.
    /// Default: 99.
    pub max_round: u32,

    /// Largest encoded envelope accepted, in bytes.
    /// Default: 1 MiB.
    pub max_message_size: usize,

    /// How many heights ahead of the current one are buffered for replay.
    /// Default: 4.
    pub future_height_backlog: u64,

    /// Upper bound on buffered future-height messages.
    /// Default: 10_000.
    pub max_backlog_messages: usize,

    /// Equivocation evidence older than this many heights is pruned.
    /// Default: 100.
    pub evidence_retention_heights: u64,
}

impl Default for BftConfig {
    fn default() -> Self {
        Self {
            propose_timeout_base_ms: 3000,
            propose_timeout_delta_ms: 500,
            prevote_timeout_base_ms: 1000,
            prevote_timeout_delta_ms: 500,
            precommit_timeout_base_ms: 1000,
            precommit_timeout_delta_ms: 500,
            max_round: 99,
            max_message_size: 1024 * 1024,
            future_height_backlog: 4,
            max_backlog_messages: 10_000,
            evidence_retention_heights: 100,
        }
    }
}

impl BftConfig {
    /// Timeout length in milliseconds for `kind` at `round`.
    pub fn timeout_ms(&self, kind: TimeoutKind, round: u32) -> u64 {
        let (base, delta) = match kind {
            TimeoutKind::Propose => (self.propose_timeout_base_ms, self.propose_timeout_delta_ms),
            TimeoutKind::Prevote => (self.prevote_timeout_base_ms, self.prevote_timeout_delta_ms),
            TimeoutKind::Precommit => (
                self.precommit_timeout_base_ms,
                self.precommit_timeout_delta_ms,
            ),
        };
        base.saturating_add(delta.saturating_mul(u64::from(round)))
    }

    pub fn timeout(&self, kind: TimeoutKind, round: u32) -> Duration {
        Duration::from_millis(self.timeout_ms(kind, round))
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.propose_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidTimeout("propose_timeout_base_ms"));
        }
        if self.prevote_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidTimeout("prevote_timeout_base_ms"));
        }
        if self.precommit_timeout_base_ms == 0 {
            return Err(ConfigError::InvalidTimeout("precommit_timeout_base_ms"));
        }
        if self.max_round == 0 || self.max_round == u32::MAX {
            return Err(ConfigError::InvalidMaxRound(self.max_round));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidMaxMessageSize);
        }
        if self.evidence_retention_heights == 0 {
            return Err(ConfigError::InvalidEvidenceRetention);
        }
        Ok(())
    }

    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            propose_timeout_base_ms: 200,
            propose_timeout_delta_ms: 50,
            prevote_timeout_base_ms: 100,
            prevote_timeout_delta_ms: 50,
            precommit_timeout_base_ms: 100,
            precommit_timeout_delta_ms: 50,
            ..Self::default()
        }
    }
}

/// Errors in BFT configuration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    InvalidTimeout(&'static str),
    #[error("max_round must be in [1, u32::MAX), got {0}")]
    InvalidMaxRound(u32),
    #[error("max_message_size must be > 0")]
    InvalidMaxMessageSize,
    #[error("evidence_retention_heights must be > 0")]
    InvalidEvidenceRetention,
}
