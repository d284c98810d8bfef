//! Crate-wide error type and result alias.

use std::io;
use thiserror::Error;

/// Convenience alias used across the agent.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors surfaced by the agent core.
///
/// Background threads never return these to callers; they log and set status
/// flags instead. Foreground API calls validate eagerly and return structured
/// errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A packet or header could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// On-disk data failed validation (bad magic, checksum, truncation).
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A session, fragment, or metric was not present.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Caller-supplied argument rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Metric value calculation could not produce a value (for example a
    /// zero base delta under a fraction sample kind).
    #[error("data collection error: {0}")]
    DataCollection(String),
    /// Initialization was canceled by a subscriber; publish calls are no-ops
    /// until a later init succeeds.
    #[error("agent suppressed: {0}")]
    Suppressed(String),
}

impl AgentError {
    /// True when the error marks on-disk damage that should be isolated to
    /// one fragment rather than failing a whole session read.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            AgentError::Corruption(_) | AgentError::Serialization(_)
        )
    }
}
