//! Error taxonomy for the optimizer engine.
//!
//! Only [`Error::InvalidArgument`] escalates to callers; trial and
//! storage failures are absorbed and logged where they occur.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed dimension or factor input. A caller bug, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single candidate's compile or measure step failed. Recoverable
    /// by skipping that candidate.
    #[error("trial {experiment} failed: {reason}")]
    Trial { experiment: String, reason: String },

    /// A checkpoint or cache read/write failed. The affected call
    /// proceeds without persistence.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
