use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SableError>;

#[derive(Debug, Error)]
pub enum SableError {
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The transaction hit a snapshot conflict or an invariant violation
    /// and must be discarded by the caller.
    #[error("transaction rolled back: {0}")]
    Rollback(&'static str),
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),
}

impl SableError {
    /// True when the error means "discard this transaction and retry",
    /// as opposed to an engine-level failure.
    pub fn is_rollback(&self) -> bool {
        matches!(self, SableError::Rollback(_))
    }
}
