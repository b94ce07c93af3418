//! Error types for jobq.

use thiserror::Error;

use crate::{JobId, JobState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    /// A non-terminal state reached the closure logic. This is a caller bug.
    #[error("unsupported final state \"{0}\"")]
    IllegalFinalState(JobState),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
