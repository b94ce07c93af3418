//! Scheduler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Job(#[from] jobq_core::Error),

    #[error(transparent)]
    Store(#[from] jobq_db::DbError),
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
