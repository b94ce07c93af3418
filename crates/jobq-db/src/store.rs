//! Store traits and implementations.

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobq_core::{Job, JobId, JobState, NewJob};
use serde_json::Value;
use std::collections::HashSet;

use crate::DbResult;

/// Durable job storage.
///
/// Lookups by dedup key return the lowest-id match so that every caller
/// converges on the same row while a concurrent insert is being reconciled.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job together with its dependency edges.
    async fn insert(&self, job: NewJob) -> DbResult<Job>;

    async fn get(&self, id: JobId) -> DbResult<Option<Job>>;

    /// Fetch several jobs, lowest id first. Unknown ids are skipped.
    async fn find_by_ids(&self, ids: &[JobId]) -> DbResult<Vec<Job>>;

    /// Any job with this dedup key. Numeric arguments match by value, so `1`
    /// and `1.0` are the same key.
    async fn find_one(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>>;

    /// The lowest-id job with this dedup key.
    async fn find_oldest(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>>;

    /// The lowest-id pending job whose id is not in `excluded`.
    async fn find_one_pending(&self, excluded: &HashSet<JobId>) -> DbResult<Option<Job>>;

    /// Jobs that list `id` among their dependencies, lowest id first.
    async fn find_incoming_dependents(&self, id: JobId) -> DbResult<Vec<Job>>;

    /// Overwrite the state of a single job outside of any transaction.
    async fn set_state(&self, id: JobId, state: JobState) -> DbResult<()>;

    /// Atomically move a pending job to running. Returns `false` when the job
    /// was no longer pending, i.e. another worker got it first.
    async fn claim(&self, id: JobId) -> DbResult<bool>;

    async fn remove(&self, id: JobId) -> DbResult<()>;

    async fn add_dependency(&self, job: JobId, dependency: JobId) -> DbResult<()>;

    /// List jobs, lowest id first, optionally filtered by state.
    async fn list(&self, state: Option<JobState>, limit: usize) -> DbResult<Vec<Job>>;

    /// Number of jobs per state. States without jobs are omitted.
    async fn count_by_state(&self) -> DbResult<Vec<(JobState, i64)>>;

    /// Forget any cached copy of a job so the next read hits storage.
    fn detach(&self, _id: JobId) {}

    /// Open a transaction.
    async fn begin(&self) -> DbResult<Box<dyn JobTransaction>>;
}

/// A unit of work against the store. Reads observe the transaction's own
/// writes; nothing is visible to other transactions before `commit`.
#[async_trait]
pub trait JobTransaction: Send {
    async fn get(&mut self, id: JobId) -> DbResult<Option<Job>>;

    async fn find_incoming_dependents(&mut self, id: JobId) -> DbResult<Vec<Job>>;

    async fn update_state(&mut self, id: JobId, state: JobState) -> DbResult<()>;

    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}

/// Apply a state change and its timestamps to a loaded job.
pub(crate) fn stamp(job: &mut Job, state: JobState, now: DateTime<Utc>) {
    job.state = state;
    if state == JobState::Running && job.started_at.is_none() {
        job.started_at = Some(now);
    }
    if state.is_terminal() {
        job.closed_at = Some(now);
    }
}
