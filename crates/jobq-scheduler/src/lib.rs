//! Job scheduling for jobq.
//!
//! Decides which queued job may run next, deduplicates equivalent requests
//! and propagates terminal outcomes through the dependency graph. All mutual
//! exclusion is delegated to the store's transactions.

pub mod error;
pub mod scheduler;
pub mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
pub use worker::{JobOutcome, JobRunner, OutputSink, Worker};
