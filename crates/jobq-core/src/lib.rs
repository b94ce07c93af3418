//! Core domain types for the jobq scheduling engine.
//!
//! This crate contains:
//! - Job identifiers and the job record
//! - The job state machine and its cascade policy
//! - A read-only view over dependency edges
//! - The state-change notification port

pub mod error;
pub mod graph;
pub mod id;
pub mod job;
pub mod notify;
pub mod state;

pub use error::{Error, Result};
pub use graph::DependencyView;
pub use id::JobId;
pub use job::{Job, JobArgs, NewJob};
pub use notify::{NoopListener, OutputEvent, OutputStream, StateChangeListener};
pub use state::{Cascade, JobState};
