//! State-change notification port.
//!
//! The scheduler reports every proposed closure to a listener injected at
//! construction. The listener may answer with a different final state, which
//! the scheduler then adopts. Output produced by a running job flows through
//! the same listener.

use serde::{Deserialize, Serialize};

use crate::{Job, JobState};

/// Which stream a chunk of job output was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A chunk of output produced by a running job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub stream: OutputStream,
    pub chunk: String,
}

impl OutputEvent {
    pub fn stdout(chunk: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            chunk: chunk.into(),
        }
    }

    pub fn stderr(chunk: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            chunk: chunk.into(),
        }
    }
}

/// Listener for job state changes.
pub trait StateChangeListener: Send + Sync {
    /// Called once per job before its final state is persisted. The returned
    /// state replaces `proposed`.
    fn on_state_change(&self, _job: &Job, proposed: JobState) -> JobState {
        proposed
    }

    /// Called for each chunk of output. The returned event replaces `event`.
    fn on_output(&self, _job: &Job, event: OutputEvent) -> OutputEvent {
        event
    }
}

/// Listener that accepts every proposal unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl StateChangeListener for NoopListener {}
