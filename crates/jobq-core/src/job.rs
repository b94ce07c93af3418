//! Job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, JobId, JobState, Result};

/// Ordered job arguments. Only JSON primitives are allowed.
pub type JobArgs = Vec<Value>;

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier, ordered by creation.
    pub id: JobId,
    /// Command to run.
    pub command: String,
    /// Command arguments. Together with `command` this is the dedup key.
    pub args: JobArgs,
    /// Current lifecycle state.
    pub state: JobState,
    /// Jobs that must finish before this one may start.
    pub dependencies: Vec<JobId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this job was requested with the given dedup key. Numbers are
    /// compared by value, as JSONB does, so `1` and `1.0` are the same key.
    pub fn matches(&self, command: &str, args: &[Value]) -> bool {
        self.command == command
            && self.args.len() == args.len()
            && self.args.iter().zip(args).all(|(a, b)| same_arg(a, b))
    }

    pub fn depends_on(&self, id: JobId) -> bool {
        self.dependencies.contains(&id)
    }
}

/// A job that has not been inserted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub command: String,
    pub args: JobArgs,
    pub state: JobState,
    pub dependencies: Vec<JobId>,
}

impl NewJob {
    /// A job that is schedulable as soon as it is inserted.
    pub fn new(command: impl Into<String>, args: JobArgs) -> Self {
        Self {
            command: command.into(),
            args,
            state: JobState::Pending,
            dependencies: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    /// Add a dependency. Duplicate edges are ignored.
    pub fn depends_on(mut self, id: JobId) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidInput("command must not be empty".to_string()));
        }
        if !matches!(self.state, JobState::New | JobState::Pending) {
            return Err(Error::InvalidInput(format!(
                "jobs cannot be created in state {}",
                self.state
            )));
        }
        validate_args(&self.args)
    }
}

fn same_arg(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Reject arguments that are not JSON primitives.
pub fn validate_args(args: &[Value]) -> Result<()> {
    for (idx, arg) in args.iter().enumerate() {
        if arg.is_array() || arg.is_object() {
            return Err(Error::InvalidInput(format!(
                "argument {} must be a primitive value, got {}",
                idx, arg
            )));
        }
    }
    Ok(())
}
