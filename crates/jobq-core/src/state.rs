//! Job state machine.
//!
//! A job is born `New` (or directly `Pending`), is claimed into `Running`
//! and ends in exactly one terminal state. Terminal states never change.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Inserted but not yet schedulable. Used while a dedup insert is reconciled.
    #[display("new")]
    New,
    /// Waiting for its dependencies and a worker.
    #[display("pending")]
    Pending,
    /// Claimed by a worker.
    #[display("running")]
    Running,
    /// Completed successfully.
    #[display("finished")]
    Finished,
    /// Completed unsuccessfully.
    #[display("failed")]
    Failed,
    /// Killed while running.
    #[display("terminated")]
    Terminated,
    /// Will never run.
    #[display("canceled")]
    Canceled,
}

/// What closing a job in a given state does to the jobs depending on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    /// Dependents are left alone.
    None,
    /// Every dependent is closed as [`JobState::Canceled`].
    CancelDependents,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::New,
        JobState::Pending,
        JobState::Running,
        JobState::Finished,
        JobState::Failed,
        JobState::Terminated,
        JobState::Canceled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Terminated | JobState::Canceled
        )
    }

    /// Whether a dependency in this state lets its dependents start.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, JobState::Finished)
    }

    /// Any open job may be closed with any terminal state. Terminal states
    /// have no outgoing transitions.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        match self {
            New => next == Pending || next.is_terminal(),
            Pending => next == Running || next.is_terminal(),
            Running => next.is_terminal(),
            Finished | Failed | Terminated | Canceled => false,
        }
    }

    /// Cascade policy for a job closed in this state.
    ///
    /// Dependents are always canceled, whatever the triggering terminal state
    /// was. Passing a non-terminal state is a contract violation.
    pub fn cascade(&self) -> Result<Cascade> {
        match self {
            JobState::Canceled | JobState::Terminated | JobState::Failed => {
                Ok(Cascade::CancelDependents)
            }
            JobState::Finished => Ok(Cascade::None),
            other => Err(Error::IllegalFinalState(*other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Terminated => "terminated",
            JobState::Canceled => "canceled",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Parse(format!("unknown job state: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = JobState::ALL
            .into_iter()
            .filter(JobState::is_terminal)
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobState::Finished,
                JobState::Failed,
                JobState::Terminated,
                JobState::Canceled
            ]
        );
    }

    #[test]
    fn test_terminal_states_have_no_transitions() {
        for from in JobState::ALL.into_iter().filter(JobState::is_terminal) {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(JobState::New.can_transition_to(JobState::Pending));
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Pending.can_transition_to(JobState::Canceled));
        assert!(JobState::Running.can_transition_to(JobState::Finished));
        assert!(!JobState::New.can_transition_to(JobState::Running));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
        assert!(!JobState::Pending.can_transition_to(JobState::New));
    }

    #[test]
    fn test_open_jobs_close_with_any_terminal_state() {
        for from in [JobState::New, JobState::Pending, JobState::Running] {
            for to in JobState::ALL.into_iter().filter(JobState::is_terminal) {
                assert!(from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_failures_cancel_dependents() {
        for state in [JobState::Failed, JobState::Terminated, JobState::Canceled] {
            assert_eq!(state.cascade().unwrap(), Cascade::CancelDependents);
        }
        assert_eq!(JobState::Finished.cascade().unwrap(), Cascade::None);
    }

    #[test]
    fn test_non_terminal_final_state_is_rejected() {
        for state in [JobState::New, JobState::Pending, JobState::Running] {
            assert!(matches!(
                state.cascade(),
                Err(Error::IllegalFinalState(s)) if s == state
            ));
        }
    }

    #[test]
    fn test_only_finished_satisfies_dependency() {
        for state in JobState::ALL {
            assert_eq!(state.satisfies_dependency(), state == JobState::Finished);
        }
    }

    #[test]
    fn test_parse_round_trips_display() {
        for state in JobState::ALL {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert_eq!("FAILED".parse::<JobState>().unwrap(), JobState::Failed);
        assert!("done".parse::<JobState>().is_err());
    }
}
