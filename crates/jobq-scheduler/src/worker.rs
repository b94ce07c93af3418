//! Worker that processes jobs from the queue.

use crate::{Scheduler, SchedulerError, SchedulerResult};
use async_trait::async_trait;
use jobq_config::WorkerConfig;
use jobq_core::{Job, JobId, JobState, OutputEvent, OutputStream, StateChangeListener};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Finished,
    Failed,
    Terminated,
    Canceled,
}

impl JobOutcome {
    /// The final state reported to the scheduler.
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Finished => JobState::Finished,
            JobOutcome::Failed => JobState::Failed,
            JobOutcome::Terminated => JobState::Terminated,
            JobOutcome::Canceled => JobState::Canceled,
        }
    }
}

/// Forwards output of a running job to the scheduler's listener and the log.
#[derive(Clone)]
pub struct OutputSink {
    job: Arc<Job>,
    listener: Arc<dyn StateChangeListener>,
}

impl OutputSink {
    pub fn new(job: Arc<Job>, listener: Arc<dyn StateChangeListener>) -> Self {
        Self { job, listener }
    }

    pub fn emit(&self, event: OutputEvent) {
        let event = self.listener.on_output(&self.job, event);
        match event.stream {
            OutputStream::Stdout => info!(job_id = %self.job.id, stream = "stdout", "{}", event.chunk),
            OutputStream::Stderr => warn!(job_id = %self.job.id, stream = "stderr", "{}", event.chunk),
        }
    }

    pub fn stdout(&self, chunk: impl Into<String>) {
        self.emit(OutputEvent::stdout(chunk));
    }

    pub fn stderr(&self, chunk: impl Into<String>) {
        self.emit(OutputEvent::stderr(chunk));
    }
}

/// Executes the command of a claimed job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job, output: OutputSink) -> JobOutcome;
}

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    scheduler: Arc<Scheduler>,
    runner: Arc<dyn JobRunner>,
    poll_interval: Duration,
    error_backoff: Duration,
    /// Claimed jobs whose closing failed, with the state to retry with.
    unclosed: Mutex<Vec<(JobId, JobState)>>,
}

impl Worker {
    pub fn new(
        config: &WorkerConfig,
        scheduler: Arc<Scheduler>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            id: config.id.clone(),
            scheduler,
            runner,
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            unclosed: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim, run and close at most one job. Returns the closed job and the
    /// state it ended in, or `None` when nothing was startable.
    ///
    /// A claimed job whose closing failed is retried before any new job is
    /// claimed, so it never stays running.
    pub async fn run_once(&self) -> SchedulerResult<Option<(JobId, JobState)>> {
        if let Some(closed) = self.retry_unclosed().await? {
            return Ok(Some(closed));
        }

        let mut excluded = HashSet::new();

        while let Some(job) = self.scheduler.find_startable_job(&mut excluded).await? {
            // Another worker may have picked the same job.
            if !self.scheduler.store().claim(job.id).await? {
                excluded.insert(job.id);
                continue;
            }
            info!(worker_id = %self.id, job_id = %job.id, command = %job.command, "Claimed job");

            let outcome = match self.scheduler.job(job.id).await {
                Ok(claimed) => {
                    let claimed = Arc::new(claimed);
                    let output =
                        OutputSink::new(claimed.clone(), self.scheduler.listener().clone());
                    self.runner.run(&claimed, output).await
                }
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to load claimed job");
                    JobOutcome::Failed
                }
            };

            let state = self.close(job.id, outcome.state()).await?;
            return Ok(Some((job.id, state)));
        }

        Ok(None)
    }

    /// Close a claimed job, remembering it for a retry when that fails.
    async fn close(&self, id: JobId, state: JobState) -> SchedulerResult<JobState> {
        match self.scheduler.close_job(id, state).await {
            Ok(state) => Ok(state),
            Err(e) => {
                // A rejected state will be rejected again; fail the job instead.
                let retry = match e {
                    SchedulerError::Job(_) => JobState::Failed,
                    SchedulerError::Store(_) => state,
                };
                warn!(
                    worker_id = %self.id,
                    job_id = %id,
                    error = %e,
                    retry_state = %retry,
                    "Failed to close job, will retry"
                );
                self.unclosed().push((id, retry));
                Err(e)
            }
        }
    }

    async fn retry_unclosed(&self) -> SchedulerResult<Option<(JobId, JobState)>> {
        let next = self.unclosed().pop();
        let Some((id, state)) = next else {
            return Ok(None);
        };

        let job = match self.scheduler.store().get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.unclosed().push((id, state));
                return Err(e.into());
            }
        };
        // The failed attempt may have committed after all.
        if job.state.is_terminal() {
            return Ok(Some((id, job.state)));
        }

        info!(worker_id = %self.id, job_id = %id, state = %state, "Retrying close");
        let state = self.close(id, state).await?;
        Ok(Some((id, state)))
    }

    fn unclosed(&self) -> MutexGuard<'_, Vec<(JobId, JobState)>> {
        self.unclosed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the worker loop until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, "Starting worker");

        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }

            let pause = match self.run_once().await {
                Ok(Some(_)) => continue,
                // No jobs available, wait before polling again
                Ok(None) => self.poll_interval,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to process job");
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }
}
