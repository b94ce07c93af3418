//! Scheduler - deduplicated job creation, startable-job selection and
//! cascading closure.

use jobq_core::{
    Cascade, DependencyView, Error, Job, JobArgs, JobId, JobState, NewJob, NoopListener,
    StateChangeListener, job::validate_args,
};
use jobq_db::{JobStore, JobTransaction};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::SchedulerResult;

/// Orchestrates the job store and the state machine.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    listener: Arc<dyn StateChangeListener>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_listener(store, Arc::new(NoopListener))
    }

    /// Create a scheduler that reports state changes to `listener`.
    pub fn with_listener(
        store: Arc<dyn JobStore>,
        listener: Arc<dyn StateChangeListener>,
    ) -> Self {
        Self { store, listener }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn listener(&self) -> &Arc<dyn StateChangeListener> {
        &self.listener
    }

    /// Look up a job by id.
    pub async fn job(&self, id: JobId) -> SchedulerResult<Job> {
        let job = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;
        Ok(job)
    }

    pub async fn find_job(&self, command: &str, args: &[Value]) -> SchedulerResult<Option<Job>> {
        Ok(self.store.find_one(command, args).await?)
    }

    /// Look up a job by its dedup key, failing when there is none.
    pub async fn get_job(&self, command: &str, args: &[Value]) -> SchedulerResult<Job> {
        let job = self.find_job(command, args).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "found no job for command \"{}\" with args {}",
                command,
                Value::from(args.to_vec())
            ))
        })?;
        Ok(job)
    }

    /// Return the job for `(command, args)`, creating it when missing.
    ///
    /// Concurrent callers may both insert a row. The lowest id wins: the
    /// winner is made pending, every loser deletes its own row and returns
    /// the winner instead.
    pub async fn get_or_create_if_not_exists(
        &self,
        command: &str,
        args: JobArgs,
    ) -> SchedulerResult<Job> {
        validate_args(&args)?;

        if let Some(job) = self.store.find_one(command, &args).await? {
            return Ok(job);
        }

        let candidate = NewJob::new(command, args).with_state(JobState::New);
        candidate.validate()?;
        let mut inserted = self.store.insert(candidate).await?;

        let oldest = self
            .store
            .find_oldest(&inserted.command, &inserted.args)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {} vanished after insert", inserted.id)))?;

        if oldest.id == inserted.id {
            self.store.set_state(inserted.id, JobState::Pending).await?;
            inserted.state = JobState::Pending;
            info!(job_id = %inserted.id, command = %inserted.command, "Created job");
            return Ok(inserted);
        }

        debug!(
            job_id = %inserted.id,
            winner = %oldest.id,
            command = %inserted.command,
            "Lost insert race, discarding duplicate"
        );
        self.store.remove(inserted.id).await?;
        Ok(oldest)
    }

    /// Submit a job without deduplication.
    pub async fn enqueue(&self, job: NewJob) -> SchedulerResult<Job> {
        job.validate()?;

        if !job.dependencies.is_empty() {
            let found = self.store.find_by_ids(&job.dependencies).await?;
            if let Some(missing) = job
                .dependencies
                .iter()
                .find(|dep| !found.iter().any(|j| j.id == **dep))
            {
                return Err(Error::NotFound(format!("dependency job {}", missing)).into());
            }
        }

        let job = self.store.insert(job).await?;
        info!(
            job_id = %job.id,
            command = %job.command,
            dependencies = job.dependencies.len(),
            "Enqueued job"
        );
        Ok(job)
    }

    /// Make `job` wait for `dependency`. Only jobs that have not started yet
    /// accept new dependencies.
    pub async fn add_dependency(&self, job: JobId, dependency: JobId) -> SchedulerResult<()> {
        if job == dependency {
            return Err(Error::InvalidInput(format!("job {} cannot depend on itself", job)).into());
        }

        let record = self.job(job).await?;
        if !matches!(record.state, JobState::New | JobState::Pending) {
            return Err(Error::InvalidInput(format!(
                "cannot add dependencies to job {} in state {}",
                job, record.state
            ))
            .into());
        }
        self.job(dependency).await?;

        self.store.add_dependency(job, dependency).await?;
        debug!(job_id = %job, dependency = %dependency, "Added dependency");
        Ok(())
    }

    /// The lowest-id pending job not in `excluded`, startable or not.
    pub async fn find_pending_job(
        &self,
        excluded: &HashSet<JobId>,
    ) -> SchedulerResult<Option<Job>> {
        Ok(self.store.find_one_pending(excluded).await?)
    }

    /// Whether every dependency of `job` has finished. Dependency states are
    /// always read fresh from the store.
    pub async fn is_startable(&self, job: &Job) -> SchedulerResult<bool> {
        if job.dependencies.is_empty() {
            return Ok(true);
        }
        let dependencies = self.store.find_by_ids(&job.dependencies).await?;
        Ok(DependencyView::new(&dependencies).is_startable(job))
    }

    /// Find the lowest-id pending job whose dependencies have all finished.
    ///
    /// Blocked jobs are added to `excluded`, so callers can keep the set
    /// between calls to skip jobs they already know are blocked.
    pub async fn find_startable_job(
        &self,
        excluded: &mut HashSet<JobId>,
    ) -> SchedulerResult<Option<Job>> {
        while let Some(job) = self.find_pending_job(excluded).await? {
            if self.is_startable(&job).await? {
                return Ok(Some(job));
            }

            debug!(job_id = %job.id, "Skipping blocked job");
            excluded.insert(job.id);
            // Another worker may advance this job's dependencies at any time.
            self.store.detach(job.id);
        }

        Ok(None)
    }

    /// Close a job with `final_state` and cascade to its dependents.
    ///
    /// Runs in one transaction: either the job and every dependent it
    /// cancels are updated, or nothing is. Returns the state the job was
    /// actually closed with, which the listener may have changed.
    pub async fn close_job(&self, id: JobId, final_state: JobState) -> SchedulerResult<JobState> {
        let mut tx = self.store.begin().await?;

        match self.close_in_transaction(tx.as_mut(), id, final_state).await {
            Ok((state, closed)) => {
                tx.commit().await?;
                info!(job_id = %id, state = %state, closed, "Closed job");
                Ok(state)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(job_id = %id, error = %rollback_err, "Rollback failed");
                }
                warn!(job_id = %id, error = %e, "Closing job failed, rolled back");
                Err(e)
            }
        }
    }

    /// Depth-first closure over incoming dependency edges. Each job is
    /// visited at most once, which bounds the walk on diamonds and cycles.
    async fn close_in_transaction(
        &self,
        tx: &mut dyn JobTransaction,
        root: JobId,
        final_state: JobState,
    ) -> SchedulerResult<(JobState, usize)> {
        let job = tx
            .get(root)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {}", root)))?;

        let mut visited = HashSet::new();
        let mut stack = vec![(job, final_state)];
        let mut root_state = None;

        while let Some((job, proposed)) = stack.pop() {
            if !visited.insert(job.id) {
                continue;
            }

            let state = self.listener.on_state_change(&job, proposed);
            if state != proposed {
                debug!(job_id = %job.id, proposed = %proposed, state = %state, "Listener overrode state");
            }

            match state.cascade()? {
                Cascade::CancelDependents => {
                    let dependents = tx.find_incoming_dependents(job.id).await?;
                    // Reversed so the lowest id is popped first.
                    for dependent in dependents.into_iter().rev() {
                        if visited.contains(&dependent.id) {
                            continue;
                        }
                        if dependent.state.is_terminal() {
                            debug!(job_id = %dependent.id, state = %dependent.state, "Dependent already closed");
                            continue;
                        }
                        stack.push((dependent, JobState::Canceled));
                    }
                }
                Cascade::None => {}
            }

            if !job.state.can_transition_to(state) {
                return Err(Error::InvalidTransition {
                    job: job.id,
                    from: job.state,
                    to: state,
                }
                .into());
            }

            tx.update_state(job.id, state).await?;
            root_state.get_or_insert(state);
        }

        // The root is always visited first.
        Ok((root_state.unwrap_or(final_state), visited.len()))
    }
}
