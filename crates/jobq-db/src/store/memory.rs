//! In-memory job store.
//!
//! Keeps every job in a single map behind a mutex. Transactions stage their
//! writes and apply them in one step on commit, so a rolled back transaction
//! leaves no trace. Meant for tests and embedding, not for multi-process use.

use async_trait::async_trait;
use chrono::Utc;
use jobq_core::{DependencyView, Job, JobId, JobState, NewJob};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{JobStore, JobTransaction, stamp};
use crate::{DbError, DbResult};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, Job>,
    last_id: i64,
    failing_updates: HashSet<JobId>,
}

impl MemoryState {
    fn ensure_writable(&self, id: JobId) -> DbResult<()> {
        if self.failing_updates.contains(&id) {
            return Err(DbError::Injected(format!("update of job {}", id)));
        }
        if !self.jobs.contains_key(&id) {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        Ok(())
    }
}

/// Job store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later state update of `id` fail, inside or outside a
    /// transaction.
    pub fn fail_updates_for(&self, id: JobId) {
        self.state().failing_updates.insert(id);
    }

    pub fn clear_failures(&self) {
        self.state().failing_updates.clear();
    }

    /// Snapshot of every stored job, lowest id first.
    pub fn snapshot(&self) -> Vec<Job> {
        self.state().jobs.values().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find_first(&self, pred: impl Fn(&Job) -> bool) -> Option<Job> {
        self.state().jobs.values().find(|j| pred(j)).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob) -> DbResult<Job> {
        let mut state = self.state();
        if let Some(missing) = job
            .dependencies
            .iter()
            .find(|dep| !state.jobs.contains_key(dep))
        {
            return Err(DbError::NotFound(format!("dependency job {}", missing)));
        }

        state.last_id += 1;
        let record = Job {
            id: JobId::new(state.last_id),
            command: job.command,
            args: job.args,
            state: job.state,
            dependencies: job.dependencies,
            created_at: Utc::now(),
            started_at: None,
            closed_at: None,
        };
        state.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: JobId) -> DbResult<Option<Job>> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn find_by_ids(&self, ids: &[JobId]) -> DbResult<Vec<Job>> {
        let state = self.state();
        let mut jobs: Vec<Job> = ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn find_one(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        Ok(self.find_first(|j| j.matches(command, args)))
    }

    async fn find_oldest(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        // The map is ordered by id, so the first match is the oldest.
        Ok(self.find_first(|j| j.matches(command, args)))
    }

    async fn find_one_pending(&self, excluded: &HashSet<JobId>) -> DbResult<Option<Job>> {
        Ok(self.find_first(|j| j.state == JobState::Pending && !excluded.contains(&j.id)))
    }

    async fn find_incoming_dependents(&self, id: JobId) -> DbResult<Vec<Job>> {
        let state = self.state();
        let view = DependencyView::new(state.jobs.values());
        Ok(view.dependents(id).into_iter().cloned().collect())
    }

    async fn set_state(&self, id: JobId, new_state: JobState) -> DbResult<()> {
        let mut state = self.state();
        state.ensure_writable(id)?;
        if let Some(job) = state.jobs.get_mut(&id) {
            stamp(job, new_state, Utc::now());
        }
        Ok(())
    }

    async fn claim(&self, id: JobId) -> DbResult<bool> {
        let mut state = self.state();
        state.ensure_writable(id)?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Pending => {
                stamp(job, JobState::Running, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: JobId) -> DbResult<()> {
        let mut state = self.state();
        state.jobs.remove(&id);
        for job in state.jobs.values_mut() {
            job.dependencies.retain(|dep| *dep != id);
        }
        Ok(())
    }

    async fn add_dependency(&self, job: JobId, dependency: JobId) -> DbResult<()> {
        let mut state = self.state();
        if !state.jobs.contains_key(&dependency) {
            return Err(DbError::NotFound(format!("dependency job {}", dependency)));
        }
        let record = state
            .jobs
            .get_mut(&job)
            .ok_or_else(|| DbError::NotFound(format!("job {}", job)))?;
        if !record.depends_on(dependency) {
            record.dependencies.push(dependency);
        }
        Ok(())
    }

    async fn list(&self, filter: Option<JobState>, limit: usize) -> DbResult<Vec<Job>> {
        Ok(self
            .state()
            .jobs
            .values()
            .filter(|j| filter.is_none_or(|s| j.state == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_by_state(&self) -> DbResult<Vec<(JobState, i64)>> {
        let state = self.state();
        Ok(JobState::ALL
            .into_iter()
            .map(|s| (s, state.jobs.values().filter(|j| j.state == s).count() as i64))
            .filter(|(_, count)| *count > 0)
            .collect())
    }

    async fn begin(&self) -> DbResult<Box<dyn JobTransaction>> {
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            staged: BTreeMap::new(),
        }))
    }
}

/// Transaction over a [`MemoryJobStore`].
pub struct MemoryTransaction {
    store: MemoryJobStore,
    staged: BTreeMap<JobId, JobState>,
}

impl MemoryTransaction {
    fn overlay(&self, mut job: Job) -> Job {
        if let Some(state) = self.staged.get(&job.id) {
            stamp(&mut job, *state, Utc::now());
        }
        job
    }
}

#[async_trait]
impl JobTransaction for MemoryTransaction {
    async fn get(&mut self, id: JobId) -> DbResult<Option<Job>> {
        let job = self.store.state().jobs.get(&id).cloned();
        Ok(job.map(|j| self.overlay(j)))
    }

    async fn find_incoming_dependents(&mut self, id: JobId) -> DbResult<Vec<Job>> {
        let dependents = self.store.find_incoming_dependents(id).await?;
        Ok(dependents.into_iter().map(|j| self.overlay(j)).collect())
    }

    async fn update_state(&mut self, id: JobId, state: JobState) -> DbResult<()> {
        self.store.state().ensure_writable(id)?;
        self.staged.insert(id, state);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let mut state = self.store.state();
        let now = Utc::now();
        for (id, new_state) in &self.staged {
            if let Some(job) = state.jobs.get_mut(id) {
                stamp(job, *new_state, now);
            }
        }
        debug!(updates = self.staged.len(), "Committed memory transaction");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        debug!(discarded = self.staged.len(), "Rolled back memory transaction");
        Ok(())
    }
}
