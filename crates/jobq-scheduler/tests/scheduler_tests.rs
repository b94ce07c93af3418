//! Scheduler behaviour against the in-memory store: deduplication, startable
//! ordering and cascading closure.

use async_trait::async_trait;
use jobq_core::{Error, Job, JobId, JobState, NewJob, StateChangeListener};
use jobq_db::{DbError, DbResult, JobStore, JobTransaction, MemoryJobStore};
use jobq_scheduler::{Scheduler, SchedulerError};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

fn make_scheduler() -> (MemoryJobStore, Scheduler) {
    let store = MemoryJobStore::new();
    let scheduler = Scheduler::new(Arc::new(store.clone()));
    (store, scheduler)
}

async fn state_of(store: &MemoryJobStore, id: JobId) -> JobState {
    store.get(id).await.unwrap().unwrap().state
}

async fn running_job(scheduler: &Scheduler, command: &str, deps: &[JobId]) -> Job {
    let job = pending_job(scheduler, command, deps).await;
    assert!(scheduler.store().claim(job.id).await.unwrap());
    job
}

async fn pending_job(scheduler: &Scheduler, command: &str, deps: &[JobId]) -> Job {
    let job = deps
        .iter()
        .fold(NewJob::new(command, vec![]), |job, dep| job.depends_on(*dep));
    scheduler.enqueue(job).await.unwrap()
}

/// Records every notification and optionally overrides some of them.
#[derive(Default)]
struct RecordingListener {
    seen: Mutex<Vec<(JobId, JobState)>>,
    overrides: HashMap<JobId, JobState>,
}

impl RecordingListener {
    fn seen(&self) -> Vec<(JobId, JobState)> {
        self.seen.lock().unwrap().clone()
    }
}

impl StateChangeListener for RecordingListener {
    fn on_state_change(&self, job: &Job, proposed: JobState) -> JobState {
        self.seen.lock().unwrap().push((job.id, proposed));
        self.overrides.get(&job.id).copied().unwrap_or(proposed)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Rival {
    /// A concurrent writer inserts the same job just before us.
    Before,
    /// A concurrent writer inserts the same job just after us.
    After,
}

/// Store that simulates a concurrent writer racing the next insert.
struct RacingStore {
    inner: MemoryJobStore,
    rival: Mutex<Option<Rival>>,
}

impl RacingStore {
    fn new(inner: MemoryJobStore, rival: Rival) -> Self {
        Self {
            inner,
            rival: Mutex::new(Some(rival)),
        }
    }

    async fn insert_rival(&self, job: &NewJob) -> DbResult<Job> {
        self.inner.insert(job.clone()).await
    }
}

#[async_trait]
impl JobStore for RacingStore {
    async fn insert(&self, job: NewJob) -> DbResult<Job> {
        let rival = self.rival.lock().unwrap().take();
        if rival == Some(Rival::Before) {
            self.insert_rival(&job).await?;
        }
        let inserted = self.inner.insert(job.clone()).await?;
        if rival == Some(Rival::After) {
            self.insert_rival(&job).await?;
        }
        Ok(inserted)
    }

    async fn get(&self, id: JobId) -> DbResult<Option<Job>> {
        self.inner.get(id).await
    }

    async fn find_by_ids(&self, ids: &[JobId]) -> DbResult<Vec<Job>> {
        self.inner.find_by_ids(ids).await
    }

    async fn find_one(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        self.inner.find_one(command, args).await
    }

    async fn find_oldest(&self, command: &str, args: &[Value]) -> DbResult<Option<Job>> {
        self.inner.find_oldest(command, args).await
    }

    async fn find_one_pending(&self, excluded: &HashSet<JobId>) -> DbResult<Option<Job>> {
        self.inner.find_one_pending(excluded).await
    }

    async fn find_incoming_dependents(&self, id: JobId) -> DbResult<Vec<Job>> {
        self.inner.find_incoming_dependents(id).await
    }

    async fn set_state(&self, id: JobId, state: JobState) -> DbResult<()> {
        self.inner.set_state(id, state).await
    }

    async fn claim(&self, id: JobId) -> DbResult<bool> {
        self.inner.claim(id).await
    }

    async fn remove(&self, id: JobId) -> DbResult<()> {
        self.inner.remove(id).await
    }

    async fn add_dependency(&self, job: JobId, dependency: JobId) -> DbResult<()> {
        self.inner.add_dependency(job, dependency).await
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> DbResult<Vec<Job>> {
        self.inner.list(state, limit).await
    }

    async fn count_by_state(&self) -> DbResult<Vec<(JobState, i64)>> {
        self.inner.count_by_state().await
    }

    async fn begin(&self) -> DbResult<Box<dyn JobTransaction>> {
        self.inner.begin().await
    }
}

fn rows_for(store: &MemoryJobStore, command: &str, args: &[Value]) -> Vec<Job> {
    store
        .snapshot()
        .into_iter()
        .filter(|j| j.matches(command, args))
        .collect()
}

#[tokio::test]
async fn test_insert_race_loser_returns_winner() {
    let memory = MemoryJobStore::new();
    let scheduler = Scheduler::new(Arc::new(RacingStore::new(memory.clone(), Rival::Before)));

    let job = scheduler
        .get_or_create_if_not_exists("export", vec![json!("csv")])
        .await
        .unwrap();

    let rows = rows_for(&memory, "export", &[json!("csv")]);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, job.id);
    // The rival's own reconciliation is responsible for making it pending.
    assert_eq!(rows[0].state, JobState::New);
}

#[tokio::test]
async fn test_insert_race_winner_becomes_pending() {
    let memory = MemoryJobStore::new();
    let scheduler = Scheduler::new(Arc::new(RacingStore::new(memory.clone(), Rival::After)));

    let job = scheduler
        .get_or_create_if_not_exists("export", vec![json!("csv")])
        .await
        .unwrap();

    assert_eq!(job.state, JobState::Pending);
    let rows = rows_for(&memory, "export", &[json!("csv")]);
    assert_eq!(rows[0].id, job.id);
    assert_eq!(rows[0].state, JobState::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_converges() {
    let (store, scheduler) = make_scheduler();
    let scheduler = Arc::new(scheduler);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .get_or_create_if_not_exists("rebuild-index", vec![json!("users"), json!(3)])
                    .await
                    .unwrap()
                    .id
            })
        })
        .collect();

    let ids: HashSet<JobId> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(ids.len(), 1);
    let rows = rows_for(&store, "rebuild-index", &[json!("users"), json!(3)]);
    assert_eq!(rows.len(), 1);
    assert!(ids.contains(&rows[0].id));
    assert_eq!(rows[0].state, JobState::Pending);
}

#[tokio::test]
async fn test_startable_ordering() {
    let (store, scheduler) = make_scheduler();
    let dependency = running_job(&scheduler, "fetch", &[]).await;
    let first = pending_job(&scheduler, "first", &[]).await;
    let second = pending_job(&scheduler, "second", &[dependency.id]).await;
    let third = pending_job(&scheduler, "third", &[]).await;

    let mut excluded = HashSet::new();
    let found = scheduler.find_startable_job(&mut excluded).await.unwrap();
    assert_eq!(found.map(|j| j.id), Some(first.id));

    excluded.insert(first.id);
    let found = scheduler.find_startable_job(&mut excluded).await.unwrap();
    assert_eq!(found.map(|j| j.id), Some(third.id));
    assert!(excluded.contains(&second.id));

    scheduler
        .close_job(dependency.id, JobState::Finished)
        .await
        .unwrap();
    store.claim(first.id).await.unwrap();
    store.claim(third.id).await.unwrap();

    let found = scheduler
        .find_startable_job(&mut HashSet::new())
        .await
        .unwrap();
    assert_eq!(found.map(|j| j.id), Some(second.id));
}

#[tokio::test]
async fn test_failure_cancels_dependents() {
    let (store, scheduler) = make_scheduler();
    let b = running_job(&scheduler, "b", &[]).await;
    let a = pending_job(&scheduler, "a", &[b.id]).await;
    let unrelated = pending_job(&scheduler, "unrelated", &[]).await;

    let state = scheduler.close_job(b.id, JobState::Failed).await.unwrap();

    assert_eq!(state, JobState::Failed);
    assert_eq!(state_of(&store, b.id).await, JobState::Failed);
    assert_eq!(state_of(&store, a.id).await, JobState::Canceled);
    assert_eq!(state_of(&store, unrelated.id).await, JobState::Pending);
    assert!(store.get(a.id).await.unwrap().unwrap().closed_at.is_some());
}

#[tokio::test]
async fn test_finished_job_does_not_cascade() {
    let (store, scheduler) = make_scheduler();
    let b = running_job(&scheduler, "b", &[]).await;
    let a = pending_job(&scheduler, "a", &[b.id]).await;

    scheduler.close_job(b.id, JobState::Finished).await.unwrap();

    assert_eq!(state_of(&store, b.id).await, JobState::Finished);
    assert_eq!(state_of(&store, a.id).await, JobState::Pending);
}

#[tokio::test]
async fn test_cascade_is_transitive_and_always_cancels() {
    let (store, scheduler) = make_scheduler();
    let root = running_job(&scheduler, "root", &[]).await;
    let mid = pending_job(&scheduler, "mid", &[root.id]).await;
    let leaf = pending_job(&scheduler, "leaf", &[mid.id]).await;

    scheduler
        .close_job(root.id, JobState::Terminated)
        .await
        .unwrap();

    assert_eq!(state_of(&store, root.id).await, JobState::Terminated);
    assert_eq!(state_of(&store, mid.id).await, JobState::Canceled);
    assert_eq!(state_of(&store, leaf.id).await, JobState::Canceled);
}

#[tokio::test]
async fn test_diamond_notifies_each_job_once() {
    let store = MemoryJobStore::new();
    let listener = Arc::new(RecordingListener::default());
    let scheduler = Scheduler::with_listener(Arc::new(store.clone()), listener.clone());

    let b = running_job(&scheduler, "b", &[]).await;
    let c = pending_job(&scheduler, "c", &[b.id]).await;
    let d = pending_job(&scheduler, "d", &[b.id]).await;
    let a = pending_job(&scheduler, "a", &[c.id, d.id]).await;

    scheduler.close_job(b.id, JobState::Failed).await.unwrap();

    let seen = listener.seen();
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], (b.id, JobState::Failed));
    for id in [c.id, d.id, a.id] {
        let hits: Vec<_> = seen.iter().filter(|(j, _)| *j == id).collect();
        assert_eq!(hits, vec![&(id, JobState::Canceled)]);
    }
    for id in [c.id, d.id, a.id] {
        assert_eq!(state_of(&store, id).await, JobState::Canceled);
    }
}

#[tokio::test]
async fn test_listener_override_prevents_cascade() {
    let store = MemoryJobStore::new();
    let memory: Arc<dyn JobStore> = Arc::new(store.clone());
    let b = memory.insert(NewJob::new("b", vec![])).await.unwrap();
    memory.claim(b.id).await.unwrap();
    let a = memory
        .insert(NewJob::new("a", vec![]).depends_on(b.id))
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener {
        overrides: HashMap::from([(b.id, JobState::Finished)]),
        ..Default::default()
    });
    let scheduler = Scheduler::with_listener(memory, listener.clone());

    let state = scheduler.close_job(b.id, JobState::Failed).await.unwrap();

    assert_eq!(state, JobState::Finished);
    assert_eq!(state_of(&store, b.id).await, JobState::Finished);
    assert_eq!(state_of(&store, a.id).await, JobState::Pending);
    assert_eq!(listener.seen(), vec![(b.id, JobState::Failed)]);
}

#[tokio::test]
async fn test_listener_can_finish_a_pending_dependent() {
    let store = MemoryJobStore::new();
    let memory: Arc<dyn JobStore> = Arc::new(store.clone());
    let b = memory.insert(NewJob::new("b", vec![])).await.unwrap();
    memory.claim(b.id).await.unwrap();
    let a = memory
        .insert(NewJob::new("a", vec![]).depends_on(b.id))
        .await
        .unwrap();
    let c = memory
        .insert(NewJob::new("c", vec![]).depends_on(a.id))
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener {
        overrides: HashMap::from([(a.id, JobState::Finished)]),
        ..Default::default()
    });
    let scheduler = Scheduler::with_listener(memory, listener.clone());

    let state = scheduler.close_job(b.id, JobState::Failed).await.unwrap();

    assert_eq!(state, JobState::Failed);
    assert_eq!(state_of(&store, b.id).await, JobState::Failed);
    assert_eq!(state_of(&store, a.id).await, JobState::Finished);
    // A finished, so nothing cascades past it.
    assert_eq!(state_of(&store, c.id).await, JobState::Pending);
    assert_eq!(
        listener.seen(),
        vec![(b.id, JobState::Failed), (a.id, JobState::Canceled)]
    );
}

#[tokio::test]
async fn test_listener_can_finish_a_pending_root() {
    let store = MemoryJobStore::new();
    let memory: Arc<dyn JobStore> = Arc::new(store.clone());
    let b = memory.insert(NewJob::new("b", vec![])).await.unwrap();

    let listener = Arc::new(RecordingListener {
        overrides: HashMap::from([(b.id, JobState::Finished)]),
        ..Default::default()
    });
    let scheduler = Scheduler::with_listener(memory, listener);

    let state = scheduler.close_job(b.id, JobState::Failed).await.unwrap();
    assert_eq!(state, JobState::Finished);
    assert_eq!(state_of(&store, b.id).await, JobState::Finished);
}

#[tokio::test]
async fn test_listener_override_to_non_terminal_state_rolls_back() {
    let store = MemoryJobStore::new();
    let memory: Arc<dyn JobStore> = Arc::new(store.clone());
    let b = memory.insert(NewJob::new("b", vec![])).await.unwrap();
    memory.claim(b.id).await.unwrap();
    let a = memory
        .insert(NewJob::new("a", vec![]).depends_on(b.id))
        .await
        .unwrap();

    let listener = Arc::new(RecordingListener {
        overrides: HashMap::from([(a.id, JobState::Pending)]),
        ..Default::default()
    });
    let scheduler = Scheduler::with_listener(memory, listener);

    let result = scheduler.close_job(b.id, JobState::Failed).await;

    assert!(matches!(
        result,
        Err(SchedulerError::Job(Error::IllegalFinalState(JobState::Pending)))
    ));
    assert_eq!(state_of(&store, b.id).await, JobState::Running);
    assert_eq!(state_of(&store, a.id).await, JobState::Pending);
}

#[tokio::test]
async fn test_store_error_mid_cascade_rolls_back_everything() {
    let (store, scheduler) = make_scheduler();
    let b = running_job(&scheduler, "b", &[]).await;
    let a = pending_job(&scheduler, "a", &[b.id]).await;
    let z = pending_job(&scheduler, "z", &[a.id]).await;
    store.fail_updates_for(a.id);

    let result = scheduler.close_job(b.id, JobState::Failed).await;

    assert!(matches!(
        result,
        Err(SchedulerError::Store(DbError::Injected(_)))
    ));
    assert_eq!(state_of(&store, b.id).await, JobState::Running);
    assert_eq!(state_of(&store, a.id).await, JobState::Pending);
    assert_eq!(state_of(&store, z.id).await, JobState::Pending);

    store.clear_failures();
    scheduler.close_job(b.id, JobState::Failed).await.unwrap();
    assert_eq!(state_of(&store, z.id).await, JobState::Canceled);
}

#[tokio::test]
async fn test_cycle_terminates() {
    let (store, scheduler) = make_scheduler();
    let x = pending_job(&scheduler, "x", &[]).await;
    let y = pending_job(&scheduler, "y", &[x.id]).await;
    scheduler.add_dependency(x.id, y.id).await.unwrap();

    scheduler.close_job(x.id, JobState::Canceled).await.unwrap();

    assert_eq!(state_of(&store, x.id).await, JobState::Canceled);
    assert_eq!(state_of(&store, y.id).await, JobState::Canceled);
}

#[tokio::test]
async fn test_already_closed_dependents_are_left_alone() {
    let store = MemoryJobStore::new();
    let listener = Arc::new(RecordingListener::default());
    let scheduler = Scheduler::with_listener(Arc::new(store.clone()), listener.clone());

    let first = running_job(&scheduler, "first", &[]).await;
    let second = running_job(&scheduler, "second", &[]).await;
    let child = pending_job(&scheduler, "child", &[first.id, second.id]).await;

    scheduler.close_job(first.id, JobState::Failed).await.unwrap();
    assert_eq!(state_of(&store, child.id).await, JobState::Canceled);

    scheduler
        .close_job(second.id, JobState::Terminated)
        .await
        .unwrap();

    assert_eq!(state_of(&store, child.id).await, JobState::Canceled);
    let child_hits = listener
        .seen()
        .into_iter()
        .filter(|(id, _)| *id == child.id)
        .count();
    assert_eq!(child_hits, 1);
}
