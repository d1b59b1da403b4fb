//! In-memory batch and job store.
//!
//! Intended for tests/dev. Transactions stage their writes and apply them
//! atomically on commit; each staged stamp is re-checked against live state
//! so a conflicting commit surfaces as `ConcurrentModification` even when the
//! advisory lock was skipped. Advisory locks are per-batch async mutexes
//! whose guards live in the transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use convoy_core::{
    BatchError, BatchId, BatchRecord, BatchResult, BatchTimestamp, JobId, Properties,
};

use super::{BatchQuery, BatchStore, BatchTransaction, JobStore, StoreCapabilities};
use crate::jobs::{Job, NewJob};

#[derive(Debug, Default)]
struct State {
    batches: HashMap<BatchId, BatchRecord>,
    jobs: HashMap<JobId, Job>,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<State>,
    locks: Mutex<HashMap<BatchId, Arc<AsyncMutex<()>>>>,
    capabilities: StoreCapabilities,
    lock_timeout: Duration,
}

/// In-memory store shared by cloning.
#[derive(Debug, Clone)]
pub struct InMemoryBatchStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBatchStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self::with_options(StoreCapabilities::full(), Self::DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_options(capabilities: StoreCapabilities, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                locks: Mutex::new(HashMap::new()),
                capabilities,
                lock_timeout,
            }),
        }
    }

    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self::with_options(capabilities, Self::DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self::with_options(StoreCapabilities::full(), lock_timeout)
    }

    /// Every stored job, oldest first.
    pub fn jobs(&self) -> BatchResult<Vec<Job>> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn read(&self) -> BatchResult<std::sync::RwLockReadGuard<'_, State>> {
        self.inner
            .state
            .read()
            .map_err(|_| BatchError::storage("state lock poisoned"))
    }

    fn write(&self) -> BatchResult<std::sync::RwLockWriteGuard<'_, State>> {
        self.inner
            .state
            .write()
            .map_err(|_| BatchError::storage("state lock poisoned"))
    }

    fn jobs_where(&self, pred: impl Fn(&Job) -> bool) -> BatchResult<Vec<Job>> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state.jobs.values().filter(|&j| pred(j)).cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> BatchResult<Self::Tx> {
        Ok(InMemoryTransaction {
            store: self.clone(),
            locks: HashMap::new(),
            changes: Vec::new(),
        })
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.inner.capabilities
    }

    async fn get_batch(&self, id: BatchId) -> BatchResult<Option<BatchRecord>> {
        Ok(self.read()?.batches.get(&id).cloned())
    }

    async fn list_batches(&self, query: &BatchQuery) -> BatchResult<Vec<BatchRecord>> {
        let state = self.read()?;
        let mut batches: Vec<BatchRecord> = state
            .batches
            .values()
            .filter(|b| query.cursor.is_none_or(|c| c.admits(b)))
            .filter(|b| query.filter.matches(b))
            .cloned()
            .collect();
        batches.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        batches.truncate(query.limit);
        Ok(batches)
    }

    async fn finished_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>> {
        let field = self.inner.capabilities.completion_timestamp();
        let state = self.read()?;
        let mut batches: Vec<BatchRecord> = state
            .batches
            .values()
            .filter(|b| b.timestamp(field).is_some_and(|at| at <= before))
            .cloned()
            .collect();
        batches.sort_by_key(|b| (b.timestamp(field), b.id));
        batches.truncate(limit);
        Ok(batches)
    }

    async fn pending_batches(
        &self,
        after: Option<(DateTime<Utc>, BatchId)>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>> {
        let track_callbacks = self.inner.capabilities.callbacks_finished_at;
        let state = self.read()?;
        let members = |id: BatchId| state.jobs.values().filter(move |j| j.batch_id == Some(id));
        let mut pending: Vec<BatchRecord> = state
            .batches
            .values()
            .filter(|b| b.is_enqueued())
            .filter(|b| after.is_none_or(|cursor| (b.created_at, b.id) > cursor))
            .filter(|b| {
                if !b.is_finished() {
                    members(b.id).all(Job::is_finished)
                        || (!b.is_discarded() && members(b.id).any(Job::is_discarding))
                } else {
                    track_callbacks
                        && !b.are_callbacks_finished()
                        && state
                            .jobs
                            .values()
                            .filter(|j| j.batch_callback_id == Some(b.id))
                            .all(Job::is_finished)
                }
            })
            .cloned()
            .collect();
        pending.sort_by_key(|b| (b.created_at, b.id));
        pending.truncate(limit);
        Ok(pending)
    }
}

#[async_trait]
impl JobStore for InMemoryBatchStore {
    async fn get_job(&self, id: JobId) -> BatchResult<Option<Job>> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn claim_next(&self, queues: &[String], lease: Duration) -> BatchResult<Option<Job>> {
        let now = Utc::now();
        let expired = chrono::Duration::from_std(lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease));
        let mut state = self.write()?;
        let next = state
            .jobs
            .values()
            .filter(|j| j.finished_at.is_none())
            .filter(|j| {
                j.performed_at
                    .is_none_or(|at| expired.is_some_and(|expired| at < expired))
            })
            .filter(|j| j.scheduled_at <= now)
            .filter(|j| queues.is_empty() || queues.contains(&j.queue_name))
            .min_by_key(|j| (j.priority, j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            state.jobs.get_mut(&id).map(|job| {
                job.performed_at = Some(now);
                job.attempts += 1;
                job.clone()
            })
        }))
    }

    async fn finish_job(&self, id: JobId, error: Option<String>) -> BatchResult<Job> {
        let mut state = self.write()?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| BatchError::not_found(format!("job {id}")))?;
        if job.is_finished() {
            return Err(BatchError::invalid_argument(format!(
                "job {id} already finished"
            )));
        }
        job.finished_at = Some(Utc::now());
        job.error = error;
        Ok(job.clone())
    }

    async fn reschedule_job(
        &self,
        id: JobId,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> BatchResult<Job> {
        let mut state = self.write()?;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| BatchError::not_found(format!("job {id}")))?;
        if job.is_finished() {
            return Err(BatchError::invalid_argument(format!(
                "job {id} already finished"
            )));
        }
        job.performed_at = None;
        job.scheduled_at = at;
        job.error = error;
        Ok(job.clone())
    }

    async fn batch_jobs(&self, batch_id: BatchId) -> BatchResult<Vec<Job>> {
        self.jobs_where(|j| j.batch_id == Some(batch_id))
    }

    async fn callback_jobs(&self, batch_id: BatchId) -> BatchResult<Vec<Job>> {
        self.jobs_where(|j| j.batch_callback_id == Some(batch_id))
    }
}

#[derive(Debug)]
enum Change {
    InsertBatch(BatchRecord),
    Stamp {
        id: BatchId,
        field: BatchTimestamp,
        at: DateTime<Utc>,
    },
    Properties {
        id: BatchId,
        properties: Properties,
    },
    InsertJob(Job),
}

/// Staged writes plus the advisory locks held.
#[derive(Debug)]
pub struct InMemoryTransaction {
    store: InMemoryBatchStore,
    locks: HashMap<BatchId, OwnedMutexGuard<()>>,
    changes: Vec<Change>,
}

impl InMemoryTransaction {
    fn lock_for(&self, id: BatchId) -> BatchResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .store
            .inner
            .locks
            .lock()
            .map_err(|_| BatchError::storage("lock table poisoned"))?;
        Ok(locks.entry(id).or_default().clone())
    }

    /// Live state overlaid with this transaction's staged writes.
    fn view(&self, id: BatchId) -> BatchResult<Option<BatchRecord>> {
        let mut batch = self.store.read()?.batches.get(&id).cloned();
        for change in &self.changes {
            match change {
                Change::InsertBatch(record) if record.id == id => batch = Some(record.clone()),
                Change::Stamp { id: target, field, at } if *target == id => {
                    if let Some(b) = batch.as_mut() {
                        b.stamp(*field, *at);
                    }
                }
                Change::Properties { id: target, properties } if *target == id => {
                    if let Some(b) = batch.as_mut() {
                        b.properties = properties.clone();
                    }
                }
                _ => {}
            }
        }
        Ok(batch)
    }

    fn count_jobs(&self, pred: impl Fn(&Job) -> bool) -> BatchResult<u64> {
        let state = self.store.read()?;
        let live = state.jobs.values().filter(|&j| pred(j)).count();
        let staged = self
            .changes
            .iter()
            .filter(|c| matches!(c, Change::InsertJob(j) if pred(j)))
            .count();
        Ok((live + staged) as u64)
    }
}

#[async_trait]
impl BatchTransaction for InMemoryTransaction {
    async fn lock_batch(&mut self, id: BatchId) -> BatchResult<()> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }
        let mutex = self.lock_for(id)?;
        let timeout = self.store.inner.lock_timeout;
        let guard = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| {
                BatchError::lock_unavailable(format!(
                    "batch {id} still locked after {}ms",
                    timeout.as_millis()
                ))
            })?;
        debug!(batch_id = %id, "advisory lock acquired");
        self.locks.insert(id, guard);
        Ok(())
    }

    fn holds_lock(&self, id: BatchId) -> bool {
        self.locks.contains_key(&id)
    }

    async fn insert_batch(&mut self, batch: &BatchRecord) -> BatchResult<()> {
        if self.view(batch.id)?.is_some() {
            return Err(BatchError::concurrent_modification(format!(
                "batch {} already exists",
                batch.id
            )));
        }
        self.changes.push(Change::InsertBatch(batch.clone()));
        Ok(())
    }

    async fn load_batch(&mut self, id: BatchId) -> BatchResult<BatchRecord> {
        self.view(id)?
            .ok_or_else(|| BatchError::not_found(format!("batch {id}")))
    }

    async fn stamp(
        &mut self,
        id: BatchId,
        field: BatchTimestamp,
        at: DateTime<Utc>,
    ) -> BatchResult<bool> {
        if field == BatchTimestamp::CallbacksFinished
            && !self.store.inner.capabilities.callbacks_finished_at
        {
            return Err(BatchError::capability_missing(field.column()));
        }
        let batch = self.load_batch(id).await?;
        if batch.timestamp(field).is_some() {
            return Ok(false);
        }
        self.changes.push(Change::Stamp { id, field, at });
        Ok(true)
    }

    async fn write_properties(&mut self, id: BatchId, properties: &Properties) -> BatchResult<()> {
        self.load_batch(id).await?;
        self.changes.push(Change::Properties {
            id,
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn count_unfinished_jobs(&mut self, id: BatchId) -> BatchResult<u64> {
        self.count_jobs(|j| j.batch_id == Some(id) && !j.is_finished())
    }

    async fn count_unfinished_callback_jobs(&mut self, id: BatchId) -> BatchResult<u64> {
        self.count_jobs(|j| j.batch_callback_id == Some(id) && !j.is_finished())
    }

    async fn count_errored_jobs(&mut self, id: BatchId) -> BatchResult<u64> {
        self.count_jobs(|j| j.batch_id == Some(id) && j.is_discarding())
    }

    async fn enqueue_job(&mut self, job: NewJob) -> BatchResult<JobId> {
        let job = job.into_job()?;
        let id = job.id;
        self.changes.push(Change::InsertJob(job));
        Ok(id)
    }

    async fn commit(mut self) -> BatchResult<()> {
        let changes = std::mem::take(&mut self.changes);
        let mut state = self.store.write()?;

        // Validate everything against live state before touching it.
        let mut touched: HashMap<BatchId, BatchRecord> = HashMap::new();
        let mut jobs = Vec::new();
        for change in changes {
            match change {
                Change::InsertBatch(record) => {
                    if state.batches.contains_key(&record.id) || touched.contains_key(&record.id) {
                        return Err(BatchError::concurrent_modification(format!(
                            "batch {} already exists",
                            record.id
                        )));
                    }
                    touched.insert(record.id, record);
                }
                Change::Stamp { id, field, at } => {
                    let batch = touched_entry(&mut touched, &state, id)?;
                    if !batch.stamp(field, at) {
                        return Err(BatchError::concurrent_modification(format!(
                            "batch {id}: {} was set by another transaction",
                            field.column()
                        )));
                    }
                }
                Change::Properties { id, properties } => {
                    touched_entry(&mut touched, &state, id)?.properties = properties;
                }
                Change::InsertJob(job) => {
                    if state.jobs.contains_key(&job.id) {
                        return Err(BatchError::concurrent_modification(format!(
                            "job {} already exists",
                            job.id
                        )));
                    }
                    jobs.push(job);
                }
            }
        }

        state.batches.extend(touched);
        state.jobs.extend(jobs.into_iter().map(|j| (j.id, j)));
        drop(state);
        self.locks.clear();
        Ok(())
    }
}

fn touched_entry<'a>(
    touched: &'a mut HashMap<BatchId, BatchRecord>,
    state: &State,
    id: BatchId,
) -> BatchResult<&'a mut BatchRecord> {
    if !touched.contains_key(&id) {
        let live = state
            .batches
            .get(&id)
            .cloned()
            .ok_or_else(|| BatchError::not_found(format!("batch {id}")))?;
        touched.insert(id, live);
    }
    touched
        .get_mut(&id)
        .ok_or_else(|| BatchError::not_found(format!("batch {id}")))
}
