//! Storage seams for batches and jobs.
//!
//! A [`BatchStore`] hands out [`BatchTransaction`]s. Every batch state change
//! happens inside one: it is the unit of atomicity, and (through
//! [`BatchTransaction::lock_batch`]) the scope of the per-batch advisory lock.
//! Dropping a transaction without committing rolls it back and releases
//! every lock it holds.
//!
//! Implementations:
//! - [`InMemoryBatchStore`]: tests and single-process use.
//! - [`PostgresBatchStore`]: shared durable store for many worker processes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use convoy_core::{BatchId, BatchRecord, BatchResult, BatchTimestamp, JobId, Properties};

use crate::jobs::{Job, NewJob};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryBatchStore, InMemoryTransaction};
pub use postgres::{PostgresBatchStore, PostgresTransaction};

/// Optional schema features, detected once when the store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// `callbacks_finished_at` column exists.
    pub callbacks_finished_at: bool,
    /// Cleanup index over `callbacks_finished_at` exists.
    pub cleanup_index: bool,
}

impl StoreCapabilities {
    pub fn full() -> Self {
        Self {
            callbacks_finished_at: true,
            cleanup_index: true,
        }
    }

    /// Schema predating the callbacks-finished marker.
    pub fn legacy() -> Self {
        Self {
            callbacks_finished_at: false,
            cleanup_index: false,
        }
    }

    /// Timestamp that marks a batch as done for cleanup purposes.
    pub fn completion_timestamp(&self) -> BatchTimestamp {
        if self.callbacks_finished_at {
            BatchTimestamp::CallbacksFinished
        } else {
            BatchTimestamp::Finished
        }
    }
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

/// Continuation point for listing, ordered `(created_at desc, id desc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    pub created_at: DateTime<Utc>,
    pub id: Option<BatchId>,
}

impl BatchCursor {
    /// Cursor positioned just after `batch`.
    pub fn after(batch: &BatchRecord) -> Self {
        Self {
            created_at: batch.created_at,
            id: Some(batch.id),
        }
    }

    /// Strictly-less-than continuation.
    pub fn admits(&self, batch: &BatchRecord) -> bool {
        match self.id {
            Some(id) => (batch.created_at, batch.id) < (self.created_at, id),
            None => batch.created_at < self.created_at,
        }
    }
}

/// Listing filter. `None` means "either".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchFilter {
    pub finished: Option<bool>,
    pub discarded: Option<bool>,
}

impl BatchFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn finished() -> Self {
        Self {
            finished: Some(true),
            discarded: None,
        }
    }

    pub fn discarded() -> Self {
        Self {
            finished: None,
            discarded: Some(true),
        }
    }

    pub fn not_discarded() -> Self {
        Self {
            finished: None,
            discarded: Some(false),
        }
    }

    /// Finished and never discarded.
    pub fn succeeded() -> Self {
        Self {
            finished: Some(true),
            discarded: Some(false),
        }
    }

    pub fn matches(&self, batch: &BatchRecord) -> bool {
        self.finished.is_none_or(|f| batch.is_finished() == f)
            && self.discarded.is_none_or(|d| batch.is_discarded() == d)
    }
}

/// Page request for [`BatchStore::list_batches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchQuery {
    pub cursor: Option<BatchCursor>,
    pub filter: BatchFilter,
    pub limit: usize,
}

impl Default for BatchQuery {
    fn default() -> Self {
        Self {
            cursor: None,
            filter: BatchFilter::all(),
            limit: 25,
        }
    }
}

impl BatchQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: BatchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn after(mut self, cursor: BatchCursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Query for the page following `page`, if `page` was full.
    pub fn next_page(&self, page: &[BatchRecord]) -> Option<Self> {
        if page.len() < self.limit {
            return None;
        }
        page.last().map(|last| self.clone().after(BatchCursor::after(last)))
    }
}

/// Batch persistence.
#[async_trait]
pub trait BatchStore: Send + Sync + 'static {
    type Tx: BatchTransaction + 'static;

    /// Open a transaction. Nothing is locked yet.
    async fn begin(&self) -> BatchResult<Self::Tx>;

    fn capabilities(&self) -> StoreCapabilities;

    async fn get_batch(&self, id: BatchId) -> BatchResult<Option<BatchRecord>>;

    /// Batches ordered `(created_at desc, id desc)`.
    async fn list_batches(&self, query: &BatchQuery) -> BatchResult<Vec<BatchRecord>>;

    /// Batches whose completion timestamp is at or before `before`.
    ///
    /// Completion is `callbacks_finished_at` when the schema has it, else
    /// `finished_at`.
    async fn finished_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>>;

    /// Enqueued batches whose next transition is ready to apply, ordered
    /// `(created_at asc, id asc)` and strictly after `after` when given.
    ///
    /// A batch qualifies when it is unfinished with no unfinished members,
    /// unfinished and undiscarded with an errored member, or (when the
    /// schema tracks it) finished with every callback job done but no
    /// `callbacks_finished_at`. Batches still waiting on work are skipped.
    async fn pending_batches(
        &self,
        after: Option<(DateTime<Utc>, BatchId)>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>>;
}

/// One atomic unit of batch work.
#[async_trait]
pub trait BatchTransaction: Send {
    /// Take the advisory lock for `id` until the transaction ends.
    ///
    /// Re-entrant: a lock already held by this transaction is granted again
    /// without waiting. Fails with `LockUnavailable` when the wait times out.
    async fn lock_batch(&mut self, id: BatchId) -> BatchResult<()>;

    /// Whether this transaction holds the lock for `id`.
    fn holds_lock(&self, id: BatchId) -> bool;

    async fn insert_batch(&mut self, batch: &BatchRecord) -> BatchResult<()>;

    /// Freshest state of the batch as seen by this transaction.
    async fn load_batch(&mut self, id: BatchId) -> BatchResult<BatchRecord>;

    /// Set a lifecycle timestamp if it is still null.
    ///
    /// Returns whether this call performed the write.
    async fn stamp(
        &mut self,
        id: BatchId,
        field: BatchTimestamp,
        at: DateTime<Utc>,
    ) -> BatchResult<bool>;

    async fn write_properties(&mut self, id: BatchId, properties: &Properties) -> BatchResult<()>;

    /// Member jobs with a null `finished_at`.
    async fn count_unfinished_jobs(&mut self, id: BatchId) -> BatchResult<u64>;

    /// Callback jobs with a null `finished_at`.
    async fn count_unfinished_callback_jobs(&mut self, id: BatchId) -> BatchResult<u64>;

    /// Member jobs finished with an error.
    async fn count_errored_jobs(&mut self, id: BatchId) -> BatchResult<u64>;

    async fn enqueue_job(&mut self, job: NewJob) -> BatchResult<JobId>;

    async fn commit(self) -> BatchResult<()>;
}

/// Job persistence used by the executor.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn get_job(&self, id: JobId) -> BatchResult<Option<Job>>;

    /// Claim the next ready job, lowest priority value first, then oldest.
    ///
    /// An empty `queues` slice means every queue. An unfinished job claimed
    /// more than `lease` ago counts as abandoned and is claimable again.
    async fn claim_next(&self, queues: &[String], lease: Duration) -> BatchResult<Option<Job>>;

    /// Mark a claimed job finished. `error` makes it discarding.
    async fn finish_job(&self, id: JobId, error: Option<String>) -> BatchResult<Job>;

    /// Release a claimed job for another attempt at `at`.
    async fn reschedule_job(
        &self,
        id: JobId,
        at: DateTime<Utc>,
        error: Option<String>,
    ) -> BatchResult<Job>;

    /// Member jobs of a batch, oldest first.
    async fn batch_jobs(&self, batch_id: BatchId) -> BatchResult<Vec<Job>>;

    /// Callback jobs of a batch, oldest first.
    async fn callback_jobs(&self, batch_id: BatchId) -> BatchResult<Vec<Job>>;
}

/// A store usable by the whole coordinator.
pub trait Store: BatchStore + JobStore {}

impl<T: BatchStore + JobStore> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::NewBatch;

    fn batch_at(created_at: DateTime<Utc>) -> BatchRecord {
        let mut batch = NewBatch::new().into_record("default", 0);
        batch.created_at = created_at;
        batch
    }

    #[test]
    fn cursor_without_id_compares_timestamps_only() {
        let now = Utc::now();
        let cursor = BatchCursor {
            created_at: now,
            id: None,
        };
        assert!(!cursor.admits(&batch_at(now)));
        assert!(cursor.admits(&batch_at(now - chrono::Duration::milliseconds(1))));
    }

    #[test]
    fn cursor_with_id_breaks_ties_on_id() {
        let now = Utc::now();
        let a = batch_at(now);
        let b = batch_at(now);
        let (low, high) = if a.id < b.id { (a, b) } else { (b, a) };

        let cursor = BatchCursor::after(&high);
        assert!(cursor.admits(&low));
        assert!(!cursor.admits(&high));
    }

    #[test]
    fn succeeded_filter_excludes_discarded() {
        let mut batch = batch_at(Utc::now());
        batch.stamp(BatchTimestamp::Finished, Utc::now());
        assert!(BatchFilter::succeeded().matches(&batch));

        batch.stamp(BatchTimestamp::Discarded, Utc::now());
        assert!(!BatchFilter::succeeded().matches(&batch));
        assert!(BatchFilter::discarded().matches(&batch));
        assert!(BatchFilter::finished().matches(&batch));
        assert!(!BatchFilter::not_discarded().matches(&batch));
    }

    #[test]
    fn completion_timestamp_follows_capabilities() {
        assert_eq!(
            StoreCapabilities::full().completion_timestamp(),
            BatchTimestamp::CallbacksFinished
        );
        assert_eq!(
            StoreCapabilities::legacy().completion_timestamp(),
            BatchTimestamp::Finished
        );
    }
}
