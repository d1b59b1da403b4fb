//! What a running job sees: its record, its batch context, and a way to
//! enqueue follow-up work.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use convoy_core::{BatchContext, BatchRecord, BatchResult, Frame, JobId, NewBatch};

use super::types::{Job, NewJob};

/// Enqueue path available to running jobs.
#[async_trait]
pub trait Enqueue: Send + Sync {
    /// Enqueue `job`, tagged from the current frame of `context`.
    async fn enqueue_in(&self, context: &BatchContext, job: NewJob) -> BatchResult<JobId>;

    /// Create a batch, enqueue `jobs` as its members and mark it enqueued.
    async fn define_batch_in(
        &self,
        context: &mut BatchContext,
        batch: NewBatch,
        jobs: Vec<NewJob>,
    ) -> BatchResult<BatchRecord>;
}

/// Per-execution context handed to task and callback handlers.
///
/// The context stack starts at the job's own frame: member jobs enqueue into
/// their batch, callback jobs run under a callback frame so anything they
/// enqueue is attributed to the batch's callbacks instead of its members.
pub struct PerformContext {
    job: Job,
    context: BatchContext,
    enqueuer: Arc<dyn Enqueue>,
}

impl fmt::Debug for PerformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformContext")
            .field("job", &self.job.id)
            .field("frame", &self.context.current())
            .finish_non_exhaustive()
    }
}

impl PerformContext {
    pub fn new(job: Job, enqueuer: Arc<dyn Enqueue>) -> Self {
        let context = BatchContext::with_base(Frame {
            batch_id: job.batch_id,
            callback_id: job.batch_callback_id,
        });
        Self {
            job,
            context,
            enqueuer,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut BatchContext {
        &mut self.context
    }

    pub async fn enqueue(&self, job: NewJob) -> BatchResult<JobId> {
        self.enqueuer.enqueue_in(&self.context, job).await
    }

    pub async fn define_batch(
        &mut self,
        batch: NewBatch,
        jobs: Vec<NewJob>,
    ) -> BatchResult<BatchRecord> {
        self.enqueuer
            .define_batch_in(&mut self.context, batch, jobs)
            .await
    }
}
