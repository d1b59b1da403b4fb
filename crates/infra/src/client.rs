//! Batch client: define batches, enqueue jobs, read batch state.
//!
//! ```ignore
//! let mut ctx = BatchContext::new();
//! let batch = client
//!     .define_batch(
//!         &mut ctx,
//!         NewBatch::new().on_finish("convoy.log"),
//!         vec![NewJob::task("resize", ArgValue::from("a.png"))],
//!     )
//!     .await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use convoy_core::{
    ArgValue, BatchContext, BatchError, BatchId, BatchRecord, BatchResult, BatchTimestamp, JobId,
    NewBatch, Properties,
};

use crate::config::CoordinatorConfig;
use crate::dispatcher::{CallbackDispatcher, CallbackRegistry};
use crate::evaluator::CompletionEvaluator;
use crate::jobs::{Enqueue, NewJob};
use crate::store::{BatchQuery, BatchTransaction, Store};

/// Entry point for everything that creates or inspects batches.
#[derive(Debug)]
pub struct BatchClient<S: Store> {
    store: Arc<S>,
    evaluator: CompletionEvaluator<S>,
    registry: Arc<CallbackRegistry>,
    config: CoordinatorConfig,
}

impl<S: Store> BatchClient<S> {
    /// `registry` is frozen here; register every callback before this call.
    pub fn new(store: Arc<S>, registry: CallbackRegistry, config: CoordinatorConfig) -> Self {
        let registry = Arc::new(registry);
        let dispatcher = CallbackDispatcher::new(registry.clone());
        let evaluator = CompletionEvaluator::new(store.clone(), dispatcher, &config);
        Self {
            store,
            evaluator,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn evaluator(&self) -> &CompletionEvaluator<S> {
        &self.evaluator
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Persist a new, not yet enqueued batch.
    ///
    /// Fails with `UnknownCallback` if a callback target is not registered.
    pub async fn create_batch(&self, new: NewBatch) -> BatchResult<BatchRecord> {
        let batch = new.into_record(&self.config.callback_queue, self.config.callback_priority);
        self.registry.validate(&batch)?;

        let mut tx = self.store.begin().await?;
        tx.insert_batch(&batch).await?;
        tx.commit().await?;

        info!(
            batch_id = %batch.id,
            description = batch.description.as_deref().unwrap_or(""),
            callback_queue = %batch.callbacks.queue_name,
            "batch created"
        );
        Ok(batch)
    }

    /// Enqueue `job`, tagged from the current frame of `context`.
    ///
    /// The frame overrides any batch association already on the job.
    pub async fn enqueue(&self, context: &BatchContext, mut job: NewJob) -> BatchResult<JobId> {
        let frame = context.current();
        job.batch_id = frame.batch_id;
        job.batch_callback_id = frame.callback_id;

        let mut tx = self.store.begin().await?;
        let job_id = tx.enqueue_job(job).await?;
        tx.commit().await?;

        debug!(
            job_id = %job_id,
            batch_id = ?frame.batch_id,
            batch_callback_id = ?frame.callback_id,
            "job enqueued"
        );
        Ok(job_id)
    }

    /// Mark the batch fully defined and evaluate it in the same locked
    /// transaction.
    ///
    /// A batch whose members all finished before this call (or that has none)
    /// finishes here. Calling it twice leaves the first `enqueued_at` intact.
    pub async fn mark_enqueued(&self, batch_id: BatchId) -> BatchResult<BatchRecord> {
        let mut scope = self
            .evaluator
            .lock()
            .acquire(batch_id, self.config.lock_mode)
            .await?;

        let stamped = scope
            .tx()
            .stamp(batch_id, BatchTimestamp::Enqueued, Utc::now())
            .await?;
        let evaluation = self.evaluator.apply(&mut scope, batch_id, None).await?;
        let batch = scope.tx().load_batch(batch_id).await?;
        scope.commit().await?;

        info!(
            batch_id = %batch_id,
            newly_enqueued = stamped,
            finished = evaluation.finished,
            "batch enqueued"
        );
        Ok(batch)
    }

    /// Create a batch, enqueue `jobs` into it and mark it enqueued.
    ///
    /// Jobs are enqueued under a frame for the new batch; `context` is back to
    /// its previous frame when this returns, whatever the outcome.
    pub async fn define_batch(
        &self,
        context: &mut BatchContext,
        new: NewBatch,
        jobs: Vec<NewJob>,
    ) -> BatchResult<BatchRecord> {
        let batch = self.create_batch(new).await?;
        {
            let frame = context.enter_batch(batch.id);
            for job in jobs {
                self.enqueue(&frame, job).await?;
            }
        }
        self.mark_enqueued(batch.id).await
    }

    /// Replace the batch's properties.
    ///
    /// Non-map values fail with `InvalidArgument` before anything is written.
    pub async fn set_properties(&self, batch_id: BatchId, value: ArgValue) -> BatchResult<()> {
        let properties = Properties::try_from(value)?;

        let mut scope = self
            .evaluator
            .lock()
            .acquire(batch_id, self.config.lock_mode)
            .await?;
        scope.tx().write_properties(batch_id, &properties).await?;
        scope.commit().await?;

        debug!(batch_id = %batch_id, keys = properties.len(), "batch properties set");
        Ok(())
    }

    /// Stored properties; empty when never set.
    pub async fn properties(&self, batch_id: BatchId) -> BatchResult<Properties> {
        Ok(self.require_batch(batch_id).await?.properties)
    }

    pub async fn get_batch(&self, batch_id: BatchId) -> BatchResult<Option<BatchRecord>> {
        self.store.get_batch(batch_id).await
    }

    pub async fn require_batch(&self, batch_id: BatchId) -> BatchResult<BatchRecord> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| BatchError::not_found(format!("batch {batch_id}")))
    }

    pub async fn list_batches(&self, query: &BatchQuery) -> BatchResult<Vec<BatchRecord>> {
        self.store.list_batches(query).await
    }

    /// Cleanup candidates completed at or before `before`.
    pub async fn finished_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> BatchResult<Vec<BatchRecord>> {
        self.store.finished_before(before, limit).await
    }
}

#[async_trait]
impl<S: Store> Enqueue for BatchClient<S> {
    async fn enqueue_in(&self, context: &BatchContext, job: NewJob) -> BatchResult<JobId> {
        self.enqueue(context, job).await
    }

    async fn define_batch_in(
        &self,
        context: &mut BatchContext,
        batch: NewBatch,
        jobs: Vec<NewJob>,
    ) -> BatchResult<BatchRecord> {
        self.define_batch(context, batch, jobs).await
    }
}
