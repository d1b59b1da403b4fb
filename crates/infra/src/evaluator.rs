//! Completion evaluator: the batch state machine.
//!
//! Invoked after every job completion report and by the periodic sweep.
//! One evaluation is one transaction under the batch's advisory lock and
//! runs three steps in fixed order, each re-reading the batch first:
//!
//! 1. discard: `discarded_at` is null and either the triggering job
//!    finished with an error or (for an unfinished batch) some member job
//!    already did. Stamp it, dispatch `discard`. The member check lets a
//!    trigger-less evaluation recover a discard whose report was lost.
//! 2. finish: `enqueued_at` set, `finished_at` null, no unfinished member
//!    jobs. Stamp it, dispatch `success` (only if not discarded) and
//!    `finish`.
//! 3. callbacks finished (capability-gated): `finished_at` set,
//!    `callbacks_finished_at` null, no unfinished callback jobs. Stamp it.
//!
//! Every step only acts when its target timestamp is still null and the
//! store confirms the conditional write, so re-running an evaluation after
//! its effects landed writes nothing and dispatches nothing.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use convoy_core::{BatchError, BatchEvent, BatchId, BatchResult, BatchTimestamp, JobId};

use crate::config::CoordinatorConfig;
use crate::dispatcher::CallbackDispatcher;
use crate::jobs::{Job, RetryPolicy};
use crate::lock::{DistributedLock, LockMode, LockScope};
use crate::store::{BatchStore, BatchTransaction, StoreCapabilities};

/// What one evaluation changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub batch_id: BatchId,
    pub discarded: bool,
    pub finished: bool,
    pub callbacks_finished: bool,
    /// Callback jobs enqueued, in dispatch order.
    pub dispatched: Vec<(BatchEvent, JobId)>,
}

impl Evaluation {
    fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            discarded: false,
            finished: false,
            callbacks_finished: false,
            dispatched: Vec::new(),
        }
    }

    pub fn changed(&self) -> bool {
        self.discarded || self.finished || self.callbacks_finished
    }

    pub fn dispatched_events(&self) -> impl Iterator<Item = BatchEvent> + '_ {
        self.dispatched.iter().map(|(event, _)| *event)
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evaluated: usize,
    pub transitioned: usize,
    pub failed: usize,
}

/// Applies batch transitions.
#[derive(Debug)]
pub struct CompletionEvaluator<S: BatchStore> {
    store: Arc<S>,
    lock: DistributedLock<S>,
    dispatcher: CallbackDispatcher,
    capabilities: StoreCapabilities,
    lock_mode: LockMode,
    report_retry: RetryPolicy,
}

impl<S: BatchStore> CompletionEvaluator<S> {
    /// Capabilities are read from the store here, once.
    pub fn new(store: Arc<S>, dispatcher: CallbackDispatcher, config: &CoordinatorConfig) -> Self {
        let capabilities = store.capabilities();
        if !capabilities.callbacks_finished_at {
            warn!("store lacks callbacks_finished_at; callbacks-finished step disabled");
        }
        Self {
            lock: DistributedLock::new(store.clone()),
            store,
            dispatcher,
            capabilities,
            lock_mode: config.lock_mode,
            report_retry: config.report_retry.clone(),
        }
    }

    pub fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn lock(&self) -> &DistributedLock<S> {
        &self.lock
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }

    /// Evaluate `batch_id` in the configured lock mode.
    pub async fn evaluate(&self, batch_id: BatchId, trigger: Option<&Job>) -> BatchResult<Evaluation> {
        self.evaluate_with(batch_id, trigger, self.lock_mode).await
    }

    /// Evaluate `batch_id` in an explicit lock mode.
    pub async fn evaluate_with(
        &self,
        batch_id: BatchId,
        trigger: Option<&Job>,
        mode: LockMode,
    ) -> BatchResult<Evaluation> {
        let mut scope = self.lock.acquire(batch_id, mode).await?;
        let report = self.apply(&mut scope, batch_id, trigger).await?;
        scope.commit().await?;

        if report.changed() {
            info!(
                batch_id = %batch_id,
                discarded = report.discarded,
                finished = report.finished,
                callbacks_finished = report.callbacks_finished,
                dispatched = report.dispatched.len(),
                "batch transitioned"
            );
        } else {
            debug!(batch_id = %batch_id, "batch evaluated; no transition");
        }
        Ok(report)
    }

    /// Run the three steps inside an already open scope.
    ///
    /// Takes the batch lock through the scope first; a scope that already
    /// holds it (e.g. the enqueue path) continues without waiting.
    pub async fn apply(
        &self,
        scope: &mut LockScope<S::Tx>,
        batch_id: BatchId,
        trigger: Option<&Job>,
    ) -> BatchResult<Evaluation> {
        scope.acquire(batch_id).await?;
        let tx = scope.tx();
        let mut report = Evaluation::new(batch_id);

        let batch = tx.load_batch(batch_id).await?;
        if !batch.is_discarded() {
            let triggered =
                trigger.is_some_and(|job| job.batch_id == Some(batch_id) && job.is_discarding());
            let discarding = triggered
                || (!batch.is_finished() && tx.count_errored_jobs(batch_id).await? > 0);
            if discarding
                && tx
                    .stamp(batch_id, BatchTimestamp::Discarded, Utc::now())
                    .await?
            {
                report.discarded = true;
                self.dispatch(tx, batch_id, BatchEvent::Discard, &mut report)
                    .await?;
            }
        }

        let batch = tx.load_batch(batch_id).await?;
        if batch.is_enqueued()
            && !batch.is_finished()
            && tx.count_unfinished_jobs(batch_id).await? == 0
            && tx
                .stamp(batch_id, BatchTimestamp::Finished, Utc::now())
                .await?
        {
            report.finished = true;
            let batch = tx.load_batch(batch_id).await?;
            if !batch.is_discarded() {
                self.dispatch(tx, batch_id, BatchEvent::Success, &mut report)
                    .await?;
            }
            self.dispatch(tx, batch_id, BatchEvent::Finish, &mut report)
                .await?;
        }

        if self.capabilities.callbacks_finished_at {
            match mark_callbacks_finished(tx, batch_id).await {
                Ok(done) => report.callbacks_finished = done,
                Err(BatchError::CapabilityMissing(detail)) => {
                    warn!(
                        batch_id = %batch_id,
                        detail = %detail,
                        "callbacks-finished marker unavailable; skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    async fn dispatch(
        &self,
        tx: &mut S::Tx,
        batch_id: BatchId,
        event: BatchEvent,
        report: &mut Evaluation,
    ) -> BatchResult<()> {
        let batch = tx.load_batch(batch_id).await?;
        if let Some(job_id) = self.dispatcher.dispatch(tx, &batch, event).await? {
            report.dispatched.push((event, job_id));
        }
        Ok(())
    }

    /// Evaluate, retrying lock timeouts and conflicts per the report policy.
    pub async fn evaluate_retrying(
        &self,
        batch_id: BatchId,
        trigger: Option<&Job>,
    ) -> BatchResult<Evaluation> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.evaluate(batch_id, trigger).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_retryable() && self.report_retry.should_retry(attempt) => {
                    let delay = self.report_retry.delay_for_attempt(attempt);
                    warn!(
                        batch_id = %batch_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "batch evaluation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Report a finished job: evaluates its batch (with the job as trigger)
    /// and the batch whose callback it ran (no trigger).
    ///
    /// Both evaluations are attempted; the first error is returned.
    pub async fn report(&self, job: &Job) -> BatchResult<Vec<Evaluation>> {
        let targets = [
            job.batch_id.map(|id| (id, Some(job))),
            job.batch_callback_id.map(|id| (id, None)),
        ];

        let mut evaluations = Vec::new();
        let mut first_error = None;
        for (batch_id, trigger) in targets.into_iter().flatten() {
            match self.evaluate_retrying(batch_id, trigger).await {
                Ok(report) => evaluations.push(report),
                Err(e) => {
                    error!(
                        batch_id = %batch_id,
                        job_id = %job.id,
                        error = %e,
                        "batch evaluation failed; leaving it for the sweep"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(evaluations),
        }
    }

    /// Evaluate every batch with a transition ready, `limit` per page.
    ///
    /// Pages are keyed on `(created_at, id)`, so batches that stay pending
    /// after evaluation never hide newer ones.
    pub async fn sweep(&self, limit: usize) -> BatchResult<SweepReport> {
        let page_size = limit.max(1);
        let mut report = SweepReport::default();
        let mut after = None;
        loop {
            let page = self.store.pending_batches(after, page_size).await?;
            for batch in &page {
                report.evaluated += 1;
                match self.evaluate_retrying(batch.id, None).await {
                    Ok(evaluation) if evaluation.changed() => report.transitioned += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(batch_id = %batch.id, error = %e, "sweep evaluation failed");
                    }
                }
            }
            match page.last() {
                Some(last) if page.len() == page_size => after = Some((last.created_at, last.id)),
                _ => break,
            }
        }
        if report.evaluated > 0 {
            info!(
                evaluated = report.evaluated,
                transitioned = report.transitioned,
                failed = report.failed,
                "batch sweep finished"
            );
        }
        Ok(report)
    }
}

async fn mark_callbacks_finished<T: BatchTransaction>(tx: &mut T, batch_id: BatchId) -> BatchResult<bool> {
    let batch = tx.load_batch(batch_id).await?;
    if !batch.is_finished() || batch.are_callbacks_finished() {
        return Ok(false);
    }
    if tx.count_unfinished_callback_jobs(batch_id).await? > 0 {
        return Ok(false);
    }
    tx.stamp(batch_id, BatchTimestamp::CallbacksFinished, Utc::now())
        .await
}
