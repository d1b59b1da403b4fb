//! Lifecycle callback registry and dispatcher.
//!
//! Callback targets are stable string keys registered at process start.
//! Dispatch enqueues one callback job through the caller's transaction, so
//! the job commits together with the state write that triggered it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use convoy_core::{ArgValue, BatchError, BatchEvent, BatchId, BatchRecord, BatchResult, JobId};

use crate::jobs::{JobKind, JobResult, NewJob, PerformContext};
use crate::store::BatchTransaction;

/// Handles lifecycle events of batches.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// `batch` is the batch as stored when the callback job runs.
    async fn on_event(
        &self,
        batch: &BatchRecord,
        event: BatchEvent,
        ctx: &mut PerformContext,
    ) -> JobResult;
}

/// Adapts a plain closure into a [`CallbackHandler`].
pub struct FnCallback<F>(pub F);

#[async_trait]
impl<F> CallbackHandler for FnCallback<F>
where
    F: Fn(&BatchRecord, BatchEvent) -> JobResult + Send + Sync,
{
    async fn on_event(
        &self,
        batch: &BatchRecord,
        event: BatchEvent,
        _ctx: &mut PerformContext,
    ) -> JobResult {
        (self.0)(batch, event)
    }
}

/// Stock handler that logs the event and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCallback;

impl LogCallback {
    pub const NAME: &'static str = "convoy.log";
}

#[async_trait]
impl CallbackHandler for LogCallback {
    async fn on_event(
        &self,
        batch: &BatchRecord,
        event: BatchEvent,
        _ctx: &mut PerformContext,
    ) -> JobResult {
        info!(
            batch_id = %batch.id,
            event = %event,
            description = batch.description.as_deref().unwrap_or(""),
            discarded = batch.is_discarded(),
            "batch lifecycle event"
        );
        JobResult::Success
    }
}

/// Name → handler table. Immutable once shared.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    handlers: HashMap<String, Arc<dyn CallbackHandler>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("CallbackRegistry")
            .field("handlers", &names)
            .finish()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: impl CallbackHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&BatchRecord, BatchEvent) -> JobResult + Send + Sync + 'static,
    {
        self.register(name, FnCallback(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn resolve(&self, name: &str) -> BatchResult<Arc<dyn CallbackHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| BatchError::unknown_callback(name))
    }

    /// Every configured target of `batch` must be registered.
    pub fn validate(&self, batch: &BatchRecord) -> BatchResult<()> {
        for (event, name) in batch.callbacks.targets() {
            if !self.contains(name) {
                return Err(BatchError::unknown_callback(format!(
                    "{name} (on_{event})"
                )));
            }
        }
        Ok(())
    }
}

/// Arguments carried by a callback job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackArgs {
    pub batch_id: BatchId,
    pub event: BatchEvent,
}

impl CallbackArgs {
    pub fn to_value(self) -> ArgValue {
        ArgValue::map([
            ("batch", ArgValue::Batch(self.batch_id)),
            ("event", ArgValue::from(self.event.as_str())),
        ])
    }

    pub fn from_value(value: &ArgValue) -> BatchResult<Self> {
        let batch_id = value
            .get("batch")
            .and_then(ArgValue::as_batch_id)
            .ok_or_else(|| BatchError::invalid_argument("callback args: missing batch reference"))?;
        let event = value
            .get("event")
            .and_then(ArgValue::as_str)
            .ok_or_else(|| BatchError::invalid_argument("callback args: missing event"))?
            .parse()?;
        Ok(Self { batch_id, event })
    }
}

/// Enqueues callback jobs for lifecycle events.
#[derive(Debug, Clone)]
pub struct CallbackDispatcher {
    registry: Arc<CallbackRegistry>,
}

impl CallbackDispatcher {
    pub fn new(registry: Arc<CallbackRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Enqueue the callback configured for `event`, if any.
    ///
    /// The job runs on the batch's callback queue and priority, is attributed
    /// to the batch through `batch_callback_id`, and carries a reference to
    /// the batch plus the event tag.
    pub async fn dispatch<T: BatchTransaction>(
        &self,
        tx: &mut T,
        batch: &BatchRecord,
        event: BatchEvent,
    ) -> BatchResult<Option<JobId>> {
        let Some(name) = batch.callbacks.target(event) else {
            debug!(batch_id = %batch.id, event = %event, "no callback configured");
            return Ok(None);
        };
        self.registry.resolve(name)?;

        let args = CallbackArgs {
            batch_id: batch.id,
            event,
        };
        let mut job = NewJob::new(JobKind::batch_callback(name), args.to_value())
            .queue(batch.callbacks.queue_name.clone())
            .priority(batch.callbacks.priority);
        job.batch_callback_id = Some(batch.id);

        let job_id = tx.enqueue_job(job).await?;
        info!(
            batch_id = %batch.id,
            event = %event,
            callback = name,
            job_id = %job_id,
            "batch callback enqueued"
        );
        Ok(Some(job_id))
    }
}
