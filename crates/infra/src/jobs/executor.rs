//! Job executor with retry, backoff and completion reporting.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use convoy_core::{ArgValue, BatchResult, JobId};

use super::context::{Enqueue, PerformContext};
use super::types::{Job, JobKind, JobResult, RetryPolicy};
use crate::client::BatchClient;
use crate::config::WorkerConfig;
use crate::dispatcher::CallbackArgs;
use crate::store::Store;

/// Runs ordinary (non-callback) jobs.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn perform(&self, args: &ArgValue, ctx: &mut PerformContext) -> JobResult;
}

/// Adapts a plain closure into a [`TaskHandler`].
pub struct FnTask<F>(pub F);

#[async_trait]
impl<F> TaskHandler for FnTask<F>
where
    F: Fn(&ArgValue) -> JobResult + Send + Sync,
{
    async fn perform(&self, args: &ArgValue, _ctx: &mut PerformContext) -> JobResult {
        (self.0)(args)
    }
}

/// How an execution ended once persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Finished with an error; counts as discarding for its batch.
    Discarded(String),
    /// Released for another attempt.
    Retried { at: DateTime<Utc> },
}

/// A persisted execution.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: Job,
    pub outcome: Outcome,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_discarded: u64,
    pub jobs_retried: u64,
    /// Completion reports that failed and were left for the sweep.
    pub reports_failed: u64,
    pub current_running: usize,
    pub sweeps: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    discarded: AtomicU64,
    retried: AtomicU64,
    reports_failed: AtomicU64,
    running: AtomicUsize,
    sweeps: AtomicU64,
}

impl StatsCounters {
    fn record(&self, outcome: &Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::Discarded(_) => &self.discarded,
            Outcome::Retried { .. } => &self.retried,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, started: Instant) -> ExecutorStats {
        ExecutorStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_discarded: self.discarded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            reports_failed: self.reports_failed.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            uptime_secs: started.elapsed().as_secs(),
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<StatsCounters>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "executor task ended abnormally");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot(self.started)
    }
}

/// Background job executor.
///
/// Claims jobs from the store, runs them with registered handlers, persists
/// the outcome and reports finished jobs to the completion evaluator.
pub struct JobExecutor<S: Store> {
    client: Arc<BatchClient<S>>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    retry_policy: RetryPolicy,
    claim_lease: Duration,
    stats: Arc<StatsCounters>,
    started: Instant,
}

impl<S: Store> fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("JobExecutor")
            .field("handlers", &names)
            .field("retry_policy", &self.retry_policy)
            .field("claim_lease", &self.claim_lease)
            .finish_non_exhaustive()
    }
}

impl<S: Store> JobExecutor<S> {
    pub fn new(client: Arc<BatchClient<S>>) -> Self {
        Self {
            client,
            handlers: HashMap::new(),
            retry_policy: RetryPolicy::default(),
            claim_lease: WorkerConfig::default().claim_lease,
            stats: Arc::new(StatsCounters::default()),
            started: Instant::now(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Age after which a claimed, unfinished job is handed out again.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.snapshot(self.started)
    }

    pub fn client(&self) -> &Arc<BatchClient<S>> {
        &self.client
    }

    /// Register a handler for a task name.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl TaskHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&ArgValue) -> JobResult + Send + Sync + 'static,
    {
        self.register_handler(name, FnTask(f))
    }

    /// Claim and execute one job. `None` when nothing is ready.
    pub async fn run_next(&self, queues: &[String]) -> BatchResult<Option<JobOutcome>> {
        let Some(job) = self.client.store().claim_next(queues, self.claim_lease).await? else {
            return Ok(None);
        };
        debug!(job_id = %job.id, kind = ?job.kind, attempt = job.attempts, "claimed job");

        self.stats.running.fetch_add(1, Ordering::Relaxed);
        let outcome = self.execute(job).await;
        self.stats.running.fetch_sub(1, Ordering::Relaxed);

        let outcome = outcome?;
        self.stats.record(&outcome.outcome);
        Ok(Some(outcome))
    }

    /// Execute a claimed job, persist the outcome and report completion.
    ///
    /// A job claimed more times than the retry policy allows was abandoned
    /// by earlier workers and is discarded without running again.
    pub async fn execute(&self, job: Job) -> BatchResult<JobOutcome> {
        let result = if job.attempts > self.retry_policy.max_attempts {
            JobResult::Discard(format!("abandoned after {} claims", job.attempts - 1))
        } else {
            self.perform(&job).await
        };
        let outcome = self.persist(&job, result).await?;

        if outcome.job.is_finished() {
            if let Err(e) = self.client.evaluator().report(&outcome.job).await {
                self.stats.reports_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %outcome.job.id,
                    error = %e,
                    "completion report failed; batch left for the sweep"
                );
            }
        }
        Ok(outcome)
    }

    async fn perform(&self, job: &Job) -> JobResult {
        let args = match job.decode_args() {
            Ok(args) => args,
            Err(e) => return JobResult::Discard(format!("undecodable arguments: {e}")),
        };
        let enqueuer: Arc<dyn Enqueue> = self.client.clone();
        let mut ctx = PerformContext::new(job.clone(), enqueuer);

        match &job.kind {
            JobKind::Task { handler } => match self.handlers.get(handler) {
                Some(h) => {
                    let h = h.clone();
                    isolated(job.id, async move { h.perform(&args, &mut ctx).await }).await
                }
                None => {
                    warn!(job_id = %job.id, handler = %handler, "no handler for job");
                    JobResult::Discard(format!("no handler registered for '{handler}'"))
                }
            },
            JobKind::BatchCallback { handler } => {
                let callback = match self.client.registry().resolve(handler) {
                    Ok(callback) => callback,
                    Err(e) => return JobResult::Discard(e.to_string()),
                };
                let CallbackArgs { batch_id, event } = match CallbackArgs::from_value(&args) {
                    Ok(parsed) => parsed,
                    Err(e) => return JobResult::Discard(e.to_string()),
                };
                let batch = match self.client.get_batch(batch_id).await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => return JobResult::Discard(format!("batch {batch_id} not found")),
                    Err(e) => return JobResult::Failure(format!("loading batch: {e}")),
                };
                isolated(job.id, async move { callback.on_event(&batch, event, &mut ctx).await })
                    .await
            }
        }
    }

    async fn persist(&self, job: &Job, result: JobResult) -> BatchResult<JobOutcome> {
        let store = self.client.store();
        let now = Utc::now();
        let retry_at = |delay: std::time::Duration| {
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
        };

        let (persisted, outcome) = match result {
            JobResult::Success => {
                let job = store.finish_job(job.id, None).await?;
                debug!(job_id = %job.id, "job completed successfully");
                (job, Outcome::Succeeded)
            }
            JobResult::Failure(error) if self.retry_policy.should_retry(job.attempts) => {
                let at = retry_at(self.retry_policy.delay_for_attempt(job.attempts));
                debug!(job_id = %job.id, error = %error, retry_at = %at, "job failed; retrying");
                let job = store.reschedule_job(job.id, at, Some(error)).await?;
                (job, Outcome::Retried { at })
            }
            JobResult::Failure(error) | JobResult::Discard(error) => {
                warn!(job_id = %job.id, attempts = job.attempts, error = %error, "job discarded");
                let job = store.finish_job(job.id, Some(error.clone())).await?;
                (job, Outcome::Discarded(error))
            }
            JobResult::RetryNow => {
                let job = store
                    .reschedule_job(job.id, now, Some("retry requested".to_string()))
                    .await?;
                (job, Outcome::Retried { at: now })
            }
            JobResult::RetryAfter(delay) => {
                let at = retry_at(delay);
                let job = store
                    .reschedule_job(job.id, at, Some("retry after delay".to_string()))
                    .await?;
                (job, Outcome::Retried { at })
            }
        };

        Ok(JobOutcome {
            job: persisted,
            outcome,
        })
    }

    /// Spawn `config.concurrency` polling loops plus the periodic sweep.
    pub fn spawn(self, config: WorkerConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let executor = Arc::new(
            self.with_retry_policy(config.retry_policy.clone())
                .with_claim_lease(config.claim_lease),
        );
        let config = Arc::new(config);

        let mut joins = Vec::with_capacity(config.concurrency + 1);
        for slot in 0..config.concurrency.max(1) {
            joins.push(tokio::spawn(executor_loop(
                executor.clone(),
                config.clone(),
                slot,
                shutdown_rx.clone(),
            )));
        }
        joins.push(tokio::spawn(sweep_loop(executor, config, shutdown_rx)));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

/// Run a handler on its own task so a panic fails the job instead of the loop.
async fn isolated<F>(job_id: JobId, handler: F) -> JobResult
where
    F: Future<Output = JobResult> + Send + 'static,
{
    match tokio::spawn(handler).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            error!(job_id = %job_id, panic = %message, "job handler panicked");
            JobResult::Failure(format!("handler panicked: {message}"))
        }
        Err(e) => JobResult::Failure(format!("handler task aborted: {e}")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn executor_loop<S: Store>(
    executor: Arc<JobExecutor<S>>,
    config: Arc<WorkerConfig>,
    slot: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(executor = %config.name, slot, queues = ?config.queues, "job executor started");

    while !*shutdown.borrow() {
        match executor.run_next(&config.queues).await {
            Ok(Some(done)) => {
                debug!(
                    executor = %config.name,
                    job_id = %done.job.id,
                    outcome = ?done.outcome,
                    "job processed"
                );
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(executor = %config.name, error = %e, "failed to run job"),
        }

        // A dropped handle also stops the loop.
        let closed = tokio::select! {
            changed = shutdown.changed() => changed.is_err(),
            _ = tokio::time::sleep(config.poll_interval) => false,
        };
        if closed {
            break;
        }
    }

    info!(executor = %config.name, slot, "job executor stopped");
}

async fn sweep_loop<S: Store>(
    executor: Arc<JobExecutor<S>>,
    config: Arc<WorkerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let closed = tokio::select! {
            changed = shutdown.changed() => changed.is_err(),
            _ = tokio::time::sleep(config.sweep_interval) => false,
        };
        if closed || *shutdown.borrow() {
            break;
        }
        match executor
            .client
            .evaluator()
            .sweep(config.sweep_batch_size)
            .await
        {
            Ok(_) => {
                executor.stats.sweeps.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!(executor = %config.name, error = %e, "batch sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use convoy_core::{BatchContext, BatchEvent, BatchId, BatchRecord, NewBatch};

    use crate::config::CoordinatorConfig;
    use crate::dispatcher::{CallbackHandler, CallbackRegistry};
    use crate::jobs::NewJob;
    use crate::store::{BatchStore, BatchTransaction, InMemoryBatchStore, JobStore};

    fn client_with(registry: CallbackRegistry) -> Arc<BatchClient<InMemoryBatchStore>> {
        Arc::new(BatchClient::new(
            Arc::new(InMemoryBatchStore::new()),
            registry,
            CoordinatorConfig::default(),
        ))
    }

    #[tokio::test]
    async fn successful_job_is_finished() {
        let client = client_with(CallbackRegistry::new());
        let mut executor = JobExecutor::new(client.clone());
        executor.register_fn("test", |_| JobResult::Success);

        client
            .enqueue(&BatchContext::new(), NewJob::task("test", ArgValue::Null))
            .await
            .unwrap();

        let done = executor.run_next(&[]).await.unwrap().unwrap();
        assert_eq!(done.outcome, Outcome::Succeeded);
        assert!(done.job.is_finished());
        assert!(executor.run_next(&[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_job_retries_then_discards() {
        let client = client_with(CallbackRegistry::new());
        let mut executor = JobExecutor::new(client.clone())
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO));
        executor.register_fn("test", |_| JobResult::Failure("test error".to_string()));

        client
            .enqueue(&BatchContext::new(), NewJob::task("test", ArgValue::Null))
            .await
            .unwrap();

        let first = executor.run_next(&[]).await.unwrap().unwrap();
        assert!(matches!(first.outcome, Outcome::Retried { .. }));
        assert!(!first.job.is_finished());

        let second = executor.run_next(&[]).await.unwrap().unwrap();
        assert_eq!(second.outcome, Outcome::Discarded("test error".into()));
        assert!(second.job.is_discarding());
        assert_eq!(second.job.attempts, 2);
    }

    #[tokio::test]
    async fn missing_handler_discards_job() {
        let client = client_with(CallbackRegistry::new());
        let executor = JobExecutor::new(client.clone());

        client
            .enqueue(&BatchContext::new(), NewJob::task("unknown", ArgValue::Null))
            .await
            .unwrap();

        let done = executor.run_next(&[]).await.unwrap().unwrap();
        assert!(matches!(done.outcome, Outcome::Discarded(ref e) if e.contains("unknown")));
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_job_and_keeps_running() {
        let client = client_with(CallbackRegistry::new());
        let mut executor =
            JobExecutor::new(client.clone()).with_retry_policy(RetryPolicy::no_retry());
        executor.register_fn("explode", |_| panic!("kaboom"));
        executor.register_fn("test", |_| JobResult::Success);

        let context = BatchContext::new();
        let exploding = client
            .enqueue(&context, NewJob::task("explode", ArgValue::Null))
            .await
            .unwrap();
        client
            .enqueue(&context, NewJob::task("test", ArgValue::Null))
            .await
            .unwrap();

        let first = executor.run_next(&[]).await.unwrap().unwrap();
        assert_eq!(first.job.id, exploding);
        assert!(matches!(first.outcome, Outcome::Discarded(ref e) if e.contains("kaboom")));
        assert!(first.job.is_discarding());

        let second = executor.run_next(&[]).await.unwrap().unwrap();
        assert_eq!(second.outcome, Outcome::Succeeded);
        assert_eq!(executor.stats().current_running, 0);
    }

    #[tokio::test]
    async fn panicking_member_discards_its_batch() {
        let mut registry = CallbackRegistry::new();
        registry.register_fn("Done", |_, _| JobResult::Success);
        let client = client_with(registry);
        let mut executor =
            JobExecutor::new(client.clone()).with_retry_policy(RetryPolicy::no_retry());
        executor.register_fn("explode", |_| panic!("kaboom"));

        let batch = client
            .define_batch(
                &mut BatchContext::new(),
                NewBatch::new().on_finish("Done"),
                vec![NewJob::task("explode", ArgValue::Null)],
            )
            .await
            .unwrap();

        while executor.run_next(&[]).await.unwrap().is_some() {}

        let batch = client.require_batch(batch.id).await.unwrap();
        assert!(batch.is_discarded() && batch.is_finished());
        assert!(batch.are_callbacks_finished());
    }

    #[tokio::test]
    async fn abandoned_claim_is_retried_after_the_lease() {
        let client = client_with(CallbackRegistry::new());
        let mut executor = JobExecutor::new(client.clone())
            .with_retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
            .with_claim_lease(Duration::ZERO);
        executor.register_fn("test", |_| JobResult::Success);

        let id = client
            .enqueue(&BatchContext::new(), NewJob::task("test", ArgValue::Null))
            .await
            .unwrap();
        let crashed = client
            .store()
            .claim_next(&[], Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(crashed.id, id);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let done = executor.run_next(&[]).await.unwrap().unwrap();
        assert_eq!(done.outcome, Outcome::Succeeded);
        assert_eq!(done.job.attempts, 2);
    }

    #[tokio::test]
    async fn claims_past_the_attempt_limit_are_discarded_unrun() {
        let runs = Arc::new(AtomicUsize::new(0));
        let client = client_with(CallbackRegistry::new());
        let mut executor = JobExecutor::new(client.clone())
            .with_retry_policy(RetryPolicy::no_retry())
            .with_claim_lease(Duration::ZERO);
        let counted = runs.clone();
        executor.register_fn("test", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        });

        client
            .enqueue(&BatchContext::new(), NewJob::task("test", ArgValue::Null))
            .await
            .unwrap();
        client
            .store()
            .claim_next(&[], Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let done = executor.run_next(&[]).await.unwrap().unwrap();
        assert!(matches!(done.outcome, Outcome::Discarded(ref e) if e.contains("abandoned")));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_completion_report_is_counted() {
        let client = client_with(CallbackRegistry::new());
        let mut executor = JobExecutor::new(client.clone());
        executor.register_fn("test", |_| JobResult::Success);

        let mut orphan = NewJob::task("test", ArgValue::Null);
        orphan.batch_id = Some(BatchId::new());
        let mut tx = client.store().begin().await.unwrap();
        tx.enqueue_job(orphan).await.unwrap();
        tx.commit().await.unwrap();

        let done = executor.run_next(&[]).await.unwrap().unwrap();
        assert_eq!(done.outcome, Outcome::Succeeded);
        let stats = executor.stats();
        assert_eq!(stats.reports_failed, 1);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    struct SpawnsFollowUp {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CallbackHandler for SpawnsFollowUp {
        async fn on_event(
            &self,
            batch: &BatchRecord,
            event: BatchEvent,
            ctx: &mut PerformContext,
        ) -> JobResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(event, BatchEvent::Finish);
            assert_eq!(ctx.context().current().callback_id, Some(batch.id));
            assert_eq!(ctx.context().current().batch_id, None);
            match ctx.enqueue(NewJob::task("noop", ArgValue::Null)).await {
                Ok(_) => JobResult::Success,
                Err(e) => JobResult::Failure(e.to_string()),
            }
        }
    }

    #[tokio::test]
    async fn callback_jobs_run_under_callback_frame() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = CallbackRegistry::new();
        registry.register(
            "FollowUp",
            SpawnsFollowUp {
                calls: calls.clone(),
            },
        );
        let client = client_with(registry);
        let mut executor = JobExecutor::new(client.clone());
        executor.register_fn("noop", |_| JobResult::Success);

        let batch = client
            .define_batch(
                &mut BatchContext::new(),
                NewBatch::new().on_finish("FollowUp"),
                vec![NewJob::task("noop", ArgValue::Null)],
            )
            .await
            .unwrap();

        while executor.run_next(&[]).await.unwrap().is_some() {}

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let callback_jobs = client.store().callback_jobs(batch.id).await.unwrap();
        assert_eq!(callback_jobs.len(), 2, "callback plus its follow-up");
        assert!(callback_jobs.iter().all(|j| j.batch_id.is_none()));

        let batch = client.require_batch(batch.id).await.unwrap();
        assert!(batch.is_finished());
        assert!(batch.are_callbacks_finished());
        assert_eq!(client.store().batch_jobs(batch.id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_executor_drains_queue_and_shuts_down() {
        let client = client_with(CallbackRegistry::new());
        let mut executor = JobExecutor::new(client.clone());
        executor.register_fn("test", |_| JobResult::Success);

        for _ in 0..5 {
            client
                .enqueue(&BatchContext::new(), NewJob::task("test", ArgValue::Null))
                .await
                .unwrap();
        }

        let handle = executor.spawn(
            WorkerConfig::default()
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(5)),
        );

        let mut waited = 0;
        while handle.stats().jobs_processed < 5 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(handle.stats().jobs_succeeded, 5);
        handle.shutdown().await;

        let jobs = client.store().jobs().unwrap();
        assert!(jobs.iter().all(Job::is_finished));
    }
}
