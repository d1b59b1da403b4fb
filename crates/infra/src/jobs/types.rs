//! Job records, enqueue requests and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use convoy_core::{ArgValue, BatchId, BatchResult, JobId};

/// What a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum JobKind {
    /// Ordinary task routed to a registered task handler.
    Task { handler: String },
    /// Lifecycle callback routed to the callback registry.
    BatchCallback { handler: String },
}

impl JobKind {
    pub fn task(handler: impl Into<String>) -> Self {
        Self::Task {
            handler: handler.into(),
        }
    }

    pub fn batch_callback(handler: impl Into<String>) -> Self {
        Self::BatchCallback {
            handler: handler.into(),
        }
    }

    pub fn handler_name(&self) -> &str {
        match self {
            JobKind::Task { handler } | JobKind::BatchCallback { handler } => handler,
        }
    }

    /// Stored discriminator.
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Task { .. } => "task",
            JobKind::BatchCallback { .. } => "batch_callback",
        }
    }

    pub fn from_parts(type_name: &str, handler: String) -> Option<Self> {
        match type_name {
            "task" => Some(Self::Task { handler }),
            "batch_callback" => Some(Self::BatchCallback { handler }),
            _ => None,
        }
    }
}

/// Derived job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `scheduled_at`, or ready to be claimed.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error.
    Discarded,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, counting the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt; failures are final.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so retries of sibling jobs don't line up exactly.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` have run.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A persisted job, member of at most one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Arguments in stored form (see [`ArgValue::to_json`]).
    pub args: JsonValue,
    pub queue_name: String,
    pub priority: i32,
    /// Batch this job is a member of.
    pub batch_id: Option<BatchId>,
    /// Batch whose lifecycle callback this job runs (or was enqueued from).
    pub batch_callback_id: Option<BatchId>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub performed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Finished with an error.
    pub fn is_discarding(&self) -> bool {
        self.finished_at.is_some() && self.error.is_some()
    }

    pub fn status(&self) -> JobStatus {
        match (self.finished_at, &self.error, self.performed_at) {
            (Some(_), Some(_), _) => JobStatus::Discarded,
            (Some(_), None, _) => JobStatus::Succeeded,
            (None, _, Some(_)) => JobStatus::Running,
            (None, _, None) => JobStatus::Pending,
        }
    }

    pub fn decode_args(&self) -> BatchResult<ArgValue> {
        ArgValue::from_json(&self.args)
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub args: ArgValue,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub batch_id: Option<BatchId>,
    pub batch_callback_id: Option<BatchId>,
}

impl NewJob {
    pub const DEFAULT_QUEUE: &'static str = "default";

    pub fn new(kind: JobKind, args: ArgValue) -> Self {
        Self {
            kind,
            args,
            queue_name: Self::DEFAULT_QUEUE.to_string(),
            priority: 0,
            scheduled_at: None,
            batch_id: None,
            batch_callback_id: None,
        }
    }

    pub fn task(handler: impl Into<String>, args: ArgValue) -> Self {
        Self::new(JobKind::task(handler), args)
    }

    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Schedule the job for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.scheduled_at =
            Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    /// Encode arguments and build the record to persist.
    pub fn into_job(self) -> BatchResult<Job> {
        let args = self.args.to_json()?;
        let now = Utc::now();
        Ok(Job {
            id: JobId::new(),
            kind: self.kind,
            args,
            queue_name: self.queue_name,
            priority: self.priority,
            batch_id: self.batch_id,
            batch_callback_id: self.batch_callback_id,
            attempts: 0,
            created_at: now,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            performed_at: None,
            finished_at: None,
            error: None,
        })
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed; retried while the retry policy allows, then discarded
    Failure(String),
    /// Job failed and must not be retried
    Discard(String),
    /// Job should be retried immediately (transient failure)
    RetryNow,
    /// Job should be retried after a delay
    RetryAfter(Duration),
}
