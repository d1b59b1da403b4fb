//! Background job system with retry and backoff.
//!
//! ## Design
//!
//! - Jobs carry the batch they belong to, or the batch whose callbacks they run
//! - Retry policy with exponential backoff
//! - Finished jobs are reported to the completion evaluator
//!
//! ## Components
//!
//! - `Job` / `NewJob`: persisted job records and enqueue requests
//! - `PerformContext`: what a running handler sees
//! - `JobExecutor`: claims, runs, retries and reports jobs

pub mod context;
pub mod executor;
pub mod types;

pub use context::{Enqueue, PerformContext};
pub use executor::{
    ExecutorStats, FnTask, JobExecutor, JobExecutorHandle, JobOutcome, Outcome, TaskHandler,
};
pub use types::{BackoffStrategy, Job, JobKind, JobResult, JobStatus, NewJob, RetryPolicy};
