//! Infrastructure layer: batch stores, locking, completion evaluation,
//! callback dispatch and the job executor.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod evaluator;
pub mod jobs;
pub mod lock;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use client::BatchClient;
pub use config::{ConfigError, CoordinatorConfig, WorkerConfig};
pub use dispatcher::{
    CallbackArgs, CallbackDispatcher, CallbackHandler, CallbackRegistry, FnCallback, LogCallback,
};
pub use evaluator::{CompletionEvaluator, Evaluation, SweepReport};
pub use lock::{DistributedLock, LockMode, LockScope};
pub use store::{
    BatchCursor, BatchFilter, BatchQuery, BatchStore, BatchTransaction, InMemoryBatchStore,
    JobStore, PostgresBatchStore, Store, StoreCapabilities,
};
