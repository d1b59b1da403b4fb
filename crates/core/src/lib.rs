//! `convoy-core`: batch domain building blocks.
//!
//! Pure types only: identifiers, the batch record and its lifecycle
//! timestamps, job argument values, and the execution context stack.
//! Storage, locking and dispatch live in `convoy-infra`.

pub mod batch;
pub mod context;
pub mod error;
pub mod id;
pub mod value;

pub use batch::{
    BatchEvent, BatchRecord, BatchState, BatchTimestamp, CallbackConfig, NewBatch, Properties,
};
pub use context::{BatchContext, ContextGuard, Frame};
pub use error::{BatchError, BatchResult};
pub use id::{BatchId, JobId};
pub use value::ArgValue;
