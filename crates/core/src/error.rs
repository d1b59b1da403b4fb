//! Error model of the batch core.

use thiserror::Error;

/// Result type used across the batch core.
pub type BatchResult<T> = Result<T, BatchError>;

/// Batch-level error.
///
/// Every variant is recoverable at the call site: either retry the operation
/// (see [`BatchError::is_retryable`]) or skip it and let the next qualifying
/// event or sweep attempt the transition again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// A caller supplied a value outside the accepted domain (e.g. non-map properties).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The store did not grant the advisory lock within the allowed wait.
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),

    /// The store detected a conflicting write inside the transaction.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The referenced batch or job does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A callback name is not present in the callback registry.
    #[error("unknown callback target: {0}")]
    UnknownCallback(String),

    /// The store schema lacks an optional column or index.
    #[error("capability missing: {0}")]
    CapabilityMissing(String),

    /// A value could not be encoded to or decoded from its stored form.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Any other storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl BatchError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn lock_unavailable(msg: impl Into<String>) -> Self {
        Self::LockUnavailable(msg.into())
    }

    pub fn concurrent_modification(msg: impl Into<String>) -> Self {
        Self::ConcurrentModification(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unknown_callback(name: impl Into<String>) -> Self {
        Self::UnknownCallback(name.into())
    }

    pub fn capability_missing(msg: impl Into<String>) -> Self {
        Self::CapabilityMissing(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the caller should simply re-run the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::LockUnavailable(_) | BatchError::ConcurrentModification(_)
        )
    }
}
