//! Per-batch distributed lock.
//!
//! A [`LockScope`] owns one store transaction and the advisory locks taken
//! inside it. Locks are released when the scope ends: [`LockScope::commit`]
//! commits and releases, dropping the scope (early return, `?`, panic) rolls
//! back and releases.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use convoy_core::{BatchError, BatchId, BatchResult};

use crate::store::{BatchStore, BatchTransaction};

/// Whether transition work takes the advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Transaction plus per-batch advisory lock.
    #[default]
    Locked,
    /// Transaction only.
    ///
    /// Reduced safety: only for call paths the caller already serializes
    /// (e.g. a single-threaded enqueue path). Conflicting writes are still
    /// caught at commit by stores that detect them, but callbacks are not
    /// guaranteed at-most-once by the lock.
    Unlocked,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Locked => "locked",
            LockMode::Unlocked => "unlocked",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "locked" => Ok(LockMode::Locked),
            "unlocked" => Ok(LockMode::Unlocked),
            other => Err(BatchError::invalid_argument(format!(
                "unknown lock mode '{other}'"
            ))),
        }
    }
}

/// Hands out lock scopes over a store.
#[derive(Debug)]
pub struct DistributedLock<S: BatchStore> {
    store: Arc<S>,
}

impl<S: BatchStore> Clone for DistributedLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: BatchStore> DistributedLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Open a transaction and, in `Locked` mode, lock `batch_id` in it.
    ///
    /// Blocks until the lock is granted or the store's lock wait times out
    /// (`LockUnavailable`).
    pub async fn acquire(&self, batch_id: BatchId, mode: LockMode) -> BatchResult<LockScope<S::Tx>> {
        let tx = self.store.begin().await?;
        let mut scope = LockScope { tx, mode };
        if mode == LockMode::Unlocked {
            warn!(batch_id = %batch_id, "batch transition running without advisory lock");
        }
        scope.acquire(batch_id).await?;
        Ok(scope)
    }
}

/// Open transaction holding zero or more batch locks.
#[derive(Debug)]
pub struct LockScope<T: BatchTransaction> {
    tx: T,
    mode: LockMode,
}

impl<T: BatchTransaction> LockScope<T> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn tx(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Lock another (or the same) batch inside this scope.
    ///
    /// Re-acquiring a lock this scope already holds returns immediately.
    pub async fn acquire(&mut self, batch_id: BatchId) -> BatchResult<()> {
        if self.mode == LockMode::Unlocked || self.tx.holds_lock(batch_id) {
            return Ok(());
        }
        self.tx.lock_batch(batch_id).await?;
        debug!(batch_id = %batch_id, "batch lock held");
        Ok(())
    }

    pub fn holds(&self, batch_id: BatchId) -> bool {
        self.tx.holds_lock(batch_id)
    }

    /// Commit the transaction and release every lock.
    pub async fn commit(self) -> BatchResult<()> {
        self.tx.commit().await
    }
}
