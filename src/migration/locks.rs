//! Per-target run locks
//!
//! Runs against the same target resource (e.g. the destination cluster) are
//! serialized so two runs never interleave writes to the same resume log or
//! the same remote resources.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Held while a run owns its target. Dropping the last reference to a key
/// removes it from the registry.
pub struct ResourceGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters hold their own clone of the mutex
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard").field("key", &self.key).finish()
    }
}

/// Registry of per-key async mutexes
#[derive(Debug, Default, Clone)]
pub struct ResourceLocks {
    locks: Arc<LockMap>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &str, guard: OwnedMutexGuard<()>) -> ResourceGuard {
        ResourceGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Wait for exclusive ownership of `key`, giving up on cancellation
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<ResourceGuard> {
        let lock = self.lock_for(key);
        if let Ok(guard) = lock.clone().try_lock_owned() {
            return Ok(self.guard(key, guard));
        }

        debug!(target_key = %key, "Waiting for another run to release target");
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            guard = lock.lock_owned() => Ok(self.guard(key, guard)),
        }
    }

    /// Take ownership of `key` only if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Option<ResourceGuard> {
        let guard = self.lock_for(key).try_lock_owned().ok()?;
        Some(self.guard(key, guard))
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Keys currently registered (held or waited on)
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
