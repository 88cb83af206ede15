//! Lock provider contract.

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::LockError;

type Hook = Box<dyn FnOnce() + Send>;

/// A held lock.
///
/// `release` may be called any number of times; only the first call has an
/// effect. Dropping the guard releases it too, so holders can rely on scope.
pub struct LockGuard {
    resource_key: String,
    holder_id: String,
    release: Mutex<Option<Hook>>,
    abandon: Mutex<Option<Hook>>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource_key", &self.resource_key)
            .field("holder_id", &self.holder_id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl LockGuard {
    pub fn new(
        resource_key: impl Into<String>,
        holder_id: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            holder_id: holder_id.into(),
            release: Mutex::new(Some(Box::new(release))),
            abandon: Mutex::new(None),
        }
    }

    /// Hook run by `abandon` instead of the release hook.
    pub fn on_abandon(self, hook: impl FnOnce() + Send + 'static) -> Self {
        if let Ok(mut slot) = self.abandon.lock() {
            *slot = Some(Box::new(hook));
        }
        self
    }

    pub fn resource_key(&self) -> &str {
        &self.resource_key
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn is_released(&self) -> bool {
        self.release.lock().map(|slot| slot.is_none()).unwrap_or(true)
    }

    /// Release the lock. Idempotent.
    pub fn release(&self) {
        let hook = self.release.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            tracing::debug!(lock = %self.resource_key, holder = %self.holder_id, "lock released");
            hook();
        }
    }

    /// Stop renewing without releasing; the lease runs out on its own TTL.
    pub fn abandon(self) {
        if let Ok(mut slot) = self.release.lock() {
            slot.take();
        }
        let hook = self.abandon.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Atomically create the lock for `resource_key` if nobody holds it.
    ///
    /// `Ok(None)` means another holder owns the key. Errors are reserved for
    /// backend failures.
    async fn acquire_lock(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_release_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let guard = LockGuard::new("k", "node-a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        guard.release();
        guard.release();
        assert!(guard.is_released());
        drop(guard);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        {
            let _guard = LockGuard::new("k", "node-a", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandon_skips_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let abandoned = Arc::new(AtomicUsize::new(0));
        let (r, a) = (released.clone(), abandoned.clone());
        let guard = LockGuard::new("k", "node-a", move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .on_abandon(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });

        guard.abandon();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(abandoned.load(Ordering::SeqCst), 1);
    }
}
