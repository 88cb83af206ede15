//! In-process lease table.
//!
//! Mirrors the semantics of a KV store with leases: a key is created only if
//! absent, it belongs to a lease with a TTL, and the lease is kept alive by a
//! background task until the holder releases it. An abandoned lease expires
//! after one TTL and the key becomes acquirable again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::provider::{LockGuard, LockProvider};

#[derive(Debug, Clone)]
struct Lease {
    id: u64,
    holder_id: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseTable {
    leases: Mutex<HashMap<String, Lease>>,
    next_id: AtomicU64,
}

impl LeaseTable {
    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, LockError> {
        self.leases
            .lock()
            .map_err(|_| LockError::Unavailable("lease table poisoned".to_string()))
    }

    /// Extend the lease if it is still ours. False once it was lost.
    fn renew(&self, key: &str, id: u64, ttl: Duration) -> bool {
        let Ok(mut leases) = self.table() else {
            return false;
        };
        match leases.get_mut(key) {
            Some(lease) if lease.id == id && lease.expires_at > Instant::now() => {
                lease.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    fn revoke(&self, key: &str, id: u64) {
        if let Ok(mut leases) = self.table() {
            if leases.get(key).is_some_and(|l| l.id == id) {
                leases.remove(key);
            }
        }
    }
}

/// `LockProvider` backed by an in-process lease table.
///
/// Clones share the same table, so one provider can be handed to several
/// dispatchers to model nodes contending for fleet-wide keys.
#[derive(Debug, Clone, Default)]
pub struct LeaseLockProvider {
    inner: Arc<LeaseTable>,
}

impl LeaseLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current live holder of `resource_key`.
    pub fn holder(&self, resource_key: &str) -> Option<String> {
        let leases = self.inner.table().ok()?;
        leases
            .get(resource_key)
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.holder_id.clone())
    }

    fn spawn_keepalive(&self, key: String, id: u64, ttl: Duration, token: CancellationToken) {
        let table: Weak<LeaseTable> = Arc::downgrade(&self.inner);
        let every = (ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        let Some(table) = table.upgrade() else { break };
                        if !table.renew(&key, id, ttl) {
                            tracing::warn!(lock = %key, "lease lost before release");
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl LockProvider for LeaseLockProvider {
    async fn acquire_lock(
        &self,
        resource_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        if ttl.is_zero() {
            return Err(LockError::InvalidTtl);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut leases = self.inner.table()?;
            let now = Instant::now();
            leases.retain(|_, lease| lease.expires_at > now);
            if let Some(current) = leases.get(resource_key) {
                if current.expires_at > now {
                    tracing::debug!(
                        lock = resource_key,
                        holder = %current.holder_id,
                        "lock held elsewhere"
                    );
                    return Ok(None);
                }
            }
            leases.insert(
                resource_key.to_string(),
                Lease {
                    id,
                    holder_id: holder_id.to_string(),
                    expires_at: now + ttl,
                },
            );
        }

        let token = CancellationToken::new();
        self.spawn_keepalive(resource_key.to_string(), id, ttl, token.clone());

        let table = self.inner.clone();
        let key = resource_key.to_string();
        let stop = token.clone();
        let guard = LockGuard::new(resource_key, holder_id, move || {
            token.cancel();
            table.revoke(&key, id);
        })
        .on_abandon(move || stop.cancel());
        tracing::debug!(lock = resource_key, holder = holder_id, "lock acquired");
        Ok(Some(guard))
    }
}
