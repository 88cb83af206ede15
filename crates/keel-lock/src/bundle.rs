//! Certificate bundle KV.
//!
//! One node per domain wins the issuer lock, issues the certificate and
//! publishes it with `put_bundle`; the others `wait_for_bundle`. Readers detect
//! "nothing changed" by comparing generations.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::provider::{LockGuard, LockProvider};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertBundle {
    pub key: Vec<u8>,
    pub fullchain: Vec<u8>,
    pub ca: Vec<u8>,
    /// Zero on `put_bundle` means "one past the stored generation"; an
    /// explicit value at or below the stored one is raised the same way.
    pub generation: u64,
    pub updated_ms: u64,
}

/// Stored form; key material is base64 so the value stays printable.
#[derive(Debug, Serialize, Deserialize)]
struct BundlePayload {
    generation: u64,
    updated_ms: u64,
    key: String,
    fullchain: String,
    #[serde(default)]
    ca: String,
}

impl BundlePayload {
    fn encode(bundle: &CertBundle) -> Self {
        Self {
            generation: bundle.generation,
            updated_ms: bundle.updated_ms,
            key: STANDARD.encode(&bundle.key),
            fullchain: STANDARD.encode(&bundle.fullchain),
            ca: STANDARD.encode(&bundle.ca),
        }
    }

    fn decode(self) -> Result<CertBundle, LockError> {
        let ca = if self.ca.is_empty() {
            Vec::new()
        } else {
            STANDARD.decode(&self.ca)?
        };
        Ok(CertBundle {
            key: STANDARD.decode(&self.key)?,
            fullchain: STANDARD.decode(&self.fullchain)?,
            ca,
            generation: self.generation,
            updated_ms: self.updated_ms,
        })
    }
}

pub fn issuer_lock_key(domain: &str) -> String {
    format!("pki/locks/{domain}")
}

pub fn bundle_key(domain: &str) -> String {
    format!("pki/bundles/{domain}")
}

#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn acquire_issuer_lock(
        &self,
        domain: &str,
        node_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError>;

    /// Store `bundle` and return the generation it was stored under.
    async fn put_bundle(&self, domain: &str, bundle: CertBundle) -> Result<u64, LockError>;

    /// `LockError::NotFound` when nothing was published for `domain`.
    async fn get_bundle(&self, domain: &str) -> Result<CertBundle, LockError>;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Poll `get_bundle` until it succeeds, `timeout` elapses or `cancel` fires.
    async fn wait_for_bundle(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        timeout: Duration,
    ) -> Result<CertBundle, LockError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_bundle(domain).await {
                Ok(bundle) => return Ok(bundle),
                Err(LockError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    key: bundle_key(domain),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval()) => {}
            }
        }
    }

    async fn get_bundle_generation(&self, domain: &str) -> Result<u64, LockError> {
        Ok(self.get_bundle(domain).await?.generation)
    }
}

/// Bundle store over an in-memory KV map, with issuer locks from any
/// `LockProvider`.
pub struct MemoryBundleStore {
    kv: RwLock<HashMap<String, String>>,
    locks: Arc<dyn LockProvider>,
    clock: keel_core::Clock,
}

impl MemoryBundleStore {
    pub fn new(locks: Arc<dyn LockProvider>) -> Self {
        Self {
            kv: RwLock::new(HashMap::new()),
            locks,
            clock: keel_core::system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: keel_core::Clock) -> Self {
        self.clock = clock;
        self
    }

    fn read_raw(&self, key: &str) -> Result<Option<String>, LockError> {
        let kv = self
            .kv
            .read()
            .map_err(|_| LockError::Unavailable("bundle kv poisoned".to_string()))?;
        Ok(kv.get(key).cloned())
    }
}

#[async_trait]
impl BundleStore for MemoryBundleStore {
    async fn acquire_issuer_lock(
        &self,
        domain: &str,
        node_id: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        self.locks
            .acquire_lock(&issuer_lock_key(domain), node_id, ttl)
            .await
    }

    /// Generations never move backwards: the stored generation is
    /// `max(current + 1, bundle.generation)`, computed under the write lock.
    async fn put_bundle(&self, domain: &str, mut bundle: CertBundle) -> Result<u64, LockError> {
        let key = bundle_key(domain);
        let mut kv = self
            .kv
            .write()
            .map_err(|_| LockError::Unavailable("bundle kv poisoned".to_string()))?;
        let current = match kv.get(&key) {
            Some(data) => serde_json::from_str::<BundlePayload>(data)?.generation,
            None => 0,
        };
        bundle.generation = bundle.generation.max(current + 1);
        bundle.updated_ms = (self.clock)();
        let data = serde_json::to_string(&BundlePayload::encode(&bundle))?;
        kv.insert(key, data);
        tracing::info!(domain, generation = bundle.generation, "bundle published");
        Ok(bundle.generation)
    }

    async fn get_bundle(&self, domain: &str) -> Result<CertBundle, LockError> {
        let key = bundle_key(domain);
        let data = self
            .read_raw(&key)?
            .ok_or(LockError::NotFound { key })?;
        let payload: BundlePayload = serde_json::from_str(&data)?;
        payload.decode()
    }
}
