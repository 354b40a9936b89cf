//! Hot tier: external TTL key/value cache.
//!
//! The engine only consumes the [`HotCache`] trait; any network client
//! (Redis, memcached, ...) can sit behind it. Every error a client returns is
//! treated by the engine as a cache miss, never as an engine failure.
//! [`InMemoryHotCache`] is the in-process implementation.
//!
//! Values are JSON-encoded [`HotEntry`] payloads.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::engine::RecallHit;
use crate::error::{Error, Result};
use crate::memory::MemoryId;

/// Value stored under one hot key: the ranked results of a lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotEntry {
    pub hits: Vec<RecallHit>,
    pub cached_at: DateTime<Utc>,
}

impl HotEntry {
    pub fn new(hits: Vec<RecallHit>) -> Self {
        Self {
            hits,
            cached_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a cached value. Undecodable bytes are a cache fault, not data loss.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::cache(format!("undecodable entry: {}", e)))
    }

    pub fn memory_ids(&self) -> impl Iterator<Item = &MemoryId> {
        self.hits.iter().map(|hit| &hit.id)
    }
}

/// TTL key/value cache consumed by the engine.
#[async_trait]
pub trait HotCache: Send + Sync {
    /// Fetch a live value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value that expires after `ttl_secs`.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()>;

    /// Invalidate a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check reachability right now.
    async fn ping(&self) -> Result<()>;

    /// Release the connection.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Longest TTL honoured; larger values are clamped.
pub(crate) const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone)]
struct CachedValue {
    value: Vec<u8>,
    expires_at: DateTime<Utc>,
}

/// Process-local [`HotCache`] with lazy expiry.
#[derive(Debug, Default)]
pub struct InMemoryHotCache {
    entries: RwLock<HashMap<String, CachedValue>>,
    offline: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryHotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a lost connection: every call fails until set back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, v| v.expires_at > now);
        before - entries.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::cache("connection closed"));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::cache("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl HotCache for InMemoryHotCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Utc::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        let ttl = Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries
            .write()
            .await
            .insert(key.to_string(), CachedValue { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.write().await.clear();
        Ok(())
    }
}
