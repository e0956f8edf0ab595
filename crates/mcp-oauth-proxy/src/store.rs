//! Async key-value stores with per-key TTL.
//!
//! Transactions, client codes, refresh-token records, upstream token bundles
//! and registered clients all live behind [`KeyValueStore`]. The in-memory
//! backend follows the `RwLock<HashMap>` + cleanup-task pattern; other
//! backends only need to honour the trait contract:
//!
//! - `put` overwrites unconditionally
//! - `get` returns `None` for both missing and expired keys
//! - `take` removes and returns a live value in one step

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::StoreResult;

/// Default sweep interval for [`MemoryStore::start_cleanup_task`].
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Generic async key-value store with optional per-key expiry.
#[async_trait]
pub trait KeyValueStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Insert or replace `key`. `ttl = None` never expires.
    async fn put(&self, key: &str, value: V, ttl: Option<Duration>) -> StoreResult<()>;

    /// Fetch a live value.
    async fn get(&self, key: &str) -> StoreResult<Option<V>>;

    /// Remove `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Remove and return a live value.
    ///
    /// Backends with an atomic get-and-delete should override this; the default
    /// leaves a window where two callers can both observe the value.
    async fn take(&self, key: &str) -> StoreResult<Option<V>> {
        let value = self.get(key).await?;
        if value.is_some() && !self.delete(key).await? {
            return Ok(None);
        }
        Ok(value)
    }
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory [`KeyValueStore`].
pub struct MemoryStore<V> {
    name: &'static str,
    entries: Arc<RwLock<HashMap<String, Entry<V>>>>,
}

impl<V> MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty store. `name` only appears in logs.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self { name, entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns true if no live entries remain.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start background cleanup of expired entries.
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                self.cleanup_expired().await;
            }
        });
    }

    /// Drop expired entries, returning how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(store = self.name, count = removed, "Cleaned up expired entries");
        }
        removed
    }
}

#[async_trait]
impl<V> KeyValueStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, key: &str, value: V, ttl: Option<Duration>) -> StoreResult<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().await.insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<V>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let removed = self.entries.write().await.remove(key);
        Ok(removed.is_some_and(|entry| !entry.is_expired(Instant::now())))
    }

    async fn take(&self, key: &str) -> StoreResult<Option<V>> {
        let removed = self.entries.write().await.remove(key);
        Ok(removed.filter(|entry| !entry.is_expired(Instant::now())).map(|entry| entry.value))
    }
}

impl<V> std::fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("name", &self.name).finish()
    }
}
