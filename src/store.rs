//! Short-lived token-keyed caches
//!
//! Scan results, decode exports, replay jobs and decode progress all live in
//! a [`TokenStore`]: opaque token in, shared value out, lazily expired after
//! a TTL of inactivity. Engines only see the trait, so an external cache can
//! replace [`InMemoryTokenStore`] without touching them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Default lifetime of a cache entry without activity
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Generate an opaque, URL-safe token
pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[async_trait]
pub trait TokenStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Store a value under a fresh token
    async fn insert(&self, value: V) -> String {
        let token = new_token();
        self.put(token.clone(), value).await;
        token
    }

    /// Store a value under a caller-chosen token, replacing any previous value
    async fn put(&self, token: String, value: V);

    async fn get(&self, token: &str) -> Option<V>;

    /// Refresh an entry's expiry; returns false if it is gone
    async fn touch(&self, token: &str) -> bool;

    async fn remove(&self, token: &str) -> Option<V>;

    async fn len(&self) -> usize;
}

struct Entry<V> {
    value: V,
    touched: Instant,
}

/// In-memory [`TokenStore`] guarded by one `RwLock`
pub struct InMemoryTokenStore<V> {
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Duration,
}

impl<V> InMemoryTokenStore<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn prune(&self, entries: &mut HashMap<String, Entry<V>>) {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.touched) <= self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} expired cache entries", evicted);
        }
    }
}

impl<V> Default for InMemoryTokenStore<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[async_trait]
impl<V> TokenStore<V> for InMemoryTokenStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn put(&self, token: String, value: V) {
        let mut entries = self.entries.write().await;
        self.prune(&mut entries);
        entries.insert(
            token,
            Entry {
                value,
                touched: Instant::now(),
            },
        );
    }

    async fn get(&self, token: &str) -> Option<V> {
        let mut entries = self.entries.write().await;
        self.prune(&mut entries);
        entries.get(token).map(|entry| entry.value.clone())
    }

    async fn touch(&self, token: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(token) {
            Some(entry) => {
                entry.touched = Instant::now();
                true
            }
            None => false,
        }
    }

    async fn remove(&self, token: &str) -> Option<V> {
        let mut entries = self.entries.write().await;
        entries.remove(token).map(|entry| entry.value)
    }

    async fn len(&self) -> usize {
        let mut entries = self.entries.write().await;
        self.prune(&mut entries);
        entries.len()
    }
}
