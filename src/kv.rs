//! Ephemeral key/value stores with per-entry expiry, used for assistant
//! sessions and asynchronous STT jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

/// Longest lifetime an entry can get; larger TTLs are cut down to it.
const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub trait TtlStore<V>: Send + Sync {
    /// Insert or replace `key`, expiring `ttl` from now.
    fn put(&self, key: &str, value: V, ttl: Duration);

    /// Returns the live value for `key`; expired entries read as absent.
    fn get(&self, key: &str) -> Option<V>;

    /// Replace the value of a live entry, keeping its expiry. Returns false
    /// when the entry is missing or expired.
    fn update(&self, key: &str, value: V) -> bool;

    fn remove(&self, key: &str) -> Option<V>;

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct InMemoryTtlStore<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> InMemoryTtlStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V> Default for InMemoryTtlStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> TtlStore<V> for InMemoryTtlStore<V> {
    fn put(&self, key: &str, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = Entry {
            value,
            expires_at: now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now),
        };
        self.lock().insert(key.to_string(), entry);
    }

    fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn update(&self, key: &str, value: V) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.value = value;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, key: &str) -> Option<V> {
        self.lock()
            .remove(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value)
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

/// Periodically purge `store` until the returned handle is aborted.
pub fn spawn_sweeper<V: 'static>(
    name: &'static str,
    store: Arc<dyn TtlStore<V>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = store.purge_expired();
            if removed > 0 {
                debug!("Purged {} expired {} entries", removed, name);
            }
        }
    })
}
