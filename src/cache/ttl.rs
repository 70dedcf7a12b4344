//! In-memory key/value cache with per-entry expiry.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// A thread-safe TTL cache. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct TtlCache {
    inner: Arc<DashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value for `key`. Expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        if let Some(entry) = self.inner.get(key) {
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        self.inner.remove_if(key, |_, entry| !entry.is_live(now));
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        self.inner.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Increment a counter, starting a fresh window of `ttl` when absent or expired.
    ///
    /// Returns the count after incrementing.
    pub fn increment(&self, key: &str, ttl: Duration) -> u64 {
        let now = Instant::now();
        let mut entry = self.inner.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::from(0u64),
            expires_at: now + ttl,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: Value::from(0u64),
                expires_at: now + ttl,
            };
        }
        let count = entry.value.as_u64().unwrap_or(0) + 1;
        entry.value = Value::from(count);
        count
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.remove(key).map(|(_, entry)| entry.value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.inner.retain(|_, entry| {
            let live = entry.is_live(now);
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    /// Number of stored entries, including ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
