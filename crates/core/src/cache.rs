//! In-memory response cache with fresh and stale windows.
//!
//! Entries are never evicted in the background. An entry past its stale
//! window is dropped the next time it is read, by [`CacheStore::purge_expired`],
//! or by [`CacheStore::clear`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Windows longer than this are clamped
const MAX_WINDOW: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn window_end(start: Instant, length: Duration) -> Instant {
    start
        .checked_add(length)
        .or_else(|| start.checked_add(MAX_WINDOW))
        .unwrap_or(start)
}

/// Freshness and grace windows for one write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub stale_grace: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            stale_grace: Duration::from_secs(3600),
        }
    }
}

/// A cached value and its validity windows
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub stored_at: Instant,
    pub fresh_until: Instant,
    pub stale_until: Instant,
}

impl<V> CacheEntry<V> {
    fn freshness_at(&self, now: Instant) -> Option<Freshness> {
        if now <= self.fresh_until {
            Some(Freshness::Fresh)
        } else if now <= self.stale_until {
            Some(Freshness::Stale)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
}

/// Result of a cache read
#[derive(Debug, Clone)]
pub struct CacheHit<V> {
    pub value: V,
    pub freshness: Freshness,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
}

/// Key → entry map guarded by a mutex
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    default_policy: CachePolicy,
}

impl<V: Clone> CacheStore<V> {
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::default())
    }

    pub fn with_policy(default_policy: CachePolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_policy,
        }
    }

    pub fn default_policy(&self) -> CachePolicy {
        self.default_policy
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` for `ttl` using the store's stale grace
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let policy = CachePolicy {
            ttl,
            stale_grace: self.default_policy.stale_grace,
        };
        self.set_with_policy(key, value, policy);
    }

    /// Store `value`, replacing any prior entry for the key
    pub fn set_with_policy(&self, key: impl Into<String>, value: V, policy: CachePolicy) {
        let key = key.into();
        let now = Instant::now();
        let fresh_until = window_end(now, policy.ttl);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            stored_at: now,
            fresh_until,
            stale_until: window_end(fresh_until, policy.stale_grace),
        };

        self.entries().insert(key, entry);
    }

    /// Read an entry that is still fresh or inside its stale window.
    /// Fully expired entries are removed here.
    pub fn get(&self, key: &str) -> Option<CacheHit<V>> {
        let now = Instant::now();
        let mut entries = self.entries();

        let entry = entries.get(key)?;
        match entry.freshness_at(now) {
            Some(freshness) => Some(CacheHit {
                value: entry.value.clone(),
                freshness,
                age: now.saturating_duration_since(entry.stored_at),
            }),
            None => {
                tracing::debug!(key = %key, "Dropping expired cache entry");
                entries.remove(key);
                None
            }
        }
    }

    /// Read only if the entry is inside its fresh window
    pub fn get_fresh(&self, key: &str) -> Option<V> {
        self.get(key)
            .filter(|hit| hit.freshness == Freshness::Fresh)
            .map(|hit| hit.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Remove every entry
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let removed = entries.len();
        entries.clear();
        removed
    }

    /// Remove entries past their stale window, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.freshness_at(now).is_some());
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries();

        let mut stats = CacheStats {
            entries: entries.len(),
            ..Default::default()
        };
        for entry in entries.values() {
            match entry.freshness_at(now) {
                Some(Freshness::Fresh) => stats.fresh += 1,
                Some(Freshness::Stale) => stats.stale += 1,
                None => stats.expired += 1,
            }
        }
        stats
    }
}

impl<V: Clone> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a stable cache key from an operation and its target
pub fn cache_key(operation: &str, target: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update([0u8]);
    hasher.update(target.as_bytes());
    hex::encode(hasher.finalize())
}
