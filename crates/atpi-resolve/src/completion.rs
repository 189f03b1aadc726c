use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

use atpi_core::TimestampMillis;

pub const COLLECTIONS_TTL_MS: i64 = 5 * 60 * 1_000;
pub const RECORDS_TTL_MS: i64 = 60 * 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionCacheEntry {
    pub items: Vec<String>,
    pub timestamp: TimestampMillis,
}

/// Short-lived, in-memory lookup results used to feed autocomplete.
#[derive(Debug)]
pub struct CompletionCache<K> {
    entries: Mutex<HashMap<K, CompletionCacheEntry>>,
    ttl_ms: i64,
}

impl<K: Eq + Hash> CompletionCache<K> {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ms,
        }
    }

    fn is_fresh(&self, entry: &CompletionCacheEntry, now: TimestampMillis) -> bool {
        now.saturating_sub(entry.timestamp) < self.ttl_ms
    }

    /// Items stored under `key` if they are younger than the TTL. A stale
    /// entry is dropped on the way out.
    pub fn get(&self, key: &K, now: TimestampMillis) -> Option<Vec<String>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        if self.is_fresh(entry, now) {
            return Some(entry.items.clone());
        }
        entries.remove(key);
        None
    }

    /// Stores `items` and sweeps every other entry that has expired by `now`.
    pub fn insert(&self, key: K, items: Vec<String>, now: TimestampMillis) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| self.is_fresh(entry, now));
        entries.insert(
            key,
            CompletionCacheEntry {
                items,
                timestamp: now,
            },
        );
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
