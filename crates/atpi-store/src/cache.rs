use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use atpi_config::SharedConfig;
use atpi_core::{CacheEntry, Clock};

use crate::{CACHE_STATE_KEY, StateStore};

/// URL → last successful resolution, expiring after `cache.duration_ms`.
///
/// The duration is read from the shared config on every access. The whole
/// map is written back to the state store after each mutation; storage
/// failures are logged and the in-memory map stays authoritative.
pub struct ResolutionCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    state: Arc<dyn StateStore>,
    config: SharedConfig,
    clock: Arc<dyn Clock>,
}

impl ResolutionCache {
    pub fn load(state: Arc<dyn StateStore>, config: SharedConfig, clock: Arc<dyn Clock>) -> Self {
        let entries = match state.read_state(CACHE_STATE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<(String, CacheEntry)>>(&raw) {
                Ok(pairs) => pairs.into_iter().collect(),
                Err(err) => {
                    tracing::warn!(error = %err, "discarding unreadable resolution cache");
                    HashMap::new()
                }
            },
            Ok(None) => HashMap::new(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load resolution cache");
                HashMap::new()
            }
        };

        let cache = Self {
            entries: Mutex::new(entries),
            state,
            config,
            clock,
        };

        let mut entries = cache.lock();
        if cache.purge_expired(&mut entries) > 0 {
            cache.persist(&entries);
        }
        drop(entries);

        cache
    }

    /// Returns the entry for `url` unless it is missing or expired. An expired
    /// entry is removed as part of the read.
    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        let entry = entries.get(url)?;

        if entry.is_expired(self.clock.now_millis(), self.duration_ms()) {
            entries.remove(url);
            self.persist(&entries);
            tracing::debug!(url, "resolution cache entry expired");
            return None;
        }

        Some(entry.clone())
    }

    pub fn set(&self, url: impl Into<String>, entry: CacheEntry) {
        let mut entries = self.lock();
        entries.insert(url.into(), entry);
        self.persist(&entries);
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries);
    }

    pub fn remove(&self, url: &str) -> bool {
        let mut entries = self.lock();
        let removed = entries.remove(url).is_some();
        if removed {
            self.persist(&entries);
        }
        removed
    }

    /// Snapshot of every live entry, after dropping the expired ones.
    pub fn all(&self) -> HashMap<String, CacheEntry> {
        let mut entries = self.lock();
        if self.purge_expired(&mut entries) > 0 {
            self.persist(&entries);
        }
        entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn flush(&self) {
        let entries = self.lock();
        self.persist(&entries);
    }

    fn duration_ms(&self) -> u64 {
        self.config.snapshot().cache.duration_ms
    }

    fn purge_expired(&self, entries: &mut HashMap<String, CacheEntry>) -> usize {
        let now = self.clock.now_millis();
        let duration_ms = self.duration_ms();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, duration_ms));
        before - entries.len()
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) {
        let mut pairs: Vec<(&String, &CacheEntry)> = entries.iter().collect();
        pairs.sort_by(|left, right| left.0.cmp(right.0));

        let encoded = match serde_json::to_string(&pairs) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode resolution cache");
                return;
            }
        };

        if let Err(err) = self.state.write_state(CACHE_STATE_KEY, &encoded) {
            tracing::warn!(error = %err, "failed to save resolution cache");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
