use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use atpi_core::format::elide;
use atpi_core::{AtUrl, ResolvedResult};
use serde::Serialize;
use tokio::sync::watch;

use crate::{HISTORY_STATE_KEY, StateStore};

pub const MAX_HISTORY_ITEMS: usize = 50;
const RKEY_LABEL_CHARS: usize = 20;
const IDENTITY_LABEL_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryItem {
    pub result: ResolvedResult,
    pub label: String,
}

/// Newest-first list of successful resolutions, capped at
/// [`MAX_HISTORY_ITEMS`].
///
/// Every change bumps a revision counter that subscribers can watch.
pub struct HistoryStore {
    items: Mutex<Vec<ResolvedResult>>,
    state: Arc<dyn StateStore>,
    revision: watch::Sender<u64>,
}

impl HistoryStore {
    pub fn load(state: Arc<dyn StateStore>) -> Self {
        let mut items = match state.read_state(HISTORY_STATE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<ResolvedResult>>(&raw) {
                Ok(items) => items,
                Err(err) => {
                    tracing::warn!(error = %err, "discarding unreadable resolution history");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load resolution history");
                Vec::new()
            }
        };
        items.truncate(MAX_HISTORY_ITEMS);

        let (revision, _) = watch::channel(0);
        Self {
            items: Mutex::new(items),
            state,
            revision,
        }
    }

    pub fn append(&self, result: ResolvedResult) {
        let mut items = self.lock();
        items.insert(0, result);
        items.truncate(MAX_HISTORY_ITEMS);
        self.persist(&items);
        drop(items);
        self.notify();
    }

    pub fn clear(&self) {
        let mut items = self.lock();
        items.clear();
        self.persist(&items);
        drop(items);
        self.notify();
    }

    pub fn list(&self) -> Vec<ResolvedResult> {
        self.lock().clone()
    }

    pub fn items(&self) -> Vec<HistoryItem> {
        self.lock()
            .iter()
            .map(|result| HistoryItem {
                label: history_label(result.url()),
                result: result.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receiver that observes a new revision after every append or clear.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn persist(&self, items: &[ResolvedResult]) {
        let encoded = match serde_json::to_string(items) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode resolution history");
                return;
            }
        };

        if let Err(err) = self.state.write_state(HISTORY_STATE_KEY, &encoded) {
            tracing::warn!(error = %err, "failed to save resolution history");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ResolvedResult>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Short display label for a history entry.
pub fn history_label(url: &str) -> String {
    let Some(parsed) = AtUrl::parse(url) else {
        return url.to_owned();
    };

    match (parsed.collection, parsed.rkey) {
        (Some(collection), Some(rkey)) => {
            format!("{collection}/{}", elide(&rkey, RKEY_LABEL_CHARS))
        }
        (Some(collection), None) => collection,
        _ => elide(&parsed.identity, IDENTITY_LABEL_CHARS),
    }
}
