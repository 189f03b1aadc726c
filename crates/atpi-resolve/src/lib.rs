use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use atpi_core::ResolutionMode;
use serde_json::Value;
use thiserror::Error;

mod completion;
mod http;
mod resolver;

pub use completion::{
    COLLECTIONS_TTL_MS, CompletionCache, CompletionCacheEntry, RECORDS_TTL_MS,
};
pub use http::{DEFAULT_HANDLE_RESOLVER, DEFAULT_PLC_DIRECTORY, HttpAtpiClient};
pub use resolver::{
    BatchProgress, COMPLETION_TIMEOUT_MS, DEFAULT_RECORD_LIMIT, ResolveOptions, Resolver,
};

/// Per-call settings handed to an [`AtpiClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub mode: ResolutionMode,
    pub timeout_ms: u64,
    pub fallback_to_remote: bool,
    pub base_url: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid AT URL: {0}")]
    InvalidUrl(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("{0}")]
    NotFound(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("local resolution failed: {local}; remote fallback failed: {remote}")]
    Fallback {
        local: Box<ClientError>,
        remote: Box<ClientError>,
    },
    #[error("{0}")]
    Unavailable(String),
}

/// The resolution backend: turns one AT URL into a JSON document.
///
/// Bare identities are expected to come back with `repoInfo.collections`, and
/// collections with `records[*].uri`; completion relies on both shapes.
#[async_trait]
pub trait AtpiClient: Send + Sync {
    async fn resolve(&self, url: &str, request: &ClientRequest) -> Result<Value, ClientError>;
}

/// Deterministic in-memory client for tests and offline runs.
#[derive(Debug, Default)]
pub struct MockAtpiClient {
    fixtures: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<(String, ClientRequest)>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockAtpiClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fixture(self, url: impl Into<String>, data: Value) -> Self {
        self.insert_fixture(url, data);
        self
    }

    pub fn with_failure(self, url: impl Into<String>, message: impl Into<String>) -> Self {
        self.insert_failure(url, message);
        self
    }

    /// Builds a client from a JSON object mapping URLs to documents.
    pub fn from_fixture_map(fixtures: &Value) -> Result<Self, ClientError> {
        let Some(map) = fixtures.as_object() else {
            return Err(ClientError::InvalidResponse(
                "fixture file must contain a JSON object keyed by AT URL".to_owned(),
            ));
        };

        let client = Self::new();
        for (url, data) in map {
            client.insert_fixture(url.clone(), data.clone());
        }
        Ok(client)
    }

    pub fn insert_fixture(&self, url: impl Into<String>, data: Value) {
        self.fixtures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), data);
    }

    pub fn insert_failure(&self, url: impl Into<String>, message: impl Into<String>) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), message.into());
    }

    /// Every resolution sleeps this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, ClientRequest)> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn urls(&self) -> HashSet<String> {
        self.fixtures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AtpiClient for MockAtpiClient {
    async fn resolve(&self, url: &str, request: &ClientRequest) -> Result<Value, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_owned(), request.clone()));

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
        {
            return Err(ClientError::Unavailable(message.clone()));
        }

        self.fixtures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("no fixture for {url}")))
    }
}
