use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod format;
pub mod matcher;
pub mod url;

pub use format::{
    DataSummary, batch_summary, format_bytes, format_timestamp, summarize, truncate_for_display,
};
pub use matcher::{
    CompletionContext, UrlMatch, completion_context, find_all, find_all_with_positions, find_at,
    find_nearest,
};
pub use url::{AT_SCHEME, AtUrl, UrlValidationError, atpi_web_url, atproto_web_url, validate_at_url};

/// Milliseconds since the unix epoch.
pub type TimestampMillis = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Talk to the PDS directly.
    #[default]
    Local,
    /// Go through the hosted resolution service.
    Remote,
    /// Local first, remote when local fails.
    Auto,
}

impl ResolutionMode {
    pub const ALL: [ResolutionMode; 3] = [Self::Local, Self::Remote, Self::Auto];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Auto => "auto",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Local => "Connect directly to PDS",
            Self::Remote => "Use the atpi.at service",
            Self::Auto => "Try local first, fallback to remote",
        }
    }
}

impl std::fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResolutionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "invalid resolution mode '{other}', expected one of: local, remote, auto"
            )),
        }
    }
}

/// Outcome of resolving one AT URL.
///
/// Either `error` is unset and `data` holds the document, or `data` is null
/// and `error` carries the failure message. A success may legitimately carry
/// null data, so only the presence of `error` marks a failure. Deserializing
/// rejects records with both set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResolvedResult")]
pub struct ResolvedResult {
    url: String,
    #[serde(default)]
    data: Value,
    timestamp: TimestampMillis,
    mode: ResolutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawResolvedResult {
    url: String,
    #[serde(default)]
    data: Value,
    timestamp: TimestampMillis,
    mode: ResolutionMode,
    #[serde(default)]
    error: Option<String>,
}

impl TryFrom<RawResolvedResult> for ResolvedResult {
    type Error = String;

    fn try_from(raw: RawResolvedResult) -> Result<Self, Self::Error> {
        match raw.error {
            Some(error) if !raw.data.is_null() => Err(format!(
                "result for {} carries both data and error '{error}'",
                raw.url
            )),
            Some(error) => Ok(Self::failure(raw.url, error, raw.timestamp, raw.mode)),
            None => Ok(Self::success(raw.url, raw.data, raw.timestamp, raw.mode)),
        }
    }
}

impl ResolvedResult {
    pub fn success(
        url: impl Into<String>,
        data: Value,
        timestamp: TimestampMillis,
        mode: ResolutionMode,
    ) -> Self {
        Self {
            url: url.into(),
            data,
            timestamp,
            mode,
            error: None,
        }
    }

    pub fn failure(
        url: impl Into<String>,
        error: impl Into<String>,
        timestamp: TimestampMillis,
        mode: ResolutionMode,
    ) -> Self {
        Self {
            url: url.into(),
            data: Value::Null,
            timestamp,
            mode,
            error: Some(error.into()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Resolved document, `None` for failed resolutions.
    pub fn data(&self) -> Option<&Value> {
        if self.error.is_some() {
            None
        } else {
            Some(&self.data)
        }
    }

    pub fn timestamp(&self) -> TimestampMillis {
        self.timestamp
    }

    pub fn mode(&self) -> ResolutionMode {
        self.mode
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: TimestampMillis,
    pub mode: ResolutionMode,
}

impl CacheEntry {
    pub fn is_expired(&self, now: TimestampMillis, duration_ms: u64) -> bool {
        now.saturating_sub(self.timestamp) > duration_ms as i64
    }
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> TimestampMillis;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> TimestampMillis {
        current_unix_timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: TimestampMillis) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, value: TimestampMillis) {
        self.now.store(value, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> TimestampMillis {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn current_unix_timestamp_millis() -> TimestampMillis {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
