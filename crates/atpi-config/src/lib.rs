use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use atpi_core::ResolutionMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const ATPI_DIR_NAME: &str = ".atpi";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const CLIENT_SETTINGS_SECTION: &str = "atpi";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_REMOTE_BASE_URL: &str = "https://atpi.at";
pub const DEFAULT_CACHE_DURATION_MS: u64 = 3_600_000;
pub const DEFAULT_HOVER_MAX_LENGTH: usize = atpi_core::format::DEFAULT_HOVER_MAX_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AtpiConfig {
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    #[serde(default)]
    pub mode: ResolutionMode,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_remote_base_url")]
    pub remote_base_url: String,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            mode: ResolutionMode::Local,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            remote_base_url: default_remote_base_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_duration_ms")]
    pub duration_ms: u64,
    #[serde(default)]
    pub completion_cache_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            duration_ms: DEFAULT_CACHE_DURATION_MS,
            completion_cache_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayConfig {
    /// Hover JSON is cut after this many characters; 0 disables the cut.
    #[serde(default = "default_hover_max_length")]
    pub hover_max_length: usize,
    #[serde(default = "default_true")]
    pub show_code_lens: bool,
    #[serde(default)]
    pub show_record_preview_on_completion: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            hover_max_length: DEFAULT_HOVER_MAX_LENGTH,
            show_code_lens: true,
            show_record_preview_on_completion: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("failed to edit config TOML: {0}")]
    TomlEdit(#[from] toml_edit::TomlError),
    #[error("config section [{0}] is not a table")]
    InvalidSection(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

/// Live configuration shared between components. Every reader takes a fresh
/// snapshot, so an update is visible on the very next access.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<AtpiConfig>>,
}

impl SharedConfig {
    pub fn new(config: AtpiConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> AtpiConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: AtpiConfig) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn update(&self, apply: impl FnOnce(&mut AtpiConfig)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        apply(&mut *guard);
        let normalized = normalize_config(std::mem::take(&mut *guard));
        *guard = normalized;
    }
}

pub fn atpi_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(ATPI_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    atpi_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(workspace_root: impl AsRef<Path>) -> Result<AtpiConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(AtpiConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: AtpiConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<AtpiConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(atpi_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = AtpiConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Rewrites `resolution.mode` in place, keeping the rest of the file
/// (comments included) untouched.
pub fn set_resolution_mode(
    workspace_root: impl AsRef<Path>,
    mode: ResolutionMode,
) -> Result<AtpiConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    ensure_workspace_config(workspace_root)?;

    let path = config_path(workspace_root);
    let raw = fs::read_to_string(&path)?;
    let mut document = raw.parse::<toml_edit::DocumentMut>()?;

    if !document.contains_key("resolution") {
        document["resolution"] = toml_edit::table();
    }
    let table = document["resolution"]
        .as_table_like_mut()
        .ok_or(ConfigError::InvalidSection("resolution"))?;
    table.insert("mode", toml_edit::value(mode.as_str()));

    fs::write(&path, document.to_string())?;
    load_workspace_config(workspace_root)
}

pub fn validate_config(config: &AtpiConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.resolution.timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "resolution_timeout_zero",
            message: "resolution.timeout_ms is 0; every resolution will time out immediately"
                .to_owned(),
        });
    }

    let base_url = config.resolution.remote_base_url.as_str();
    if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
        warnings.push(ConfigWarning {
            code: "remote_base_url_scheme",
            message: format!(
                "resolution.remote_base_url '{base_url}' is not an http(s) URL; remote mode will fail"
            ),
        });
    }

    if config.cache.enabled && config.cache.duration_ms == 0 {
        warnings.push(ConfigWarning {
            code: "cache_duration_zero",
            message: "cache.enabled is true but cache.duration_ms is 0; entries expire immediately"
                .to_owned(),
        });
    }

    warnings
}

/// Overlays editor-supplied settings (camelCase keys, optionally nested under
/// an `atpi` object) onto `config`. Unknown keys and mistyped values are
/// ignored.
pub fn apply_client_settings(config: &mut AtpiConfig, settings: &Value) {
    let settings = settings
        .get(CLIENT_SETTINGS_SECTION)
        .filter(|section| section.is_object())
        .unwrap_or(settings);
    let Some(settings) = settings.as_object() else {
        return;
    };

    if let Some(mode) = settings
        .get("resolutionMode")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<ResolutionMode>().ok())
    {
        config.resolution.mode = mode;
    }
    if let Some(timeout) = settings.get("timeout").and_then(Value::as_u64) {
        config.resolution.timeout_ms = timeout;
    }
    if let Some(base_url) = settings.get("remoteBaseUrl").and_then(Value::as_str) {
        config.resolution.remote_base_url = base_url.to_owned();
    }
    if let Some(enabled) = settings.get("enableCache").and_then(Value::as_bool) {
        config.cache.enabled = enabled;
    }
    if let Some(duration) = settings.get("cacheDuration").and_then(Value::as_u64) {
        config.cache.duration_ms = duration;
    }
    if let Some(enabled) = settings.get("enableCompletionCache").and_then(Value::as_bool) {
        config.cache.completion_cache_enabled = enabled;
    }
    if let Some(max_length) = settings.get("hoverMaxLength").and_then(Value::as_u64) {
        config.display.hover_max_length = max_length as usize;
    }
    if let Some(show) = settings.get("showCodeLens").and_then(Value::as_bool) {
        config.display.show_code_lens = show;
    }
    if let Some(show) = settings
        .get("showRecordPreviewOnCompletion")
        .and_then(Value::as_bool)
    {
        config.display.show_record_preview_on_completion = show;
    }

    *config = normalize_config(std::mem::take(config));
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_remote_base_url() -> String {
    DEFAULT_REMOTE_BASE_URL.to_owned()
}

fn default_cache_duration_ms() -> u64 {
    DEFAULT_CACHE_DURATION_MS
}

fn default_hover_max_length() -> usize {
    DEFAULT_HOVER_MAX_LENGTH
}

fn normalize_config(mut config: AtpiConfig) -> AtpiConfig {
    let base_url = config
        .resolution
        .remote_base_url
        .trim()
        .trim_end_matches('/');
    config.resolution.remote_base_url = if base_url.is_empty() {
        default_remote_base_url()
    } else {
        base_url.to_owned()
    };

    config
}
