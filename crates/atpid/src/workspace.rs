use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use atpi_config::{AtpiConfig, SharedConfig, config_path, ensure_workspace_config, validate_config};
use atpi_core::SystemClock;
use atpi_lsp::ServerState;
use atpi_resolve::{AtpiClient, HttpAtpiClient, MockAtpiClient, Resolver};
use atpi_store::{HistoryStore, ResolutionCache, SqliteStateStore};

use crate::cli::Cli;

/// Resolver and history opened over one workspace's `.atpi/` state.
pub struct Session {
    pub resolver: Arc<Resolver>,
    pub history: Arc<HistoryStore>,
}

/// A workspace root with its loaded configuration and chosen backend.
pub struct Workspace {
    root: PathBuf,
    config: SharedConfig,
    client: Arc<dyn AtpiClient>,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, config: AtpiConfig, client: Arc<dyn AtpiClient>) -> Self {
        Self {
            root: root.into(),
            config: SharedConfig::new(config),
            client,
        }
    }

    /// Loads (or creates) the workspace config and applies the per-run
    /// overrides from the command line.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let root = cli.workspace.canonicalize().with_context(|| {
            format!("failed to resolve workspace path {}", cli.workspace.display())
        })?;

        let mut config = ensure_workspace_config(&root).with_context(|| {
            format!(
                "failed to load or create workspace config at {}",
                config_path(&root).display()
            )
        })?;
        if let Some(mode) = cli.mode {
            config.resolution.mode = mode;
        }
        if let Some(timeout_ms) = cli.timeout_ms {
            config.resolution.timeout_ms = timeout_ms;
        }
        for warning in validate_config(&config) {
            tracing::warn!(code = warning.code, "{}", warning.message);
        }

        let client = build_client(cli.offline, cli.fixtures.as_deref())?;
        Ok(Self::new(root, config, client))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn open_session(&self) -> Result<Session> {
        let state = Arc::new(
            SqliteStateStore::open(&self.root).context("failed to open workspace state")?,
        );
        let clock = Arc::new(SystemClock);
        let cache = ResolutionCache::load(state.clone(), self.config.clone(), clock.clone());
        let resolver = Arc::new(Resolver::new(
            self.client.clone(),
            cache,
            self.config.clone(),
            clock,
        ));
        let history = Arc::new(HistoryStore::load(state));
        Ok(Session { resolver, history })
    }

    pub fn into_server_state(self) -> Result<ServerState> {
        ServerState::open(self.root, self.client, self.config)
            .context("failed to initialize language server state")
    }
}

pub fn build_client(offline: bool, fixtures: Option<&Path>) -> Result<Arc<dyn AtpiClient>> {
    if !offline {
        return Ok(Arc::new(HttpAtpiClient::new()));
    }

    let Some(path) = fixtures else {
        return Ok(Arc::new(MockAtpiClient::new()));
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixtures from {}", path.display()))?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse fixtures in {}", path.display()))?;
    let client = MockAtpiClient::from_fixture_map(&parsed)
        .with_context(|| format!("invalid fixtures in {}", path.display()))?;
    Ok(Arc::new(client))
}
