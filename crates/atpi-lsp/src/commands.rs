use std::path::Path;
use std::sync::Arc;

use atpi_config::{ConfigError, set_resolution_mode};
use atpi_core::{ResolutionMode, batch_summary, find_all, find_nearest, validate_at_url};
use atpi_resolve::{ResolveOptions, Resolver};
use atpi_store::HistoryStore;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tower_lsp::lsp_types::{MessageType, Position, Url};

use crate::documents::{DocumentStore, cursor_line};

pub const RESOLVE_URL: &str = "atpi.resolveUrl";
pub const BATCH_RESOLVE: &str = "atpi.batchResolve";
pub const PREVIEW_RECORD: &str = "atpi.previewRecord";
pub const CHANGE_MODE: &str = "atpi.changeMode";
pub const CLEAR_CACHE: &str = "atpi.clearCache";
pub const SHOW_HISTORY: &str = "atpi.showHistory";
pub const CLEAR_HISTORY: &str = "atpi.clearHistory";
pub const COPY_AS_JSON: &str = "atpi.copyAsJson";
pub const COPY_URL: &str = "atpi.copyUrl";

pub const ALL_COMMANDS: [&str; 9] = [
    RESOLVE_URL,
    BATCH_RESOLVE,
    PREVIEW_RECORD,
    CHANGE_MODE,
    CLEAR_CACHE,
    SHOW_HISTORY,
    CLEAR_HISTORY,
    COPY_AS_JSON,
    COPY_URL,
];

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{command} requires {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("{0}")]
    InvalidArgument(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("config update failed: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to encode command result: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct CommandContext<'a> {
    pub resolver: &'a Arc<Resolver>,
    pub history: &'a HistoryStore,
    pub documents: &'a DocumentStore,
    pub workspace_root: Option<&'a Path>,
}

/// What the client should see: a return value and an optional popup.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommandOutcome {
    pub value: Option<Value>,
    pub message: Option<(MessageType, String)>,
}

impl CommandOutcome {
    fn value(value: Value) -> Self {
        Self {
            value: Some(value),
            message: None,
        }
    }

    fn with_message(mut self, kind: MessageType, message: impl Into<String>) -> Self {
        self.message = Some((kind, message.into()));
        self
    }
}

pub async fn execute(
    ctx: &CommandContext<'_>,
    command: &str,
    arguments: &[Value],
) -> Result<CommandOutcome, CommandError> {
    match command {
        RESOLVE_URL => resolve_url(ctx, arguments).await,
        BATCH_RESOLVE => batch_resolve(ctx, arguments).await,
        PREVIEW_RECORD => preview_record(ctx, arguments).await,
        CHANGE_MODE => change_mode(ctx, arguments),
        CLEAR_CACHE => {
            ctx.resolver.clear_all_caches();
            Ok(CommandOutcome::default().with_message(MessageType::INFO, "ATPI: All caches cleared"))
        }
        SHOW_HISTORY => Ok(CommandOutcome::value(serde_json::to_value(ctx.history.items())?)),
        CLEAR_HISTORY => {
            ctx.history.clear();
            Ok(CommandOutcome::default().with_message(MessageType::INFO, "ATPI: History cleared"))
        }
        COPY_AS_JSON => copy_as_json(arguments),
        COPY_URL => {
            let url = string_argument(arguments, COPY_URL, "an AT URL")?;
            Ok(CommandOutcome::value(Value::String(url.to_owned())))
        }
        other => Err(CommandError::UnknownCommand(other.to_owned())),
    }
}

async fn resolve_url(
    ctx: &CommandContext<'_>,
    arguments: &[Value],
) -> Result<CommandOutcome, CommandError> {
    let url = match arguments.first() {
        Some(Value::String(url)) => url.clone(),
        Some(Value::Object(_)) => match url_near_cursor(ctx, &arguments[0])? {
            Some(url) => url,
            None => {
                return Ok(CommandOutcome::default().with_message(
                    MessageType::INFO,
                    "No AT Protocol URL found at cursor position",
                ));
            }
        },
        _ => {
            return Err(CommandError::MissingArgument {
                command: RESOLVE_URL,
                argument: "an AT URL or a document position",
            });
        }
    };
    let url = url.as_str();
    if let Err(err) = validate_at_url(url) {
        return Ok(CommandOutcome::default()
            .with_message(MessageType::ERROR, format!("Invalid AT URL: {err}")));
    }

    let result = ctx.resolver.resolve(url, ResolveOptions::default()).await;
    let value = serde_json::to_value(&result)?;
    if let Some(err) = result.error() {
        return Ok(CommandOutcome::value(value)
            .with_message(MessageType::ERROR, format!("Failed to resolve: {err}")));
    }

    ctx.history.append(result);
    Ok(CommandOutcome::value(value)
        .with_message(MessageType::INFO, format!("Successfully resolved {url}")))
}

#[derive(Debug, Deserialize)]
struct CursorArgument {
    uri: Url,
    position: Position,
}

/// The URL on the cursor's line whose span midpoint is closest to the cursor.
fn url_near_cursor(
    ctx: &CommandContext<'_>,
    argument: &Value,
) -> Result<Option<String>, CommandError> {
    let cursor: CursorArgument = serde_json::from_value(argument.clone())
        .map_err(|err| CommandError::InvalidArgument(format!("invalid cursor argument: {err}")))?;
    let text = ctx.documents.text(&cursor.uri).ok_or_else(|| {
        CommandError::InvalidArgument(format!("document is not open: {}", cursor.uri))
    })?;
    Ok(cursor_line(&text, cursor.position).and_then(|(line, offset)| find_nearest(line, offset)))
}

/// Accepts either a list of URLs or the URI of an open document whose URLs
/// should all be resolved.
async fn batch_resolve(
    ctx: &CommandContext<'_>,
    arguments: &[Value],
) -> Result<CommandOutcome, CommandError> {
    let urls: Vec<String> = match arguments.first() {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(Value::String(uri)) => {
            let uri = Url::parse(uri)
                .map_err(|err| CommandError::InvalidArgument(format!("invalid document URI: {err}")))?;
            let text = ctx.documents.text(&uri).ok_or_else(|| {
                CommandError::InvalidArgument(format!("document is not open: {uri}"))
            })?;
            find_all(&text)
        }
        _ => {
            return Err(CommandError::MissingArgument {
                command: BATCH_RESOLVE,
                argument: "a document URI or a list of AT URLs",
            });
        }
    };

    if urls.is_empty() {
        return Ok(CommandOutcome::default().with_message(
            MessageType::INFO,
            "No AT Protocol URLs found in the current document",
        ));
    }

    let results = ctx
        .resolver
        .resolve_many_with_progress(&urls, ResolveOptions::default(), |progress| {
            tracing::info!(
                "Resolving {} of {}: {}",
                progress.index + 1,
                progress.total,
                progress.url
            );
        })
        .await;

    let summary = batch_summary(&results);
    let failed = results.iter().filter(|result| !result.is_success()).count();
    let kind = if failed > 0 {
        MessageType::WARNING
    } else {
        MessageType::INFO
    };

    Ok(CommandOutcome::value(json!({
        "results": results,
        "succeeded": results.len() - failed,
        "failed": failed,
    }))
    .with_message(kind, summary))
}

async fn preview_record(
    ctx: &CommandContext<'_>,
    arguments: &[Value],
) -> Result<CommandOutcome, CommandError> {
    let Some(url) = arguments.first().and_then(Value::as_str) else {
        return Ok(CommandOutcome::default());
    };

    let result = ctx.resolver.resolve(url, ResolveOptions::quiet()).await;
    if let Some(err) = result.error() {
        tracing::warn!(url, error = %err, "record preview failed");
        return Ok(CommandOutcome::default());
    }
    Ok(CommandOutcome::value(serde_json::to_value(&result)?))
}

fn change_mode(ctx: &CommandContext<'_>, arguments: &[Value]) -> Result<CommandOutcome, CommandError> {
    let current = ctx.resolver.config().snapshot().resolution.mode;

    let Some(raw) = arguments.first().and_then(Value::as_str) else {
        let modes: Vec<Value> = ResolutionMode::ALL
            .iter()
            .map(|mode| {
                json!({
                    "mode": mode.as_str(),
                    "description": mode.description(),
                    "current": *mode == current,
                })
            })
            .collect();
        return Ok(CommandOutcome::value(Value::Array(modes)));
    };

    let mode = raw
        .parse::<ResolutionMode>()
        .map_err(CommandError::InvalidArgument)?;

    if let Some(root) = ctx.workspace_root {
        set_resolution_mode(root, mode)?;
    }
    ctx.resolver
        .config()
        .update(|config| config.resolution.mode = mode);

    let outcome = CommandOutcome::value(json!(mode.as_str()));
    if mode == current {
        return Ok(outcome);
    }
    Ok(outcome.with_message(
        MessageType::INFO,
        format!("ATPI resolution mode changed to: {mode}"),
    ))
}

fn copy_as_json(arguments: &[Value]) -> Result<CommandOutcome, CommandError> {
    match arguments.first() {
        None | Some(Value::Null) => {
            Ok(CommandOutcome::default().with_message(MessageType::ERROR, "No data to copy"))
        }
        Some(data) => Ok(CommandOutcome::value(Value::String(
            serde_json::to_string_pretty(data)?,
        ))),
    }
}

fn string_argument<'a>(
    arguments: &'a [Value],
    command: &'static str,
    argument: &'static str,
) -> Result<&'a str, CommandError> {
    arguments
        .first()
        .and_then(Value::as_str)
        .ok_or(CommandError::MissingArgument { command, argument })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use atpi_config::{SharedConfig, config_path, load_workspace_config};
    use atpi_core::ManualClock;
    use atpi_resolve::MockAtpiClient;
    use atpi_store::{MemoryStateStore, ResolutionCache};
    use tempfile::tempdir;

    use super::*;

    struct Fixture {
        resolver: Arc<Resolver>,
        history: HistoryStore,
        documents: DocumentStore,
    }

    impl Fixture {
        fn new() -> Self {
            let client = MockAtpiClient::new()
                .with_fixture("at://alice.test", json!({"handle": "alice.test"}))
                .with_fixture("at://bob.test", json!({"handle": "bob.test"}))
                .with_failure("at://down.test", "offline");
            let config = SharedConfig::default();
            let clock = Arc::new(ManualClock::new(0));
            let cache = ResolutionCache::load(
                Arc::new(MemoryStateStore::new()),
                config.clone(),
                clock.clone(),
            );
            Self {
                resolver: Arc::new(Resolver::new(Arc::new(client), cache, config, clock)),
                history: HistoryStore::load(Arc::new(MemoryStateStore::new())),
                documents: DocumentStore::new(),
            }
        }

        fn context<'a>(&'a self, workspace_root: Option<&'a Path>) -> CommandContext<'a> {
            CommandContext {
                resolver: &self.resolver,
                history: &self.history,
                documents: &self.documents,
                workspace_root,
            }
        }
    }

    #[tokio::test]
    async fn resolve_url_records_success_in_history() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);

        let outcome = execute(&ctx, RESOLVE_URL, &[json!("at://alice.test")])
            .await
            .expect("resolve command");

        assert_eq!(
            outcome.message,
            Some((MessageType::INFO, "Successfully resolved at://alice.test".to_owned()))
        );
        let value = outcome.value.expect("result value");
        assert_eq!(value["data"], json!({"handle": "alice.test"}));
        assert_eq!(fixture.history.len(), 1);
    }

    #[tokio::test]
    async fn resolve_url_failures_skip_history() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);

        let outcome = execute(&ctx, RESOLVE_URL, &[json!("at://down.test")])
            .await
            .expect("resolve command");
        assert_eq!(
            outcome.message,
            Some((MessageType::ERROR, "Failed to resolve: offline".to_owned()))
        );

        let invalid = execute(&ctx, RESOLVE_URL, &[json!("https://alice.test")])
            .await
            .expect("resolve command");
        assert_eq!(
            invalid.message,
            Some((MessageType::ERROR, "Invalid AT URL: URL must start with at://".to_owned()))
        );
        assert!(fixture.history.is_empty());

        let missing = execute(&ctx, RESOLVE_URL, &[]).await.expect_err("no url");
        assert!(matches!(missing, CommandError::MissingArgument { .. }));
    }

    #[tokio::test]
    async fn resolve_url_picks_nearest_url_on_cursor_line() {
        let fixture = Fixture::new();
        let uri = Url::parse("file:///notes.md").expect("uri");
        fixture.documents.open(
            uri.clone(),
            "header\nat://alice.test and then at://bob.test\n".to_owned(),
        );
        let ctx = fixture.context(None);

        let near_bob = json!({"uri": uri.as_str(), "position": {"line": 1, "character": 38}});
        let outcome = execute(&ctx, RESOLVE_URL, &[near_bob])
            .await
            .expect("resolve at cursor");
        assert_eq!(
            outcome.message,
            Some((MessageType::INFO, "Successfully resolved at://bob.test".to_owned()))
        );

        let near_alice = json!({"uri": uri.as_str(), "position": {"line": 1, "character": 3}});
        let outcome = execute(&ctx, RESOLVE_URL, &[near_alice])
            .await
            .expect("resolve at cursor");
        assert_eq!(outcome.value.expect("result")["url"], "at://alice.test");

        let empty_line = json!({"uri": uri.as_str(), "position": {"line": 0, "character": 2}});
        let outcome = execute(&ctx, RESOLVE_URL, &[empty_line])
            .await
            .expect("resolve without url");
        assert_eq!(
            outcome.message,
            Some((
                MessageType::INFO,
                "No AT Protocol URL found at cursor position".to_owned()
            ))
        );
        assert_eq!(fixture.history.len(), 2);

        let closed = json!({"uri": "file:///closed.md", "position": {"line": 0, "character": 0}});
        let err = execute(&ctx, RESOLVE_URL, &[closed])
            .await
            .expect_err("closed document");
        assert!(matches!(err, CommandError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn batch_resolve_reads_open_document() {
        let fixture = Fixture::new();
        let uri = Url::parse("file:///notes.md").expect("uri");
        fixture.documents.open(
            uri.clone(),
            "at://alice.test then at://down.test and at://alice.test again".to_owned(),
        );
        let ctx = fixture.context(None);

        let outcome = execute(&ctx, BATCH_RESOLVE, &[json!(uri.as_str())])
            .await
            .expect("batch command");

        assert_eq!(
            outcome.message,
            Some((MessageType::WARNING, "Resolved 1 URL, 1 failed".to_owned()))
        );
        let value = outcome.value.expect("batch value");
        assert_eq!(value["succeeded"], 1);
        assert_eq!(value["failed"], 1);
        assert_eq!(value["results"][1]["error"], "offline");
    }

    #[tokio::test]
    async fn batch_resolve_with_no_urls_informs() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);

        let outcome = execute(&ctx, BATCH_RESOLVE, &[json!([])])
            .await
            .expect("batch command");

        assert_eq!(outcome.value, None);
        assert_eq!(
            outcome.message,
            Some((
                MessageType::INFO,
                "No AT Protocol URLs found in the current document".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn change_mode_persists_and_updates_live_config() {
        let temp = tempdir().expect("tempdir");
        let fixture = Fixture::new();
        let ctx = fixture.context(Some(temp.path()));

        let listing = execute(&ctx, CHANGE_MODE, &[]).await.expect("list modes");
        let modes = listing.value.expect("modes");
        assert_eq!(modes[0]["mode"], "local");
        assert_eq!(modes[0]["current"], true);

        let outcome = execute(&ctx, CHANGE_MODE, &[json!("auto")])
            .await
            .expect("change mode");

        assert_eq!(
            outcome.message,
            Some((MessageType::INFO, "ATPI resolution mode changed to: auto".to_owned()))
        );
        assert_eq!(
            fixture.resolver.config().snapshot().resolution.mode,
            ResolutionMode::Auto
        );
        let persisted = load_workspace_config(temp.path()).expect("load config");
        assert_eq!(persisted.resolution.mode, ResolutionMode::Auto);
        assert!(fs::read_to_string(config_path(temp.path())).is_ok());

        let err = execute(&ctx, CHANGE_MODE, &[json!("warp")])
            .await
            .expect_err("invalid mode");
        assert!(err.to_string().contains("expected one of"));
    }

    #[tokio::test]
    async fn history_commands_list_and_clear() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);
        execute(&ctx, RESOLVE_URL, &[json!("at://alice.test")])
            .await
            .expect("resolve");
        execute(&ctx, RESOLVE_URL, &[json!("at://bob.test")])
            .await
            .expect("resolve");

        let listing = execute(&ctx, SHOW_HISTORY, &[]).await.expect("show history");
        let items = listing.value.expect("history items");
        assert_eq!(items[0]["label"], "bob.test");
        assert_eq!(items[1]["result"]["url"], "at://alice.test");

        execute(&ctx, CLEAR_HISTORY, &[]).await.expect("clear history");
        assert!(fixture.history.is_empty());
    }

    #[tokio::test]
    async fn clear_cache_drops_resolutions() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);
        execute(&ctx, RESOLVE_URL, &[json!("at://alice.test")])
            .await
            .expect("resolve");
        assert_eq!(fixture.resolver.cache().len(), 1);

        let outcome = execute(&ctx, CLEAR_CACHE, &[]).await.expect("clear cache");

        assert!(fixture.resolver.cache().is_empty());
        assert_eq!(
            outcome.message,
            Some((MessageType::INFO, "ATPI: All caches cleared".to_owned()))
        );
    }

    #[tokio::test]
    async fn copy_commands_return_text() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);

        let json_copy = execute(&ctx, COPY_AS_JSON, &[json!({"a": 1})])
            .await
            .expect("copy json");
        assert_eq!(json_copy.value, Some(json!("{\n  \"a\": 1\n}")));

        let empty = execute(&ctx, COPY_AS_JSON, &[]).await.expect("copy nothing");
        assert_eq!(
            empty.message,
            Some((MessageType::ERROR, "No data to copy".to_owned()))
        );

        let url = execute(&ctx, COPY_URL, &[json!("at://alice.test")])
            .await
            .expect("copy url");
        assert_eq!(url.value, Some(json!("at://alice.test")));
    }

    #[tokio::test]
    async fn preview_returns_result_without_touching_history() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);

        let outcome = execute(&ctx, PREVIEW_RECORD, &[json!("at://alice.test")])
            .await
            .expect("preview");
        assert_eq!(outcome.value.expect("preview value")["url"], "at://alice.test");
        assert!(fixture.history.is_empty());

        let failed = execute(&ctx, PREVIEW_RECORD, &[json!("at://down.test")])
            .await
            .expect("preview");
        assert_eq!(failed, CommandOutcome::default());
    }

    #[tokio::test]
    async fn unknown_commands_are_rejected() {
        let fixture = Fixture::new();
        let ctx = fixture.context(None);
        let err = execute(&ctx, "atpi.nope", &[]).await.expect_err("unknown");
        assert_eq!(err.to_string(), "unknown command: atpi.nope");
    }
}
