use std::path::PathBuf;
use std::sync::Arc;

use atpi_config::{SharedConfig, apply_client_settings, validate_config};
use atpi_core::SystemClock;
use atpi_resolve::{AtpiClient, Resolver};
use atpi_store::{HistoryStore, ResolutionCache, SqliteStateStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_lsp::lsp_types::notification::Notification;
use tower_lsp::lsp_types::{
    CodeLens, CodeLensOptions, CodeLensParams, CompletionOptions, CompletionParams,
    CompletionResponse, DidChangeConfigurationParams, DidChangeTextDocumentParams,
    DidCloseTextDocumentParams, DidOpenTextDocumentParams, DocumentLink, DocumentLinkOptions,
    DocumentLinkParams, ExecuteCommandOptions, ExecuteCommandParams, Hover, HoverContents,
    HoverParams, HoverProviderCapability, InitializeParams, InitializeResult, InitializedParams,
    MarkupContent, MarkupKind, MessageType, Range, ServerCapabilities, ServerInfo,
    TextDocumentSyncCapability, TextDocumentSyncKind, WorkDoneProgressOptions,
};
use tower_lsp::{Client, LanguageServer, LspService, Server};

pub mod commands;
pub mod completion;
pub mod documents;
pub mod hover;
pub mod lenses;

pub use commands::{ALL_COMMANDS, CommandContext, CommandError, CommandOutcome};
pub use documents::DocumentStore;

#[derive(Debug, Error)]
pub enum LspServerError {
    #[error("state store init error: {0}")]
    Store(#[from] StoreError),
}

/// Sent whenever the resolution history changes.
pub enum HistoryChanged {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryChangedParams {
    pub revision: u64,
    pub count: usize,
}

impl Notification for HistoryChanged {
    type Params = HistoryChangedParams;
    const METHOD: &'static str = "atpi/historyChanged";
}

/// Everything the server needs, built once and shared by every request.
pub struct ServerState {
    pub resolver: Arc<Resolver>,
    pub history: Arc<HistoryStore>,
    pub documents: DocumentStore,
    pub workspace_root: Option<PathBuf>,
}

impl ServerState {
    pub fn new(
        resolver: Arc<Resolver>,
        history: Arc<HistoryStore>,
        workspace_root: Option<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            history,
            documents: DocumentStore::new(),
            workspace_root,
        }
    }

    /// Opens the workspace state under `.atpi/` and wires the resolver to it.
    pub fn open(
        workspace_root: PathBuf,
        client: Arc<dyn AtpiClient>,
        config: SharedConfig,
    ) -> Result<Self, LspServerError> {
        let state = Arc::new(SqliteStateStore::open(&workspace_root)?);
        let clock = Arc::new(SystemClock);
        let cache = ResolutionCache::load(state.clone(), config.clone(), clock.clone());
        let resolver = Arc::new(Resolver::new(client, cache, config, clock));
        let history = Arc::new(HistoryStore::load(state));
        Ok(Self::new(resolver, history, Some(workspace_root)))
    }

    fn command_context(&self) -> CommandContext<'_> {
        CommandContext {
            resolver: &self.resolver,
            history: &self.history,
            documents: &self.documents,
            workspace_root: self.workspace_root.as_deref(),
        }
    }
}

pub struct AtpiLspBackend {
    client: Client,
    state: Arc<ServerState>,
}

impl AtpiLspBackend {
    pub fn new(client: Client, state: Arc<ServerState>) -> Self {
        Self { client, state }
    }

    fn apply_settings(&self, settings: &serde_json::Value) -> Vec<String> {
        let config = self.state.resolver.config();
        config.update(|config| apply_client_settings(config, settings));
        validate_config(&config.snapshot())
            .into_iter()
            .map(|warning| format!("{}: {}", warning.code, warning.message))
            .collect()
    }

    fn watch_history(&self) {
        let mut receiver = self.state.history.subscribe();
        let history = self.state.history.clone();
        let client = self.client.clone();
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let revision = *receiver.borrow_and_update();
                client
                    .send_notification::<HistoryChanged>(HistoryChangedParams {
                        revision,
                        count: history.len(),
                    })
                    .await;
            }
        });
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for AtpiLspBackend {
    async fn initialize(
        &self,
        params: InitializeParams,
    ) -> tower_lsp::jsonrpc::Result<InitializeResult> {
        if let Some(settings) = params.initialization_options.as_ref() {
            for warning in self.apply_settings(settings) {
                tracing::warn!(warning = %warning, "client settings produced a config warning");
            }
        }

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(
                    TextDocumentSyncKind::FULL,
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(
                        completion::TRIGGER_CHARACTERS
                            .iter()
                            .map(|trigger| (*trigger).to_owned())
                            .collect(),
                    ),
                    ..CompletionOptions::default()
                }),
                code_lens_provider: Some(CodeLensOptions {
                    resolve_provider: Some(false),
                }),
                document_link_provider: Some(DocumentLinkOptions {
                    resolve_provider: Some(false),
                    work_done_progress_options: WorkDoneProgressOptions::default(),
                }),
                execute_command_provider: Some(ExecuteCommandOptions {
                    commands: ALL_COMMANDS
                        .iter()
                        .map(|command| (*command).to_owned())
                        .collect(),
                    work_done_progress_options: WorkDoneProgressOptions::default(),
                }),
                ..ServerCapabilities::default()
            },
            server_info: Some(ServerInfo {
                name: "atpi".to_owned(),
                version: Some(env!("CARGO_PKG_VERSION").to_owned()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        self.watch_history();
        let mode = self.state.resolver.config().snapshot().resolution.mode;
        self.client
            .log_message(
                MessageType::INFO,
                format!("ATPI language server initialized ({mode} mode)"),
            )
            .await;
    }

    async fn shutdown(&self) -> tower_lsp::jsonrpc::Result<()> {
        self.state.resolver.shutdown();
        tracing::info!("ATPI language server shut down");
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        self.state
            .documents
            .open(params.text_document.uri, params.text_document.text);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        if let Some(change) = params.content_changes.into_iter().last() {
            self.state
                .documents
                .replace(params.text_document.uri, change.text);
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        self.state.documents.close(&params.text_document.uri);
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        for warning in self.apply_settings(&params.settings) {
            self.client.log_message(MessageType::WARNING, warning).await;
        }
        if let Err(err) = self.client.code_lens_refresh().await {
            tracing::debug!(error = %err, "client declined code lens refresh");
        }
    }

    async fn hover(&self, params: HoverParams) -> tower_lsp::jsonrpc::Result<Option<Hover>> {
        let position = params.text_document_position_params.position;
        let uri = params.text_document_position_params.text_document.uri;
        let Some(text) = self.state.documents.text(&uri) else {
            return Ok(None);
        };

        let outcome = hover::resolve_hover(self.state.resolver.clone(), &text, position).await;
        Ok(outcome.map(|outcome| markdown_hover(outcome.markdown, Some(outcome.range))))
    }

    async fn completion(
        &self,
        params: CompletionParams,
    ) -> tower_lsp::jsonrpc::Result<Option<CompletionResponse>> {
        let position = params.text_document_position.position;
        let uri = params.text_document_position.text_document.uri;
        let Some(text) = self.state.documents.text(&uri) else {
            return Ok(None);
        };
        let Some(prefix) = documents::line_prefix(&text, position) else {
            return Ok(None);
        };

        let items = completion::completion_items(&self.state.resolver, prefix, position).await;
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn code_lens(
        &self,
        params: CodeLensParams,
    ) -> tower_lsp::jsonrpc::Result<Option<Vec<CodeLens>>> {
        if !self.state.resolver.config().snapshot().display.show_code_lens {
            return Ok(None);
        }
        Ok(self
            .state
            .documents
            .text(&params.text_document.uri)
            .map(|text| lenses::code_lenses(&text)))
    }

    async fn document_link(
        &self,
        params: DocumentLinkParams,
    ) -> tower_lsp::jsonrpc::Result<Option<Vec<DocumentLink>>> {
        Ok(self
            .state
            .documents
            .text(&params.text_document.uri)
            .map(|text| lenses::document_links(&text)))
    }

    async fn execute_command(
        &self,
        params: ExecuteCommandParams,
    ) -> tower_lsp::jsonrpc::Result<Option<serde_json::Value>> {
        let ctx = self.state.command_context();
        match commands::execute(&ctx, &params.command, &params.arguments).await {
            Ok(outcome) => {
                if let Some((kind, message)) = outcome.message {
                    self.client.show_message(kind, message).await;
                }
                Ok(outcome.value)
            }
            Err(err) => {
                tracing::warn!(command = %params.command, error = %err, "command failed");
                Err(tower_lsp::jsonrpc::Error::invalid_params(err.to_string()))
            }
        }
    }
}

pub async fn run_stdio(state: ServerState) -> Result<(), LspServerError> {
    let state = Arc::new(state);

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) =
        LspService::new(|client| AtpiLspBackend::new(client, state.clone()));

    Server::new(stdin, stdout, socket).serve(service).await;
    state.resolver.shutdown();
    Ok(())
}

fn markdown_hover(value: String, range: Option<Range>) -> Hover {
    Hover {
        contents: HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value,
        }),
        range,
    }
}
