use std::ffi::OsStr;
use std::path::PathBuf;

use atpi_core::ResolutionMode;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

/// How `resolve` prints a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// The full result record as JSON.
    Json,
    /// Just the resolved document, pretty-printed.
    #[default]
    Pretty,
    /// Summary line plus well-known fields.
    Summary,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Summary => "summary",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "summary" => Ok(Self::Summary),
            other => Err(format!(
                "invalid output format '{other}', expected one of: json, pretty, summary"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ResolveArgs {
    #[arg(help = "AT URL to resolve")]
    pub url: String,

    #[arg(
        long,
        default_value = "pretty",
        value_parser = parse_output_format,
        help = "Output format: json, pretty, or summary"
    )]
    pub output: OutputFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct BatchArgs {
    #[arg(help = "AT URLs to resolve")]
    pub urls: Vec<String>,

    #[arg(long, help = "Resolve every AT URL found in this file")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ExtractArgs {
    #[arg(help = "File to scan for AT URLs")]
    pub file: PathBuf,

    #[arg(long, help = "Print line:column before each URL")]
    pub positions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ModeArgs {
    #[arg(
        value_name = "MODE",
        value_parser = parse_resolution_mode,
        help = "New resolution mode: local, remote, or auto. Lists modes when omitted"
    )]
    pub target: Option<ResolutionMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CacheCommand {
    /// List cached URLs
    List,
    /// Drop every cached resolution
    Clear,
    /// Drop one cached URL
    Remove {
        #[arg(help = "AT URL to evict")]
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum HistoryCommand {
    /// List recent resolutions, newest first
    List,
    /// Forget every recent resolution
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Resolve one AT URL
    Resolve(ResolveArgs),
    /// Resolve several AT URLs in order
    Batch(BatchArgs),
    /// Check that a string is a syntactically valid AT URL
    Validate {
        #[arg(help = "AT URL to check")]
        url: String,
    },
    /// List the AT URLs found in a file
    Extract(ExtractArgs),
    /// Show or change the workspace resolution mode
    Mode(ModeArgs),
    /// Inspect or clear the resolution cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
    /// Inspect or clear the resolution history
    History {
        #[command(subcommand)]
        action: HistoryCommand,
    },
    /// Run as stdio LSP server
    Lsp,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "ATPI AT URL resolver")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .atpi/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[arg(
        long,
        global = true,
        value_parser = parse_resolution_mode,
        help = "Resolution mode for this run only: local, remote, or auto"
    )]
    pub mode: Option<ResolutionMode>,

    #[arg(long, global = true, help = "Per-resolution timeout for this run only")]
    pub timeout_ms: Option<u64>,

    #[arg(
        long,
        global = true,
        help = "Resolve from fixtures instead of the network"
    )]
    pub offline: bool,

    #[arg(
        long,
        global = true,
        requires = "offline",
        help = "JSON file mapping AT URLs to documents for --offline"
    )]
    pub fixtures: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_output_format(value: &str) -> Result<OutputFormat, String> {
    value.parse()
}

fn parse_resolution_mode(value: &str) -> Result<ResolutionMode, String> {
    value.parse()
}
