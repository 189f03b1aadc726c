use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use atpi_config::{SharedConfig, set_resolution_mode};
use atpi_core::{
    ResolutionMode, ResolvedResult, UrlMatch, batch_summary, find_all, find_all_with_positions,
    format_timestamp, summarize, truncate_for_display, validate_at_url,
};
use atpi_resolve::ResolveOptions;
use atpi_store::history_label;

use crate::cli::{CacheCommand, HistoryCommand, OutputFormat};
use crate::workspace::Session;

pub async fn run_resolve(
    session: &Session,
    url: &str,
    output: OutputFormat,
    out: &mut dyn Write,
) -> Result<()> {
    session
        .resolver
        .validate(url)
        .map_err(|err| anyhow!("invalid AT URL {url}: {err}"))?;

    let result = session.resolver.resolve(url, ResolveOptions::default()).await;
    let Some(data) = result.data() else {
        bail!(
            "failed to resolve {url}: {}",
            result.error().unwrap_or("unknown error")
        );
    };

    match output {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
        }
        OutputFormat::Pretty => {
            writeln!(out, "{}", truncate_for_display(data, 0))?;
        }
        OutputFormat::Summary => write_summary(&result, out)?,
    }

    session.history.append(result);
    Ok(())
}

fn write_summary(result: &ResolvedResult, out: &mut dyn Write) -> Result<()> {
    let Some(data) = result.data() else {
        return Ok(());
    };
    let summary = summarize(data);

    writeln!(out, "{} ({} mode)", result.url(), result.mode())?;
    writeln!(out, "{}", summary.summary)?;
    for (key, value) in &summary.details {
        match value {
            serde_json::Value::String(text) => writeln!(out, "  {key}: {text}")?,
            other => writeln!(out, "  {key}: {other}")?,
        }
    }
    writeln!(out, "resolved at {}", format_timestamp(result.timestamp()))?;
    Ok(())
}

/// Explicit URLs first, then URLs found in `file`, without repeats.
pub fn collect_batch_urls(urls: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut collected: Vec<String> = Vec::new();
    for url in urls {
        if !collected.contains(url) {
            collected.push(url.clone());
        }
    }

    if let Some(path) = file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for url in find_all(&text) {
            if !collected.contains(&url) {
                collected.push(url);
            }
        }
    }

    if collected.is_empty() {
        bail!("no AT URLs to resolve");
    }
    Ok(collected)
}

/// Resolves every URL in order and prints one status line each plus a totals
/// line. Returns the number of failures.
pub async fn run_batch(session: &Session, urls: &[String], out: &mut dyn Write) -> Result<usize> {
    let results = session
        .resolver
        .resolve_many_with_progress(urls, ResolveOptions::quiet(), |progress| {
            tracing::info!(
                index = progress.index + 1,
                total = progress.total,
                url = progress.url,
                "resolving"
            );
        })
        .await;

    for result in &results {
        match result.error() {
            None => writeln!(out, "ok\t{}", result.url())?,
            Some(err) => writeln!(out, "error\t{}\t{}", result.url(), one_line(err))?,
        }
    }
    writeln!(out, "{}", batch_summary(&results))?;

    Ok(results.iter().filter(|result| !result.is_success()).count())
}

pub fn run_validate(url: &str, out: &mut dyn Write) -> Result<()> {
    validate_at_url(url).map_err(|err| anyhow!("invalid AT URL {url}: {err}"))?;
    writeln!(out, "valid\t{url}")?;
    Ok(())
}

pub fn run_extract(path: &Path, positions: bool, out: &mut dyn Write) -> Result<()> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;

    if !positions {
        for url in find_all(&text) {
            writeln!(out, "{url}")?;
        }
        return Ok(());
    }

    for found in find_all_with_positions(&text) {
        let (line, column) = line_column(&text, &found);
        writeln!(out, "{line}:{column}\t{}", found.url)?;
    }
    Ok(())
}

/// 1-based line and character column of a match start.
fn line_column(text: &str, found: &UrlMatch) -> (usize, usize) {
    let before = &text[..found.start];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|index| index + 1).unwrap_or(0);
    let column = text[line_start..found.start].chars().count() + 1;
    (line, column)
}

/// Lists the modes with the active one starred, or persists a new mode and
/// applies it to the live config.
pub fn run_mode(
    workspace: &Path,
    config: &SharedConfig,
    target: Option<ResolutionMode>,
    out: &mut dyn Write,
) -> Result<()> {
    let Some(mode) = target else {
        let current = config.snapshot().resolution.mode;
        for mode in ResolutionMode::ALL {
            let marker = if mode == current { "*" } else { " " };
            writeln!(out, "{marker} {mode}\t{}", mode.description())?;
        }
        return Ok(());
    };

    let persisted = set_resolution_mode(workspace, mode)
        .with_context(|| format!("failed to persist resolution mode {mode}"))?;
    config.update(|config| config.resolution.mode = persisted.resolution.mode);
    writeln!(out, "Resolution mode changed to {mode}")?;
    Ok(())
}

pub fn run_cache(session: &Session, action: &CacheCommand, out: &mut dyn Write) -> Result<()> {
    let cache = session.resolver.cache();
    match action {
        CacheCommand::List => {
            let mut entries: Vec<_> = cache.all().into_iter().collect();
            if entries.is_empty() {
                writeln!(out, "Cache is empty")?;
                return Ok(());
            }
            entries.sort_by(|left, right| left.0.cmp(&right.0));
            for (url, entry) in entries {
                writeln!(
                    out,
                    "{url}\t{}\t{}",
                    entry.mode,
                    format_timestamp(entry.timestamp)
                )?;
            }
        }
        CacheCommand::Clear => {
            session.resolver.clear_all_caches();
            writeln!(out, "Cache cleared")?;
        }
        CacheCommand::Remove { url } => {
            if cache.remove(url) {
                writeln!(out, "Removed {url}")?;
            } else {
                writeln!(out, "{url} was not cached")?;
            }
        }
    }
    Ok(())
}

pub fn run_history(session: &Session, action: &HistoryCommand, out: &mut dyn Write) -> Result<()> {
    match action {
        HistoryCommand::List => {
            let results = session.history.list();
            if results.is_empty() {
                writeln!(out, "No history")?;
                return Ok(());
            }
            for result in results {
                writeln!(
                    out,
                    "{}\t{}\t{}",
                    history_label(result.url()),
                    result.url(),
                    format_timestamp(result.timestamp())
                )?;
            }
        }
        HistoryCommand::Clear => {
            session.history.clear();
            writeln!(out, "History cleared")?;
        }
    }
    Ok(())
}

fn one_line(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}
