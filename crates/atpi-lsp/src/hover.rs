use std::sync::Arc;

use atpi_core::{
    ResolvedResult, UrlMatch, atpi_web_url, atproto_web_url, find_at, summarize,
    truncate_for_display, validate_at_url,
};
use atpi_resolve::{ResolveOptions, Resolver};
use tower_lsp::lsp_types::{Position, Range};

use crate::documents::{offset_at, range_for};

pub const HOVER_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoverOutcome {
    pub markdown: String,
    pub range: Range,
}

pub fn url_at_position(text: &str, position: Position) -> Option<UrlMatch> {
    find_at(text, offset_at(text, position)?)
}

/// Resolves the URL under the cursor and renders it for a hover popup.
///
/// The resolution runs on its own task. If the request future is dropped
/// the task still finishes and fills the cache.
pub async fn resolve_hover(
    resolver: Arc<Resolver>,
    text: &str,
    position: Position,
) -> Option<HoverOutcome> {
    let found = url_at_position(text, position)?;
    let range = range_for(text, found.start, found.end);

    if let Err(err) = validate_at_url(&found.url) {
        return Some(HoverOutcome {
            markdown: format!("**Invalid AT URL**\n\n{err}"),
            range,
        });
    }

    let max_length = resolver.config().snapshot().display.hover_max_length;
    let url = found.url.clone();
    let task = tokio::spawn(async move {
        resolver
            .resolve(&url, ResolveOptions::quiet().with_timeout_ms(HOVER_TIMEOUT_MS))
            .await
    });

    let markdown = match task.await {
        Ok(result) => resolved_hover_markdown(&result, max_length),
        Err(err) => {
            tracing::warn!(url = %found.url, error = %err, "hover resolution task failed");
            format!("**Error**\n\n{err}")
        }
    };

    Some(HoverOutcome { markdown, range })
}

pub fn resolved_hover_markdown(result: &ResolvedResult, max_length: usize) -> String {
    if let Some(err) = result.error() {
        return format!("**Failed to resolve**\n\n{err}");
    }
    let Some(data) = result.data() else {
        return "**Failed to resolve**\n\nno data returned".to_owned();
    };

    let url = result.url();
    let summary = summarize(data);
    let mut markdown = format!("**ATPI** *({} mode)*\n\n`{url}`\n\n", result.mode());
    markdown.push_str("```json\n");
    markdown.push_str(&truncate_for_display(data, max_length));
    markdown.push_str("\n```\n\n");
    markdown.push_str(&summary.summary);
    markdown.push_str("\n\n---\n\n");
    markdown.push_str(&format!(
        "[Open in atproto.at]({}) • [Open in atpi.at]({})",
        atproto_web_url(url),
        atpi_web_url(url)
    ));
    markdown
}

#[cfg(test)]
mod tests {
    use atpi_config::SharedConfig;
    use atpi_core::{ManualClock, ResolutionMode};
    use atpi_resolve::MockAtpiClient;
    use atpi_store::{MemoryStateStore, ResolutionCache};
    use serde_json::json;

    use super::*;

    fn resolver(client: Arc<MockAtpiClient>) -> Arc<Resolver> {
        let config = SharedConfig::default();
        let clock = Arc::new(ManualClock::new(0));
        let cache = ResolutionCache::load(Arc::new(MemoryStateStore::new()), config.clone(), clock.clone());
        Arc::new(Resolver::new(client, cache, config, clock))
    }

    #[tokio::test]
    async fn hover_renders_resolved_json_with_links() {
        let client = Arc::new(MockAtpiClient::new().with_fixture(
            "at://alice.test/app.bsky.feed.post/1",
            json!({"$type": "app.bsky.feed.post", "text": "hi"}),
        ));
        let text = "note\nsee at://alice.test/app.bsky.feed.post/1 here";

        let hover = resolve_hover(resolver(client.clone()), text, Position::new(1, 10))
            .await
            .expect("hover on url");

        assert!(hover.markdown.starts_with("**ATPI** *(local mode)*"));
        assert!(hover.markdown.contains("```json\n{\n  \"$type\""));
        assert!(hover.markdown.contains("Object with 2 keys, 0 arrays, 0 nested objects"));
        assert!(hover.markdown.contains("https://atproto.at://alice.test/app.bsky.feed.post/1"));
        assert_eq!(hover.range, Range::new(Position::new(1, 4), Position::new(1, 40)));

        let (_, request) = client.requests().pop().expect("one request");
        assert_eq!(request.timeout_ms, HOVER_TIMEOUT_MS);
    }

    #[tokio::test]
    async fn hover_reports_failures() {
        let client = Arc::new(MockAtpiClient::new().with_failure("at://down.test", "timed out"));
        let hover = resolve_hover(resolver(client), "at://down.test", Position::new(0, 3))
            .await
            .expect("hover on url");
        assert_eq!(hover.markdown, "**Failed to resolve**\n\ntimed out");
    }

    #[tokio::test]
    async fn no_hover_outside_urls() {
        let client = Arc::new(MockAtpiClient::new());
        let hover = resolve_hover(resolver(client.clone()), "plain words", Position::new(0, 2)).await;
        assert!(hover.is_none());
        assert_eq!(client.calls(), 0);
    }

    #[test]
    fn long_documents_are_cut_in_hover() {
        let items: Vec<_> = (0..200).map(|index| json!({"index": index})).collect();
        let result = ResolvedResult::success(
            "at://alice.test",
            json!({ "items": items }),
            0,
            ResolutionMode::Remote,
        );

        let markdown = resolved_hover_markdown(&result, 100);

        assert!(markdown.starts_with("**ATPI** *(remote mode)*"));
        assert!(markdown.contains("\n...\n"));
    }
}
