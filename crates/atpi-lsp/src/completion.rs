use atpi_core::CompletionContext;
use atpi_resolve::{DEFAULT_RECORD_LIMIT, Resolver};
use serde_json::json;
use tower_lsp::lsp_types::{
    Command, CompletionItem, CompletionItemKind, CompletionTextEdit, Documentation,
    MarkupContent, MarkupKind, Position, Range, TextEdit,
};

use crate::commands::PREVIEW_RECORD;

pub const TRIGGER_CHARACTERS: [&str; 2] = ["/", "."];

/// Completion items for the text before the cursor, empty when the cursor is
/// not inside an AT URL or the lookup found nothing.
pub async fn completion_items(
    resolver: &Resolver,
    line_prefix: &str,
    position: Position,
) -> Vec<CompletionItem> {
    let Some(context) = atpi_core::completion_context(line_prefix) else {
        return Vec::new();
    };
    let show_preview = resolver
        .config()
        .snapshot()
        .display
        .show_record_preview_on_completion;

    match context {
        CompletionContext::PartialCollection { identity, partial } => {
            let range = replace_range(position, &partial);
            let needle = partial.to_lowercase();
            resolver
                .get_collections(&identity)
                .await
                .into_iter()
                .filter(|collection| collection.to_lowercase().starts_with(&needle))
                .enumerate()
                .map(|(index, collection)| {
                    let mut item = collection_item(&collection);
                    item.sort_text = Some(format!("0_{index:04}_{collection}"));
                    item.text_edit = Some(CompletionTextEdit::Edit(TextEdit::new(
                        range,
                        collection,
                    )));
                    item
                })
                .collect()
        }
        CompletionContext::AwaitingCollection { identity } => resolver
            .get_collections(&identity)
            .await
            .into_iter()
            .map(|collection| {
                let mut item = collection_item(&collection);
                item.sort_text = Some(format!("0_{collection}"));
                item.insert_text = Some(collection);
                item
            })
            .collect(),
        CompletionContext::AwaitingRecordKey {
            identity,
            collection,
        } => {
            let records = resolver
                .get_records(&identity, &collection, DEFAULT_RECORD_LIMIT)
                .await;
            record_items(&identity, &collection, records, None, show_preview)
        }
        CompletionContext::PartialRecordKey {
            identity,
            collection,
            partial,
        } => {
            let records: Vec<String> = resolver
                .get_records(&identity, &collection, DEFAULT_RECORD_LIMIT)
                .await
                .into_iter()
                .filter(|rkey| rkey.starts_with(partial.as_str()))
                .collect();
            let range = replace_range(position, &partial);
            record_items(&identity, &collection, records, Some(range), show_preview)
        }
    }
}

fn collection_item(collection: &str) -> CompletionItem {
    CompletionItem {
        label: collection.to_owned(),
        kind: Some(CompletionItemKind::VALUE),
        detail: Some("AT Protocol Collection".to_owned()),
        documentation: Some(markdown(format!("AT Protocol collection: {collection}"))),
        ..CompletionItem::default()
    }
}

fn record_items(
    identity: &str,
    collection: &str,
    records: Vec<String>,
    range: Option<Range>,
    show_preview: bool,
) -> Vec<CompletionItem> {
    let total = records.len();
    records
        .into_iter()
        .enumerate()
        .map(|(index, rkey)| {
            let record_url = format!("at://{identity}/{collection}/{rkey}");
            let mut docs = format!("**Record**: `{rkey}`\n\n_Full URL_: `{record_url}`");
            let command = show_preview.then(|| {
                docs.push_str("\n\nSelect to open a full JSON preview");
                Command::new(
                    "Preview Record".to_owned(),
                    PREVIEW_RECORD.to_owned(),
                    Some(vec![json!(record_url)]),
                )
            });

            CompletionItem {
                label: rkey.clone(),
                kind: Some(CompletionItemKind::REFERENCE),
                detail: Some(format!("AT Protocol Record ({} of {total})", index + 1)),
                documentation: Some(markdown(docs)),
                sort_text: Some(format!("1_{index:04}_{rkey}")),
                text_edit: range
                    .map(|range| CompletionTextEdit::Edit(TextEdit::new(range, rkey.clone()))),
                insert_text: Some(rkey),
                command,
                ..CompletionItem::default()
            }
        })
        .collect()
}

/// Range covering the `partial` text that ends at the cursor.
fn replace_range(position: Position, partial: &str) -> Range {
    let width = partial.encode_utf16().count() as u32;
    Range::new(
        Position::new(position.line, position.character.saturating_sub(width)),
        position,
    )
}

fn markdown(value: String) -> Documentation {
    Documentation::MarkupContent(MarkupContent {
        kind: MarkupKind::Markdown,
        value,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atpi_config::{AtpiConfig, SharedConfig};
    use atpi_core::ManualClock;
    use atpi_resolve::MockAtpiClient;
    use atpi_store::{MemoryStateStore, ResolutionCache};
    use serde_json::json;

    use super::*;

    fn resolver(show_preview: bool) -> Resolver {
        let client = MockAtpiClient::new()
            .with_fixture(
                "at://alice.test",
                json!({"repoInfo": {"collections": [
                    "app.bsky.actor.profile",
                    "app.bsky.feed.post",
                    "chat.bsky.actor.declaration"
                ]}}),
            )
            .with_fixture(
                "at://alice.test/app.bsky.feed.post",
                json!({"records": [
                    {"uri": "at://did:plc:alice/app.bsky.feed.post/3kaaa"},
                    {"uri": "at://did:plc:alice/app.bsky.feed.post/3kbbb"},
                    {"uri": "at://did:plc:alice/app.bsky.feed.post/4zzz"}
                ]}),
            );
        let mut config = AtpiConfig::default();
        config.display.show_record_preview_on_completion = show_preview;
        let config = SharedConfig::new(config);
        let clock = Arc::new(ManualClock::new(0));
        let cache = ResolutionCache::load(Arc::new(MemoryStateStore::new()), config.clone(), clock.clone());
        Resolver::new(Arc::new(client), cache, config, clock)
    }

    fn labels(items: &[CompletionItem]) -> Vec<&str> {
        items.iter().map(|item| item.label.as_str()).collect()
    }

    #[tokio::test]
    async fn awaiting_collection_lists_every_collection() {
        let resolver = resolver(false);
        let items = completion_items(&resolver, "at://alice.test/", Position::new(0, 16)).await;

        assert_eq!(
            labels(&items),
            vec!["app.bsky.actor.profile", "app.bsky.feed.post", "chat.bsky.actor.declaration"]
        );
        assert_eq!(items[0].insert_text.as_deref(), Some("app.bsky.actor.profile"));
        assert_eq!(items[0].sort_text.as_deref(), Some("0_app.bsky.actor.profile"));
    }

    #[tokio::test]
    async fn partial_collection_filters_case_insensitively_and_replaces_partial() {
        let resolver = resolver(false);
        let prefix = "x at://alice.test/APP.bsky.f";
        let position = Position::new(3, prefix.len() as u32);

        let items = completion_items(&resolver, prefix, position).await;

        assert_eq!(labels(&items), vec!["app.bsky.feed.post"]);
        let Some(CompletionTextEdit::Edit(edit)) = &items[0].text_edit else {
            panic!("expected a plain text edit");
        };
        assert_eq!(edit.range.start, Position::new(3, 18));
        assert_eq!(edit.range.end, position);
        assert_eq!(edit.new_text, "app.bsky.feed.post");
        assert_eq!(items[0].sort_text.as_deref(), Some("0_0000_app.bsky.feed.post"));
    }

    #[tokio::test]
    async fn record_keys_carry_full_url_and_preview_command() {
        let resolver = resolver(true);
        let items = completion_items(
            &resolver,
            "at://alice.test/app.bsky.feed.post/",
            Position::new(0, 35),
        )
        .await;

        assert_eq!(labels(&items), vec!["3kaaa", "3kbbb", "4zzz"]);
        assert_eq!(items[1].detail.as_deref(), Some("AT Protocol Record (2 of 3)"));
        let command = items[0].command.as_ref().expect("preview command");
        assert_eq!(command.command, PREVIEW_RECORD);
        assert_eq!(
            command.arguments,
            Some(vec![json!("at://alice.test/app.bsky.feed.post/3kaaa")])
        );
        let Some(Documentation::MarkupContent(docs)) = &items[0].documentation else {
            panic!("expected markdown docs");
        };
        assert!(docs.value.contains("at://alice.test/app.bsky.feed.post/3kaaa"));
    }

    #[tokio::test]
    async fn partial_record_key_filters_by_prefix() {
        let resolver = resolver(false);
        let prefix = "at://alice.test/app.bsky.feed.post/3k";
        let items = completion_items(&resolver, prefix, Position::new(0, prefix.len() as u32)).await;

        assert_eq!(labels(&items), vec!["3kaaa", "3kbbb"]);
        assert!(items[0].command.is_none());
        assert!(items[0].text_edit.is_some());
    }

    #[tokio::test]
    async fn nothing_offered_outside_url_context() {
        let resolver = resolver(false);
        assert!(completion_items(&resolver, "hello /", Position::new(0, 7)).await.is_empty());
        assert!(
            completion_items(&resolver, "at://nobody.test/", Position::new(0, 17))
                .await
                .is_empty()
        );
    }
}
