use atpi_core::{atproto_web_url, find_all_with_positions};
use serde_json::json;
use tower_lsp::lsp_types::{CodeLens, Command, DocumentLink, Url};

use crate::commands::{COPY_URL, RESOLVE_URL};
use crate::documents::range_for;

/// "Resolve" and "Copy URL" lenses above every AT URL occurrence.
pub fn code_lenses(text: &str) -> Vec<CodeLens> {
    find_all_with_positions(text)
        .into_iter()
        .flat_map(|found| {
            let range = range_for(text, found.start, found.end);
            [
                CodeLens {
                    range,
                    command: Some(Command::new(
                        "Resolve".to_owned(),
                        RESOLVE_URL.to_owned(),
                        Some(vec![json!(found.url)]),
                    )),
                    data: None,
                },
                CodeLens {
                    range,
                    command: Some(Command::new(
                        "Copy URL".to_owned(),
                        COPY_URL.to_owned(),
                        Some(vec![json!(found.url)]),
                    )),
                    data: None,
                },
            ]
        })
        .collect()
}

pub fn document_links(text: &str) -> Vec<DocumentLink> {
    find_all_with_positions(text)
        .into_iter()
        .filter_map(|found| {
            let target = match Url::parse(&atproto_web_url(&found.url)) {
                Ok(target) => target,
                Err(err) => {
                    tracing::debug!(url = %found.url, error = %err, "skipping unlinkable AT URL");
                    return None;
                }
            };
            Some(DocumentLink {
                range: range_for(text, found.start, found.end),
                target: Some(target),
                tooltip: Some(format!("Open {} in atproto.at", found.url)),
                data: None,
            })
        })
        .collect()
}
