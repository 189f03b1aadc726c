use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tower_lsp::lsp_types::{Position, Range, Url};

/// Full-text mirror of the documents the client has open.
#[derive(Debug, Default)]
pub struct DocumentStore {
    documents: Mutex<HashMap<Url, String>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, uri: Url, text: String) {
        self.lock().insert(uri, text);
    }

    pub fn replace(&self, uri: Url, text: String) {
        self.lock().insert(uri, text);
    }

    pub fn close(&self, uri: &Url) {
        self.lock().remove(uri);
    }

    pub fn text(&self, uri: &Url) -> Option<String> {
        self.lock().get(uri).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Url, String>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Byte offset of an LSP position (UTF-16 columns). Columns past the end of
/// the line clamp to the line end; `None` when the line does not exist.
pub fn offset_at(text: &str, position: Position) -> Option<usize> {
    let line_start = line_start_offset(text, position.line as usize)?;
    let line = line_text(&text[line_start..]);

    let mut units = 0u32;
    for (index, ch) in line.char_indices() {
        if units >= position.character {
            return Some(line_start + index);
        }
        units += ch.len_utf16() as u32;
    }
    Some(line_start + line.len())
}

pub fn position_at(text: &str, offset: usize) -> Position {
    let offset = offset.min(text.len());
    let before = &text[..offset];
    let line = before.matches('\n').count() as u32;
    let line_start = before.rfind('\n').map(|index| index + 1).unwrap_or(0);
    let character = before[line_start..].encode_utf16().count() as u32;
    Position::new(line, character)
}

pub fn range_for(text: &str, start: usize, end: usize) -> Range {
    Range::new(position_at(text, start), position_at(text, end))
}

/// Text of the cursor's line up to the cursor.
pub fn line_prefix(text: &str, position: Position) -> Option<&str> {
    let line_start = line_start_offset(text, position.line as usize)?;
    let cursor = offset_at(text, position)?;
    Some(&text[line_start..cursor])
}

/// The cursor's whole line and the cursor's byte offset within it.
pub fn cursor_line(text: &str, position: Position) -> Option<(&str, usize)> {
    let line_start = line_start_offset(text, position.line as usize)?;
    let cursor = offset_at(text, position)?;
    Some((line_text(&text[line_start..]), cursor - line_start))
}

fn line_start_offset(text: &str, line: usize) -> Option<usize> {
    if line == 0 {
        return Some(0);
    }
    text.match_indices('\n')
        .nth(line - 1)
        .map(|(index, _)| index + 1)
}

fn line_text(rest: &str) -> &str {
    let line = rest.split('\n').next().unwrap_or_default();
    line.strip_suffix('\r').unwrap_or(line)
}
