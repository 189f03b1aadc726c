use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{ResolvedResult, TimestampMillis};

pub const DEFAULT_HOVER_MAX_LENGTH: usize = 20_000;
const TEXT_PREVIEW_CHARS: usize = 100;
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq)]
pub struct DataSummary {
    pub summary: String,
    pub details: Map<String, Value>,
}

/// One-line description of a resolved document plus the well-known AT
/// Protocol fields it carries.
pub fn summarize(data: &Value) -> DataSummary {
    let Value::Object(object) = data else {
        let mut details = Map::new();
        details.insert("value".to_owned(), data.clone());
        return DataSummary {
            summary: display_string(data),
            details,
        };
    };

    let mut details = Map::new();
    for (source, target) in [("$type", "type"), ("uri", "uri"), ("cid", "cid")] {
        if let Some(value) = object.get(source).filter(|value| is_truthy(value)) {
            details.insert(target.to_owned(), value.clone());
        }
    }

    if let Some(text) = object.get("text").filter(|value| is_truthy(value)) {
        let preview = match text {
            Value::String(text) => Value::String(elide(text, TEXT_PREVIEW_CHARS)),
            other => other.clone(),
        };
        details.insert("text".to_owned(), preview);
    }

    if let Some(created_at) = object.get("createdAt").filter(|value| is_truthy(value)) {
        details.insert(
            "created".to_owned(),
            Value::String(format_created_at(created_at)),
        );
    }

    for field in ["displayName", "handle", "did"] {
        if let Some(value) = object.get(field).filter(|value| is_truthy(value)) {
            details.insert(field.to_owned(), value.clone());
        }
    }

    let mut array_count = 0usize;
    let mut object_count = 0usize;
    for (key, value) in object {
        match value {
            Value::Array(items) => {
                array_count += 1;
                details.insert(format!("{key}_count"), Value::from(items.len()));
            }
            Value::Object(_) => object_count += 1,
            _ => {}
        }
    }

    DataSummary {
        summary: format!(
            "Object with {} keys, {array_count} arrays, {object_count} nested objects",
            object.len()
        ),
        details,
    }
}

/// Pretty JSON cut to `max_length` characters (0 disables the cut). A cut
/// output ends with `...` followed by closers for every bracket left open, so
/// it reads like JSON even though it may not parse.
pub fn truncate_for_display(data: &Value, max_length: usize) -> String {
    let pretty = serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
    if max_length == 0 || pretty.chars().count() <= max_length {
        return pretty;
    }

    let mut truncated: String = pretty.chars().take(max_length).collect();
    truncated.push('\n');
    truncated.push_str(ELLIPSIS);

    let open = unclosed_brackets(&truncated);
    if !open.is_empty() {
        truncated.push('\n');
        truncated.extend(open.iter().rev());
    }
    truncated
}

/// Closers for the brackets still open at the end of `text`, innermost last.
/// Brackets inside string literals are ignored.
fn unclosed_brackets(text: &str) -> Vec<char> {
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                open.pop();
            }
            _ => {}
        }
    }
    open
}

/// `Resolved 3 URLs, 1 failed`; the failure clause is omitted when nothing
/// failed.
pub fn batch_summary(results: &[ResolvedResult]) -> String {
    let succeeded = results.iter().filter(|result| result.is_success()).count();
    let failed = results.len() - succeeded;

    let plural = if succeeded == 1 { "" } else { "s" };
    let mut message = format!("Resolved {succeeded} URL{plural}");
    if failed > 0 {
        message.push_str(&format!(", {failed} failed"));
    }
    message
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_owned();
    }

    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

pub fn format_timestamp(timestamp: TimestampMillis) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|moment| moment.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Keeps the first `limit` characters and appends `...` when anything was cut.
pub fn elide(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_owned();
    }
    let mut out: String = value.chars().take(limit).collect();
    out.push_str(ELLIPSIS);
    out
}

fn format_created_at(value: &Value) -> String {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|moment| format_timestamp(moment.timestamp_millis()))
            .unwrap_or_else(|_| raw.clone()),
        Value::Number(number) => number
            .as_i64()
            .map(format_timestamp)
            .unwrap_or_else(|| number.to_string()),
        other => display_string(other),
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
