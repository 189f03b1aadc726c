//! Locating AT URLs inside arbitrary text.
//!
//! Two query modes share one grammar. Full-match mode (`find_*`) reports
//! complete URLs for hover, resolve and code lenses; a trailing slash after
//! the identity is simply not part of the match. Prefix-match mode
//! ([`completion_context`]) looks at the text before a cursor and reports what
//! segment the user is in the middle of typing, so a trailing slash there means
//! "awaiting collection".

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

const IDENTITY_CHARS: &str = r"[A-Za-z0-9._:%-]";
const COLLECTION_CHARS: &str = r"[A-Za-z0-9._-]";
const RKEY_CHARS: &str = r"[A-Za-z0-9._~:@!$&'()*+,;=-]";

static AT_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"at://{IDENTITY_CHARS}+(?:/{COLLECTION_CHARS}+)?(?:/{RKEY_CHARS}+)?"
    ))
    .expect("valid AT URL regex")
});

static PARTIAL_COLLECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"at://({IDENTITY_CHARS}+)/({COLLECTION_CHARS}+)$"
    ))
    .expect("valid partial collection regex")
});

static AWAITING_COLLECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"at://({IDENTITY_CHARS}+)/$")).expect("valid awaiting collection regex")
});

static RECORD_KEY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"at://({IDENTITY_CHARS}+)/({COLLECTION_CHARS}+)/({RKEY_CHARS}*)$"
    ))
    .expect("valid record key prefix regex")
});

/// A URL occurrence with byte offsets into the searched text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlMatch {
    pub url: String,
    pub start: usize,
    pub end: usize,
}

impl UrlMatch {
    fn midpoint(&self) -> f64 {
        self.start as f64 + (self.end - self.start) as f64 / 2.0
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset <= self.end
    }
}

/// All distinct URLs in order of first occurrence.
pub fn find_all(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    AT_URL_PATTERN
        .find_iter(text)
        .map(|found| found.as_str())
        .filter(|url| seen.insert(*url))
        .map(str::to_owned)
        .collect()
}

pub fn find_all_with_positions(text: &str) -> Vec<UrlMatch> {
    AT_URL_PATTERN
        .find_iter(text)
        .map(|found| UrlMatch {
            url: found.as_str().to_owned(),
            start: found.start(),
            end: found.end(),
        })
        .collect()
}

/// The URL whose span midpoint is closest to `cursor`; the earlier match wins
/// ties.
pub fn find_nearest(text: &str, cursor: usize) -> Option<String> {
    let mut best: Option<(f64, UrlMatch)> = None;
    for candidate in find_all_with_positions(text) {
        let distance = (candidate.midpoint() - cursor as f64).abs();
        match &best {
            Some((best_distance, _)) if distance >= *best_distance => {}
            _ => best = Some((distance, candidate)),
        }
    }
    best.map(|(_, found)| found.url)
}

/// The match covering `offset`, end inclusive so a cursor placed right after
/// the last character still hits.
pub fn find_at(text: &str, offset: usize) -> Option<UrlMatch> {
    find_all_with_positions(text)
        .into_iter()
        .find(|candidate| candidate.contains(offset))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionContext {
    /// `at://alice.test/app.bs|`
    PartialCollection { identity: String, partial: String },
    /// `at://alice.test/|`
    AwaitingCollection { identity: String },
    /// `at://alice.test/app.bsky.feed.post/|`
    AwaitingRecordKey { identity: String, collection: String },
    /// `at://alice.test/app.bsky.feed.post/3k|`
    PartialRecordKey {
        identity: String,
        collection: String,
        partial: String,
    },
}

impl CompletionContext {
    /// Length in bytes of the text the completion should replace.
    pub fn partial_len(&self) -> usize {
        match self {
            Self::PartialCollection { partial, .. } | Self::PartialRecordKey { partial, .. } => {
                partial.len()
            }
            Self::AwaitingCollection { .. } | Self::AwaitingRecordKey { .. } => 0,
        }
    }
}

/// Classifies the text before the cursor. Record keys are only offered for
/// dotted collection names, and nothing is offered past a complete record URL.
pub fn completion_context(line_prefix: &str) -> Option<CompletionContext> {
    if let Some(captures) = PARTIAL_COLLECTION.captures(line_prefix) {
        return Some(CompletionContext::PartialCollection {
            identity: captures[1].to_owned(),
            partial: captures[2].to_owned(),
        });
    }

    if let Some(captures) = AWAITING_COLLECTION.captures(line_prefix) {
        return Some(CompletionContext::AwaitingCollection {
            identity: captures[1].to_owned(),
        });
    }

    let captures = RECORD_KEY_PREFIX.captures(line_prefix)?;
    let identity = captures[1].to_owned();
    let collection = captures[2].to_owned();
    if !is_dotted(&collection) {
        return None;
    }

    let partial = &captures[3];
    if partial.is_empty() {
        Some(CompletionContext::AwaitingRecordKey {
            identity,
            collection,
        })
    } else {
        Some(CompletionContext::PartialRecordKey {
            identity,
            collection,
            partial: partial.to_owned(),
        })
    }
}

fn is_dotted(collection: &str) -> bool {
    collection
        .split('.')
        .filter(|segment| !segment.is_empty())
        .count()
        >= 2
}
