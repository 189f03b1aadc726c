use std::fmt;

use thiserror::Error;

pub const AT_SCHEME: &str = "at://";

const ATPROTO_WEB_BASE: &str = "https://atproto.at://";
const ATPI_WEB_BASE: &str = "https://atpi.at//";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UrlValidationError {
    #[error("URL must start with at://")]
    MissingScheme,
    #[error("Invalid AT URL format")]
    Empty,
}

/// Cheap local pre-check. Full grammar validation happens in the resolution
/// backend when the URL is actually resolved.
pub fn validate_at_url(url: &str) -> Result<(), UrlValidationError> {
    let Some(rest) = url.strip_prefix(AT_SCHEME) else {
        return Err(UrlValidationError::MissingScheme);
    };
    if rest.is_empty() {
        return Err(UrlValidationError::Empty);
    }
    Ok(())
}

/// `at://<identity>[/<collection>[/<rkey>]]` split into its segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUrl {
    pub identity: String,
    pub collection: Option<String>,
    pub rkey: Option<String>,
}

impl AtUrl {
    pub fn identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            collection: None,
            rkey: None,
        }
    }

    pub fn collection(identity: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            collection: Some(collection.into()),
            rkey: None,
        }
    }

    pub fn record(
        identity: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            collection: Some(collection.into()),
            rkey: Some(rkey.into()),
        }
    }

    /// Splits on `/` and stops at the first empty segment, so a trailing slash
    /// or a doubled slash never produces an empty collection or record key.
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix(AT_SCHEME)?;
        let mut segments = rest.split('/');

        let identity = segments.next().filter(|segment| !segment.is_empty())?;
        let collection = segments.next().filter(|segment| !segment.is_empty());
        let rkey = collection.and_then(|_| segments.next().filter(|segment| !segment.is_empty()));

        Some(Self {
            identity: identity.to_owned(),
            collection: collection.map(str::to_owned),
            rkey: rkey.map(str::to_owned),
        })
    }

    pub fn is_did(&self) -> bool {
        self.identity.starts_with("did:")
    }
}

impl fmt::Display for AtUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{AT_SCHEME}{}", self.identity)?;
        if let Some(collection) = &self.collection {
            write!(f, "/{collection}")?;
            if let Some(rkey) = &self.rkey {
                write!(f, "/{rkey}")?;
            }
        }
        Ok(())
    }
}

pub fn atproto_web_url(url: &str) -> String {
    format!("{ATPROTO_WEB_BASE}{}", strip_scheme(url))
}

pub fn atpi_web_url(url: &str) -> String {
    format!("{ATPI_WEB_BASE}{}", strip_scheme(url))
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix(AT_SCHEME).unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_missing_scheme_with_fixed_reason() {
        for candidate in ["", "http://example.com", "did:plc:abc", " at://x", "AT://x"] {
            let err = validate_at_url(candidate).expect_err("should be invalid");
            assert_eq!(err, UrlValidationError::MissingScheme);
            assert_eq!(err.to_string(), "URL must start with at://");
        }
    }

    #[test]
    fn validate_only_checks_structure_minimally() {
        assert_eq!(validate_at_url("at://"), Err(UrlValidationError::Empty));
        assert_eq!(validate_at_url("at://did:plc:abc"), Ok(()));
        assert_eq!(validate_at_url("at://not a real handle!"), Ok(()));
    }

    #[test]
    fn parse_splits_segments_in_order() {
        assert_eq!(
            AtUrl::parse("at://did:plc:abc/app.bsky.feed.post/3k2a"),
            Some(AtUrl::record("did:plc:abc", "app.bsky.feed.post", "3k2a"))
        );
        assert_eq!(
            AtUrl::parse("at://alice.bsky.social/app.bsky.feed.post"),
            Some(AtUrl::collection("alice.bsky.social", "app.bsky.feed.post"))
        );
        assert_eq!(
            AtUrl::parse("at://alice.bsky.social/"),
            Some(AtUrl::identity("alice.bsky.social"))
        );
        assert_eq!(AtUrl::parse("at://"), None);
        assert_eq!(AtUrl::parse("https://alice"), None);
    }

    #[test]
    fn display_rebuilds_the_url() {
        let url = AtUrl::record("did:plc:abc", "app.bsky.graph.follow", "did:plc:xyz");
        assert_eq!(url.to_string(), "at://did:plc:abc/app.bsky.graph.follow/did:plc:xyz");
        assert!(url.is_did());
        assert_eq!(AtUrl::identity("bob.test").to_string(), "at://bob.test");
    }

    #[test]
    fn web_urls_drop_the_scheme() {
        assert_eq!(
            atproto_web_url("at://did:plc:abc/app.bsky.feed.post/1"),
            "https://atproto.at://did:plc:abc/app.bsky.feed.post/1"
        );
        assert_eq!(atpi_web_url("at://alice.test"), "https://atpi.at//alice.test");
    }
}
