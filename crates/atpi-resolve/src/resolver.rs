use std::sync::Arc;

use atpi_config::SharedConfig;
use atpi_core::{CacheEntry, Clock, ResolutionMode, ResolvedResult, UrlValidationError, validate_at_url};
use atpi_store::ResolutionCache;
use serde_json::Value;

use crate::completion::{COLLECTIONS_TTL_MS, CompletionCache, RECORDS_TTL_MS};
use crate::{AtpiClient, ClientRequest};

/// Timeout for the lookups that feed autocomplete.
pub const COMPLETION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECORD_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOptions {
    pub mode: Option<ResolutionMode>,
    pub timeout_ms: Option<u64>,
    /// Log the resolution at `info` instead of `debug`.
    pub show_progress: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            mode: None,
            timeout_ms: None,
            show_progress: true,
        }
    }
}

impl ResolveOptions {
    pub fn quiet() -> Self {
        Self {
            show_progress: false,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: ResolutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress<'a> {
    pub index: usize,
    pub total: usize,
    pub url: &'a str,
}

/// Turns AT URLs into [`ResolvedResult`]s, consulting the resolution cache
/// first and the client second. Also serves the autocomplete lookups.
pub struct Resolver {
    client: Arc<dyn AtpiClient>,
    cache: ResolutionCache,
    config: SharedConfig,
    clock: Arc<dyn Clock>,
    collections: CompletionCache<String>,
    records: CompletionCache<(String, String)>,
}

impl Resolver {
    pub fn new(
        client: Arc<dyn AtpiClient>,
        cache: ResolutionCache,
        config: SharedConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            cache,
            config,
            clock,
            collections: CompletionCache::new(COLLECTIONS_TTL_MS),
            records: CompletionCache::new(RECORDS_TTL_MS),
        }
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    /// Never fails: client errors come back as a failed [`ResolvedResult`].
    pub async fn resolve(&self, url: &str, options: ResolveOptions) -> ResolvedResult {
        let config = self.config.snapshot();
        let mode = options.mode.unwrap_or(config.resolution.mode);
        let timeout_ms = options.timeout_ms.unwrap_or(config.resolution.timeout_ms);

        if config.cache.enabled {
            if let Some(entry) = self.cache.get(url) {
                tracing::debug!(url, mode = %entry.mode, "resolution cache hit");
                return ResolvedResult::success(url, entry.data, entry.timestamp, entry.mode);
            }
            tracing::debug!(url, "resolution cache miss");
        }

        if options.show_progress {
            tracing::info!(url, mode = %mode, "resolving AT URL");
        } else {
            tracing::debug!(url, mode = %mode, timeout_ms, "resolving AT URL");
        }

        let request = ClientRequest {
            mode,
            timeout_ms,
            fallback_to_remote: mode == ResolutionMode::Auto,
            base_url: config.resolution.remote_base_url,
        };

        match self.client.resolve(url, &request).await {
            Ok(data) => {
                let now = self.clock.now_millis();
                if config.cache.enabled {
                    self.cache.set(
                        url,
                        CacheEntry {
                            data: data.clone(),
                            timestamp: now,
                            mode,
                        },
                    );
                }
                ResolvedResult::success(url, data, now, mode)
            }
            Err(err) => {
                tracing::debug!(url, error = %err, "resolution failed");
                ResolvedResult::failure(url, err.to_string(), self.clock.now_millis(), mode)
            }
        }
    }

    pub async fn resolve_many(&self, urls: &[String], options: ResolveOptions) -> Vec<ResolvedResult> {
        self.resolve_many_with_progress(urls, options, |_| {}).await
    }

    /// Resolves one URL at a time in input order, reporting progress before
    /// each.
    pub async fn resolve_many_with_progress<F>(
        &self,
        urls: &[String],
        options: ResolveOptions,
        mut on_progress: F,
    ) -> Vec<ResolvedResult>
    where
        F: FnMut(BatchProgress<'_>) + Send,
    {
        let total = urls.len();
        let inner = ResolveOptions {
            show_progress: false,
            ..options
        };

        let mut results = Vec::with_capacity(total);
        for (index, url) in urls.iter().enumerate() {
            on_progress(BatchProgress { index, total, url });
            results.push(self.resolve(url, inner).await);
        }

        let failed = results.iter().filter(|result| !result.is_success()).count();
        tracing::info!(total, failed, "batch resolution finished");
        results
    }

    pub fn validate(&self, url: &str) -> Result<(), UrlValidationError> {
        validate_at_url(url)
    }

    /// Collection names in the repository of `identity`, empty on any failure.
    pub async fn get_collections(&self, identity: &str) -> Vec<String> {
        let use_cache = self.config.snapshot().cache.completion_cache_enabled;
        let key = identity.to_owned();
        if use_cache {
            if let Some(collections) = self.collections.get(&key, self.clock.now_millis()) {
                return collections;
            }
        }

        let result = self
            .resolve(
                &format!("at://{identity}"),
                ResolveOptions::quiet().with_timeout_ms(COMPLETION_TIMEOUT_MS),
            )
            .await;

        if let Some(err) = result.error() {
            tracing::warn!(identity, error = %err, "failed to fetch collections");
            return Vec::new();
        }

        let Some(collections) = result.data().and_then(extract_collections) else {
            return Vec::new();
        };
        if use_cache {
            self.collections
                .insert(key, collections.clone(), self.clock.now_millis());
        }
        collections
    }

    /// Record keys in `collection`, at most `limit`, empty on any failure.
    pub async fn get_records(&self, identity: &str, collection: &str, limit: usize) -> Vec<String> {
        let use_cache = self.config.snapshot().cache.completion_cache_enabled;
        let key = (identity.to_owned(), collection.to_owned());
        if use_cache {
            if let Some(records) = self.records.get(&key, self.clock.now_millis()) {
                return records.into_iter().take(limit).collect();
            }
        }

        let result = self
            .resolve(
                &format!("at://{identity}/{collection}"),
                ResolveOptions::quiet().with_timeout_ms(COMPLETION_TIMEOUT_MS),
            )
            .await;

        if let Some(err) = result.error() {
            tracing::warn!(identity, collection, error = %err, "failed to fetch records");
            return Vec::new();
        }

        let Some(records) = result.data().and_then(extract_record_keys) else {
            return Vec::new();
        };
        let limited = records.iter().take(limit).cloned().collect();
        if use_cache {
            self.records.insert(key, records, self.clock.now_millis());
        }
        limited
    }

    /// Drops the autocomplete caches; resolution results stay cached.
    pub fn clear_completion_caches(&self) {
        self.collections.clear();
        self.records.clear();
    }

    pub fn clear_all_caches(&self) {
        self.clear_completion_caches();
        self.cache.clear();
        tracing::info!("cleared all resolution caches");
    }

    pub fn shutdown(&self) {
        self.cache.flush();
    }
}

fn extract_collections(data: &Value) -> Option<Vec<String>> {
    let collections = data.get("repoInfo")?.get("collections")?.as_array()?;
    Some(
        collections
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
    )
}

fn extract_record_keys(data: &Value) -> Option<Vec<String>> {
    let records = data.get("records")?.as_array()?;
    Some(
        records
            .iter()
            .filter_map(|record| record.get("uri").and_then(Value::as_str))
            .filter_map(|uri| uri.rsplit('/').next())
            .filter(|rkey| !rkey.is_empty())
            .map(str::to_owned)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use atpi_config::AtpiConfig;
    use atpi_core::ManualClock;
    use atpi_store::MemoryStateStore;
    use serde_json::json;

    use super::*;
    use crate::MockAtpiClient;

    const HOUR_MS: i64 = 3_600_000;

    struct Harness {
        resolver: Resolver,
        client: Arc<MockAtpiClient>,
        clock: Arc<ManualClock>,
        config: SharedConfig,
    }

    fn harness(client: MockAtpiClient) -> Harness {
        harness_with_config(client, AtpiConfig::default())
    }

    fn harness_with_config(client: MockAtpiClient, config: AtpiConfig) -> Harness {
        let client = Arc::new(client);
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let config = SharedConfig::new(config);
        let cache = ResolutionCache::load(
            Arc::new(MemoryStateStore::new()),
            config.clone(),
            clock.clone(),
        );
        let resolver = Resolver::new(client.clone(), cache, config.clone(), clock.clone());
        Harness {
            resolver,
            client,
            clock,
            config,
        }
    }

    fn urls(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[tokio::test]
    async fn second_resolve_within_ttl_is_served_from_cache() {
        let h = harness(MockAtpiClient::new().with_fixture("at://alice.test", json!({"n": 1})));

        let first = h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;
        h.clock.advance(10_000);
        let second = h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;

        assert!(first.is_success());
        assert_eq!(second.data(), first.data());
        assert_eq!(second.timestamp(), first.timestamp());
        assert_eq!(h.client.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entry_triggers_new_delegation() {
        let h = harness(MockAtpiClient::new().with_fixture("at://alice.test", json!({"n": 1})));

        h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;
        h.clock.advance(HOUR_MS + 1);

        assert!(h.resolver.cache().get("at://alice.test").is_none());
        let again = h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;
        assert!(again.is_success());
        assert_eq!(h.client.calls(), 2);
    }

    #[tokio::test]
    async fn disabled_cache_always_delegates() {
        let mut config = AtpiConfig::default();
        config.cache.enabled = false;
        let h = harness_with_config(
            MockAtpiClient::new().with_fixture("at://alice.test", json!(1)),
            config,
        );

        h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;
        h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;

        assert_eq!(h.client.calls(), 2);
        assert!(h.resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn failures_are_captured_and_not_cached() {
        let h = harness(MockAtpiClient::new().with_failure("at://down.test", "connection refused"));

        let result = h.resolver.resolve("at://down.test", ResolveOptions::quiet()).await;

        assert!(!result.is_success());
        assert_eq!(result.error(), Some("connection refused"));
        assert_eq!(result.data(), None);
        assert_eq!(result.mode(), ResolutionMode::Local);
        assert!(h.resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn options_override_config_and_auto_requests_fallback() {
        let h = harness(MockAtpiClient::new().with_fixture("at://alice.test", json!(1)));
        h.config.update(|config| config.resolution.remote_base_url = "https://resolver.example/".to_owned());

        let result = h
            .resolver
            .resolve(
                "at://alice.test",
                ResolveOptions::quiet()
                    .with_mode(ResolutionMode::Auto)
                    .with_timeout_ms(1_234),
            )
            .await;

        assert_eq!(result.mode(), ResolutionMode::Auto);
        let (_, request) = h.client.requests().pop().expect("one request");
        assert_eq!(
            request,
            ClientRequest {
                mode: ResolutionMode::Auto,
                timeout_ms: 1_234,
                fallback_to_remote: true,
                base_url: "https://resolver.example".to_owned(),
            }
        );
        assert_eq!(
            h.resolver.cache().get("at://alice.test").map(|entry| entry.mode),
            Some(ResolutionMode::Auto)
        );
    }

    #[tokio::test]
    async fn config_defaults_apply_without_options() {
        let h = harness(MockAtpiClient::new().with_fixture("at://alice.test", json!(1)));
        h.config.update(|config| {
            config.resolution.mode = ResolutionMode::Remote;
            config.resolution.timeout_ms = 9_000;
        });

        h.resolver.resolve("at://alice.test", ResolveOptions::default()).await;

        let (_, request) = h.client.requests().pop().expect("one request");
        assert_eq!(request.mode, ResolutionMode::Remote);
        assert_eq!(request.timeout_ms, 9_000);
        assert!(!request.fallback_to_remote);
    }

    #[tokio::test]
    async fn batch_keeps_order_and_isolates_failures() {
        let h = harness(
            MockAtpiClient::new()
                .with_fixture("at://one.test", json!(1))
                .with_failure("at://two.test", "nope")
                .with_fixture("at://three.test", json!(3)),
        );
        let batch = urls(&["at://one.test", "at://two.test", "at://three.test"]);

        let mut seen = Vec::new();
        let results = h
            .resolver
            .resolve_many_with_progress(&batch, ResolveOptions::default(), |progress| {
                seen.push((progress.index, progress.total, progress.url.to_owned()));
            })
            .await;

        let order: Vec<_> = results.iter().map(|result| result.url().to_owned()).collect();
        assert_eq!(order, batch);
        assert!(results[0].is_success());
        assert_eq!(results[1].error(), Some("nope"));
        assert!(results[2].is_success());
        assert_eq!(
            seen,
            vec![
                (0, 3, "at://one.test".to_owned()),
                (1, 3, "at://two.test".to_owned()),
                (2, 3, "at://three.test".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn batch_of_nothing_is_empty() {
        let h = harness(MockAtpiClient::new());
        assert!(h.resolver.resolve_many(&[], ResolveOptions::default()).await.is_empty());
        assert_eq!(h.client.calls(), 0);
    }

    #[test]
    fn validate_checks_scheme_and_emptiness() {
        let h = harness(MockAtpiClient::new());
        assert!(h.resolver.validate("at://did:plc:example").is_ok());

        let err = h.resolver.validate("https://example.com").expect_err("wrong scheme");
        assert_eq!(err.to_string(), "URL must start with at://");

        assert_eq!(h.resolver.validate("at://"), Err(UrlValidationError::Empty));
    }

    #[tokio::test]
    async fn collections_come_from_repo_info_with_short_timeout() {
        let h = harness(MockAtpiClient::new().with_fixture(
            "at://alice.test",
            json!({"repoInfo": {"collections": ["app.bsky.feed.post", "app.bsky.graph.follow"]}}),
        ));

        let collections = h.resolver.get_collections("alice.test").await;

        assert_eq!(collections, vec!["app.bsky.feed.post", "app.bsky.graph.follow"]);
        let (_, request) = h.client.requests().pop().expect("one request");
        assert_eq!(request.timeout_ms, COMPLETION_TIMEOUT_MS);
    }

    #[tokio::test]
    async fn collections_are_empty_on_failure_or_missing_shape() {
        let h = harness(
            MockAtpiClient::new()
                .with_failure("at://down.test", "offline")
                .with_fixture("at://bare.test", json!({"did": "did:plc:bare"})),
        );

        assert!(h.resolver.get_collections("down.test").await.is_empty());
        assert!(h.resolver.get_collections("bare.test").await.is_empty());
    }

    #[tokio::test]
    async fn completion_cache_is_opt_in_and_expires() {
        let mut config = AtpiConfig::default();
        config.cache.enabled = false;
        config.cache.completion_cache_enabled = true;
        let h = harness_with_config(
            MockAtpiClient::new().with_fixture(
                "at://alice.test",
                json!({"repoInfo": {"collections": ["app.bsky.feed.post"]}}),
            ),
            config,
        );

        h.resolver.get_collections("alice.test").await;
        h.resolver.get_collections("alice.test").await;
        assert_eq!(h.client.calls(), 1);

        h.clock.advance(COLLECTIONS_TTL_MS);
        h.resolver.get_collections("alice.test").await;
        assert_eq!(h.client.calls(), 2);

        h.resolver.clear_completion_caches();
        h.resolver.get_collections("alice.test").await;
        assert_eq!(h.client.calls(), 3);
    }

    #[tokio::test]
    async fn records_keep_last_uri_segment_and_honor_limit() {
        let mut config = AtpiConfig::default();
        config.cache.enabled = false;
        config.cache.completion_cache_enabled = true;
        let h = harness_with_config(
            MockAtpiClient::new().with_fixture(
                "at://alice.test/app.bsky.feed.post",
                json!({"records": [
                    {"uri": "at://did:plc:alice/app.bsky.feed.post/3k1"},
                    {"uri": "at://did:plc:alice/app.bsky.feed.post/3k2"},
                    {"cid": "no-uri"},
                    {"uri": "at://did:plc:alice/app.bsky.feed.post/3k3"}
                ]}),
            ),
            config,
        );

        let first = h.resolver.get_records("alice.test", "app.bsky.feed.post", 2).await;
        assert_eq!(first, vec!["3k1", "3k2"]);

        let cached = h
            .resolver
            .get_records("alice.test", "app.bsky.feed.post", DEFAULT_RECORD_LIMIT)
            .await;
        assert_eq!(cached, vec!["3k1", "3k2", "3k3"]);
        assert_eq!(h.client.calls(), 1);

        h.clock.advance(RECORDS_TTL_MS);
        h.resolver.get_records("alice.test", "app.bsky.feed.post", 2).await;
        assert_eq!(h.client.calls(), 2);
    }

    #[tokio::test]
    async fn clear_all_caches_also_drops_resolutions() {
        let h = harness(MockAtpiClient::new().with_fixture("at://alice.test", json!(1)));
        h.resolver.resolve("at://alice.test", ResolveOptions::quiet()).await;
        assert_eq!(h.resolver.cache().len(), 1);

        h.resolver.clear_completion_caches();
        assert_eq!(h.resolver.cache().len(), 1);

        h.resolver.clear_all_caches();
        assert!(h.resolver.cache().is_empty());
    }
}
