use std::time::Duration;

use async_trait::async_trait;
use atpi_core::{AT_SCHEME, AtUrl, ResolutionMode};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{AtpiClient, ClientError, ClientRequest};

pub const DEFAULT_HANDLE_RESOLVER: &str = "https://public.api.bsky.app";
pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";
const PDS_SERVICE_ID: &str = "#atproto_pds";
const LIST_RECORDS_LIMIT: &str = "100";

/// Resolves AT URLs over HTTP, either straight against the owning PDS or
/// through a hosted resolution service.
#[derive(Debug, Clone)]
pub struct HttpAtpiClient {
    client: reqwest::Client,
    handle_resolver: String,
    plc_directory: String,
}

impl Default for HttpAtpiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAtpiClient {
    pub fn new() -> Self {
        Self::with_endpoints(DEFAULT_HANDLE_RESOLVER, DEFAULT_PLC_DIRECTORY)
    }

    pub fn with_endpoints(handle_resolver: &str, plc_directory: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            handle_resolver: handle_resolver.trim_end_matches('/').to_owned(),
            plc_directory: plc_directory.trim_end_matches('/').to_owned(),
        }
    }

    async fn resolve_local(&self, url: &str, timeout: Duration) -> Result<Value, ClientError> {
        let parsed = AtUrl::parse(url).ok_or_else(|| ClientError::InvalidUrl(url.to_owned()))?;

        let did = if parsed.is_did() {
            parsed.identity.clone()
        } else {
            self.resolve_handle(&parsed.identity, timeout).await?
        };
        let pds = self.resolve_pds(&did, timeout).await?;
        tracing::debug!(url, did = %did, pds = %pds, "resolved repository host");

        match (&parsed.collection, &parsed.rkey) {
            (None, _) => {
                let repo_info = self
                    .get_json(
                        &format!("{pds}/xrpc/com.atproto.repo.describeRepo"),
                        &[("repo", did.as_str())],
                        timeout,
                    )
                    .await?;
                let handle = repo_info
                    .get("handle")
                    .cloned()
                    .unwrap_or_else(|| Value::String(parsed.identity.clone()));
                Ok(json!({
                    "did": did,
                    "handle": handle,
                    "pds": pds,
                    "repoInfo": repo_info,
                }))
            }
            (Some(collection), None) => {
                self.get_json(
                    &format!("{pds}/xrpc/com.atproto.repo.listRecords"),
                    &[
                        ("repo", did.as_str()),
                        ("collection", collection.as_str()),
                        ("limit", LIST_RECORDS_LIMIT),
                    ],
                    timeout,
                )
                .await
            }
            (Some(collection), Some(rkey)) => {
                self.get_json(
                    &format!("{pds}/xrpc/com.atproto.repo.getRecord"),
                    &[
                        ("repo", did.as_str()),
                        ("collection", collection.as_str()),
                        ("rkey", rkey.as_str()),
                    ],
                    timeout,
                )
                .await
            }
        }
    }

    async fn resolve_remote(
        &self,
        url: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let endpoint = remote_endpoint(base_url, url);
        tracing::debug!(url, endpoint = %endpoint, "resolving through remote service");
        self.get_json(&endpoint, &[], timeout).await
    }

    async fn resolve_handle(&self, handle: &str, timeout: Duration) -> Result<String, ClientError> {
        let response: ResolveHandleResponse = serde_json::from_value(
            self.get_json(
                &format!(
                    "{}/xrpc/com.atproto.identity.resolveHandle",
                    self.handle_resolver
                ),
                &[("handle", handle)],
                timeout,
            )
            .await?,
        )?;

        if response.did.is_empty() {
            return Err(ClientError::NotFound(format!(
                "handle {handle} did not resolve to a DID"
            )));
        }
        Ok(response.did)
    }

    async fn resolve_pds(&self, did: &str, timeout: Duration) -> Result<String, ClientError> {
        let document_url = did_document_url(&self.plc_directory, did)?;
        let document = self.get_json(&document_url, &[], timeout).await?;
        pds_endpoint(&document)
            .ok_or_else(|| ClientError::NotFound(format!("no PDS service listed for {did}")))
    }

    async fn get_json(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let value = self
            .client
            .get(endpoint)
            .query(query)
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl AtpiClient for HttpAtpiClient {
    async fn resolve(&self, url: &str, request: &ClientRequest) -> Result<Value, ClientError> {
        let timeout = Duration::from_millis(request.timeout_ms);
        let resolution = async {
            match request.mode {
                ResolutionMode::Local => self.resolve_local(url, timeout).await,
                ResolutionMode::Remote => {
                    self.resolve_remote(url, &request.base_url, timeout).await
                }
                ResolutionMode::Auto => match self.resolve_local(url, timeout).await {
                    Ok(value) => Ok(value),
                    Err(local) if request.fallback_to_remote => {
                        tracing::debug!(url, error = %local, "local resolution failed, trying remote");
                        self.resolve_remote(url, &request.base_url, timeout)
                            .await
                            .map_err(|remote| ClientError::Fallback {
                                local: Box::new(local),
                                remote: Box::new(remote),
                            })
                    }
                    Err(local) => Err(local),
                },
            }
        };

        tokio::time::timeout(timeout, resolution)
            .await
            .map_err(|_| ClientError::Timeout(request.timeout_ms))?
    }
}

#[derive(Debug, Deserialize)]
struct ResolveHandleResponse {
    #[serde(default)]
    did: String,
}

/// `{base}/{identity}/{collection}/{rkey}` for the hosted service.
pub(crate) fn remote_endpoint(base_url: &str, url: &str) -> String {
    let path = url.strip_prefix(AT_SCHEME).unwrap_or(url);
    format!("{}/{path}", base_url.trim_end_matches('/'))
}

/// Location of the DID document: the PLC directory for `did:plc`, the
/// well-known path on the host for `did:web`.
pub(crate) fn did_document_url(plc_directory: &str, did: &str) -> Result<String, ClientError> {
    if did.starts_with("did:plc:") {
        return Ok(format!("{plc_directory}/{did}"));
    }

    if let Some(host) = did.strip_prefix("did:web:") {
        if host.is_empty() {
            return Err(ClientError::InvalidUrl(did.to_owned()));
        }
        let host = host.replace("%3A", ":").replace("%3a", ":");
        return Ok(format!("https://{host}/.well-known/did.json"));
    }

    Err(ClientError::InvalidUrl(format!("unsupported DID method: {did}")))
}

pub(crate) fn pds_endpoint(document: &Value) -> Option<String> {
    document
        .get("service")?
        .as_array()?
        .iter()
        .find(|service| {
            service
                .get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| id == PDS_SERVICE_ID || id.ends_with(PDS_SERVICE_ID))
        })?
        .get("serviceEndpoint")?
        .as_str()
        .map(|endpoint| endpoint.trim_end_matches('/').to_owned())
}
