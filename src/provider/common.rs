//! # Common Provider Utilities
//!
//! HTTP plumbing shared by the REST backends: authentication headers,
//! rate-limit bookkeeping, status classification and metrics.

use crate::config::{BootstrapConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::observability::metrics;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// How the token is presented to the API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>` (GitHub)
    Bearer,
    /// `PRIVATE-TOKEN: <token>` (GitLab)
    PrivateToken,
    /// `Authorization: token <token>` (Gitea)
    Token,
}

/// Last rate-limit information reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Time left until the window resets, when the budget is exhausted
    #[must_use]
    pub fn exhausted_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.remaining != Some(0) {
            return None;
        }
        let reset_at = self.reset_at?;
        (reset_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    fn update(&mut self, headers: &HeaderMap) {
        if let Some(remaining) = header_u64(headers, &["x-ratelimit-remaining", "ratelimit-remaining"])
        {
            self.remaining = Some(remaining);
        }
        if let Some(reset) = header_u64(headers, &["x-ratelimit-reset", "ratelimit-reset"]) {
            self.reset_at = i64::try_from(reset)
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
        }
    }
}

/// Pages followed by [`ProviderHandle::send_json_paged`] before giving up
const MAX_PAGES: usize = 50;

/// Authenticated HTTP client for one provider, owned by one run
pub struct ProviderHandle {
    kind: ProviderKind,
    http_client: Client,
    base_url: String,
    token: Zeroizing<String>,
    auth: AuthScheme,
    rate_limit: Mutex<RateLimitState>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl ProviderHandle {
    pub fn new(
        kind: ProviderKind,
        base_url: &str,
        token: Zeroizing<String>,
        auth: AuthScheme,
        config: &BootstrapConfig,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(concat!("gitops-bootstrap/", env!("CARGO_PKG_VERSION")))
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            kind,
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            auth,
            rate_limit: Mutex::new(RateLimitState::default()),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn rate_limit(&self) -> RateLimitState {
        self.rate_limit
            .lock()
            .map(|state| *state)
            .unwrap_or_default()
    }

    /// Build a request with authentication headers
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        };

        let request = self
            .http_client
            .request(method, url)
            .header("Accept", "application/json");

        match self.auth {
            AuthScheme::Bearer => request.bearer_auth(self.token.as_str()),
            AuthScheme::PrivateToken => request.header("PRIVATE-TOKEN", self.token.as_str()),
            AuthScheme::Token => {
                request.header("Authorization", format!("token {}", self.token.as_str()))
            }
        }
    }

    /// Send a request, returning the response only on success
    ///
    /// Refuses to send while the rate-limit budget is exhausted and classifies
    /// every non-success status into an [`Error`].
    pub async fn send(&self, operation: &'static str, builder: RequestBuilder) -> Result<Response> {
        match self.try_send(operation, builder).await? {
            Ok(response) => Ok(response),
            Err((status, headers, body)) => Err(self.classify(status, &headers, &body)),
        }
    }

    /// Like [`send`](Self::send) but maps `404 Not Found` to `None`
    pub async fn send_optional(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Option<Response>> {
        match self.try_send(operation, builder).await? {
            Ok(response) => Ok(Some(response)),
            Err((StatusCode::NOT_FOUND, _, _)) => Ok(None),
            Err((status, headers, body)) => Err(self.classify(status, &headers, &body)),
        }
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(operation, builder).await?;
        decode(operation, response).await
    }

    pub async fn send_optional_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Option<T>> {
        match self.send_optional(operation, builder).await? {
            Some(response) => decode(operation, response).await.map(Some),
            None => Ok(None),
        }
    }

    /// GET every page of a list endpoint, starting at `first`
    ///
    /// Follows `Link: <..>; rel="next"` (GitHub, Gitea) or `X-Next-Page`
    /// (GitLab). `build` turns a page path or absolute URL into a request.
    pub async fn send_json_paged<T, F>(
        &self,
        operation: &'static str,
        first: &str,
        build: F,
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> RequestBuilder,
    {
        let mut items = Vec::new();
        let mut next = Some(first.to_string());
        let mut pages = 0usize;

        while let Some(page) = next.take() {
            if pages == MAX_PAGES {
                warn!(operation, pages, "Stopped following pagination links");
                break;
            }
            pages += 1;
            let response = self.send(operation, build(&page)).await?;
            next = next_page(&page, response.headers());
            let batch: Vec<T> = decode(operation, response).await?;
            items.extend(batch);
        }

        Ok(items)
    }

    async fn try_send(
        &self,
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<std::result::Result<Response, (StatusCode, HeaderMap, String)>> {
        if let Some(wait) = self.rate_limit().exhausted_for(Utc::now()) {
            return Err(Error::Transient {
                message: format!("{} rate limit exhausted", self.kind),
                retry_after: Some(wait),
            });
        }

        let request = builder.build()?;
        let method = request.method().clone();
        let provider = self.kind.as_str();

        debug!(provider, operation, %method, url = %request.url(), "Sending provider request");
        let start = Instant::now();
        let response = match self.http_client.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                metrics::increment_provider_operation_errors(provider);
                return Err(e.into());
            }
        };
        metrics::record_provider_operation(provider, operation, start.elapsed().as_secs_f64());

        if let Ok(mut state) = self.rate_limit.lock() {
            state.update(response.headers());
        }

        let status = response.status();
        if status.is_success() {
            if method != Method::GET {
                metrics::increment_provider_mutations(provider, operation);
            }
            return Ok(Ok(response));
        }

        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        if status != StatusCode::NOT_FOUND {
            metrics::increment_provider_operation_errors(provider);
            warn!(provider, operation, status = status.as_u16(), "Provider request failed");
        }
        Ok(Err((status, headers, body)))
    }

    /// Map a failed response to a classified error
    fn classify(&self, status: StatusCode, headers: &HeaderMap, body: &str) -> Error {
        let message = error_message(body);
        let target = self.kind.as_str();
        let retry_after = retry_after(headers)
            .or_else(|| self.rate_limit().exhausted_for(Utc::now()));

        match status.as_u16() {
            401 => Error::auth(target, message),
            403 if retry_after.is_some() || message.to_lowercase().contains("rate limit") => {
                Error::Transient {
                    message: format!("{target} rate limited: {message}"),
                    retry_after,
                }
            }
            403 => Error::auth(target, message),
            409 => Error::Conflict(format!("{target}: {message}")),
            422 if mentions_limit(&message) => Error::Quota(format!("{target}: {message}")),
            422 => Error::Conflict(format!("{target}: {message}")),
            429 | 500..=599 => Error::Transient {
                message: format!("{target} returned {}: {message}", status.as_u16()),
                retry_after,
            },
            404 => Error::Internal(anyhow::anyhow!(
                "{target} resource not found (HTTP 404): {message}"
            )),
            code => Error::Internal(anyhow::anyhow!("{target} returned HTTP {code}: {message}")),
        }
    }
}

async fn decode<T: DeserializeOwned>(operation: &'static str, response: Response) -> Result<T> {
    response.json::<T>().await.map_err(|e| {
        Error::Internal(anyhow::anyhow!(
            "Failed to parse {operation} response: {e}"
        ))
    })
}

/// Pull a human-readable message out of a provider error body
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let message = value
        .get("message")
        .or_else(|| value.get("error"))
        .map(|m| match m {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| body.trim().to_string());

    // GitHub puts the useful detail for 422s in `errors[].message`
    let details: Vec<&str> = value
        .get("errors")
        .and_then(|e| e.as_array())
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if details.is_empty() {
        message
    } else {
        format!("{message} ({})", details.join("; "))
    }
}

fn mentions_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("limit") || lower.contains("quota") || lower.contains("too many")
}

/// Location of the page after `current`, if the response announces one
fn next_page(current: &str, headers: &HeaderMap) -> Option<String> {
    let linked = headers
        .get("link")
        .and_then(|v| v.to_str().ok())
        .and_then(|link| {
            link.split(',').find_map(|entry| {
                let (target, params) = entry.split_once(';')?;
                params
                    .split(';')
                    .any(|p| p.trim() == r#"rel="next""#)
                    .then(|| target.trim().trim_matches(['<', '>']).to_string())
            })
        });
    if linked.is_some() {
        return linked;
    }

    let page = headers
        .get("x-next-page")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|p| !p.is_empty())?;
    let (base, query) = current.split_once('?').unwrap_or((current, ""));
    let mut params: Vec<String> = query
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("page="))
        .map(str::to_string)
        .collect();
    params.push(format!("page={page}"));
    Some(format!("{base}?{}", params.join("&")))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_u64(headers, &["retry-after"]).map(Duration::from_secs)
}

fn header_u64(headers: &HeaderMap, names: &[&str]) -> Option<u64> {
    names.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

/// Percent-encode a single path segment (GitLab project ids, file paths)
#[must_use]
pub fn encode_segment(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// Decode base64 file content as returned by contents APIs (may contain newlines)
pub fn decode_content(encoded: &str) -> Result<String> {
    use base64::{engine::general_purpose, Engine as _};

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| Error::Internal(anyhow::anyhow!("Invalid base64 file content: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| Error::Internal(anyhow::anyhow!("File content is not UTF-8: {e}")))
}
