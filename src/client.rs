//! API Client Module
//!
//! Handles HTTP communication with the SentIO API and classifies every
//! failure into an [`ApiError`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ApiError;

/// HTTP verbs used by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// Description of one API call
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Whether a bearer token must be attached
    pub authorized: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            authorized: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Mark the call as public (no token attached or required)
    pub fn public(mut self) -> Self {
        self.authorized = false;
        self
    }

    /// Attach a JSON body
    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::invalid(None, format!("Serialization error: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }
}

/// Raw request handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<serde_json::Value>,
}

/// Raw response from a [`Transport`]
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Wire-level seam under the client.
///
/// Implementations only move bytes; a transport failure must come back
/// as [`ApiError::Unavailable`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError>;
}

/// Transport backed by `reqwest`
pub struct ReqwestTransport {
    base_url: String,
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let url = format!("{}{}", self.base_url, request.path);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        if let Some(token) = &request.bearer {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::unavailable(format!("Network error: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::unavailable(format!("Network error: {}", e)))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Bounded retry for transient failures.
///
/// Only [`ApiError::Unavailable`] is retried; backoff doubles per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
        }
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    let delay = self.backoff(retry);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what,
                        e,
                        retry + 1,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(500),
        }
    }
}

/// Resource client for the SentIO API
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Create a client talking HTTP to the configured API
    pub fn new(config: &Config) -> Self {
        let transport = ReqwestTransport::new(&config.api_base_url, config.http_timeout);
        Self::with_transport(Arc::new(transport), config.retry)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Issue a single request and decode a typed result.
    ///
    /// An authorized spec without a token fails with `Unauthenticated`
    /// before anything touches the network.
    pub async fn request<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let bearer = match (spec.authorized, token) {
            (true, None) => {
                debug!("{} {} skipped: no token", spec.method, spec.path);
                return Err(ApiError::Unauthenticated);
            }
            (true, Some(token)) => Some(token.to_string()),
            (false, _) => None,
        };

        let response = self
            .transport
            .send(HttpRequest {
                method: spec.method,
                path: spec.path.clone(),
                bearer,
                body: spec.body.clone(),
            })
            .await?;

        debug!("{} {} -> {}", spec.method, spec.path, response.status);

        if !response.is_success() {
            let message = serde_json::from_slice::<ErrorResponse>(&response.body)
                .ok()
                .and_then(ErrorResponse::into_message);
            return Err(ApiError::from_status(response.status, message));
        }

        let body: &[u8] = if response.body.is_empty() {
            b"null"
        } else {
            &response.body
        };

        serde_json::from_slice(body).map_err(|e| {
            ApiError::invalid(Some(response.status), format!("Parse error: {}", e))
        })
    }

    /// Same as [`ApiClient::request`], retried per the client's policy
    pub async fn request_with_retry<T: DeserializeOwned>(
        &self,
        spec: &RequestSpec,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let what = format!("{} {}", spec.method, spec.path);
        self.retry
            .run(&what, || self.request::<T>(spec, token))
            .await
    }
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: Option<String>,
    message: Option<String>,
}

impl ErrorResponse {
    /// `message` is the human-readable text when the server sends both
    fn into_message(self) -> Option<String> {
        self.message.or(self.error)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::FakeTransport;

    fn client(fake: &Arc<FakeTransport>, retry: RetryPolicy) -> ApiClient {
        ApiClient::with_transport(fake.clone(), retry)
    }

    #[derive(Debug, Deserialize)]
    struct Token {
        token: String,
    }

    #[tokio::test]
    async fn authorized_request_without_token_never_hits_network() {
        let fake = FakeTransport::new();
        let api = client(&fake, RetryPolicy::none());

        let result = api
            .request::<serde_json::Value>(&RequestSpec::get("/api/users/me"), None)
            .await;

        assert_eq!(result.unwrap_err(), ApiError::Unauthenticated);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn attaches_bearer_and_decodes() {
        let fake = FakeTransport::new();
        fake.set(Method::Post, "/api/auth/signin", 200, json!({ "token": "abc" }));
        let api = client(&fake, RetryPolicy::none());

        let spec = RequestSpec::post("/api/auth/signin")
            .public()
            .json(&json!({ "email": "a@b.co" }))
            .unwrap();
        let token: Token = api.request(&spec, Some("ignored")).await.unwrap();

        assert_eq!(token.token, "abc");
        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bearer, None);
        assert_eq!(calls[0].body, Some(json!({ "email": "a@b.co" })));
    }

    #[tokio::test]
    async fn maps_error_body_into_invalid() {
        let fake = FakeTransport::new();
        fake.set(
            Method::Get,
            "/api/workspaces/9",
            404,
            json!({ "error": "Workspace not found" }),
        );
        let api = client(&fake, RetryPolicy::none());

        let err = api
            .request::<serde_json::Value>(&RequestSpec::get("/api/workspaces/9"), Some("t"))
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::invalid(Some(404), "Workspace not found"));
        assert_eq!(fake.calls()[0].bearer.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn error_body_prefers_message_over_code() {
        let fake = FakeTransport::new();
        fake.set(
            Method::Post,
            "/api/auth/signin",
            403,
            json!({ "error": "ACCOUNT_NOT_VALIDATED", "message": "Please validate your account" }),
        );
        fake.set(Method::Post, "/api/auth/signup", 409, json!({ "error": "Email already used" }));
        let api = client(&fake, RetryPolicy::none());

        let err = api
            .request::<serde_json::Value>(&RequestSpec::post("/api/auth/signin").public(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::invalid(Some(403), "Please validate your account"));

        let err = api
            .request::<serde_json::Value>(&RequestSpec::post("/api/auth/signup").public(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::invalid(Some(409), "Email already used"));
    }

    #[tokio::test]
    async fn undecodable_success_body_is_invalid() {
        let fake = FakeTransport::new();
        fake.set(Method::Get, "/api/users/me", 200, json!({ "unexpected": true }));
        let api = client(&fake, RetryPolicy::none());

        let err = api
            .request::<Token>(&RequestSpec::get("/api/users/me"), Some("t"))
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::Invalid { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn empty_body_decodes_as_acknowledgement() {
        let fake = FakeTransport::new();
        fake.push_raw(
            Method::Delete,
            "/api/workspaces/3",
            HttpResponse {
                status: 204,
                body: Vec::new(),
            },
        );
        let api = client(&fake, RetryPolicy::none());

        let ack = api
            .request::<serde::de::IgnoredAny>(&RequestSpec::delete("/api/workspaces/3"), Some("t"))
            .await;
        assert!(ack.is_ok());
    }

    #[tokio::test]
    async fn retries_only_unavailable() {
        let fake = FakeTransport::new();
        fake.push(Method::Get, "/api/workspaces", 503, json!({}));
        fake.push(Method::Get, "/api/workspaces", 502, json!({}));
        fake.set(Method::Get, "/api/workspaces", 200, json!([]));
        let retry = RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::ZERO,
        };
        let api = client(&fake, retry);

        let list: Vec<serde_json::Value> = api
            .request_with_retry(&RequestSpec::get("/api/workspaces"), Some("t"))
            .await
            .unwrap();
        assert!(list.is_empty());
        assert_eq!(fake.call_count(Method::Get, "/api/workspaces"), 3);

        fake.set(Method::Get, "/api/users/me", 401, json!({}));
        let err = api
            .request_with_retry::<serde_json::Value>(&RequestSpec::get("/api/users/me"), Some("t"))
            .await
            .unwrap_err();
        assert_eq!(err, ApiError::Unauthenticated);
        assert_eq!(fake.call_count(Method::Get, "/api/users/me"), 1);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let fake = FakeTransport::new();
        fake.fail(Method::Get, "/api/workspaces", "connection refused");
        let retry = RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::ZERO,
        };
        let api = client(&fake, retry);

        let err = api
            .request_with_retry::<serde_json::Value>(&RequestSpec::get("/api/workspaces"), Some("t"))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(fake.call_count(Method::Get, "/api/workspaces"), 3);
    }

    #[test]
    fn backoff_doubles() {
        let retry = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(400));
    }
}
