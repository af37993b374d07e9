//! Remote-call dispatcher for the auth server.
//!
//! Every request to the auth server goes through [`RemoteDispatcher::call`],
//! which resolves the operation in the static table, sends the request, and
//! decodes the 200 body per the table's response format.
//!
//! # Retry layers
//!
//! Two independent layers wrap each call:
//!
//! 1. Transport backoff: connection and request-level failures are retried
//!    with exponential backoff, bounded by a number of tries and a wall-clock
//!    ceiling. Timeouts are not retried.
//! 2. Status retries: the auth server's retriable statuses (`484` invalid
//!    service token, `503` unavailable) are retried a bounded number of times.
//!    A `484` first forces a service-token renewal and rewrites the
//!    operation's service-token parameter with the fresh credential; any other
//!    retriable status pauses briefly.
//!
//! Exhausted retries and non-retriable `5xx` answers become
//! [`GatewayError::DependencyFailure`]. Other non-200 answers become
//! [`GatewayError::Rejected`], which callers treat as "no result".

use crate::config::GatewayConfig;
use crate::error::{DependencyFailure, GatewayError, Result};
use crate::jwt::JwtCodec;
use crate::operations::{HttpMethod, Operation, ResponseFormat};
use crate::secret::{truncate_body, ExposeSecret, SecretString};
use crate::service_token::{ClientCredentials, ServiceToken, ServiceTokenManager, TokenIssuer};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

// =============================================================================
// Constants
// =============================================================================

/// Status the auth server uses for an invalid or expired service token.
pub const INVALID_SERVICE_TOKEN_STATUS: u16 = 484;

/// Statuses retried by the status loop.
pub const RETRIABLE_STATUSES: [u16; 2] = [INVALID_SERVICE_TOKEN_STATUS, 503];

/// Default retries after a retriable status.
pub const DEFAULT_MAX_STATUS_RETRIES: u32 = 3;

/// Default pause before retrying a retriable status other than `484`.
pub const DEFAULT_STATUS_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Default total transport attempts, including the first.
pub const DEFAULT_MAX_TRANSPORT_TRIES: u32 = 4;

/// Default first transport backoff delay; doubles on every retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default wall-clock ceiling for the transport backoff.
pub const DEFAULT_MAX_BACKOFF_TIME: Duration = Duration::from_secs(5);

// =============================================================================
// Retry Policy
// =============================================================================

/// Retry limits for both retry layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_status_retries: u32,
    pub status_retry_pause: Duration,
    pub max_transport_tries: u32,
    pub initial_backoff: Duration,
    pub max_backoff_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_status_retries: DEFAULT_MAX_STATUS_RETRIES,
            status_retry_pause: DEFAULT_STATUS_RETRY_PAUSE,
            max_transport_tries: DEFAULT_MAX_TRANSPORT_TRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff_time: DEFAULT_MAX_BACKOFF_TIME,
        }
    }
}

impl RetryPolicy {
    /// Override the status retry count and pause.
    #[must_use]
    pub fn with_status_retries(mut self, max_retries: u32, pause: Duration) -> Self {
        self.max_status_retries = max_retries;
        self.status_retry_pause = pause;
        self
    }

    /// Override the transport backoff.
    #[must_use]
    pub fn with_transport_backoff(
        mut self,
        max_tries: u32,
        initial_backoff: Duration,
        max_time: Duration,
    ) -> Self {
        self.max_transport_tries = max_tries;
        self.initial_backoff = initial_backoff;
        self.max_backoff_time = max_time;
        self
    }
}

/// Claims of a `get_service_token` response.
#[derive(Deserialize)]
struct ServiceTokenGrant {
    service_token: String,
    exp: i64,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// HTTP client for the auth server's operation table.
#[derive(Debug)]
pub struct RemoteDispatcher {
    http: Client,
    server: Option<String>,
    codec: Option<JwtCodec>,
    tokens: Arc<ServiceTokenManager>,
    policy: RetryPolicy,
}

impl RemoteDispatcher {
    /// Create a dispatcher using the configured server and timeouts.
    ///
    /// `codec` decodes JWT responses; without it, JWT operations fail with a
    /// configuration error.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(
        config: &GatewayConfig,
        codec: Option<JwtCodec>,
        tokens: Arc<ServiceTokenManager>,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                error!(target: "auth_gateway.dispatcher", error = %e, "Failed to build HTTP client");
                GatewayError::Configuration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            server: config
                .server
                .as_ref()
                .map(|server| server.trim_end_matches('/').to_string()),
            codec,
            tokens,
            policy: RetryPolicy::default(),
        })
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<ServiceTokenManager> {
        &self.tokens
    }

    /// Current service token, renewed first if missing or about to expire.
    ///
    /// # Errors
    ///
    /// See [`ServiceTokenManager::get_token`].
    pub async fn service_token(&self) -> Result<SecretString> {
        self.tokens.get_token(self).await
    }

    /// Call a remote operation.
    ///
    /// `params` is sent as a JSON body (POST) or query string (GET).
    ///
    /// # Errors
    ///
    /// - `GatewayError::Configuration` - no server (or no codec for a JWT
    ///   operation) configured
    /// - `GatewayError::Unreachable` / `Transport` - transport failure after
    ///   backoff
    /// - `GatewayError::Timeout` - the request timed out
    /// - `GatewayError::DependencyFailure` - retries exhausted, non-retriable
    ///   server error, or unexpected failure while handling an error status
    /// - `GatewayError::Rejected` - any other non-200 status
    /// - `GatewayError::InvalidResponse` - 200 body could not be decoded
    #[instrument(skip_all, fields(operation = %op))]
    pub async fn call(&self, op: Operation, params: &Value, headers: &HeaderMap) -> Result<Value> {
        let server = self.server.as_deref().ok_or_else(|| {
            GatewayError::Configuration("Auth server is not configured".to_string())
        })?;
        let url = format!("{server}/{}", op.name());
        let entry = op.entry();
        let mut params = params.clone();
        let mut retries: u32 = 0;

        loop {
            let response = self
                .send_with_backoff(&url, entry.method, &params, headers)
                .await?;
            let status = response.status().as_u16();

            if status == 200 {
                return self.decode_body(entry.format, response).await;
            }

            let text = match response.text().await {
                Ok(body) => truncate_body(&body),
                Err(e) => {
                    warn!(
                        target: "auth_gateway.dispatcher",
                        status = status,
                        error = %e,
                        "Failed to read auth server error body"
                    );
                    String::new()
                }
            };

            if RETRIABLE_STATUSES.contains(&status) {
                if retries >= self.policy.max_status_retries {
                    warn!(
                        target: "auth_gateway.dispatcher",
                        status = status,
                        retries = retries,
                        body = %text,
                        "Auth server error, retries exhausted"
                    );
                    return Err(GatewayError::DependencyFailure(
                        DependencyFailure::retries_exhausted(retries, status, text),
                    ));
                }

                warn!(
                    target: "auth_gateway.dispatcher",
                    status = status,
                    retries = retries,
                    body = %text,
                    "Auth server error, retrying"
                );

                // get_service_token carries no service token to refresh
                if status == INVALID_SERVICE_TOKEN_STATUS && op != Operation::GetServiceToken {
                    self.refresh_service_token_param(entry.service_token_field, &mut params)
                        .await?;
                } else {
                    tokio::time::sleep(self.policy.status_retry_pause).await;
                }

                retries += 1;
                continue;
            }

            if status >= 500 {
                warn!(
                    target: "auth_gateway.dispatcher",
                    status = status,
                    body = %text,
                    "Unhandled auth server error"
                );
                return Err(GatewayError::DependencyFailure(
                    DependencyFailure::server_error(retries, status, text),
                ));
            }

            debug!(
                target: "auth_gateway.dispatcher",
                status = status,
                body = %text,
                "Auth server rejected request"
            );
            return Err(GatewayError::Rejected { status, text });
        }
    }

    /// Force a renewal and write the fresh token into `field`, if present.
    async fn refresh_service_token_param(
        &self,
        field: Option<&'static str>,
        params: &mut Value,
    ) -> Result<()> {
        let stale = field
            .and_then(|field| params.get(field))
            .and_then(Value::as_str)
            .map(str::to_string);

        let fresh = self
            .tokens
            .force_renew(self, stale.as_deref())
            .await
            .map_err(|e| {
                error!(
                    target: "auth_gateway.dispatcher",
                    error = %e,
                    "Unhandled error refreshing service token"
                );
                GatewayError::DependencyFailure(DependencyFailure::unexpected())
            })?;

        if let (Some(field), Some(map)) = (field, params.as_object_mut()) {
            if let Some(slot) = map.get_mut(field) {
                *slot = Value::String(fresh.expose_secret().to_string());
            }
        }
        Ok(())
    }

    /// Send once, retrying transport failures with exponential backoff.
    async fn send_with_backoff(
        &self,
        url: &str,
        method: HttpMethod,
        params: &Value,
        headers: &HeaderMap,
    ) -> Result<reqwest::Response> {
        let started = tokio::time::Instant::now();
        let mut delay = self.policy.initial_backoff;
        let mut attempt: u32 = 1;

        loop {
            let err = match self.send(url, method, params, headers).await {
                Ok(response) => return Ok(response),
                Err(e) => GatewayError::from(e),
            };

            // Builder errors map to InvalidRequest and are never retried
            let retriable = matches!(
                err,
                GatewayError::Unreachable(_) | GatewayError::Transport(_)
            );
            let out_of_time = started.elapsed() + delay > self.policy.max_backoff_time;
            if !retriable || attempt >= self.policy.max_transport_tries || out_of_time {
                warn!(
                    target: "auth_gateway.dispatcher",
                    error = %err,
                    attempts = attempt,
                    "Auth server request failed"
                );
                return Err(err);
            }

            debug!(
                target: "auth_gateway.dispatcher",
                error = %err,
                attempt = attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Auth server request failed, backing off"
            );
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    async fn send(
        &self,
        url: &str,
        method: HttpMethod,
        params: &Value,
        headers: &HeaderMap,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let request = match method {
            HttpMethod::Get => {
                debug!(target: "auth_gateway.dispatcher", url = %url, "GET");
                self.http.get(url).query(params)
            }
            HttpMethod::Post => {
                debug!(target: "auth_gateway.dispatcher", url = %url, "POST");
                self.http.post(url).json(params)
            }
        };
        request.headers(headers.clone()).send().await
    }

    async fn decode_body(
        &self,
        format: ResponseFormat,
        response: reqwest::Response,
    ) -> Result<Value> {
        match format {
            ResponseFormat::Jwt => {
                let codec = self.codec.as_ref().ok_or_else(|| {
                    GatewayError::Configuration("JWT secret is not configured".to_string())
                })?;
                let text = response.text().await?;
                codec.decode::<Value>(text.trim()).map_err(|e| {
                    warn!(target: "auth_gateway.dispatcher", error = %e, "Failed to decode JWT response");
                    GatewayError::InvalidResponse("Auth server returned an invalid JWT".to_string())
                })
            }
            ResponseFormat::Json => response.json::<Value>().await.map_err(|e| {
                warn!(target: "auth_gateway.dispatcher", error = %e, "Failed to parse JSON response");
                GatewayError::InvalidResponse("Auth server returned invalid JSON".to_string())
            }),
            ResponseFormat::Text => Ok(Value::String(response.text().await?)),
        }
    }
}

#[async_trait]
impl TokenIssuer for RemoteDispatcher {
    async fn issue_service_token(&self, credentials: &ClientCredentials) -> Result<ServiceToken> {
        let params = json!({
            "client_id": credentials.client_id,
            "client_secret": credentials.client_password.expose_secret(),
            "grant_type": "service",
        });

        let claims = self
            .call(Operation::GetServiceToken, &params, &HeaderMap::new())
            .await?;

        let grant: ServiceTokenGrant = serde_json::from_value(claims).map_err(|e| {
            warn!(target: "auth_gateway.dispatcher", error = %e, "No token returned from auth server");
            GatewayError::InvalidResponse("Service token response is missing fields".to_string())
        })?;

        Ok(ServiceToken::new(
            SecretString::from(grant.service_token),
            grant.exp,
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use reqwest::header::{HeaderValue, AUTHORIZATION};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "dispatcher-test-secret";

    fn sign(claims: &Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_status_retries(3, Duration::from_millis(1))
            .with_transport_backoff(4, Duration::from_millis(10), Duration::from_secs(5))
    }

    fn config(server: &str) -> GatewayConfig {
        GatewayConfig::new(
            server.to_string(),
            "gateway".to_string(),
            SecretString::from("client-password"),
            SecretString::from(SECRET),
        )
    }

    fn dispatcher_for(config: &GatewayConfig) -> RemoteDispatcher {
        let codec = config
            .jwt_secret
            .as_ref()
            .map(|secret| JwtCodec::new(secret, &config.jwt_algorithm).unwrap());
        let tokens = Arc::new(ServiceTokenManager::new(ClientCredentials::from_config(config)));
        RemoteDispatcher::new(config, codec, tokens)
            .unwrap()
            .with_retry_policy(fast_policy())
    }

    fn dispatcher(server: &str) -> RemoteDispatcher {
        dispatcher_for(&config(server))
    }

    async fn mount_service_token(server: &MockServer, token: &str) {
        let body = sign(&json!({
            "service_token": token,
            "exp": chrono::Utc::now().timestamp() + 3600,
        }));
        Mock::given(method("POST"))
            .and(path("/get_service_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_call_returns_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_user"))
            .and(body_partial_json(json!({"user": "alice"})))
            .and(header("authorization", "Bearer inbound"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "alice"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer inbound"));

        let result = dispatcher(&server.uri())
            .call(Operation::GetUser, &json!({"user": "alice"}), &headers)
            .await
            .unwrap();

        assert_eq!(result["id"], "alice");
    }

    #[tokio::test]
    async fn test_call_decodes_jwt_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/valid_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sign(&json!({"user": "alice"}))))
            .mount(&server)
            .await;

        let result = dispatcher(&server.uri())
            .call(Operation::ValidToken, &json!({"token": "t"}), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(result["user"], "alice");
    }

    #[tokio::test]
    async fn test_call_returns_text_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_temp_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("temp-123"))
            .mount(&server)
            .await;

        let result = dispatcher(&server.uri())
            .call(Operation::GetTempToken, &json!({}), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(result, Value::String("temp-123".to_string()));
    }

    #[tokio::test]
    async fn test_get_operation_sends_query_string() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/retrieve_temp_data"))
            .and(query_param("token", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"foo": "bar"})))
            .expect(1)
            .mount(&server)
            .await;

        let result = dispatcher(&server.uri())
            .call(Operation::RetrieveTempData, &json!({"token": "abc"}), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(result["foo"], "bar");
    }

    #[tokio::test]
    async fn test_retriable_status_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let result = dispatcher(&server.uri())
            .call(Operation::GetUsers, &json!({}), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(result, json!([]));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_last_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(4)
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri())
            .call(Operation::GetUsers, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        let failure = err.dependency_failure().expect("dependency failure");
        assert_eq!(failure.reason, "oauthServerFailure");
        assert_eq!(failure.message, "Failed to call oauth server");
        assert_eq!(failure.retries, Some(3));
        assert_eq!(failure.status, Some(503));
        assert_eq!(failure.text.as_deref(), Some("busy"));
        assert_eq!(err.status_code(), 424);
    }

    #[tokio::test]
    async fn test_non_retriable_server_error_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search_user"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri())
            .call(Operation::SearchUser, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        let failure = err.dependency_failure().expect("dependency failure");
        assert_eq!(failure.message, "Unhandled oauth server error");
        assert_eq!(failure.retries, Some(0));
        assert_eq!(failure.status, Some(500));
    }

    #[tokio::test]
    async fn test_client_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_user"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri())
            .call(Operation::GetUser, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Rejected { status: 401, ref text } if text == "nope"));
    }

    #[tokio::test]
    async fn test_invalid_service_token_forces_one_renewal_and_rewrites_param() {
        let server = MockServer::start().await;
        let issued = sign(&json!({
            "service_token": "svc-fresh",
            "exp": chrono::Utc::now().timestamp() + 3600,
        }));
        Mock::given(method("POST"))
            .and(path("/get_service_token"))
            .and(body_partial_json(json!({"grant_type": "service", "client_id": "gateway"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(issued))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .and(body_partial_json(json!({"service_token": "svc-stale"})))
            .respond_with(ResponseTemplate::new(484))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .and(body_partial_json(json!({"service_token": "svc-fresh"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(["alice"])))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server.uri());
        let result = dispatcher
            .call(
                Operation::GetUsers,
                &json!({"service_token": "svc-stale", "scope": "root"}),
                &HeaderMap::new(),
            )
            .await
            .unwrap();

        assert_eq!(result, json!(["alice"]));
        let current = dispatcher.tokens().current().unwrap();
        assert_eq!(current.credential().expose_secret(), "svc-fresh");
    }

    #[tokio::test]
    async fn test_invalid_status_on_service_token_request_does_not_recurse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_service_token"))
            .respond_with(ResponseTemplate::new(484))
            .expect(4)
            .mount(&server)
            .await;

        let dispatcher = dispatcher(&server.uri());
        let err = dispatcher.service_token().await.unwrap_err();

        let failure = err.dependency_failure().expect("dependency failure");
        assert_eq!(failure.retries, Some(3));
        assert_eq!(failure.status, Some(484));
    }

    #[tokio::test]
    async fn test_failed_forced_renewal_is_unexpected_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_service_token"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .respond_with(ResponseTemplate::new(484))
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri())
            .call(Operation::GetUsers, &json!({"service_token": "x"}), &HeaderMap::new())
            .await
            .unwrap_err();

        let failure = err.dependency_failure().expect("dependency failure");
        assert_eq!(failure.message, "Failed to call oauth server");
        assert_eq!(failure.status, None);
    }

    #[tokio::test]
    async fn test_service_token_issued_and_reused() {
        let server = MockServer::start().await;
        mount_service_token(&server, "svc-1").await;

        let dispatcher = dispatcher(&server.uri());
        let first = dispatcher.service_token().await.unwrap();
        let second = dispatcher.service_token().await.unwrap();

        assert_eq!(first.expose_secret(), "svc-1");
        assert_eq!(second.expose_secret(), "svc-1");
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_token_response_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_service_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(sign(&json!({"exp": 1}))))
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri()).service_token().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_invalid_jwt_body_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not.a.jwt"))
            .mount(&server)
            .await;

        let err = dispatcher(&server.uri())
            .call(Operation::GetAuthorizationCode, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_after_backoff() {
        // Bind then drop a listener so its port refuses connections
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let uri = format!("http://127.0.0.1:{port}");

        let err = dispatcher(&uri)
            .call(Operation::GetUsers, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Unreachable(_)), "got {err:?}");
    }

    const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\nconnection: close\r\n\r\n{\"ok\":true}";

    /// Plain TCP server that closes the first `drops` connections without
    /// answering and replies `response` on every later one.
    ///
    /// Returns the base URL and the accepted-connection counter.
    async fn raw_server(drops: u32, response: &'static [u8]) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicU32::new(0));
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                if accepted.fetch_add(1, Ordering::SeqCst) < drops {
                    drop(socket);
                    continue;
                }
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (uri, connections)
    }

    #[tokio::test]
    async fn test_dropped_connections_are_retried_until_success() {
        let (uri, connections) = raw_server(2, OK_RESPONSE).await;

        let result = dispatcher(&uri)
            .call(Operation::RetrieveTempData, &json!({"token": "abc"}), &HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(result, json!({"ok": true}));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dropped_connections_exhaust_transport_tries() {
        let (uri, connections) = raw_server(u32::MAX, OK_RESPONSE).await;

        let err = dispatcher(&uri)
            .call(Operation::RetrieveTempData, &json!({"token": "abc"}), &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Transport(_)), "got {err:?}");
        assert_eq!(
            connections.load(Ordering::SeqCst),
            fast_policy().max_transport_tries
        );
    }

    #[tokio::test]
    async fn test_unreadable_error_body_still_retried() {
        // Declared length exceeds the bytes sent before close
        const TRUNCATED_503: &[u8] =
            b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 100\r\nconnection: close\r\n\r\nbusy";
        let (uri, connections) = raw_server(0, TRUNCATED_503).await;

        let err = dispatcher(&uri)
            .call(Operation::RetrieveTempData, &json!({"token": "abc"}), &HeaderMap::new())
            .await
            .unwrap_err();

        let failure = err.dependency_failure().expect("dependency failure");
        assert_eq!(failure.retries, Some(3));
        assert_eq!(failure.status, Some(503));
        assert_eq!(failure.text.as_deref(), Some(""));
        assert!(connections.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_unencodable_query_fails_without_retry() {
        let server = MockServer::start().await;

        let err = dispatcher(&server.uri())
            .call(
                Operation::CheckScopeId,
                &json!({"id": {"nested": "object"}}),
                &HeaderMap::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::InvalidRequest(_)), "got {err:?}");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_users"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(1)
            .mount(&server)
            .await;

        let config = config(&server.uri())
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(100));
        let err = dispatcher_for(&config)
            .call(Operation::GetUsers, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn test_missing_server_is_configuration_error() {
        let dispatcher = dispatcher_for(&GatewayConfig::default());
        let err = dispatcher
            .call(Operation::GetUsers, &json!({}), &HeaderMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_status_retries, 3);
        assert_eq!(policy.status_retry_pause, Duration::from_millis(50));
        assert_eq!(policy.max_transport_tries, 4);
        assert_eq!(policy.initial_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_backoff_time, Duration::from_secs(5));
    }
}
