//! Mock auth server harness for integration tests
//!
//! Provides `TestAuthServer`, a wiremock server speaking the auth server's
//! operation paths, plus a gateway configured against it.

use crate::test_ids::{TEST_CLIENT_ID, TEST_CLIENT_PASSWORD, TEST_JWT_SECRET};
use crate::token_builders::sign_claims;
use auth_gateway::dispatcher::RetryPolicy;
use auth_gateway::secret::SecretString;
use auth_gateway::service_token::RenewalSchedule;
use auth_gateway::{AuthGateway, GatewayConfig};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Mock auth server for integration tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_service_token_flow() {
///     let server = TestAuthServer::start().await;
///     server.mount_service_token(TEST_SERVICE_TOKEN_1, 3600).await;
///
///     let token = server.gateway().service_token().await.unwrap();
///     assert_eq!(token.expose_secret(), TEST_SERVICE_TOKEN_1);
/// }
/// ```
pub struct TestAuthServer {
    server: MockServer,
}

impl TestAuthServer {
    /// Start a fresh mock server on a random port.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL of the mock server.
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Underlying wiremock server, for mounting custom mocks.
    pub fn mock_server(&self) -> &MockServer {
        &self.server
    }

    /// Fully configured gateway settings pointing at this server.
    ///
    /// Uses `id` as the user id attribute and short timeouts.
    pub fn config(&self) -> GatewayConfig {
        GatewayConfig::new(
            self.uri(),
            TEST_CLIENT_ID.to_string(),
            SecretString::from(TEST_CLIENT_PASSWORD),
            SecretString::from(TEST_JWT_SECRET),
        )
        .with_attr_id("id")
        .with_timeouts(Duration::from_secs(1), Duration::from_millis(500))
    }

    /// Gateway built from [`TestAuthServer::config`] with fast retries.
    pub fn gateway(&self) -> AuthGateway {
        self.gateway_with(self.config())
    }

    /// Gateway built from `config` with fast retries.
    pub fn gateway_with(&self, config: GatewayConfig) -> AuthGateway {
        AuthGateway::with_policies(config, fast_retry_policy(), RenewalSchedule::default())
            .expect("test gateway configuration is valid")
    }

    /// Sign claims with the shared test secret.
    pub fn sign(&self, claims: &Value) -> String {
        sign_claims(claims, TEST_JWT_SECRET)
    }

    /// Answer `get_service_token` with `token`, valid for `lifetime_secs`.
    pub async fn mount_service_token(&self, token: &str, lifetime_secs: i64) {
        let body = self.sign(&json!({
            "service_token": token,
            "exp": chrono::Utc::now().timestamp() + lifetime_secs,
        }));
        Mock::given(method("POST"))
            .and(path("/get_service_token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&self.server)
            .await;
    }

    /// Answer `get_user` lookups for `login` with `record`.
    pub async fn mount_user(&self, login: &str, record: Value) {
        Mock::given(method("POST"))
            .and(path("/get_user"))
            .and(body_partial_json(json!({ "user": login })))
            .respond_with(ResponseTemplate::new(200).set_body_json(record))
            .mount(&self.server)
            .await;
    }

    /// Requests received on `operation`'s path.
    pub async fn requests_to(&self, operation: &str) -> Vec<Request> {
        let wanted = format!("/{operation}");
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == wanted)
            .collect()
    }

    /// JSON bodies of the requests received on `operation`'s path.
    pub async fn bodies_of(&self, operation: &str) -> Vec<Value> {
        self.requests_to(operation)
            .await
            .iter()
            .map(|request| request.body_json::<Value>().expect("request body is JSON"))
            .collect()
    }
}

/// Retry policy with millisecond pauses.
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_status_retries(3, Duration::from_millis(1))
        .with_transport_backoff(4, Duration::from_millis(10), Duration::from_secs(2))
}
