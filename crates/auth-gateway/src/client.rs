//! Gateway handle and higher-level auth server calls.
//!
//! [`AuthGateway`] owns one instance of every component (codec, cache,
//! service-token manager, dispatcher, validator). Build it once at startup
//! and clone it into request handlers; clones share state.
//!
//! The convenience calls are thin wrappers over [`RemoteDispatcher::call`]:
//! they shape the parameters, add the service token where the operation
//! table says so, and forward the inbound request's `Authorization` header.
//! A non-retriable rejection from the auth server is logged and returned as
//! `Ok(None)`.

use crate::cache::AuthCache;
use crate::config::GatewayConfig;
use crate::dispatcher::{RemoteDispatcher, RetryPolicy};
use crate::error::{GatewayError, Result};
use crate::jwt::JwtCodec;
use crate::operations::Operation;
use crate::secret::{ExposeSecret, SecretString};
use crate::service_token::{
    run_renewal_loop, ClientCredentials, RenewalSchedule, ServiceTokenManager,
};
use crate::user::ValidatedUser;
use crate::validator::{InboundToken, TokenValidator, DEFAULT_SCOPE};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

// =============================================================================
// Request Inputs
// =============================================================================

/// The inbound request a call is made on behalf of.
#[derive(Clone, Default)]
pub struct RequestContext {
    /// Current scope; `root` when absent.
    pub scope: Option<String>,
    /// Inbound `Authorization` header value, forwarded as is.
    pub authorization: Option<String>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("scope", &self.scope)
            .field("authorization", &self.authorization.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.authorization = Some(authorization.into());
        self
    }

    /// Current scope, defaulting to `root`.
    #[must_use]
    pub fn scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    /// Headers to forward. Values that are not valid header text are dropped.
    #[must_use]
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = self
            .authorization
            .as_deref()
            .and_then(|authorization| HeaderValue::from_str(authorization).ok())
        {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}

/// User search parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub term: String,
    /// Attributes matched against `term`.
    pub attrs: Vec<String>,
    pub page: u32,
    pub per_page: u32,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            term: String::new(),
            attrs: vec!["mail".to_string()],
            page: 0,
            per_page: 30,
        }
    }
}

impl SearchQuery {
    #[must_use]
    pub fn term(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            ..Self::default()
        }
    }

    /// Criteria and attribute list, each JSON-encoded as a string.
    fn encoded(&self) -> (String, String) {
        let criteria: Map<String, Value> = self
            .attrs
            .iter()
            .map(|attr| (attr.clone(), Value::String(self.term.clone())))
            .collect();
        (
            Value::Object(criteria).to_string(),
            Value::from(self.attrs.clone()).to_string(),
        )
    }
}

/// Account to create with [`AuthGateway::add_user`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: SecretString,
    pub send_email: bool,
    pub reset_password: bool,
    pub roles: Vec<String>,
    pub data: Map<String, Value>,
    pub cn: Option<String>,
    pub sn: Option<String>,
}

impl NewUser {
    #[must_use]
    pub fn new(username: impl Into<String>, email: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password,
            send_email: true,
            reset_password: false,
            roles: Vec::new(),
            data: Map::new(),
            cn: None,
            sn: None,
        }
    }

    #[must_use]
    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }
}

// =============================================================================
// Gateway
// =============================================================================

struct Inner {
    config: GatewayConfig,
    dispatcher: Arc<RemoteDispatcher>,
    validator: TokenValidator,
}

/// Handle to the auth gateway. Cheap to clone.
#[derive(Clone)]
pub struct AuthGateway {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AuthGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGateway")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AuthGateway {
    /// Build a gateway with default retry and renewal timing.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` for an unusable JWT algorithm or
    /// if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_policies(config, RetryPolicy::default(), RenewalSchedule::default())
    }

    /// Build a gateway with explicit retry and renewal timing.
    ///
    /// # Errors
    ///
    /// See [`AuthGateway::new`].
    pub fn with_policies(
        config: GatewayConfig,
        retry: RetryPolicy,
        schedule: RenewalSchedule,
    ) -> Result<Self> {
        let codec = config
            .jwt_secret
            .as_ref()
            .map(|secret| JwtCodec::new(secret, &config.jwt_algorithm))
            .transpose()?;

        let tokens = Arc::new(
            ServiceTokenManager::new(ClientCredentials::from_config(&config))
                .with_schedule(schedule),
        );
        let dispatcher = Arc::new(
            RemoteDispatcher::new(&config, codec.clone(), tokens)?.with_retry_policy(retry),
        );
        let validator = TokenValidator::new(
            codec,
            AuthCache::new(config.user_cache_capacity, config.user_cache_duration),
            Arc::clone(&dispatcher),
            config.attr_id.clone(),
        );

        if !config.is_configured() {
            info!(target: "auth_gateway.client", "Auth gateway not fully configured, remote features inert");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                validator,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<RemoteDispatcher> {
        &self.inner.dispatcher
    }

    #[must_use]
    pub fn validator(&self) -> &TokenValidator {
        &self.inner.validator
    }

    /// Validate an inbound token. See [`TokenValidator::validate`].
    ///
    /// # Errors
    ///
    /// See [`TokenValidator::validate_at`].
    pub async fn validate(
        &self,
        token: &InboundToken,
        scope: Option<&str>,
    ) -> Result<Option<Arc<ValidatedUser>>> {
        self.inner.validator.validate(token, scope).await
    }

    /// Call a remote operation. See [`RemoteDispatcher::call`].
    ///
    /// # Errors
    ///
    /// See [`RemoteDispatcher::call`].
    pub async fn call(&self, op: Operation, params: &Value, headers: &HeaderMap) -> Result<Value> {
        self.inner.dispatcher.call(op, params, headers).await
    }

    /// The gateway's service token, renewed first if about to expire.
    ///
    /// # Errors
    ///
    /// See [`ServiceTokenManager::get_token`](crate::service_token::ServiceTokenManager::get_token).
    pub async fn service_token(&self) -> Result<SecretString> {
        self.inner.dispatcher.service_token().await
    }

    /// Renew the service token now.
    ///
    /// # Errors
    ///
    /// See [`ServiceTokenManager::renew`](crate::service_token::ServiceTokenManager::renew).
    pub async fn renew_service_token(&self) -> Result<SecretString> {
        let dispatcher = &self.inner.dispatcher;
        let token = dispatcher.tokens().renew(dispatcher.as_ref()).await?;
        Ok(token.credential().clone())
    }

    /// Spawn the background renewal loop.
    ///
    /// Returns `None` (nothing spawned) when the gateway is not fully
    /// configured or `auto_renew_token` is off. The loop stops when `cancel`
    /// fires; await the handle on shutdown.
    #[must_use]
    pub fn spawn_renewal(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.inner.config.auto_renew_token {
            info!(target: "auth_gateway.client", "Service token auto renewal disabled");
            return None;
        }
        if !self.inner.config.is_configured() {
            info!(target: "auth_gateway.client", "Auth gateway not configured, renewal loop not started");
            return None;
        }

        let dispatcher = Arc::clone(&self.inner.dispatcher);
        let tokens = Arc::clone(dispatcher.tokens());
        Some(tokio::spawn(run_renewal_loop(tokens, dispatcher, cancel)))
    }

    // =========================================================================
    // Convenience Calls
    // =========================================================================

    async fn service_token_value(&self) -> Result<Value> {
        let token = self.service_token().await?;
        Ok(Value::String(token.expose_secret().to_string()))
    }

    /// Call `op`, turning a non-retriable rejection into `None`.
    async fn call_soft(
        &self,
        op: Operation,
        params: &Value,
        ctx: &RequestContext,
    ) -> Result<Option<Value>> {
        match self.call(op, params, &ctx.headers()).await {
            Ok(value) => Ok(Some(value)),
            Err(GatewayError::Rejected { status, text }) => {
                warn!(
                    target: "auth_gateway.client",
                    operation = %op,
                    status = status,
                    body = %text,
                    "Auth server declined request"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Request an authorization code for `client_id`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    #[instrument(skip_all, fields(client_id = %client_id))]
    pub async fn authorization_code(
        &self,
        ctx: &RequestContext,
        scopes: &[String],
        client_id: &str,
    ) -> Result<Option<String>> {
        let params = json!({
            "client_id": client_id,
            "service_token": self.service_token_value().await?,
            "scopes": scopes,
            "response_type": "code",
        });
        let result = self
            .call_soft(Operation::GetAuthorizationCode, &params, ctx)
            .await?;
        Ok(result
            .as_ref()
            .and_then(|claims| claims.get("auth_code"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// List the users of the current scope.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn get_users(&self, ctx: &RequestContext) -> Result<Option<Value>> {
        let params = json!({
            "service_token": self.service_token_value().await?,
            "scope": ctx.scope(),
            "photo_size": "false",
        });
        self.call_soft(Operation::GetUsers, &params, ctx).await
    }

    /// Search users of the current scope.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn search_users(
        &self,
        ctx: &RequestContext,
        query: &SearchQuery,
    ) -> Result<Option<Value>> {
        let (criteria, attrs) = query.encoded();
        let params = json!({
            "criteria": criteria,
            "exact_match": false,
            "attrs": attrs,
            "page": query.page,
            "num_x_page": query.per_page,
            "service_token": self.service_token_value().await?,
            "scope": ctx.scope(),
        });
        self.call_soft(Operation::SearchUser, &params, ctx).await
    }

    /// Ask the auth server who `token` belongs to.
    ///
    /// Returns the `user` field of the decoded answer.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn validate_remote_token(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<Option<Value>> {
        let params = json!({
            "code": self.service_token_value().await?,
            "token": token,
            "scope": ctx.scope(),
        });
        let result = self.call_soft(Operation::ValidToken, &params, ctx).await?;
        Ok(result.and_then(|claims| claims.get("user").cloned()))
    }

    /// Store `payload` server-side and get a temporary token for it.
    ///
    /// A `clear` key inside `payload` is removed and overrides `clear`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn get_temp_token(
        &self,
        ctx: &RequestContext,
        mut payload: Map<String, Value>,
        ttl: Option<u64>,
        clear: bool,
    ) -> Result<Option<String>> {
        let clear = payload.remove("clear").unwrap_or(Value::Bool(clear));
        let mut params = json!({
            "payload": payload,
            "service_token": self.service_token_value().await?,
            "scope": ctx.scope(),
            "client_id": self.inner.config.client_id,
            "clear": clear,
        });
        if let (Some(ttl), Some(map)) = (ttl, params.as_object_mut()) {
            map.insert("ttl".to_string(), Value::from(ttl));
        }
        let result = self.call_soft(Operation::GetTempToken, &params, ctx).await?;
        Ok(result.and_then(|text| text.as_str().map(str::to_string)))
    }

    /// Grant `roles` in the current scope to `user`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn grant_scope_roles(
        &self,
        ctx: &RequestContext,
        user: &str,
        roles: &[String],
    ) -> Result<Option<Value>> {
        let params = json!({
            "scope": ctx.scope(),
            "user": user,
            "roles": roles,
            "service_token": self.service_token_value().await?,
        });
        self.call_soft(Operation::GrantScopeRoles, &params, ctx).await
    }

    /// Remove `roles` in the current scope from `user`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn deny_scope_roles(
        &self,
        ctx: &RequestContext,
        user: &str,
        roles: &[String],
    ) -> Result<Option<Value>> {
        let params = json!({
            "scope": ctx.scope(),
            "user": user,
            "roles": roles,
            "service_token": self.service_token_value().await?,
        });
        self.call_soft(Operation::DenyScopeRoles, &params, ctx).await
    }

    /// Fetch the payload stored behind a temporary token.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn retrieve_temp_data(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<Option<Value>> {
        let params = json!({ "token": token });
        self.call_soft(Operation::RetrieveTempData, &params, ctx).await
    }

    /// Check whether scope id `scope` exists.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn check_scope_id(
        &self,
        ctx: &RequestContext,
        scope: &str,
        service: bool,
    ) -> Result<Option<Value>> {
        let mut params = json!({ "id": scope });
        if service {
            insert(&mut params, "service_token", self.service_token_value().await?);
        }
        self.call_soft(Operation::CheckScopeId, &params, ctx).await
    }

    /// Fetch a user record, as the caller or (with `service`) as the gateway.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn get_user(
        &self,
        ctx: &RequestContext,
        username: &str,
        scope: &str,
        service: bool,
    ) -> Result<Option<Value>> {
        let op = if service {
            Operation::ServiceGetUser
        } else {
            Operation::GetUser
        };
        let params = json!({
            "user": username,
            "service_token": self.service_token_value().await?,
            "scope": scope,
            "photo_size": "false",
        });
        self.call_soft(op, &params, ctx).await
    }

    /// Replace the metadata of the user behind `client_id`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn set_user_metadata(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        data: Value,
    ) -> Result<Option<Value>> {
        let params = json!({
            "client_id": client_id,
            "service_token": self.service_token_value().await?,
            "info": { "data": data },
        });
        self.call_soft(Operation::EditUser, &params, ctx).await
    }

    /// Set account metadata of `scope`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn set_account_metadata(
        &self,
        ctx: &RequestContext,
        scope: &str,
        payload: Value,
        client_id: &str,
        service: bool,
    ) -> Result<Option<Value>> {
        let mut params = json!({
            "scope": scope,
            "payload": payload,
            "client_id": client_id,
        });
        let op = if service {
            insert(&mut params, "service_token", self.service_token_value().await?);
            Operation::ServiceSetAccountMetadata
        } else {
            Operation::SetAccountMetadata
        };
        self.call_soft(op, &params, ctx).await
    }

    /// Set the limit `name` of `scope` to `value`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn modify_limit(
        &self,
        ctx: &RequestContext,
        scope: &str,
        name: &str,
        value: Value,
        client_id: &str,
        service: bool,
    ) -> Result<Option<Value>> {
        let mut params = json!({
            "scope": scope,
            "name": name,
            "value": value,
            "client_id": client_id,
        });
        let op = if service {
            insert(&mut params, "service_token", self.service_token_value().await?);
            Operation::ServiceModifyScopeLimit
        } else {
            Operation::ModifyScopeLimit
        };
        self.call_soft(op, &params, ctx).await
    }

    /// Read account metadata of `scope`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn get_account_metadata(
        &self,
        ctx: &RequestContext,
        scope: &str,
        client_id: &str,
        service: bool,
    ) -> Result<Option<Value>> {
        let mut params = json!({ "scope": scope, "client_id": client_id });
        let op = if service {
            insert(&mut params, "service_token", self.service_token_value().await?);
            Operation::GetMetadataByService
        } else {
            Operation::GetMetadata
        };
        self.call_soft(op, &params, ctx).await
    }

    /// Create scope `scope` administered by `admin_user`.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    pub async fn add_scope(
        &self,
        ctx: &RequestContext,
        scope: &str,
        admin_user: &str,
        urls: Map<String, Value>,
    ) -> Result<Option<Value>> {
        let params = json!({
            "admin_user": admin_user,
            "service_token": self.service_token_value().await?,
            "scope": scope,
            "urls": urls,
        });
        self.call_soft(Operation::AddScope, &params, ctx).await
    }

    /// Create a user in the current scope.
    ///
    /// # Errors
    ///
    /// Any dispatcher error other than a rejection.
    #[instrument(skip_all, fields(username = %user.username))]
    pub async fn add_user(&self, ctx: &RequestContext, user: &NewUser) -> Result<Option<Value>> {
        let mut params = json!({
            "user": user.username,
            "email": user.email,
            "cn": user.cn,
            "sn": user.sn,
            "password": user.password.expose_secret(),
            "service_token": self.service_token_value().await?,
            "client_id": self.inner.config.client_id,
            "send-email": user.send_email,
            "reset-password": user.reset_password,
            "scope": ctx.scope(),
            "data": user.data,
        });
        if !user.roles.is_empty() {
            insert(&mut params, "roles", Value::from(user.roles.clone()));
        }
        self.call_soft(Operation::AddUser, &params, ctx).await
    }
}

fn insert(params: &mut Value, key: &str, value: Value) {
    if let Some(map) = params.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}
