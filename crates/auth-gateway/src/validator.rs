//! Inbound token validation pipeline.
//!
//! Turns an inbound bearer credential into a [`ValidatedUser`]:
//!
//! 1. Only `bearer` and `wstoken` credentials containing a `.` are considered
//! 2. The token is verified with the shared-secret codec
//! 3. The `login` claim identifies the user
//! 4. The time-bucketed cache is consulted
//! 5. On a miss, the user record is fetched with the caller's own token
//! 6. The record's id attribute must equal the token's login
//! 7. The user is cached and returned
//!
//! "Not mine / not valid" outcomes are `Ok(None)` so a host can try other
//! validators. Only an expired token (`Unauthorized`) and remote failures
//! (`DependencyTimeout`, `DependencyFailure`, transport errors) are errors.

use crate::cache::AuthCache;
use crate::dispatcher::RemoteDispatcher;
use crate::error::{DependencyFailure, GatewayError, Result};
use crate::jwt::{JwtCodec, JwtError};
use crate::operations::Operation;
use crate::user::ValidatedUser;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Credential types this validator handles.
pub const SUPPORTED_TOKEN_TYPES: [&str; 2] = ["bearer", "wstoken"];

/// Scope used when the caller has none.
pub const DEFAULT_SCOPE: &str = "root";

/// Credential extracted from an inbound request.
#[derive(Clone, PartialEq, Eq)]
pub struct InboundToken {
    /// Credential type, e.g. `bearer`.
    pub kind: String,
    pub token: String,
}

impl InboundToken {
    #[must_use]
    pub fn new(kind: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            token: token.into(),
        }
    }

    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new("bearer", token)
    }
}

impl fmt::Debug for InboundToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundToken")
            .field("kind", &self.kind)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Claims read from an inbound token.
#[derive(Debug, Deserialize)]
struct InboundClaims {
    login: Option<String>,
    name: Option<String>,
}

/// Validates inbound tokens against the auth server, with caching.
#[derive(Debug)]
pub struct TokenValidator {
    codec: Option<JwtCodec>,
    cache: AuthCache,
    dispatcher: Arc<RemoteDispatcher>,
    attr_id: String,
}

impl TokenValidator {
    /// Create a validator. Without a codec every token is declined.
    #[must_use]
    pub fn new(
        codec: Option<JwtCodec>,
        cache: AuthCache,
        dispatcher: Arc<RemoteDispatcher>,
        attr_id: String,
    ) -> Self {
        Self {
            codec,
            cache,
            dispatcher,
            attr_id,
        }
    }

    #[must_use]
    pub fn cache(&self) -> &AuthCache {
        &self.cache
    }

    /// Validate `token` for `scope` (default `root`) at the current time.
    ///
    /// # Errors
    ///
    /// See [`TokenValidator::validate_at`].
    pub async fn validate(
        &self,
        token: &InboundToken,
        scope: Option<&str>,
    ) -> Result<Option<Arc<ValidatedUser>>> {
        #[allow(clippy::cast_precision_loss)]
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        self.validate_at(token, scope, now).await
    }

    /// Validate `token` with `now` (Unix epoch seconds) selecting the cache
    /// bucket.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Unauthorized` - token signature is valid but expired
    /// - `GatewayError::DependencyTimeout` - the user lookup timed out
    /// - any non-timeout dispatcher error other than `Rejected`
    #[instrument(skip_all, fields(kind = %token.kind))]
    pub async fn validate_at(
        &self,
        token: &InboundToken,
        scope: Option<&str>,
        now: f64,
    ) -> Result<Option<Arc<ValidatedUser>>> {
        if !SUPPORTED_TOKEN_TYPES.contains(&token.kind.as_str()) {
            return Ok(None);
        }
        // Cheap check that this might be a JWT at all
        if !token.token.contains('.') {
            return Ok(None);
        }
        let Some(codec) = &self.codec else {
            debug!(target: "auth_gateway.validator", "JWT secret not configured, declining token");
            return Ok(None);
        };

        let claims: InboundClaims = match codec.decode(&token.token) {
            Ok(claims) => claims,
            Err(JwtError::Expired) => {
                warn!(target: "auth_gateway.validator", "Token expired");
                return Err(GatewayError::Unauthorized("Token expired".to_string()));
            }
            Err(e) => {
                debug!(target: "auth_gateway.validator", error = %e, "Token declined");
                return Ok(None);
            }
        };

        let Some(login) = claims.login else {
            debug!(target: "auth_gateway.validator", "Valid token without login claim, declining");
            return Ok(None);
        };

        let scope = scope.unwrap_or(DEFAULT_SCOPE);
        let key = self.cache.key_at(scope, &login, &token.token, now);
        if let Some(user) = self.cache.get(&key).await {
            return Ok(Some(user));
        }

        let Some(data) = self.lookup_user(&token.token, scope, &login).await? else {
            return Ok(None);
        };

        let display_name = claims.name.unwrap_or_else(|| login.clone());
        let Some(user) =
            ValidatedUser::from_remote(data, &self.attr_id, display_name, token.token.clone())
        else {
            warn!(
                target: "auth_gateway.validator",
                login = %login,
                attr_id = %self.attr_id,
                "User record missing id attribute"
            );
            return Ok(None);
        };

        if user.id != login {
            warn!(
                target: "auth_gateway.validator",
                login = %login,
                id = %user.id,
                "User record does not match token login"
            );
            return Ok(None);
        }

        let user = Arc::new(user);
        self.cache.insert(key, Arc::clone(&user)).await;
        Ok(Some(user))
    }

    /// Fetch the user record, authenticated as the token's own holder.
    async fn lookup_user(&self, raw_token: &str, scope: &str, login: &str) -> Result<Option<Value>> {
        let Ok(authorization) = HeaderValue::from_str(&format!("Bearer {raw_token}")) else {
            return Ok(None);
        };
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, authorization);

        let params = json!({
            "scope": scope,
            "user": login,
            "photo_size": "false",
        });

        let started = Instant::now();
        let result = self
            .dispatcher
            .call(Operation::GetUser, &params, &headers)
            .await;
        info!(
            target: "auth_gateway.validator",
            login = %login,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "User lookup completed"
        );

        match result {
            Ok(Value::Null) => Ok(None),
            Ok(data) => Ok(Some(data)),
            Err(GatewayError::Timeout) => {
                warn!(target: "auth_gateway.validator", login = %login, "User lookup timed out");
                Err(GatewayError::DependencyTimeout(
                    DependencyFailure::user_api_timeout(),
                ))
            }
            Err(GatewayError::Rejected { status, .. }) => {
                debug!(
                    target: "auth_gateway.validator",
                    login = %login,
                    status = status,
                    "User lookup rejected"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
