//! Auth gateway configuration.
//!
//! Configuration is loaded once at startup from environment variables (or
//! built programmatically). Missing server/credential settings do not fail
//! loading: they put the gateway into inert mode, where renewal never runs and
//! remote calls refuse with a configuration error. Secrets are redacted in
//! Debug output.

use crate::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default attribute of the remote user record used as the user id.
pub const DEFAULT_ATTR_ID: &str = "mail";

/// Default JWT algorithm for the shared-secret codec.
pub const DEFAULT_JWT_ALGORITHM: &str = "HS256";

/// Algorithms accepted for the shared-secret codec.
pub const SUPPORTED_JWT_ALGORITHMS: [&str; 3] = ["HS256", "HS384", "HS512"];

/// Default TCP connect timeout for auth server calls.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default overall request timeout for auth server calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default lifetime of a validated-user cache time bucket.
pub const DEFAULT_USER_CACHE_DURATION: Duration = Duration::from_secs(120);

/// Default validated-user cache capacity.
pub const DEFAULT_USER_CACHE_CAPACITY: usize = 1000;

/// Auth gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Base URL of the auth server.
    pub server: Option<String>,

    /// Client id the gateway authenticates as.
    pub client_id: Option<String>,

    /// Client password for service-token grants.
    pub client_password: Option<SecretString>,

    /// Shared secret used to verify JWTs.
    pub jwt_secret: Option<SecretString>,

    /// JWT algorithm name (HMAC family only).
    pub jwt_algorithm: String,

    /// Remote user-record field used as the user's unique id.
    pub attr_id: String,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Overall request timeout.
    pub request_timeout: Duration,

    /// Run the background service-token renewal loop.
    pub auto_renew_token: bool,

    /// Validated-user cache bucket duration.
    pub user_cache_duration: Duration,

    /// Validated-user cache capacity.
    pub user_cache_capacity: usize,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("server", &self.server)
            .field("client_id", &self.client_id)
            .field(
                "client_password",
                &self.client_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "[REDACTED]"))
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("attr_id", &self.attr_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("auto_renew_token", &self.auto_renew_token)
            .field("user_cache_duration", &self.user_cache_duration)
            .field("user_cache_capacity", &self.user_cache_capacity)
            .finish()
    }
}

impl Default for GatewayConfig {
    /// An inert configuration: nothing to talk to, nothing to renew.
    fn default() -> Self {
        Self {
            server: None,
            client_id: None,
            client_password: None,
            jwt_secret: None,
            jwt_algorithm: DEFAULT_JWT_ALGORITHM.to_string(),
            attr_id: DEFAULT_ATTR_ID.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auto_renew_token: true,
            user_cache_duration: DEFAULT_USER_CACHE_DURATION,
            user_cache_capacity: DEFAULT_USER_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),

    #[error("Invalid boolean configuration: {0}")]
    InvalidBool(String),

    #[error("Invalid user cache configuration: {0}")]
    InvalidCache(String),

    #[error("Unsupported JWT algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl GatewayConfig {
    /// Create a fully configured gateway configuration with default timeouts.
    #[must_use]
    pub fn new(
        server: String,
        client_id: String,
        client_password: SecretString,
        jwt_secret: SecretString,
    ) -> Self {
        Self {
            server: Some(server),
            client_id: Some(client_id),
            client_password: Some(client_password),
            jwt_secret: Some(jwt_secret),
            ..Self::default()
        }
    }

    /// Set the JWT algorithm.
    #[must_use]
    pub fn with_jwt_algorithm(mut self, algorithm: &str) -> Self {
        self.jwt_algorithm = algorithm.to_string();
        self
    }

    /// Set the user id attribute.
    #[must_use]
    pub fn with_attr_id(mut self, attr_id: &str) -> Self {
        self.attr_id = attr_id.to_string();
        self
    }

    /// Set connect and request timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, connect_timeout: Duration, request_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.request_timeout = request_timeout;
        self
    }

    /// Enable or disable the background renewal loop.
    #[must_use]
    pub fn with_auto_renew_token(mut self, enabled: bool) -> Self {
        self.auto_renew_token = enabled;
        self
    }

    /// Set the validated-user cache bucket duration and capacity.
    #[must_use]
    pub fn with_user_cache(mut self, duration: Duration, capacity: usize) -> Self {
        self.user_cache_duration = duration;
        self.user_cache_capacity = capacity;
        self
    }

    /// True when every setting needed for remote calls and renewal is present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.server.is_some()
            && self.jwt_secret.is_some()
            && self.client_id.is_some()
            && self.client_password.is_some()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        let jwt_algorithm = non_empty("AUTH_JWT_ALGORITHM")
            .unwrap_or_else(|| DEFAULT_JWT_ALGORITHM.to_string());
        if !SUPPORTED_JWT_ALGORITHMS.contains(&jwt_algorithm.as_str()) {
            return Err(ConfigError::UnsupportedAlgorithm(format!(
                "AUTH_JWT_ALGORITHM must be one of {}, got '{}'",
                SUPPORTED_JWT_ALGORITHMS.join(", "),
                jwt_algorithm
            )));
        }

        let connect_timeout = parse_positive_secs(
            vars,
            "AUTH_CONNECT_TIMEOUT_SECONDS",
            DEFAULT_CONNECT_TIMEOUT,
        )
        .map_err(ConfigError::InvalidTimeout)?;

        let request_timeout = parse_positive_secs(
            vars,
            "AUTH_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT,
        )
        .map_err(ConfigError::InvalidTimeout)?;

        let auto_renew_token = match vars.get("AUTH_AUTO_RENEW_TOKEN") {
            Some(value) => parse_bool(value).ok_or_else(|| {
                ConfigError::InvalidBool(format!(
                    "AUTH_AUTO_RENEW_TOKEN must be true or false, got '{value}'"
                ))
            })?,
            None => true,
        };

        let user_cache_duration =
            parse_positive_secs(vars, "USER_CACHE_DURATION", DEFAULT_USER_CACHE_DURATION)
                .map_err(ConfigError::InvalidCache)?;

        let user_cache_capacity = if let Some(value_str) = vars.get("USER_CACHE_CAPACITY") {
            let value: usize = value_str.parse().map_err(|e| {
                ConfigError::InvalidCache(format!(
                    "USER_CACHE_CAPACITY must be a valid positive integer, got '{value_str}': {e}"
                ))
            })?;
            if value == 0 {
                return Err(ConfigError::InvalidCache(
                    "USER_CACHE_CAPACITY must be greater than 0".to_string(),
                ));
            }
            value
        } else {
            DEFAULT_USER_CACHE_CAPACITY
        };

        Ok(GatewayConfig {
            server: non_empty("AUTH_SERVER"),
            client_id: non_empty("AUTH_CLIENT_ID"),
            client_password: non_empty("AUTH_CLIENT_PASSWORD").map(SecretString::from),
            jwt_secret: non_empty("AUTH_JWT_SECRET").map(SecretString::from),
            jwt_algorithm,
            attr_id: non_empty("AUTH_ATTR_ID").unwrap_or_else(|| DEFAULT_ATTR_ID.to_string()),
            connect_timeout,
            request_timeout,
            auto_renew_token,
            user_cache_duration,
            user_cache_capacity,
        })
    }
}

fn parse_positive_secs(
    vars: &HashMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, String> {
    let Some(value_str) = vars.get(key) else {
        return Ok(default);
    };
    let value: u64 = value_str.parse().map_err(|e| {
        format!("{key} must be a valid positive integer, got '{value_str}': {e}")
    })?;
    if value == 0 {
        return Err(format!("{key} must be greater than 0"));
    }
    Ok(Duration::from_secs(value))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
