//! Error types for the auth gateway client.
//!
//! Errors fall into five classes:
//!
//! - Configuration errors (missing server/credentials, bad algorithm)
//! - Soft validation failures, which are NOT errors: validators return
//!   `Ok(None)` so that other validators can try the token
//! - Authentication failures (`Unauthorized`)
//! - Transient dependency failures (`Unreachable`, `Transport`, retriable
//!   statuses), surfaced only once the dispatcher has exhausted its retries
//! - Fatal dependency failures (`DependencyFailure`), surfaced immediately
//!
//! Messages returned to callers are generic. Details are logged server-side.

use serde::Serialize;
use thiserror::Error;

/// Reason reported when the auth server could not fulfil a request.
pub const REASON_SERVER_FAILURE: &str = "oauthServerFailure";

/// Reason reported when the user lookup timed out during validation.
pub const REASON_USER_API_TIMEOUT: &str = "userApiTimeout";

/// Structured dependency-failure payload.
///
/// This is what a host adapter serialises into the body of its
/// "failed dependency" response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyFailure {
    /// Machine-readable reason.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    /// Number of retries performed before giving up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    /// Last HTTP status returned by the auth server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Last (truncated) response body returned by the auth server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl DependencyFailure {
    /// Retries were exhausted on a retriable status.
    #[must_use]
    pub fn retries_exhausted(retries: u32, status: u16, text: String) -> Self {
        Self {
            reason: REASON_SERVER_FAILURE.to_string(),
            message: "Failed to call oauth server".to_string(),
            retries: Some(retries),
            status: Some(status),
            text: Some(text),
        }
    }

    /// The auth server answered with a non-retriable server error.
    #[must_use]
    pub fn server_error(retries: u32, status: u16, text: String) -> Self {
        Self {
            reason: REASON_SERVER_FAILURE.to_string(),
            message: "Unhandled oauth server error".to_string(),
            retries: Some(retries),
            status: Some(status),
            text: Some(text),
        }
    }

    /// Something unexpected went wrong while handling a failed call.
    ///
    /// Carries no details; they are logged, not returned.
    #[must_use]
    pub fn unexpected() -> Self {
        Self {
            reason: REASON_SERVER_FAILURE.to_string(),
            message: "Failed to call oauth server".to_string(),
            retries: None,
            status: None,
            text: None,
        }
    }

    /// The user lookup performed during token validation timed out.
    #[must_use]
    pub fn user_api_timeout() -> Self {
        Self {
            reason: REASON_USER_API_TIMEOUT.to_string(),
            message: "Timeout authenticating with user api".to_string(),
            retries: None,
            status: None,
            text: None,
        }
    }
}

/// Auth gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or invalid configuration. Fatal to the auth feature only.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation name that is not in the operation table.
    #[error("Unknown remote operation: {0}")]
    UnknownOperation(String),

    /// Authentication failed (expired token, rejected identity).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The auth server could not fulfil the request.
    #[error("Dependency failure: {}", .0.message)]
    DependencyFailure(DependencyFailure),

    /// The auth server did not answer in time during validation.
    #[error("Dependency timeout: {}", .0.message)]
    DependencyTimeout(DependencyFailure),

    /// The auth server declined the request with a non-retriable status.
    #[error("Auth server rejected request with status {status}")]
    Rejected {
        /// HTTP status returned.
        status: u16,
        /// Truncated response body.
        text: String,
    },

    /// The auth server could not be reached (connection refused, DNS, ...).
    #[error("Auth server unreachable: {0}")]
    Unreachable(String),

    /// The request timed out.
    #[error("Auth server request timed out")]
    Timeout,

    /// Any other transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request could not be built (e.g. parameters that cannot be
    /// encoded as a query string). Never retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The auth server answered 200 with a body that could not be decoded.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// HTTP status a host adapter should answer with for this error.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Unauthorized(_) => 401,
            GatewayError::DependencyFailure(_) | GatewayError::DependencyTimeout(_) => 424,
            GatewayError::InvalidResponse(_) | GatewayError::Rejected { .. } => 502,
            GatewayError::Configuration(_)
            | GatewayError::Unreachable(_)
            | GatewayError::Timeout
            | GatewayError::Transport(_) => 503,
            GatewayError::UnknownOperation(_) | GatewayError::InvalidRequest(_) => 500,
        }
    }

    /// The structured failure payload, if this error carries one.
    #[must_use]
    pub fn dependency_failure(&self) -> Option<&DependencyFailure> {
        match self {
            GatewayError::DependencyFailure(failure) | GatewayError::DependencyTimeout(failure) => {
                Some(failure)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            GatewayError::InvalidRequest(err.to_string())
        } else if err.is_timeout() {
            GatewayError::Timeout
        } else if err.is_connect() {
            GatewayError::Unreachable(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// Result type alias using `GatewayError`.
pub type Result<T> = std::result::Result<T, GatewayError>;
