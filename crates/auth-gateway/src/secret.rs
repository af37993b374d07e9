//! Secret types and log redaction helpers.
//!
//! Re-exports the [`secrecy`] types used for every credential the gateway
//! handles: the client password, the shared JWT secret and the service token.
//! `SecretString` redacts itself in `Debug`, so structs holding one can derive
//! `Debug` safely.
//!
//! ```rust
//! use auth_gateway::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct Credentials {
//!     client_id: String,
//!     client_password: SecretString,
//! }
//!
//! let creds = Credentials {
//!     client_id: "gateway".to_string(),
//!     client_password: SecretString::from("hunter2"),
//! };
//! assert!(!format!("{creds:?}").contains("hunter2"));
//! assert_eq!(creds.client_password.expose_secret(), "hunter2");
//! ```

pub use secrecy::{ExposeSecret, SecretString};

/// Number of leading characters of an issued token that may be logged.
pub const LOGGED_TOKEN_PREFIX_CHARS: usize = 10;

/// Maximum number of characters of a response body that may be logged.
pub const LOGGED_BODY_CHARS: usize = 256;

/// Short, log-safe prefix of a token: the first few characters and `...`.
#[must_use]
pub fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(LOGGED_TOKEN_PREFIX_CHARS).collect();
    format!("{prefix}...")
}

/// Truncate a response body for logging and error payloads.
#[must_use]
pub fn truncate_body(body: &str) -> String {
    if body.chars().count() <= LOGGED_BODY_CHARS {
        return body.to_string();
    }
    let head: String = body.chars().take(LOGGED_BODY_CHARS).collect();
    format!("{head}...")
}
