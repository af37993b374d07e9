//! Shared-secret JWT decoding.
//!
//! Both inbound bearer tokens and JWT-encoded auth server responses are
//! verified with the same shared secret and HMAC algorithm. Cryptography is
//! delegated to `jsonwebtoken`; this module only configures it and adds the
//! issued-at check with its clock-skew leniency.
//!
//! # Issued-at leniency
//!
//! A token whose `iat` lies in the future is rejected on the first pass with
//! [`JwtError::IssuedInFuture`]. [`JwtCodec::decode`] then decodes it once
//! more with the issued-at check disabled. Signature and expiry are verified on
//! both passes; only the `iat` comparison is relaxed, to tolerate clock drift
//! between the auth server and this host.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only HMAC algorithms are accepted
//! - Expiry is checked with zero leeway
//! - Error messages are generic; details are logged at debug level

use crate::error::GatewayError;
use crate::secret::{ExposeSecret, SecretString};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum accepted JWT size in bytes (8KB), checked before any parsing.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Errors that can occur while decoding a JWT.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtError {
    /// Token exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("The token is invalid or expired")]
    TokenTooLarge,

    /// Signature is valid but the token has expired.
    #[error("The token is invalid or expired")]
    Expired,

    /// The `iat` claim is in the future.
    #[error("The token is invalid or expired")]
    IssuedInFuture,

    /// Malformed token, bad signature, or claims of the wrong shape.
    #[error("The token is invalid or expired")]
    Invalid,
}

/// Shared-secret JWT codec.
#[derive(Clone)]
pub struct JwtCodec {
    key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtCodec")
            .field("key", &"[REDACTED]")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}

impl JwtCodec {
    /// Create a codec for the given shared secret and algorithm name.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Configuration` if the algorithm is unknown or
    /// not an HMAC algorithm.
    pub fn new(secret: &SecretString, algorithm: &str) -> Result<Self, GatewayError> {
        let algorithm = Algorithm::from_str(algorithm).map_err(|e| {
            GatewayError::Configuration(format!("Unknown JWT algorithm '{algorithm}': {e}"))
        })?;
        if !matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(GatewayError::Configuration(format!(
                "JWT algorithm {algorithm:?} is not a shared-secret algorithm"
            )));
        }

        let mut validation = Validation::new(algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        Ok(Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        })
    }

    /// Verify and decode a token into `T`, tolerating a future `iat` once.
    ///
    /// # Errors
    ///
    /// - `JwtError::TokenTooLarge` - token exceeds the size limit
    /// - `JwtError::Expired` - valid signature but `exp` is in the past
    /// - `JwtError::Invalid` - anything else (format, signature, claim shape)
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<T, JwtError> {
        let claims = match self.decode_checked(token, true) {
            Err(JwtError::IssuedInFuture) => {
                tracing::warn!(
                    target: "auth_gateway.jwt",
                    "Token issued in the future, retrying without iat verification"
                );
                self.decode_checked(token, false)?
            }
            other => other?,
        };

        serde_json::from_value(claims).map_err(|e| {
            tracing::debug!(target: "auth_gateway.jwt", error = %e, "Token claims have unexpected shape");
            JwtError::Invalid
        })
    }

    /// Single decode pass. `verify_iat` controls the issued-at check only.
    fn decode_checked(&self, token: &str, verify_iat: bool) -> Result<Value, JwtError> {
        if token.len() > MAX_JWT_SIZE_BYTES {
            tracing::debug!(
                target: "auth_gateway.jwt",
                token_size = token.len(),
                max_size = MAX_JWT_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(JwtError::TokenTooLarge);
        }

        let data = decode::<Value>(token, &self.key, &self.validation).map_err(|e| {
            if matches!(e.kind(), ErrorKind::ExpiredSignature) {
                JwtError::Expired
            } else {
                tracing::debug!(target: "auth_gateway.jwt", error = %e, "Token verification failed");
                JwtError::Invalid
            }
        })?;

        if verify_iat {
            if let Some(iat) = data.claims.get("iat").and_then(Value::as_f64) {
                validate_iat_at(iat, chrono::Utc::now().timestamp())?;
            }
        }

        Ok(data.claims)
    }
}

/// Reject an `iat` later than `now`.
pub(crate) fn validate_iat_at(iat: f64, now: i64) -> Result<(), JwtError> {
    #[allow(clippy::cast_precision_loss)]
    let now = now as f64;
    if iat > now {
        tracing::debug!(
            target: "auth_gateway.jwt",
            iat = iat,
            now = now,
            "Token iat is in the future"
        );
        return Err(JwtError::IssuedInFuture);
    }
    Ok(())
}
