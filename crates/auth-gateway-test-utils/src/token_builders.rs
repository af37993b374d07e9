//! Builder patterns for test data construction
//!
//! Provides fluent APIs for creating signed inbound tokens and user records.

use crate::test_ids::TEST_JWT_SECRET;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

/// Builder for inbound bearer tokens
///
/// # Example
/// ```rust,ignore
/// let token = TestTokenBuilder::new()
///     .for_login("alice")
///     .with_name("Alice Liddell")
///     .expires_in(3600)
///     .sign();
/// ```
pub struct TestTokenBuilder {
    login: Option<String>,
    name: Option<String>,
    exp: i64,
    iat: i64,
}

impl TestTokenBuilder {
    /// Create a new token builder with defaults (valid for one hour, no login)
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            login: None,
            name: None,
            exp: (now + Duration::seconds(3600)).timestamp(),
            iat: now.timestamp(),
        }
    }

    /// Set the login claim
    pub fn for_login(mut self, login: &str) -> Self {
        self.login = Some(login.to_string());
        self
    }

    /// Set the display name claim
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Set expiration in seconds from now (negative for an expired token)
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp = (Utc::now() + Duration::seconds(seconds)).timestamp();
        self
    }

    /// Set issued-at timestamp
    pub fn issued_at(mut self, timestamp: i64) -> Self {
        self.iat = timestamp;
        self
    }

    /// Build the claims as a JSON value
    pub fn build(self) -> Value {
        let mut claims = json!({
            "exp": self.exp,
            "iat": self.iat,
        });
        if let Some(login) = self.login {
            claims["login"] = Value::String(login);
        }
        if let Some(name) = self.name {
            claims["name"] = Value::String(name);
        }
        claims
    }

    /// Build and sign with the shared test secret
    pub fn sign(self) -> String {
        sign_claims(&self.build(), TEST_JWT_SECRET)
    }
}

impl Default for TestTokenBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sign arbitrary claims with HS256
pub fn sign_claims(claims: &Value, secret: &str) -> String {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("HS256 signing never fails for JSON claims")
}

/// A `get_user` record for `id` with no roles, groups or permissions
pub fn user_record(id: &str) -> Value {
    json!({
        "id": id,
        "roles": [],
        "groups": [],
        "permissions": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_login_and_name() {
        let claims = TestTokenBuilder::new()
            .for_login("alice")
            .with_name("Alice")
            .build();

        assert_eq!(claims["login"], "alice");
        assert_eq!(claims["name"], "Alice");
        assert!(claims["exp"].as_i64().unwrap() > Utc::now().timestamp());
    }

    #[test]
    fn test_builder_default_has_no_login() {
        let claims = TestTokenBuilder::default().build();
        assert!(claims.get("login").is_none());
    }

    #[test]
    fn test_signed_token_has_three_segments() {
        let token = TestTokenBuilder::new().for_login("alice").sign();
        assert_eq!(token.split('.').count(), 3);
    }
}
