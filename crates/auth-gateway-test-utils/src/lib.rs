//! # Auth Gateway Test Utilities
//!
//! Shared test utilities for the auth gateway.
//!
//! This crate provides:
//! - Signed-token builders (TestTokenBuilder)
//! - A mock auth server harness (TestAuthServer, backed by wiremock)
//! - Fixed test constants (secret, client credentials, logins)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use auth_gateway_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = TestAuthServer::start().await;
//!     server.mount_user(TEST_LOGIN_ALICE, user_record(TEST_LOGIN_ALICE)).await;
//!
//!     let token = TestTokenBuilder::new().for_login(TEST_LOGIN_ALICE).sign();
//!     let user = server.gateway().validate(&InboundToken::bearer(token), None).await;
//! }
//! ```

pub mod server_harness;
pub mod test_ids;
pub mod token_builders;

// Re-export commonly used items
pub use server_harness::*;
pub use test_ids::*;
pub use token_builders::*;
