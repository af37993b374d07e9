//! Authentication gateway client.
//!
//! Authenticates inbound bearer credentials against a remote auth server,
//! caches validation results, and keeps the gateway's own service token
//! renewed for server-to-server calls.
//!
//! Start with [`AuthGateway`]: build it once from a [`GatewayConfig`], spawn
//! its renewal loop, and share clones of it with request handlers.

#![warn(clippy::pedantic)]

/// Module for the time-bucketed validated-user cache
pub mod cache;

/// Module for the gateway handle and convenience calls
pub mod client;

/// Module for gateway configuration
pub mod config;

/// Module for the remote-call dispatcher with retry/backoff
pub mod dispatcher;

/// Module for gateway error types
pub mod error;

/// Module for shared-secret JWT decoding
pub mod jwt;

/// Module for the static auth server operation table
pub mod operations;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for the service token lifecycle and renewal loop
pub mod service_token;

/// Module for validated user records
pub mod user;

/// Module for the inbound token validation pipeline
pub mod validator;

pub use client::{AuthGateway, NewUser, RequestContext, SearchQuery};
pub use config::GatewayConfig;
pub use error::{DependencyFailure, GatewayError};
pub use operations::Operation;
pub use user::ValidatedUser;
pub use validator::InboundToken;
