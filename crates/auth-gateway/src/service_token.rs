//! Service token lifecycle.
//!
//! The gateway holds one long-lived credential of its own (the service
//! token) for server-to-server calls. [`ServiceTokenManager`] stores it,
//! hands it out while it is fresh, and renews it on demand. The background
//! [`run_renewal_loop`] renews it ahead of expiry, independently of request
//! traffic.
//!
//! # Features
//!
//! - Atomic replacement via `tokio::sync::watch` (lock-free reads)
//! - Renewals are serialised: concurrent callers that find the token stale
//!   wait for the in-flight renewal and share its result
//! - Forced renewal after the auth server rejects the credential, skipped if
//!   another task already replaced the rejected credential
//! - Renewal loop never exits on remote errors; only cancellation stops it
//!
//! # Security
//!
//! - Client password and token are stored as `SecretString`
//! - Only a short prefix of an issued token is ever logged

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::secret::{token_prefix, ExposeSecret, SecretString};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// =============================================================================
// Constants
// =============================================================================

/// A token is renewed once it is this close to expiry.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Renewal loop pause after the auth server could not be reached.
pub const DEFAULT_UNREACHABLE_DELAY: Duration = Duration::from_secs(10);

/// Renewal loop pause after any other renewal failure.
pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_secs(30);

/// Shortest sleep between two scheduled renewals.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

// =============================================================================
// Types
// =============================================================================

/// Client identity used to request service tokens.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_password: SecretString,
}

impl ClientCredentials {
    /// Credentials from configuration, if both id and password are set.
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Option<Self> {
        Some(Self {
            client_id: config.client_id.clone()?,
            client_password: config.client_password.clone()?,
        })
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_password", &"[REDACTED]")
            .finish()
    }
}

/// The gateway's current service credential.
///
/// Replaced as a whole on every renewal, never partially updated.
#[derive(Clone, Debug)]
pub struct ServiceToken {
    credential: SecretString,
    expires_at: i64,
}

impl ServiceToken {
    /// Create a token expiring at `expires_at` (Unix epoch seconds).
    #[must_use]
    pub fn new(credential: SecretString, expires_at: i64) -> Self {
        Self {
            credential,
            expires_at,
        }
    }

    #[must_use]
    pub fn credential(&self) -> &SecretString {
        &self.credential
    }

    /// Expiry as Unix epoch seconds.
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// True if the token outlives `now` by more than `margin`.
    #[must_use]
    pub fn is_fresh_at(&self, now: i64, margin: Duration) -> bool {
        #[allow(clippy::cast_possible_wrap)]
        let margin_secs = margin.as_secs() as i64;
        self.expires_at - margin_secs > now
    }
}

/// Source of new service tokens.
///
/// Implemented by the remote dispatcher; mocked in tests.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Request a fresh service token for `credentials`.
    async fn issue_service_token(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<ServiceToken, GatewayError>;
}

/// Timing of the renewal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalSchedule {
    /// Renew this long before expiry.
    pub safety_margin: Duration,
    /// Pause after the auth server was unreachable.
    pub unreachable_delay: Duration,
    /// Pause after any other failure.
    pub failure_delay: Duration,
}

impl Default for RenewalSchedule {
    fn default() -> Self {
        Self {
            safety_margin: DEFAULT_SAFETY_MARGIN,
            unreachable_delay: DEFAULT_UNREACHABLE_DELAY,
            failure_delay: DEFAULT_FAILURE_DELAY,
        }
    }
}

impl RenewalSchedule {
    /// Sleep before renewing `token`, measured from `now`.
    #[must_use]
    pub fn renewal_delay(&self, token: &ServiceToken, now: i64) -> Duration {
        #[allow(clippy::cast_possible_wrap)]
        let margin_secs = self.safety_margin.as_secs() as i64;
        let sleep_secs = token.expires_at - now - margin_secs;
        #[allow(clippy::cast_sign_loss)]
        let delay = Duration::from_secs(sleep_secs.max(0) as u64);
        delay.max(MIN_RENEWAL_DELAY)
    }

    /// Pause after a failed renewal.
    #[must_use]
    pub fn retry_delay(&self, error: &GatewayError) -> Duration {
        match error {
            GatewayError::Unreachable(_) => self.unreachable_delay,
            _ => self.failure_delay,
        }
    }
}

// =============================================================================
// Service Token Manager
// =============================================================================

/// Owner of the gateway's service token.
///
/// Without client credentials the manager is inert: every accessor fails with
/// a configuration error and the renewal loop does not run.
pub struct ServiceTokenManager {
    credentials: Option<ClientCredentials>,
    current: watch::Sender<Option<ServiceToken>>,
    renewal: Mutex<()>,
    schedule: RenewalSchedule,
}

impl fmt::Debug for ServiceTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceTokenManager")
            .field("credentials", &self.credentials)
            .field("token", &"[REDACTED]")
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl ServiceTokenManager {
    /// Create a manager. `None` credentials make it inert.
    #[must_use]
    pub fn new(credentials: Option<ClientCredentials>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            credentials,
            current,
            renewal: Mutex::new(()),
            schedule: RenewalSchedule::default(),
        }
    }

    /// Override the renewal schedule.
    #[must_use]
    pub fn with_schedule(mut self, schedule: RenewalSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    #[must_use]
    pub fn schedule(&self) -> &RenewalSchedule {
        &self.schedule
    }

    /// True if client credentials are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    /// Watch token replacements.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ServiceToken>> {
        self.current.subscribe()
    }

    /// The stored token, fresh or not.
    #[must_use]
    pub fn current(&self) -> Option<ServiceToken> {
        self.current.borrow().clone()
    }

    fn fresh_credential(&self) -> Option<SecretString> {
        let now = chrono::Utc::now().timestamp();
        self.current
            .borrow()
            .as_ref()
            .filter(|token| token.is_fresh_at(now, self.schedule.safety_margin))
            .map(|token| token.credential.clone())
    }

    fn credentials(&self) -> Result<&ClientCredentials, GatewayError> {
        self.credentials.as_ref().ok_or_else(|| {
            GatewayError::Configuration("Service token credentials are not configured".into())
        })
    }

    /// Get a credential valid for at least the safety margin.
    ///
    /// Renews synchronously when the stored token is missing or about to
    /// expire. Concurrent callers share a single renewal.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Configuration` - manager is inert
    /// - any error of the renewal request
    pub async fn get_token<I>(&self, issuer: &I) -> Result<SecretString, GatewayError>
    where
        I: TokenIssuer + ?Sized,
    {
        let credentials = self.credentials()?;
        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }

        let _guard = self.renewal.lock().await;
        // Another caller may have renewed while we waited
        if let Some(credential) = self.fresh_credential() {
            return Ok(credential);
        }
        let token = self.renew_locked(issuer, credentials).await?;
        Ok(token.credential)
    }

    /// Unconditionally request a new token and store it.
    ///
    /// On failure the stored token is left untouched.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Configuration` - manager is inert
    /// - any error of the renewal request
    pub async fn renew<I>(&self, issuer: &I) -> Result<ServiceToken, GatewayError>
    where
        I: TokenIssuer + ?Sized,
    {
        let credentials = self.credentials()?;
        let _guard = self.renewal.lock().await;
        self.renew_locked(issuer, credentials).await
    }

    /// Renew after the auth server rejected `stale`.
    ///
    /// If the stored credential already differs from `stale` (another task
    /// renewed it) and is fresh, it is returned without a new request. With no
    /// `stale` credential to compare against, always renews.
    ///
    /// # Errors
    ///
    /// - `GatewayError::Configuration` - manager is inert
    /// - any error of the renewal request
    pub async fn force_renew<I>(
        &self,
        issuer: &I,
        stale: Option<&str>,
    ) -> Result<SecretString, GatewayError>
    where
        I: TokenIssuer + ?Sized,
    {
        let credentials = self.credentials()?;
        let _guard = self.renewal.lock().await;

        if let (Some(stale), Some(fresh)) = (stale, self.fresh_credential()) {
            if fresh.expose_secret() != stale {
                debug!(
                    target: "auth_gateway.service_token",
                    "Rejected service token already replaced"
                );
                return Ok(fresh);
            }
        }

        warn!(
            target: "auth_gateway.service_token",
            "Invalid service token, refreshing"
        );
        let token = self.renew_locked(issuer, credentials).await?;
        Ok(token.credential)
    }

    /// Caller must hold `self.renewal`.
    async fn renew_locked<I>(
        &self,
        issuer: &I,
        credentials: &ClientCredentials,
    ) -> Result<ServiceToken, GatewayError>
    where
        I: TokenIssuer + ?Sized,
    {
        debug!(
            target: "auth_gateway.service_token",
            client_id = %credentials.client_id,
            "Getting new service token"
        );

        let token = issuer.issue_service_token(credentials).await?;

        debug!(
            target: "auth_gateway.service_token",
            client_id = %credentials.client_id,
            token = %token_prefix(token.credential.expose_secret()),
            expires_at = token.expires_at,
            "New service token issued"
        );

        self.current.send_replace(Some(token.clone()));
        Ok(token)
    }
}

// =============================================================================
// Renewal Loop
// =============================================================================

/// Keep the service token renewed until `cancel` fires.
///
/// Renews, sleeps until `safety_margin` before expiry, renews again. Failures
/// never end the loop: an unreachable auth server is retried after
/// `unreachable_delay`, any other error after `failure_delay`. Both the
/// renewal request and the sleep are raced against cancellation.
///
/// Returns immediately if the manager is inert.
#[instrument(skip_all, name = "auth_gateway.task.service_token_renewal")]
pub async fn run_renewal_loop<I>(
    manager: Arc<ServiceTokenManager>,
    issuer: Arc<I>,
    cancel: CancellationToken,
) where
    I: TokenIssuer + ?Sized,
{
    if !manager.is_configured() {
        debug!(
            target: "auth_gateway.service_token",
            "Service token credentials not configured, renewal loop not started"
        );
        return;
    }

    info!(
        target: "auth_gateway.service_token",
        safety_margin_secs = manager.schedule.safety_margin.as_secs(),
        "Starting service token renewal loop"
    );

    loop {
        debug!(target: "auth_gateway.service_token", "Renew token");

        let outcome = tokio::select! {
            result = manager.renew(issuer.as_ref()) => result,
            () = cancel.cancelled() => break,
        };

        let delay = match outcome {
            Ok(token) => manager
                .schedule
                .renewal_delay(&token, chrono::Utc::now().timestamp()),
            Err(e) => {
                let delay = manager.schedule.retry_delay(&e);
                if matches!(e, GatewayError::Unreachable(_)) {
                    warn!(
                        target: "auth_gateway.service_token",
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Could not connect to auth server, service token not renewed"
                    );
                } else {
                    warn!(
                        target: "auth_gateway.service_token",
                        error = %e,
                        retry_in_secs = delay.as_secs(),
                        "Error renewing service token"
                    );
                }
                delay
            }
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => break,
        }
    }

    info!(
        target: "auth_gateway.service_token",
        "Service token renewal loop stopped"
    );
}

// =============================================================================
// Tests
// =============================================================================
