//! Refresh-token exchange with retry and rotation.
//!
//! Transient upstream failures (network errors, timeouts, 5xx, 429 and the
//! configured OAuth error codes) are retried with linear backoff: attempt `n`
//! waits `n * retry_base_delay`. Anything else fails immediately.
//!
//! The tokens a refresh returns are verified before anything is committed.
//! With rotation enabled, a newly issued refresh token replaces the old one:
//! the old token is revoked locally as part of the commit, and upstream in the
//! background. A locally revoked token is refused without contacting the
//! provider.
//!
//! Refreshes of the same token are serialized. A second caller waits for the
//! first and then sees the token as rotated away.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::provider::{IdentityProvider, TokenResponse, UpstreamError};
use super::validator::{
    TokenType, TokenValidator, ValidationError, ValidationOptions, unverified_claims, unverified_expiry,
};
use crate::cache::digest_key;
use crate::clock::{Clock, chrono_duration};
use crate::config::RefreshConfig;
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Refresh errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// The refresh token was revoked here.
    #[error("Refresh token has been revoked")]
    Revoked,

    /// The provider refused the grant; retrying will not help.
    #[error("Refresh rejected: {0}")]
    Rejected(UpstreamError),

    /// Every attempt failed transiently.
    #[error("Refresh failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last upstream error
        last: UpstreamError,
    },

    /// The provider answered without an access token.
    #[error("Malformed refresh response: {0}")]
    MalformedResponse(String),

    /// A returned token failed verification.
    #[error("Refreshed token failed validation: {0}")]
    InvalidToken(#[from] ValidationError),
}

impl RefreshError {
    /// Stable machine-readable reason.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Revoked => "refresh_token_revoked",
            Self::Rejected(_) => "refresh_rejected",
            Self::Exhausted { .. } => "refresh_unavailable",
            Self::MalformedResponse(_) => "malformed_refresh_response",
            Self::InvalidToken(_) => "invalid_refreshed_token",
        }
    }
}

/// Per-call overrides of the configured refresh policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Scope to request instead of the configured one
    pub scope: Option<String>,
    /// Rotate (or keep) the refresh token regardless of configuration
    pub rotation: Option<bool>,
}

/// Result of a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSet {
    /// New access token
    pub access_token: String,
    /// New ID token, if issued
    pub id_token: Option<String>,
    /// Refresh token to use next time (the old one when not rotated)
    pub refresh_token: String,
    /// Token type, usually `Bearer`
    pub token_type: String,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    /// When the refresh completed
    pub refreshed_at: DateTime<Utc>,
    /// Granted scope
    pub scope: Option<String>,
    /// Whether a new refresh token replaced the old one
    pub rotated: bool,
}

/// Whether `token` expires within `threshold` of `now`.
///
/// Tokens whose expiry cannot be read always need refreshing.
#[must_use]
pub fn needs_refresh(token: &str, threshold: Duration, now: DateTime<Utc>) -> bool {
    match unverified_expiry(token) {
        Some(exp) => exp - now <= chrono_duration(threshold),
        None => true,
    }
}

/// Local record of revoked refresh tokens and their successors.
///
/// Tokens are stored as digests, never in the clear.
#[derive(Debug, Default)]
pub struct RefreshTokenRegistry {
    revoked: DashMap<String, DateTime<Utc>>,
    successors: DashMap<String, String>,
}

impl RefreshTokenRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(token: &str) -> String {
        digest_key(&[token.as_bytes()])
    }

    /// Whether `token` was revoked.
    #[must_use]
    pub fn is_revoked(&self, token: &str) -> bool {
        self.revoked.contains_key(&Self::digest(token))
    }

    /// Mark `token` revoked. Returns `false` if it already was.
    pub fn revoke(&self, token: &str, at: DateTime<Utc>) -> bool {
        self.revoked.insert(Self::digest(token), at).is_none()
    }

    /// Record that `new` replaces `old` and revoke `old`.
    ///
    /// Returns `false`, recording nothing, if `old` was already revoked.
    pub fn rotate(&self, old: &str, new: &str, at: DateTime<Utc>) -> bool {
        let old_digest = Self::digest(old);
        match self.revoked.entry(old_digest.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(at);
                self.successors.insert(old_digest, Self::digest(new));
                true
            }
        }
    }

    /// Whether `new` is the recorded successor of `old`.
    #[must_use]
    pub fn is_successor(&self, old: &str, new: &str) -> bool {
        self.successors
            .get(&Self::digest(old))
            .is_some_and(|s| *s == Self::digest(new))
    }

    /// Forget revocations recorded before `cutoff`. Returns how many were dropped.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .revoked
            .iter()
            .filter(|r| *r.value() < cutoff)
            .map(|r| r.key().clone())
            .collect();
        for digest in &stale {
            self.revoked.remove(digest);
            self.successors.remove(digest);
        }
        stale.len()
    }

    /// Revoked tokens tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }
}

/// Exchanges refresh tokens for verified token sets.
pub struct TokenRefresher {
    config: RefreshConfig,
    provider: Arc<dyn IdentityProvider>,
    validator: Arc<TokenValidator>,
    registry: RefreshTokenRegistry,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl TokenRefresher {
    /// Create a refresher.
    #[must_use]
    pub fn new(
        config: RefreshConfig,
        provider: Arc<dyn IdentityProvider>,
        validator: Arc<TokenValidator>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            provider,
            validator,
            registry: RefreshTokenRegistry::new(),
            in_flight: DashMap::new(),
            clock,
            telemetry,
        }
    }

    /// Revocation registry.
    #[must_use]
    pub fn registry(&self) -> &RefreshTokenRegistry {
        &self.registry
    }

    /// Whether `token` should be refreshed now under the configured threshold.
    #[must_use]
    pub fn needs_refresh(&self, token: &str) -> bool {
        needs_refresh(token, self.config.threshold, self.clock.now())
    }

    /// Exchange `refresh_token` for a new, verified token set using the
    /// configured scope and rotation policy.
    ///
    /// # Errors
    ///
    /// See [`RefreshError`].
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, RefreshError> {
        self.refresh_with(refresh_token, &RefreshOptions::default()).await
    }

    /// Exchange `refresh_token`, overriding scope or rotation for this call.
    ///
    /// # Errors
    ///
    /// See [`RefreshError`].
    pub async fn refresh_with(&self, refresh_token: &str, options: &RefreshOptions) -> Result<TokenSet, RefreshError> {
        let digest = RefreshTokenRegistry::digest(refresh_token);
        let lock = Arc::clone(&self.in_flight.entry(digest.clone()).or_default());
        let guard = lock.lock().await;

        let result = self.try_refresh(refresh_token, options).await;

        drop(guard);
        drop(lock);
        self.in_flight.remove_if(&digest, |_, lock| Arc::strong_count(lock) == 1);

        match &result {
            Ok(set) => {
                info!(rotated = set.rotated, expires_at = %set.expires_at, "Token refreshed");
                self.telemetry.track(
                    TelemetryEvent::new(events::TOKEN_REFRESHED)
                        .with("rotated", set.rotated)
                        .measure(
                            "expires_in_secs",
                            (set.expires_at - set.refreshed_at).num_seconds() as f64,
                        ),
                );
            }
            Err(e) => {
                warn!(reason = e.code(), error = %e, "Token refresh failed");
                self.telemetry
                    .track(TelemetryEvent::new(events::TOKEN_REFRESH_FAILED).with("reason", e.code()));
            }
        }
        result
    }

    /// Revoke `refresh_token` locally, then upstream.
    ///
    /// Upstream failure is logged; the local revocation stands regardless.
    pub async fn revoke(&self, refresh_token: &str) {
        let now = self.clock.now();
        self.registry.revoke(refresh_token, now);
        revoke_upstream(&*self.provider, &*self.telemetry, refresh_token, "explicit").await;
    }

    /// Refreshes currently holding a per-token lock.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn try_refresh(&self, refresh_token: &str, options: &RefreshOptions) -> Result<TokenSet, RefreshError> {
        if self.registry.is_revoked(refresh_token) {
            return Err(RefreshError::Revoked);
        }

        let scope = options.scope.as_deref().unwrap_or(&self.config.scope);
        let response = self.grant_with_retry(refresh_token, scope).await?;
        let access_token = response
            .access_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshError::MalformedResponse("no access_token".to_string()))?;

        let expires_at = self.verify_response(&response, &access_token).await?;

        let now = self.clock.now();
        let new_refresh = response.refresh_token.clone().filter(|t| !t.is_empty());
        let rotation = options.rotation.unwrap_or(self.config.rotation);
        let rotated = rotation && new_refresh.as_deref().is_some_and(|t| t != refresh_token);

        if rotated {
            if let Some(new) = &new_refresh {
                if !self.registry.rotate(refresh_token, new, now) {
                    return Err(RefreshError::Revoked);
                }
                self.spawn_upstream_revoke(refresh_token);
            }
        }

        Ok(TokenSet {
            access_token,
            id_token: response.id_token,
            refresh_token: new_refresh.unwrap_or_else(|| refresh_token.to_string()),
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            refreshed_at: now,
            scope: response.scope,
            rotated,
        })
    }

    /// Verify the returned tokens and return the access token expiry.
    ///
    /// The access token is always verified. An ID token, when present, is
    /// verified too, must not be an access token, and must bind the access
    /// token if it carries `at_hash`.
    async fn verify_response(&self, response: &TokenResponse, access_token: &str) -> Result<DateTime<Utc>, RefreshError> {
        let access = self.validator.validate(access_token, &ValidationOptions::default()).await?;

        if let Some(id_token) = &response.id_token {
            let binds_access = unverified_claims(id_token).is_ok_and(|c| c.contains_key("at_hash"));
            let options = ValidationOptions {
                access_token: binds_access.then(|| access_token.to_string()),
                ..ValidationOptions::default()
            };
            let id = self.validator.validate(id_token, &options).await?;
            if id.token_type == TokenType::Access {
                return Err(ValidationError::WrongTokenType {
                    expected: TokenType::Id,
                    actual: id.token_type,
                }
                .into());
            }
        }

        Ok(access.expires_at)
    }

    async fn grant_with_retry(&self, refresh_token: &str, scope: &str) -> Result<TokenResponse, RefreshError> {
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.telemetry
                .track(TelemetryEvent::new(events::TOKEN_REFRESH_ATTEMPT).measure("attempt", f64::from(attempt)));

            let outcome = timeout(self.config.request_timeout, self.provider.refresh_grant(refresh_token, scope))
                .await
                .unwrap_or_else(|_| {
                    Err(UpstreamError::Network(format!(
                        "refresh grant timed out after {:?}",
                        self.config.request_timeout
                    )))
                });

            match outcome {
                Ok(response) => return Ok(response),
                Err(e) if !self.is_transient(&e) => return Err(RefreshError::Rejected(e)),
                Err(e) if attempt >= max_attempts => {
                    debug!(attempts = attempt, "Max refresh attempts reached");
                    return Err(RefreshError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.config.retry_base_delay.saturating_mul(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying refresh after backoff"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn is_transient(&self, error: &UpstreamError) -> bool {
        match error {
            UpstreamError::Network(_) => true,
            UpstreamError::Status { status, error_code, .. } => {
                *status >= 500
                    || *status == 429
                    || error_code
                        .as_ref()
                        .is_some_and(|c| self.config.transient_error_codes.contains(c))
            }
            UpstreamError::InvalidResponse(_) => false,
        }
    }

    /// Revoke a rotated-away token upstream without holding up the caller.
    ///
    /// The local revocation is already committed, so cancelling or failing
    /// this task only leaves the provider-side token to expire on its own.
    fn spawn_upstream_revoke(&self, refresh_token: &str) {
        let provider = Arc::clone(&self.provider);
        let telemetry = Arc::clone(&self.telemetry);
        let token = refresh_token.to_string();
        tokio::spawn(async move {
            revoke_upstream(&*provider, &*telemetry, &token, "rotation").await;
        });
    }
}

async fn revoke_upstream(
    provider: &dyn IdentityProvider,
    telemetry: &dyn TelemetrySink,
    refresh_token: &str,
    trigger: &'static str,
) {
    match provider.revoke(refresh_token).await {
        Ok(()) => debug!(trigger, "Refresh token revoked upstream"),
        Err(e) => warn!(trigger, error = %e, "Upstream revocation failed"),
    }
    telemetry.track(TelemetryEvent::new(events::TOKEN_REVOKED).with("trigger", trigger));
}
