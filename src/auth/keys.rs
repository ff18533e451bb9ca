//! Signing key resolution.
//!
//! Keys come from the identity provider's published key set (JWKS) and are
//! cached by key id. A cache miss triggers at most one upstream fetch per
//! lookup; fetches are single-flight and capped per minute. Keys are evicted
//! after the cache TTL or, when the cache is full, oldest inserted first.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter as GovernorLimiter};
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use tracing::{debug, info, warn};

use crate::cache::{CacheStatsSnapshot, TtlCache};
use crate::clock::{Clock, chrono_duration};
use crate::config::KeyResolverConfig;
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Key resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFetchError {
    /// The key id is not in the published key set, even after a refetch.
    #[error("Unknown signing key id: {0}")]
    UnknownKeyId(String),

    /// The upstream key set could not be fetched or parsed.
    #[error("Key set fetch failed: {0}")]
    Upstream(String),

    /// The upstream fetch did not finish in time.
    #[error("Key set fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The per-minute fetch cap was reached.
    #[error("Key set fetch rate limit reached")]
    RateLimited,
}

/// A verification key resolved from the key set.
#[derive(Clone)]
pub struct SigningKey {
    /// Key id
    pub kid: String,
    /// Key material
    pub key: DecodingKey,
    /// When the key set containing it was fetched
    pub fetched_at: DateTime<Utc>,
    /// When the cached copy expires
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("fetched_at", &self.fetched_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Where key sets come from.
#[async_trait]
pub trait JwksSource: Send + Sync + 'static {
    /// Fetch the full key set.
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError>;
}

/// Fetches the key set over HTTP.
pub struct HttpJwksSource {
    http: reqwest::Client,
    uri: String,
}

impl HttpJwksSource {
    /// Source for `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if the HTTP client cannot be built.
    pub fn new(uri: impl Into<String>, timeout: Duration) -> crate::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            uri: uri.into(),
        })
    }
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<JwkSet, KeyFetchError> {
        debug!(uri = %self.uri, "Fetching key set");
        let response = self
            .http
            .get(&self.uri)
            .send()
            .await
            .map_err(|e| KeyFetchError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyFetchError::Upstream(format!("HTTP {status} from {}", self.uri)));
        }
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| KeyFetchError::Upstream(format!("invalid key set: {e}")))
    }
}

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Resolves key ids to verification keys.
pub struct KeyResolver {
    source: Arc<dyn JwksSource>,
    cache: TtlCache<SigningKey>,
    config: KeyResolverConfig,
    fetch_limiter: DirectLimiter,
    fetch_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl KeyResolver {
    /// Create a resolver over `source`.
    #[must_use]
    pub fn new(
        config: KeyResolverConfig,
        source: Arc<dyn JwksSource>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(config.fetches_per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            source,
            cache: TtlCache::new(config.cache_capacity),
            fetch_limiter: GovernorLimiter::direct(quota),
            fetch_lock: tokio::sync::Mutex::new(()),
            config,
            clock,
            telemetry,
        }
    }

    /// Resolver fetching from the configured key-set URL.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if the HTTP client cannot be built.
    pub fn from_config(
        config: KeyResolverConfig,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> crate::Result<Self> {
        let source = Arc::new(HttpJwksSource::new(config.resolved_jwks_uri(), config.fetch_timeout)?);
        Ok(Self::new(config, source, clock, telemetry))
    }

    /// Verification key for `kid`.
    ///
    /// # Errors
    ///
    /// [`KeyFetchError::UnknownKeyId`] if the id is absent after one refetch,
    /// or the fetch error if the key set could not be obtained.
    pub async fn get_signing_key(&self, kid: &str) -> Result<SigningKey, KeyFetchError> {
        if let Some(key) = self.cache.get(kid, self.clock.now()) {
            return Ok(key);
        }

        let _fetching = self.fetch_lock.lock().await;
        // another task may have fetched while we waited
        if let Some(key) = self.cache.get(kid, self.clock.now()) {
            return Ok(key);
        }

        self.fetch_and_cache().await?;
        self.cache.get(kid, self.clock.now()).ok_or_else(|| {
            warn!(kid, "Signing key not in key set");
            KeyFetchError::UnknownKeyId(kid.to_string())
        })
    }

    /// Prefetch the key set. Returns the number of usable keys cached.
    ///
    /// # Errors
    ///
    /// Returns the fetch error if the key set could not be obtained.
    pub async fn warm(&self) -> Result<usize, KeyFetchError> {
        let _fetching = self.fetch_lock.lock().await;
        self.fetch_and_cache().await
    }

    /// Evict expired keys. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired(self.clock.now())
    }

    /// Key cache statistics.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    async fn fetch_and_cache(&self) -> Result<usize, KeyFetchError> {
        if self.fetch_limiter.check().is_err() {
            warn!("Key set fetch cap reached");
            return Err(KeyFetchError::RateLimited);
        }

        let started = Instant::now();
        let set = match tokio::time::timeout(self.config.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result?,
            Err(_) => return Err(KeyFetchError::Timeout(self.config.fetch_timeout)),
        };

        let now = self.clock.now();
        let expires_at = now + chrono_duration(self.config.cache_ttl);
        let mut cached = 0;
        for jwk in &set.keys {
            let Some(kid) = jwk.common.key_id.as_deref() else {
                continue;
            };
            match decoding_key(jwk) {
                Some(key) => {
                    self.cache.insert(
                        kid,
                        SigningKey {
                            kid: kid.to_string(),
                            key,
                            fetched_at: now,
                            expires_at,
                        },
                        expires_at,
                    );
                    cached += 1;
                }
                None => debug!(kid, "Skipping unusable key"),
            }
        }

        let latency = started.elapsed();
        info!(keys = cached, latency_ms = latency.as_millis() as u64, "Key set fetched");
        self.telemetry.track(
            TelemetryEvent::new(events::KEYS_FETCHED)
                .measure("keys", cached as f64)
                .measure("latency_ms", latency.as_secs_f64() * 1000.0),
        );
        Ok(cached)
    }
}

/// Convert a JWK to a [`DecodingKey`]. Symmetric keys are never accepted.
fn decoding_key(jwk: &Jwk) -> Option<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}
