//! Bearer token validation.
//!
//! A token is verified in a fixed order: header `kid` → signing key →
//! signature (one configured algorithm, never `none`) → issuer, audience and
//! time claims (with clock-skew tolerance) → caller policy (token type, nonce,
//! `amr`, `acr`, `at_hash`) → user profile. Successful results are cached by
//! a digest of the token and the options, for no longer than the token lives.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use super::keys::{KeyFetchError, KeyResolver};
use crate::cache::{CacheStatsSnapshot, TtlCache, digest_key};
use crate::clock::{Clock, chrono_duration};
use crate::config::{ClaimMappingConfig, ValidatorConfig};
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Token validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Not a structurally valid signed token.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Header carries no `kid`.
    #[error("Token header has no key id")]
    MissingKeyId,

    /// Header algorithm differs from the configured one.
    #[error("Unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signing key could not be resolved.
    #[error(transparent)]
    Key(#[from] KeyFetchError),

    /// Signature does not verify.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// `exp` is in the past beyond the skew tolerance.
    #[error("Token expired at {0}")]
    Expired(DateTime<Utc>),

    /// `nbf` is in the future beyond the skew tolerance.
    #[error("Token not valid before {0}")]
    NotYetValid(DateTime<Utc>),

    /// A required claim is absent.
    #[error("Missing required claim: {0}")]
    MissingClaim(&'static str),

    /// `iss` differs from the configured issuer.
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// `aud` matches none of the accepted audiences.
    #[error("Invalid audience")]
    InvalidAudience,

    /// Inferred token type differs from the expected one.
    #[error("Expected {expected:?} token, got {actual:?}")]
    WrongTokenType {
        /// Required type
        expected: TokenType,
        /// Inferred type
        actual: TokenType,
    },

    /// `nonce` differs from the expected one.
    #[error("Nonce mismatch")]
    NonceMismatch,

    /// A required authentication method is absent from `amr`.
    #[error("Required authentication method not present: {0}")]
    AmrNotSatisfied(String),

    /// `acr` differs from the required context class.
    #[error("Required authentication context {required} not satisfied")]
    AcrNotSatisfied {
        /// Required `acr`
        required: String,
    },

    /// `at_hash` does not bind the presented access token.
    #[error("Access token hash mismatch")]
    AtHashMismatch,
}

impl ValidationError {
    /// Whether the token was rejected only for being past its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired(_))
    }

    /// Stable machine-readable reason.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) | Self::MissingKeyId => "malformed_token",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::Key(KeyFetchError::UnknownKeyId(_)) => "unknown_key",
            Self::Key(_) => "key_unavailable",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired(_) => "token_expired",
            Self::NotYetValid(_) => "token_not_yet_valid",
            Self::MissingClaim(_) => "missing_claim",
            Self::InvalidIssuer(_) => "invalid_issuer",
            Self::InvalidAudience => "invalid_audience",
            Self::WrongTokenType { .. } => "wrong_token_type",
            Self::NonceMismatch => "nonce_mismatch",
            Self::AmrNotSatisfied(_) => "amr_not_satisfied",
            Self::AcrNotSatisfied { .. } => "acr_not_satisfied",
            Self::AtHashMismatch => "at_hash_mismatch",
        }
    }
}

/// Kind of token, inferred from its claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// ID token: audience is this client and it carries `nonce` or `at_hash`
    Id,
    /// Access token: carries `scp` or `scope`
    Access,
    /// Neither
    Unknown,
}

/// Per-call validation policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationOptions {
    /// Require this token type
    pub expected_type: Option<TokenType>,
    /// Require this `nonce`
    pub nonce: Option<String>,
    /// Require each of these authentication methods in `amr`
    pub required_amr: Vec<String>,
    /// Require this `acr`
    pub required_acr: Option<String>,
    /// Companion access token; `at_hash` must bind it
    pub access_token: Option<String>,
    /// Accept only this audience instead of the configured ones
    pub audience: Option<String>,
}

/// User identity derived from claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Stable user id
    pub id: String,
    /// Email, if any candidate claim carried one
    pub email: Option<String>,
    /// Display name
    pub display_name: Option<String>,
    /// Custom organizational attributes
    pub attributes: BTreeMap<String, String>,
}

/// A validated token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Inferred token type
    pub token_type: TokenType,
    /// Verified claims
    pub claims: Map<String, Value>,
    /// Derived user profile
    pub user: UserProfile,
    /// `iat`, if present
    pub issued_at: Option<DateTime<Utc>>,
    /// `exp`
    pub expires_at: DateTime<Utc>,
    /// Time spent validating (cache lookups included)
    pub latency: Duration,
    /// Served from the validation cache
    pub cached: bool,
}

impl ValidationResult {
    /// Remaining lifetime at `now`, zero if past.
    #[must_use]
    pub fn expires_in(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Validator counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidatorStats {
    /// Full signature verifications performed
    pub verifications: u64,
    /// Validation cache statistics
    pub cache: CacheStatsSnapshot,
}

/// Validates bearer tokens against the resolved signing keys.
pub struct TokenValidator {
    config: ValidatorConfig,
    algorithm: Algorithm,
    keys: Arc<KeyResolver>,
    cache: TtlCache<ValidationResult>,
    verifications: AtomicU64,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl TokenValidator {
    /// Create a validator.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnsupportedAlgorithm`] if the configured
    /// algorithm is unknown or symmetric.
    pub fn new(
        config: ValidatorConfig,
        keys: Arc<KeyResolver>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, ValidationError> {
        let algorithm = Algorithm::from_str(&config.algorithm)
            .map_err(|_| ValidationError::UnsupportedAlgorithm(config.algorithm.clone()))?;
        if matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(ValidationError::UnsupportedAlgorithm(config.algorithm.clone()));
        }

        Ok(Self {
            cache: TtlCache::new(config.cache_capacity),
            config,
            algorithm,
            keys,
            verifications: AtomicU64::new(0),
            clock,
            telemetry,
        })
    }

    /// Validate `token` under `options`.
    ///
    /// # Errors
    ///
    /// Returns the first check that failed; see [`ValidationError`].
    pub async fn validate(
        &self,
        token: &str,
        options: &ValidationOptions,
    ) -> Result<ValidationResult, ValidationError> {
        let started = Instant::now();
        let cache_key = cache_key(token, options);

        if let Some(mut hit) = self.cache.get(&cache_key, self.clock.now()) {
            hit.cached = true;
            hit.latency = started.elapsed();
            return Ok(hit);
        }

        match self.verify(token, options, started).await {
            Ok(result) => {
                let ttl_bound = self.clock.now() + chrono_duration(self.config.cache_ttl);
                self.cache
                    .insert(&cache_key, result.clone(), result.expires_at.min(ttl_bound));

                debug!(user_id = %result.user.id, token_type = ?result.token_type, "Token validated");
                self.telemetry.track(
                    TelemetryEvent::new(events::TOKEN_VALIDATED)
                        .with("user_id", &result.user.id)
                        .with("token_type", format!("{:?}", result.token_type).to_lowercase())
                        .measure("latency_ms", result.latency.as_secs_f64() * 1000.0),
                );
                Ok(result)
            }
            Err(e) => {
                warn!(reason = e.code(), error = %e, "Token rejected");
                self.telemetry.track(
                    TelemetryEvent::new(events::TOKEN_VALIDATION_FAILED)
                        .with("reason", e.code())
                        .measure("latency_ms", started.elapsed().as_secs_f64() * 1000.0),
                );
                Err(e)
            }
        }
    }

    /// Evict expired validation results. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.cache.evict_expired(self.clock.now())
    }

    /// Validator counters.
    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            verifications: self.verifications.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    async fn verify(
        &self,
        token: &str,
        options: &ValidationOptions,
        started: Instant,
    ) -> Result<ValidationResult, ValidationError> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        if header.alg != self.algorithm {
            return Err(ValidationError::UnsupportedAlgorithm(format!("{:?}", header.alg)));
        }
        let kid = header.kid.ok_or(ValidationError::MissingKeyId)?;
        let signing_key = self.keys.get_signing_key(&kid).await?;

        let mut validation = Validation::new(self.algorithm);
        // time and audience claims are checked below against the injected clock
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        self.verifications.fetch_add(1, Ordering::Relaxed);
        let claims = jsonwebtoken::decode::<Map<String, Value>>(token, &signing_key.key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => ValidationError::InvalidSignature,
                _ => ValidationError::Malformed(e.to_string()),
            })?
            .claims;

        let now = self.clock.now();
        let skew = chrono_duration(self.config.clock_skew);

        if let Some(expected) = &self.config.issuer {
            match claims.get("iss").and_then(Value::as_str) {
                Some(iss) if iss == expected => {}
                Some(iss) => return Err(ValidationError::InvalidIssuer(iss.to_string())),
                None => return Err(ValidationError::MissingClaim("iss")),
            }
        }

        let accepted: Vec<String> = match &options.audience {
            Some(aud) => vec![aud.clone()],
            None => self.config.audiences.clone(),
        };
        if !accepted.is_empty() && !audience_matches(claims.get("aud"), &accepted) {
            return Err(ValidationError::InvalidAudience);
        }

        let expires_at = timestamp_claim(&claims, "exp").ok_or(ValidationError::MissingClaim("exp"))?;
        if now > expires_at + skew {
            return Err(ValidationError::Expired(expires_at));
        }
        if let Some(not_before) = timestamp_claim(&claims, "nbf") {
            if now + skew < not_before {
                return Err(ValidationError::NotYetValid(not_before));
            }
        }

        let token_type = infer_token_type(&claims, self.config.client_id.as_deref());
        if let Some(expected) = options.expected_type {
            if expected != token_type {
                return Err(ValidationError::WrongTokenType {
                    expected,
                    actual: token_type,
                });
            }
        }

        check_policy(&claims, options, self.algorithm)?;

        let user = derive_profile(&claims, &self.config.claims)?;

        Ok(ValidationResult {
            token_type,
            issued_at: timestamp_claim(&claims, "iat"),
            claims,
            user,
            expires_at,
            latency: started.elapsed(),
            cached: false,
        })
    }
}

fn cache_key(token: &str, options: &ValidationOptions) -> String {
    let options = serde_json::to_vec(options).unwrap_or_default();
    digest_key(&[token.as_bytes(), &options])
}

/// `nonce`, `amr`, `acr` and `at_hash` checks.
fn check_policy(
    claims: &Map<String, Value>,
    options: &ValidationOptions,
    algorithm: Algorithm,
) -> Result<(), ValidationError> {
    if let Some(expected) = &options.nonce {
        let nonce = claims
            .get("nonce")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingClaim("nonce"))?;
        if !bool::from(nonce.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(ValidationError::NonceMismatch);
        }
    }

    if !options.required_amr.is_empty() {
        let amr: Vec<&str> = claims
            .get("amr")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(missing) = options
            .required_amr
            .iter()
            .find(|m| !amr.contains(&m.as_str()))
        {
            return Err(ValidationError::AmrNotSatisfied(missing.clone()));
        }
    }

    if let Some(required) = &options.required_acr {
        if claims.get("acr").and_then(Value::as_str) != Some(required.as_str()) {
            return Err(ValidationError::AcrNotSatisfied {
                required: required.clone(),
            });
        }
    }

    if let Some(access_token) = &options.access_token {
        let at_hash = claims
            .get("at_hash")
            .and_then(Value::as_str)
            .ok_or(ValidationError::MissingClaim("at_hash"))?;
        let expected = access_token_hash(access_token, algorithm);
        if !bool::from(at_hash.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(ValidationError::AtHashMismatch);
        }
    }
    Ok(())
}

/// `at_hash` for `access_token`: left half of the digest matching the
/// signing algorithm's hash size, base64url without padding.
#[must_use]
pub fn access_token_hash(access_token: &str, algorithm: Algorithm) -> String {
    let digest: Vec<u8> = match algorithm {
        Algorithm::RS384 | Algorithm::PS384 | Algorithm::ES384 | Algorithm::HS384 => {
            Sha384::digest(access_token.as_bytes()).to_vec()
        }
        Algorithm::RS512 | Algorithm::PS512 | Algorithm::HS512 => Sha512::digest(access_token.as_bytes()).to_vec(),
        _ => Sha256::digest(access_token.as_bytes()).to_vec(),
    };
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// Infer the token type from its claims.
#[must_use]
pub fn infer_token_type(claims: &Map<String, Value>, client_id: Option<&str>) -> TokenType {
    let for_this_client = client_id.is_some_and(|id| audience_matches(claims.get("aud"), &[id.to_string()]));
    if for_this_client && (claims.contains_key("nonce") || claims.contains_key("at_hash")) {
        TokenType::Id
    } else if claims.contains_key("scp") || claims.contains_key("scope") {
        TokenType::Access
    } else {
        TokenType::Unknown
    }
}

/// Whether `aud` (string or array) contains one of `accepted`.
fn audience_matches(aud: Option<&Value>, accepted: &[String]) -> bool {
    match aud {
        Some(Value::String(s)) => accepted.iter().any(|a| a == s),
        Some(Value::Array(values)) => values
            .iter()
            .any(|v| v.as_str().is_some_and(|s| accepted.iter().any(|a| a == s))),
        _ => false,
    }
}

fn timestamp_claim(claims: &Map<String, Value>, name: &str) -> Option<DateTime<Utc>> {
    let secs = match claims.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

/// First non-empty string among candidate claims. Arrays yield their first string.
fn first_claim(claims: &Map<String, Value>, candidates: &[String]) -> Option<String> {
    candidates.iter().find_map(|name| match claims.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(values) => values
            .iter()
            .filter_map(Value::as_str)
            .find(|s| !s.is_empty())
            .map(ToString::to_string),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Derive the user profile using the ordered candidate claim names.
///
/// # Errors
///
/// Returns [`ValidationError::MissingClaim`] when no user id candidate is present.
pub fn derive_profile(
    claims: &Map<String, Value>,
    mapping: &ClaimMappingConfig,
) -> Result<UserProfile, ValidationError> {
    let id = first_claim(claims, &mapping.user_id).ok_or(ValidationError::MissingClaim("sub"))?;
    let attributes = mapping
        .attributes
        .iter()
        .filter_map(|(name, candidates)| first_claim(claims, candidates).map(|v| (name.clone(), v)))
        .collect();

    Ok(UserProfile {
        id,
        email: first_claim(claims, &mapping.email),
        display_name: first_claim(claims, &mapping.display_name),
        attributes,
    })
}

/// Claims of `token` without verifying the signature.
///
/// Only for decisions that do not grant access, such as refresh scheduling.
///
/// # Errors
///
/// Returns [`ValidationError::Malformed`] if the payload cannot be decoded.
pub fn unverified_claims(token: &str) -> Result<Map<String, Value>, ValidationError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ValidationError::Malformed("not a JWT".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ValidationError::Malformed(e.to_string()))
}

/// Expiry of `token` without verifying the signature.
#[must_use]
pub fn unverified_expiry(token: &str) -> Option<DateTime<Utc>> {
    unverified_claims(token).ok().and_then(|c| timestamp_claim(&c, "exp"))
}
