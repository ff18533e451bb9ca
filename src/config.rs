//! Configuration management

use std::{collections::BTreeMap, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::guard::rate_limit::EndpointClass;
use crate::{Error, Result};

/// Replace a leading `~` with the home directory.
fn expand_home(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Signing key resolution
    pub keys: KeyResolverConfig,
    /// Bearer token validation
    pub validator: ValidatorConfig,
    /// Refresh token exchange
    pub refresh: RefreshConfig,
    /// Session lifecycle
    pub session: SessionConfig,
    /// Session fingerprint guard
    pub fingerprint: FingerprintConfig,
    /// Expired session cleanup
    pub cleanup: CleanupConfig,
    /// Per-endpoint-class rate limits
    pub rate_limit: RateLimitConfig,
    /// Abuse scoring and IP blocking
    pub abuse: AbuseConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Env files listed in the file feed the environment layer below.
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        Self::load_env_files(&env_files);

        figment = figment.merge(Env::prefixed("ACCESS_GATE_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(env_files: &[String]) {
        for path_str in env_files {
            let expanded = expand_home(path_str);

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Reject settings that would make a component misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.cleanup.batch_size == 0 {
            return Err(Error::Config("cleanup.batch_size must be > 0".into()));
        }
        if !(self.abuse.threshold > 0.0 && self.abuse.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "abuse.threshold must be in (0, 1], got {}",
                self.abuse.threshold
            )));
        }
        if self.refresh.retry_attempts == 0 {
            return Err(Error::Config("refresh.retry_attempts must be >= 1".into()));
        }
        if self.keys.fetches_per_minute == 0 {
            return Err(Error::Config("keys.fetches_per_minute must be >= 1".into()));
        }
        if self.session.extended_timeout < self.session.timeout {
            return Err(Error::Config(
                "session.extended_timeout must not be shorter than session.timeout".into(),
            ));
        }
        for (name, interval) in [
            ("keys.sweep_interval", self.keys.sweep_interval),
            ("validator.sweep_interval", self.validator.sweep_interval),
            ("session.sweep_interval", self.session.sweep_interval),
            ("cleanup.interval", self.cleanup.interval),
            ("rate_limit.prune_interval", self.rate_limit.prune_interval),
            ("abuse.prune_interval", self.abuse.prune_interval),
        ] {
            if interval.is_zero() {
                return Err(Error::Config(format!("{name} must be > 0")));
            }
        }
        for class in EndpointClass::ALL {
            let limit = self.rate_limit.limit_for(class);
            if limit.window.is_zero() {
                return Err(Error::Config(format!(
                    "rate_limit.{}.window must be > 0",
                    class.as_str()
                )));
            }
            if limit.slow_down.enabled && limit.slow_down.window.is_zero() {
                return Err(Error::Config(format!(
                    "rate_limit.{}.slow_down.window must be > 0",
                    class.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Paths that skip token validation (still rate limited and abuse-checked)
    pub public_paths: Vec<String>,
    /// Honour `X-Forwarded-For` when resolving the client IP
    pub trust_forwarded_for: bool,
    /// Value of the `roles` claim required for the admin endpoints
    pub admin_role: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            request_timeout: Duration::from_secs(30),
            public_paths: vec![
                "/health".to_string(),
                "/api/auth/refresh".to_string(),
                "/api/auth/revoke".to_string(),
            ],
            trust_forwarded_for: false,
            admin_role: "access-gate.admin".to_string(),
        }
    }
}

/// Key resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyResolverConfig {
    /// Identity provider base URL; the key set lives at `{base}/.well-known/jwks`
    pub discovery_base: String,
    /// Explicit key-set URL, overrides `discovery_base`
    pub jwks_uri: Option<String>,
    /// Upstream request timeout
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// How long a fetched key stays cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Maximum cached keys (oldest inserted evicted first)
    pub cache_capacity: usize,
    /// Upstream fetch cap
    pub fetches_per_minute: u32,
    /// Key cache sweep cadence
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for KeyResolverConfig {
    fn default() -> Self {
        Self {
            discovery_base: "https://login.example.com".to_string(),
            jwks_uri: None,
            fetch_timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            cache_capacity: 100,
            fetches_per_minute: 10,
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl KeyResolverConfig {
    /// Effective key-set URL.
    #[must_use]
    pub fn resolved_jwks_uri(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(&self.discovery_base))
    }
}

/// Derive the key-set URL from the identity provider base URL.
#[must_use]
pub fn default_jwks_uri(base: &str) -> String {
    let base = base.trim_end_matches('/');
    format!("{base}/.well-known/jwks")
}

/// Token validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Expected `iss` claim; unchecked when `None`
    pub issuer: Option<String>,
    /// Accepted `aud` values; unchecked when empty
    pub audiences: Vec<String>,
    /// Client id of this application, used for token type inference
    pub client_id: Option<String>,
    /// The single accepted signing algorithm
    pub algorithm: String,
    /// Clock skew tolerance for `exp` / `nbf`
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Upper bound on how long a validation result is cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Maximum cached validation results
    pub cache_capacity: usize,
    /// Validation cache sweep cadence
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Claim names tried, in order, for each profile attribute
    pub claims: ClaimMappingConfig,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            audiences: Vec::new(),
            client_id: None,
            algorithm: "RS256".to_string(),
            clock_skew: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(60 * 60),
            cache_capacity: 10_000,
            sweep_interval: Duration::from_secs(5 * 60),
            claims: ClaimMappingConfig::default(),
        }
    }
}

/// Ordered candidate claim names per profile attribute. First match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimMappingConfig {
    /// User id candidates
    pub user_id: Vec<String>,
    /// Email candidates
    pub email: Vec<String>,
    /// Display name candidates
    pub display_name: Vec<String>,
    /// Custom organizational attributes
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Default for ClaimMappingConfig {
    fn default() -> Self {
        let candidates = |names: &[&str]| names.iter().map(ToString::to_string).collect::<Vec<_>>();
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "department".to_string(),
            candidates(&["extension_Department", "department"]),
        );
        attributes.insert(
            "company".to_string(),
            candidates(&["extension_CompanyName", "companyName"]),
        );
        attributes.insert(
            "job_title".to_string(),
            candidates(&["extension_JobTitle", "jobTitle"]),
        );
        attributes.insert(
            "role".to_string(),
            candidates(&["extension_Role", "roles"]),
        );

        Self {
            user_id: candidates(&["oid", "sub"]),
            email: candidates(&["email", "emails", "preferred_username", "upn"]),
            display_name: candidates(&["name", "given_name"]),
            attributes,
        }
    }
}

/// Token refresher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Token endpoint (refresh grant)
    pub token_endpoint: String,
    /// Revocation endpoint
    pub revoke_endpoint: Option<String>,
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret (confidential clients only)
    pub client_secret: Option<String>,
    /// Scope requested on refresh
    pub scope: String,
    /// Attempts before giving up
    pub retry_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * retry_base_delay`
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// Revoke the previous refresh token when a new one is issued
    pub rotation: bool,
    /// Remaining lifetime below which a token needs refreshing
    #[serde(with = "humantime_serde")]
    pub threshold: Duration,
    /// Upstream OAuth error codes treated as transient
    pub transient_error_codes: Vec<String>,
    /// Upstream HTTP request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            token_endpoint: "https://login.example.com/oauth2/v2.0/token".to_string(),
            revoke_endpoint: None,
            client_id: String::new(),
            client_secret: None,
            scope: "openid offline_access".to_string(),
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            rotation: true,
            threshold: Duration::from_secs(5 * 60),
            transient_error_codes: vec![
                "temporarily_unavailable".to_string(),
                "server_error".to_string(),
                "slow_down".to_string(),
            ],
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a regular session
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Lifetime of a "remember me" session, and the ceiling for sliding extension
    #[serde(with = "humantime_serde")]
    pub extended_timeout: Duration,
    /// Gap after which activity no longer slides the expiry forward
    #[serde(with = "humantime_serde")]
    pub inactivity_timeout: Duration,
    /// Slide expiry forward on activity
    pub sliding: bool,
    /// Tolerance past expiry before the sweep expires a session
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// Expired sessions are hard-deleted after this long
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    /// Sweep cadence
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Request header carrying the session id
    pub header: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(24 * 60 * 60),
            extended_timeout: Duration::from_secs(30 * 24 * 60 * 60),
            inactivity_timeout: Duration::from_secs(2 * 60 * 60),
            sliding: true,
            grace_period: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
            header: "x-session-id".to_string(),
        }
    }
}

/// Session fingerprint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Bind sessions to a client fingerprint
    pub enabled: bool,
    /// Request headers folded into the fingerprint (lower-case)
    pub headers: Vec<String>,
    /// Fold the client IP into the fingerprint
    pub include_ip: bool,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            headers: vec![
                "user-agent".to_string(),
                "accept-language".to_string(),
                "accept-encoding".to_string(),
            ],
            include_ip: true,
        }
    }
}

/// Cleanup engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Sessions processed per batch
    pub batch_size: usize,
    /// Pause before the next batch when the queue is still full
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Periodic drain cadence
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Delete uploaded files
    pub files: bool,
    /// Delete temporary files
    pub temp_files: bool,
    /// Drop cached data
    pub cache: bool,
    /// Delete stored preferences
    pub preferences: bool,
    /// Delete audit logs
    pub audit_logs: bool,
    /// Files younger than this always survive cleanup
    #[serde(with = "humantime_serde")]
    pub file_retention: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            cooldown: Duration::from_secs(5),
            interval: Duration::from_secs(60),
            files: true,
            temp_files: true,
            cache: true,
            preferences: false,
            audit_logs: false,
            file_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Quota for one endpoint class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassLimit {
    /// Fixed window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests allowed per window
    pub max_requests: u32,
    /// Progressive slow-down settings
    pub slow_down: SlowDownConfig,
}

impl ClassLimit {
    fn new(window_secs: u64, max_requests: u32, slow_down: SlowDownConfig) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_requests,
            slow_down,
        }
    }
}

impl Default for ClassLimit {
    fn default() -> Self {
        Self::new(60, 100, SlowDownConfig::default())
    }
}

/// Progressive slow-down settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowDownConfig {
    /// Enable artificial delay
    pub enabled: bool,
    /// Slow-down window, counted independently of the quota window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests per slow-down window before delay starts
    pub delay_after: u32,
    /// Delay added per request past `delay_after`
    #[serde(with = "humantime_serde")]
    pub delay_step: Duration,
    /// Delay ceiling
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl SlowDownConfig {
    fn new(window_secs: u64, delay_after: u32, step_ms: u64, max_ms: u64) -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(window_secs),
            delay_after,
            delay_step: Duration::from_millis(step_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }
}

impl Default for SlowDownConfig {
    fn default() -> Self {
        Self::new(60, 50, 100, 2_000)
    }
}

/// Path prefix routed to an endpoint class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteClass {
    /// Path prefix
    pub prefix: String,
    /// Class applied to matching paths
    pub class: EndpointClass,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Default class
    pub general: ClassLimit,
    /// Login / token endpoints
    pub auth: ClassLimit,
    /// File upload endpoints
    pub upload: ClassLimit,
    /// Chat endpoints
    pub chat: ClassLimit,
    /// Account and admin operations
    pub sensitive: ClassLimit,
    /// Unauthenticated endpoints
    pub public: ClassLimit,
    /// Path prefix routing, longest prefix wins
    pub routes: Vec<RouteClass>,
    /// Stale window sweep cadence
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl RateLimitConfig {
    /// Quota for `class`.
    #[must_use]
    pub fn limit_for(&self, class: EndpointClass) -> &ClassLimit {
        match class {
            EndpointClass::General => &self.general,
            EndpointClass::Auth => &self.auth,
            EndpointClass::Upload => &self.upload,
            EndpointClass::Chat => &self.chat,
            EndpointClass::Sensitive => &self.sensitive,
            EndpointClass::Public => &self.public,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let route = |prefix: &str, class| RouteClass {
            prefix: prefix.to_string(),
            class,
        };
        Self {
            enabled: true,
            general: ClassLimit::new(60, 100, SlowDownConfig::new(60, 50, 100, 2_000)),
            auth: ClassLimit::new(15 * 60, 5, SlowDownConfig::new(15 * 60, 2, 500, 5_000)),
            upload: ClassLimit::new(60 * 60, 20, SlowDownConfig::new(60 * 60, 10, 250, 3_000)),
            chat: ClassLimit::new(60, 30, SlowDownConfig::new(60, 15, 200, 3_000)),
            sensitive: ClassLimit::new(60 * 60, 10, SlowDownConfig::new(60 * 60, 3, 1_000, 10_000)),
            public: ClassLimit::new(60, 300, SlowDownConfig::new(60, 200, 50, 1_000)),
            routes: vec![
                route("/api/auth", EndpointClass::Auth),
                route("/api/upload", EndpointClass::Upload),
                route("/api/chat", EndpointClass::Chat),
                route("/api/account", EndpointClass::Sensitive),
                route("/api/admin", EndpointClass::Sensitive),
                route("/health", EndpointClass::Public),
                route("/public", EndpointClass::Public),
            ],
            prune_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Weights of the individual abuse signals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseWeights {
    /// Origin header malformed, opaque, an IP literal or high-entropy
    pub origin: f64,
    /// User agent matches a bot pattern
    pub bot_user_agent: f64,
    /// User agent missing or shorter than `min_user_agent_len`
    pub short_user_agent: f64,
    /// More proxy hops than `max_proxy_hops`
    pub proxy_hops: f64,
    /// The client IP was blocked before
    pub prior_blocks: f64,
}

impl Default for AbuseWeights {
    fn default() -> Self {
        Self {
            origin: 0.3,
            bot_user_agent: 0.4,
            short_user_agent: 0.3,
            proxy_hops: 0.2,
            prior_blocks: 0.3,
        }
    }
}

/// Event count that escalates an IP into a block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    /// Events within `window` that trigger a block
    pub max_events: usize,
    /// Counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Block duration
    #[serde(with = "humantime_serde")]
    pub block_for: Duration,
}

impl PatternRule {
    fn new(max_events: usize, window_secs: u64, block_secs: u64) -> Self {
        Self {
            max_events,
            window: Duration::from_secs(window_secs),
            block_for: Duration::from_secs(block_secs),
        }
    }
}

/// Abuse detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbuseConfig {
    /// Enable abuse scoring and pattern blocking
    pub enabled: bool,
    /// Scores strictly above this are rejected
    pub threshold: f64,
    /// Signal weights
    pub weights: AbuseWeights,
    /// Case-insensitive regexes identifying automated user agents
    pub bot_patterns: Vec<String>,
    /// Shorter user agents count as anomalous
    pub min_user_agent_len: usize,
    /// More `X-Forwarded-For` hops count as anomalous
    pub max_proxy_hops: usize,
    /// Shannon entropy (bits/char) above which an origin host looks generated
    pub origin_entropy_threshold: f64,
    /// Tracker horizon; older timestamps are pruned
    #[serde(with = "humantime_serde")]
    pub horizon: Duration,
    /// Tracker and block sweep cadence
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
    /// How long a past block keeps raising its IP's score
    #[serde(with = "humantime_serde")]
    pub block_memory: Duration,
    /// Request bodies above this size count as oversized
    pub max_payload_bytes: u64,
    /// Request burst rule
    pub rapid_fire: PatternRule,
    /// Oversized payload rule
    pub oversized_payloads: PatternRule,
    /// Authentication failure rule
    pub auth_failures: PatternRule,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.7,
            weights: AbuseWeights::default(),
            bot_patterns: [
                "bot", "crawler", "spider", "scraper", "curl", "wget", "python-requests",
                "httpclient", "go-http-client", "headless",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
            min_user_agent_len: 10,
            max_proxy_hops: 3,
            origin_entropy_threshold: 3.5,
            horizon: Duration::from_secs(60 * 60),
            prune_interval: Duration::from_secs(5 * 60),
            block_memory: Duration::from_secs(24 * 60 * 60),
            max_payload_bytes: 10 * 1024 * 1024,
            rapid_fire: PatternRule::new(300, 60, 15 * 60),
            oversized_payloads: PatternRule::new(3, 60, 60 * 60),
            auth_failures: PatternRule::new(10, 15 * 60, 30 * 60),
        }
    }
}

/// Human-readable serde for [`Duration`]
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string ("100ms", "30s", "5m", "24h", "30d")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string. A bare number is seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s", otherwise "100ms" parses as "100m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.trim().parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
