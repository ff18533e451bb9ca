//! Fixed-window rate limiting per client IP and endpoint class
//!
//! Each `(ip, class)` pair owns two fixed windows with their own lengths and
//! start times: the quota window, which rejects once `max_requests` is
//! exceeded, and the slow-down window, which adds a growing artificial delay
//! past `delay_after`. Rejections are values,
//! not errors, so the middleware can map them to 429 with `Retry-After`.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Clock, chrono_duration};
use crate::config::{ClassLimit, RateLimitConfig};
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Endpoint classes with independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Everything not matched by a route
    General,
    /// Login and token endpoints
    Auth,
    /// File uploads
    Upload,
    /// Chat requests
    Chat,
    /// Account and admin operations
    Sensitive,
    /// Unauthenticated endpoints
    Public,
}

impl EndpointClass {
    /// All classes.
    pub const ALL: [Self; 6] = [
        Self::General,
        Self::Auth,
        Self::Upload,
        Self::Chat,
        Self::Sensitive,
        Self::Public,
    ];

    /// Stable lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Auth => "auth",
            Self::Upload => "upload",
            Self::Chat => "chat",
            Self::Sensitive => "sensitive",
            Self::Public => "public",
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    /// Request may proceed, possibly after `delay`.
    Allowed {
        /// Requests left in the current window
        remaining: u32,
        /// Time until the window resets
        reset_after: Duration,
        /// Artificial delay to apply before continuing
        delay: Duration,
    },
    /// Request exceeded the quota.
    Limited(RateLimitRejection),
}

impl RateDecision {
    /// `true` when the request may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Structured rate-limit rejection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitRejection {
    /// Class whose quota was exceeded
    pub class: EndpointClass,
    /// Machine-readable reason
    pub reason_code: &'static str,
    /// Seconds until the window resets (rounded up)
    pub retry_after_secs: u64,
    /// Quota of the class
    pub limit: u32,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

impl Window {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            count: 0,
        }
    }

    /// Reset if `now` is past the window, then count one hit.
    fn hit(&mut self, now: DateTime<Utc>, length: Duration) -> u32 {
        if now >= self.started_at + chrono_duration(length) {
            *self = Self::new(now);
        }
        self.count = self.count.saturating_add(1);
        self.count
    }

    fn reset_after(&self, now: DateTime<Utc>, length: Duration) -> Duration {
        let ends = self.started_at + chrono_duration(length);
        (ends - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientWindows {
    quota: Window,
    slow_down: Window,
}

/// Per-IP, per-class fixed-window rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(IpAddr, EndpointClass), ClientWindows>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RateLimiter {
    /// Create a rate limiter.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            clock,
            telemetry,
        }
    }

    /// Map a request path to its endpoint class. Longest matching prefix wins.
    #[must_use]
    pub fn classify(&self, path: &str) -> EndpointClass {
        self.config
            .routes
            .iter()
            .filter(|r| path.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len())
            .map_or(EndpointClass::General, |r| r.class)
    }

    /// Count a request from `ip` against `class` and decide.
    pub fn check(&self, ip: IpAddr, class: EndpointClass) -> RateDecision {
        let limit = self.config.limit_for(class);
        if !self.config.enabled {
            return RateDecision::Allowed {
                remaining: limit.max_requests,
                reset_after: limit.window,
                delay: Duration::ZERO,
            };
        }

        let now = self.clock.now();
        let (count, slow_count, reset_after) = {
            let mut entry = self.windows.entry((ip, class)).or_insert_with(|| ClientWindows {
                quota: Window::new(now),
                slow_down: Window::new(now),
            });
            let count = entry.quota.hit(now, limit.window);
            let slow_count = entry.slow_down.hit(now, limit.slow_down.window);
            (count, slow_count, entry.quota.reset_after(now, limit.window))
        };

        if count > limit.max_requests {
            let retry_after_secs = reset_after.as_secs() + u64::from(reset_after.subsec_nanos() > 0);
            debug!(ip = %ip, class = class.as_str(), count, "Rate limit exceeded");
            self.telemetry.track(
                TelemetryEvent::new(events::RATE_LIMIT_EXCEEDED)
                    .with("ip", ip)
                    .with("class", class.as_str())
                    .measure("count", f64::from(count)),
            );
            return RateDecision::Limited(RateLimitRejection {
                class,
                reason_code: "rate_limit_exceeded",
                retry_after_secs,
                limit: limit.max_requests,
            });
        }

        RateDecision::Allowed {
            remaining: limit.max_requests - count,
            reset_after,
            delay: slow_down_delay(limit, slow_count),
        }
    }

    /// Drop windows that ended before now.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|(_, class), w| {
            let limit = self.config.limit_for(*class);
            now < w.quota.started_at + chrono_duration(limit.window)
                || now < w.slow_down.started_at + chrono_duration(limit.slow_down.window)
        });
        before - self.windows.len()
    }

    /// Number of tracked `(ip, class)` windows.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// Delay for the `count`-th request in the current slow-down window.
fn slow_down_delay(limit: &ClassLimit, count: u32) -> Duration {
    let slow = &limit.slow_down;
    if !slow.enabled || count <= slow.delay_after {
        return Duration::ZERO;
    }
    let over = count - slow.delay_after;
    slow.delay_step.saturating_mul(over).min(slow.max_delay)
}
