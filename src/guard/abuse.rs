//! Abuse detection and IP blocking
//!
//! Two independent mechanisms:
//!
//! 1. **Scoring**: every request gets a suspicion score in `[0, 1]`, the
//!    clamped sum of weighted signals (origin red flags, user-agent
//!    anomalies, proxy-hop count, prior blocks). A score above the
//!    configured threshold is rejected immediately.
//! 2. **Pattern blocking**: per-IP trackers count requests, authentication
//!    failures and oversized payloads. Crossing a rule's threshold places a
//!    timed [`IpBlock`]; blocked IPs are rejected before anything else runs.
//!
//! Blocks are lifted lazily on the first lookup past `until`, or by
//! [`AbuseDetector::prune`].

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::clock::{Clock, chrono_duration};
use crate::config::{AbuseConfig, PatternRule};
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Request attributes the scorer looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSignals {
    /// `Origin` header
    pub origin: Option<String>,
    /// `User-Agent` header
    pub user_agent: Option<String>,
    /// Raw `X-Forwarded-For` header
    pub forwarded_for: Option<String>,
}

impl RequestSignals {
    /// Extract signals from request headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        Self {
            origin: get("origin"),
            user_agent: get("user-agent"),
            forwarded_for: get("x-forwarded-for"),
        }
    }

    /// Number of proxy hops listed in `X-Forwarded-For`.
    #[must_use]
    pub fn proxy_hops(&self) -> usize {
        self.forwarded_for.as_deref().map_or(0, |v| {
            v.split(',').filter(|h| !h.trim().is_empty()).count()
        })
    }
}

/// Why an IP was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Too many requests in a short window
    RapidFire,
    /// Repeated oversized payloads
    OversizedPayloads,
    /// Repeated authentication failures
    AuthFailures,
    /// Placed by an operator or another component
    Manual,
}

impl BlockReason {
    /// Stable lower-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RapidFire => "rapid_fire",
            Self::OversizedPayloads => "oversized_payloads",
            Self::AuthFailures => "auth_failures",
            Self::Manual => "manual",
        }
    }
}

/// A timed block on one client IP.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpBlock {
    /// Blocked address
    pub ip: IpAddr,
    /// Reason
    pub reason: BlockReason,
    /// When the block started
    pub blocked_at: DateTime<Utc>,
    /// When the block ends
    pub until: DateTime<Utc>,
}

/// Rolling per-IP event history.
///
/// Every list is non-decreasing and, after [`prune`](Self::prune), holds no
/// entry older than the horizon.
#[derive(Debug, Clone, Default)]
pub struct AbuseTracker {
    requests: VecDeque<DateTime<Utc>>,
    auth_failures: VecDeque<DateTime<Utc>>,
    oversized_payloads: VecDeque<DateTime<Utc>>,
}

impl AbuseTracker {
    fn push(list: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
        // Keep the list sorted even if the clock steps backwards.
        let at = list.back().map_or(now, |last| (*last).max(now));
        list.push_back(at);
    }

    fn count_since(list: &VecDeque<DateTime<Utc>>, since: DateTime<Utc>) -> usize {
        list.iter().rev().take_while(|t| **t >= since).count()
    }

    fn prune_list(list: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
        while list.front().is_some_and(|t| *t < cutoff) {
            list.pop_front();
        }
    }

    /// Drop entries older than `cutoff`.
    pub fn prune(&mut self, cutoff: DateTime<Utc>) {
        Self::prune_list(&mut self.requests, cutoff);
        Self::prune_list(&mut self.auth_failures, cutoff);
        Self::prune_list(&mut self.oversized_payloads, cutoff);
    }

    /// `true` when no events remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.auth_failures.is_empty() && self.oversized_payloads.is_empty()
    }

    /// Request timestamps, oldest first.
    pub fn requests(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.requests.iter()
    }

    /// Authentication failure timestamps, oldest first.
    pub fn auth_failures(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.auth_failures.iter()
    }

    /// Oversized payload timestamps, oldest first.
    pub fn oversized_payloads(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.oversized_payloads.iter()
    }
}

/// Outcome of inspecting a request.
#[derive(Debug, Clone, PartialEq)]
pub enum AbuseVerdict {
    /// Request may proceed.
    Allow {
        /// Suspicion score
        score: f64,
    },
    /// Request must be rejected.
    Reject(AbuseRejection),
}

/// Structured abuse rejection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbuseRejection {
    /// Machine-readable reason
    pub reason_code: &'static str,
    /// Score, when the rejection came from scoring
    pub score: Option<f64>,
    /// Block end, when the IP is blocked
    pub blocked_until: Option<DateTime<Utc>>,
}

impl AbuseRejection {
    fn blocked(block: &IpBlock) -> Self {
        Self {
            reason_code: "ip_blocked",
            score: None,
            blocked_until: Some(block.until),
        }
    }
}

/// Result of a prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Trackers removed because they went empty
    pub trackers_removed: usize,
    /// Expired blocks lifted
    pub blocks_lifted: usize,
    /// Past blocks no longer counted against their IP
    pub block_history_forgotten: usize,
}

/// Which tracker list an event goes to.
#[derive(Debug, Clone, Copy)]
enum Pattern {
    Request,
    AuthFailure,
    OversizedPayload,
}

/// Per-IP abuse scoring and blocking.
pub struct AbuseDetector {
    config: AbuseConfig,
    bot_patterns: Vec<Regex>,
    trackers: DashMap<IpAddr, AbuseTracker>,
    blocks: DashMap<IpAddr, IpBlock>,
    /// Most recent block per IP, kept for `block_memory`
    block_history: DashMap<IpAddr, DateTime<Utc>>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl AbuseDetector {
    /// Create a detector. Invalid bot patterns are logged and skipped.
    #[must_use]
    pub fn new(config: AbuseConfig, clock: Arc<dyn Clock>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let bot_patterns = config
            .bot_patterns
            .iter()
            .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid bot pattern");
                    None
                }
            })
            .collect();

        Self {
            config,
            bot_patterns,
            trackers: DashMap::new(),
            blocks: DashMap::new(),
            block_history: DashMap::new(),
            clock,
            telemetry,
        }
    }

    /// Active block for `ip`, lifting it if it has run out.
    pub fn is_blocked(&self, ip: IpAddr) -> Option<IpBlock> {
        let now = self.clock.now();
        let block = self.blocks.get(&ip).map(|b| b.clone())?;
        if now >= block.until {
            if self.blocks.remove_if(&ip, |_, b| now >= b.until).is_some() {
                self.emit_unblocked(&block);
            }
            return None;
        }
        Some(block)
    }

    /// Suspicion score for a request from `ip`, in `[0, 1]`.
    ///
    /// Depends only on the signals and the block history of `ip`, so it is
    /// stable for a fixed request within a tracking window.
    #[must_use]
    pub fn score(&self, ip: IpAddr, signals: &RequestSignals) -> f64 {
        let w = &self.config.weights;
        let mut score = 0.0;

        if signals
            .origin
            .as_deref()
            .is_some_and(|o| origin_is_suspicious(o, self.config.origin_entropy_threshold))
        {
            score += w.origin;
        }

        match signals.user_agent.as_deref().map(str::trim) {
            None => score += w.short_user_agent,
            Some(ua) => {
                if ua.len() < self.config.min_user_agent_len {
                    score += w.short_user_agent;
                }
                if self.bot_patterns.iter().any(|re| re.is_match(ua)) {
                    score += w.bot_user_agent;
                }
            }
        }

        if signals.proxy_hops() > self.config.max_proxy_hops {
            score += w.proxy_hops;
        }

        if self.block_history.contains_key(&ip) {
            score += w.prior_blocks;
        }

        score.clamp(0.0, 1.0)
    }

    /// Inspect one inbound request: block check, scoring, then rapid-fire tracking.
    pub fn inspect(&self, ip: IpAddr, signals: &RequestSignals) -> AbuseVerdict {
        if let Some(block) = self.is_blocked(ip) {
            return AbuseVerdict::Reject(AbuseRejection::blocked(&block));
        }
        if !self.config.enabled {
            return AbuseVerdict::Allow { score: 0.0 };
        }

        let score = self.score(ip, signals);
        if score > self.config.threshold {
            warn!(ip = %ip, score, "Suspicious request rejected");
            self.telemetry.track(
                TelemetryEvent::new(events::ABUSE_DETECTED)
                    .with("ip", ip)
                    .with("user_agent", signals.user_agent.as_deref().unwrap_or(""))
                    .with("origin", signals.origin.as_deref().unwrap_or(""))
                    .measure("score", score),
            );
            return AbuseVerdict::Reject(AbuseRejection {
                reason_code: "security_violation",
                score: Some(score),
                blocked_until: None,
            });
        }

        if let Some(block) = self.record(ip, Pattern::Request) {
            return AbuseVerdict::Reject(AbuseRejection::blocked(&block));
        }

        AbuseVerdict::Allow { score }
    }

    /// Record an authentication failure. Returns the block if one was placed.
    pub fn record_auth_failure(&self, ip: IpAddr) -> Option<IpBlock> {
        self.record(ip, Pattern::AuthFailure)
    }

    /// Record an oversized payload. Returns the block if one was placed.
    pub fn record_oversized_payload(&self, ip: IpAddr) -> Option<IpBlock> {
        self.record(ip, Pattern::OversizedPayload)
    }

    fn record(&self, ip: IpAddr, pattern: Pattern) -> Option<IpBlock> {
        if !self.config.enabled {
            return None;
        }
        let now = self.clock.now();
        let (rule, reason) = match pattern {
            Pattern::Request => (&self.config.rapid_fire, BlockReason::RapidFire),
            Pattern::AuthFailure => (&self.config.auth_failures, BlockReason::AuthFailures),
            Pattern::OversizedPayload => (&self.config.oversized_payloads, BlockReason::OversizedPayloads),
        };

        let count = {
            let mut tracker = self.trackers.entry(ip).or_default();
            tracker.prune(now - chrono_duration(self.config.horizon));
            let list = match pattern {
                Pattern::Request => &mut tracker.requests,
                Pattern::AuthFailure => &mut tracker.auth_failures,
                Pattern::OversizedPayload => &mut tracker.oversized_payloads,
            };
            AbuseTracker::push(list, now);
            AbuseTracker::count_since(list, now - chrono_duration(rule.window))
        };

        if crosses(rule, count) {
            debug!(ip = %ip, reason = reason.as_str(), count, "Abuse pattern threshold crossed");
            return Some(self.block(ip, reason, rule.block_for));
        }
        None
    }

    /// Block `ip` for `duration`.
    pub fn block(&self, ip: IpAddr, reason: BlockReason, duration: Duration) -> IpBlock {
        let now = self.clock.now();
        let block = IpBlock {
            ip,
            reason,
            blocked_at: now,
            until: now + chrono_duration(duration),
        };
        self.blocks.insert(ip, block.clone());
        self.block_history.insert(ip, now);

        warn!(ip = %ip, reason = reason.as_str(), until = %block.until, "IP blocked");
        self.telemetry.track(
            TelemetryEvent::new(events::IP_BLOCKED)
                .with("ip", ip)
                .with("reason", reason.as_str())
                .measure("duration_secs", duration.as_secs_f64()),
        );
        block
    }

    /// Lift a block early. Returns `true` if one existed.
    pub fn unblock(&self, ip: IpAddr) -> bool {
        match self.blocks.remove(&ip) {
            Some((_, block)) => {
                self.emit_unblocked(&block);
                true
            }
            None => false,
        }
    }

    /// Prune trackers to the horizon, lift expired blocks and forget blocks
    /// older than the block memory.
    pub fn prune(&self) -> PruneReport {
        let now = self.clock.now();
        let cutoff = now - chrono_duration(self.config.horizon);

        let before = self.trackers.len();
        self.trackers.retain(|_, tracker| {
            tracker.prune(cutoff);
            !tracker.is_empty()
        });
        let trackers_removed = before - self.trackers.len();

        let expired: Vec<IpAddr> = self
            .blocks
            .iter()
            .filter(|b| now >= b.until)
            .map(|b| *b.key())
            .collect();
        let mut blocks_lifted = 0;
        for ip in expired {
            if let Some((_, block)) = self.blocks.remove_if(&ip, |_, b| now >= b.until) {
                self.emit_unblocked(&block);
                blocks_lifted += 1;
            }
        }

        let remembered_since = now - chrono_duration(self.config.block_memory);
        let before = self.block_history.len();
        self.block_history
            .retain(|ip, blocked_at| *blocked_at >= remembered_since || self.blocks.contains_key(ip));
        let block_history_forgotten = before - self.block_history.len();

        PruneReport {
            trackers_removed,
            blocks_lifted,
            block_history_forgotten,
        }
    }

    /// Snapshot of the tracker for `ip`.
    #[must_use]
    pub fn tracker(&self, ip: IpAddr) -> Option<AbuseTracker> {
        self.trackers.get(&ip).map(|t| t.clone())
    }

    /// Number of active blocks (including not-yet-lifted expired ones).
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Request bodies above this size count as oversized.
    #[must_use]
    pub fn max_payload_bytes(&self) -> u64 {
        self.config.max_payload_bytes
    }

    fn emit_unblocked(&self, block: &IpBlock) {
        debug!(ip = %block.ip, "IP block lifted");
        self.telemetry.track(
            TelemetryEvent::new(events::IP_UNBLOCKED)
                .with("ip", block.ip)
                .with("reason", block.reason.as_str()),
        );
    }
}

fn crosses(rule: &PatternRule, count: usize) -> bool {
    rule.max_events > 0 && count >= rule.max_events
}

/// Origin red flags: opaque `null`, unparseable, non-web scheme, IP-literal
/// host, or a generated-looking leading host label.
fn origin_is_suspicious(origin: &str, entropy_threshold: f64) -> bool {
    if origin.eq_ignore_ascii_case("null") {
        return true;
    }
    let Ok(url) = Url::parse(origin) else {
        return true;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return true;
    }
    match url.host() {
        None | Some(Host::Ipv4(_) | Host::Ipv6(_)) => true,
        Some(Host::Domain(domain)) => {
            let label = domain.split('.').next().unwrap_or_default();
            label.len() >= 8 && shannon_entropy(label) > entropy_threshold
        }
    }
}

/// Shannon entropy in bits per character.
#[allow(clippy::cast_precision_loss)]
fn shannon_entropy(s: &str) -> f64 {
    if s.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for b in s.bytes() {
        counts[usize::from(b)] += 1;
    }
    let len = s.len() as f64;
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / len;
            -p * p.log2()
        })
        .sum()
}
