//! Telemetry events for access-control state transitions.
//!
//! Every transition (token validated, session expired, IP blocked, ...) is
//! reported through a [`TelemetrySink`] as `(name, properties, measurements)`.
//! The concrete backend is pluggable; [`TracingSink`] emits the event via
//! `tracing::info!` with structured fields and bumps a `metrics` counter, so
//! the trail is queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `keys.fetched` | The signing-key set was fetched from upstream |
//! | `token.validated` | A bearer token passed validation |
//! | `token.validation_failed` | A bearer token was rejected |
//! | `token.refresh_attempt` | One refresh attempt was sent upstream |
//! | `token.refreshed` | A refresh produced a verified token set |
//! | `token.refresh_failed` | A refresh gave up |
//! | `token.revoked` | A refresh token was revoked |
//! | `session.created` | A session was opened |
//! | `session.expired` | A session left the active state |
//! | `session.cleaned_up` | Resources for an expired session were released |
//! | `session.cleanup_failed` | One resource class failed to clean up |
//! | `abuse.detected` | A request scored above the abuse threshold |
//! | `ip.blocked` / `ip.unblocked` | An IP block was placed or lifted |
//! | `rate_limit.exceeded` | A request was rejected by the rate limiter |

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;

/// Event names emitted by the access gate.
pub mod events {
    /// Signing keys fetched from the upstream key set.
    pub const KEYS_FETCHED: &str = "keys.fetched";
    /// Token validated.
    pub const TOKEN_VALIDATED: &str = "token.validated";
    /// Token rejected.
    pub const TOKEN_VALIDATION_FAILED: &str = "token.validation_failed";
    /// Refresh attempt sent upstream.
    pub const TOKEN_REFRESH_ATTEMPT: &str = "token.refresh_attempt";
    /// Refresh succeeded.
    pub const TOKEN_REFRESHED: &str = "token.refreshed";
    /// Refresh failed.
    pub const TOKEN_REFRESH_FAILED: &str = "token.refresh_failed";
    /// Refresh token revoked.
    pub const TOKEN_REVOKED: &str = "token.revoked";
    /// Session created.
    pub const SESSION_CREATED: &str = "session.created";
    /// Session expired or terminated.
    pub const SESSION_EXPIRED: &str = "session.expired";
    /// Session resources released.
    pub const SESSION_CLEANED_UP: &str = "session.cleaned_up";
    /// Cleanup of a resource class failed.
    pub const SESSION_CLEANUP_FAILED: &str = "session.cleanup_failed";
    /// Abuse score above threshold.
    pub const ABUSE_DETECTED: &str = "abuse.detected";
    /// IP blocked.
    pub const IP_BLOCKED: &str = "ip.blocked";
    /// IP block lifted.
    pub const IP_UNBLOCKED: &str = "ip.unblocked";
    /// Rate limit exceeded.
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit.exceeded";
}

/// A single telemetry event.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TelemetryEvent {
    /// Event name (see [`events`]).
    pub name: &'static str,
    /// String-valued properties.
    pub properties: BTreeMap<String, String>,
    /// Numeric measurements.
    pub measurements: BTreeMap<String, f64>,
}

impl TelemetryEvent {
    /// Start a new event.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    /// Attach a property.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// Attach a measurement.
    #[must_use]
    pub fn measure(mut self, key: &str, value: f64) -> Self {
        self.measurements.insert(key.to_string(), value);
        self
    }
}

/// Destination for telemetry events.
pub trait TelemetrySink: Send + Sync + 'static {
    /// Record one event. Must not block.
    fn track(&self, event: TelemetryEvent);
}

/// Sink that writes events to `tracing` and increments a `metrics` counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn track(&self, event: TelemetryEvent) {
        telemetry_metrics::counter!("access_gate_events_total", "event" => event.name).increment(1);

        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(
                target: "access_gate::telemetry",
                event = event.name,
                payload = %json,
                "telemetry"
            ),
            Err(e) => tracing::warn!(event = event.name, error = %e, "Failed to serialize telemetry event"),
        }
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded events.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    /// Number of events recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name == name).count()
    }
}

impl TelemetrySink for MemorySink {
    fn track(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
