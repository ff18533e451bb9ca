//! Session store: active and expired sessions indexed by id and by user.
//!
//! # Lifecycle
//!
//! ```text
//! create ──► Active ──(now > expiry | terminate | sweep)──► Expired ──(cleanup | retention)──► removed
//!              ▲  │
//!              └──┘ record_activity (bump + sliding expiry)
//! ```
//!
//! Every transition into Expired pushes a [`CleanupJob`] onto the shared
//! [`CleanupQueue`]. Explicit terminations are queued immediately instead of
//! waiting for the periodic sweep.
//!
//! The three indices (`active`, `by_user`, `expired`) are separate `DashMap`s.
//! Methods never hold a guard on one map while locking another.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cleanup::{CleanupJob, CleanupQueue};
use super::fingerprint::fingerprints_match;
use crate::clock::{Clock, chrono_duration};
use crate::config::SessionConfig;
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Session store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No session with this id.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// The session is no longer active.
    #[error("Session {session_id} expired ({reason})")]
    Expired {
        /// Session id
        session_id: String,
        /// Why it expired
        reason: ExpiryReason,
    },

    /// The presented client fingerprint differs from the one bound to the session.
    #[error("Session fingerprint mismatch for {0}")]
    FingerprintMismatch(String),
}

/// Why a session left the active state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// Expiry time passed
    Timeout,
    /// User logged out
    Logout,
    /// Terminated as part of a bulk sign-out
    Terminated,
    /// Terminated after a security event
    Security,
    /// Any other caller-supplied reason
    Custom(String),
}

impl fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Logout => f.write_str("logout"),
            Self::Terminated => f.write_str("terminated"),
            Self::Security => f.write_str("security"),
            Self::Custom(reason) => f.write_str(reason),
        }
    }
}

/// Client metadata captured at session creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// `User-Agent` at creation
    pub user_agent: Option<String>,
    /// Client IP at creation
    pub ip: Option<IpAddr>,
    /// How the user authenticated (e.g. `password`, `sso`)
    pub login_method: Option<String>,
}

/// An active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque random id (256 bits)
    pub id: String,
    /// Owning user
    pub user_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last request seen
    pub last_activity: DateTime<Utc>,
    /// Expiry time
    pub expires_at: DateTime<Utc>,
    /// Requests seen, including the creating one
    pub activity_count: u64,
    /// "Remember me" session
    pub extended: bool,
    /// Client metadata
    pub client: ClientMetadata,
    /// Bound client fingerprint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Session {
    /// Time left before expiry, zero if already past.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A session that left the active state and awaits cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiredSession {
    /// The session as it was when it expired
    pub session: Session,
    /// Why it expired
    pub reason: ExpiryReason,
    /// When it expired
    pub expired_at: DateTime<Utc>,
}

/// Result of a sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Active sessions expired by this sweep
    pub expired: usize,
    /// Expired sessions hard-deleted past the retention ceiling
    pub purged: usize,
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Active sessions
    pub active: usize,
    /// Expired sessions awaiting cleanup
    pub expired: usize,
    /// Users with at least one active session
    pub users: usize,
    /// Cleanup jobs queued
    pub queued: usize,
}

/// In-memory session store.
pub struct SessionStore {
    config: SessionConfig,
    active: DashMap<String, Session>,
    by_user: DashMap<String, HashSet<String>>,
    expired: DashMap<String, ExpiredSession>,
    queue: Arc<CleanupQueue>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SessionStore {
    /// Create a store that feeds `queue`.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        queue: Arc<CleanupQueue>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            config,
            active: DashMap::new(),
            by_user: DashMap::new(),
            expired: DashMap::new(),
            queue,
            clock,
            telemetry,
        }
    }

    /// Generate a session id: 32 random bytes, URL-safe base64.
    #[must_use]
    pub fn generate_id() -> String {
        let bytes: [u8; 32] = rand::random();
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Open a session for `user_id`.
    pub fn create(
        &self,
        user_id: &str,
        client: ClientMetadata,
        remember_me: bool,
        fingerprint: Option<String>,
    ) -> Session {
        let now = self.clock.now();
        let lifetime = if remember_me {
            self.config.extended_timeout
        } else {
            self.config.timeout
        };

        let session = Session {
            id: Self::generate_id(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity: now,
            expires_at: now + chrono_duration(lifetime),
            activity_count: 1,
            extended: remember_me,
            client,
            fingerprint,
        };

        self.active.insert(session.id.clone(), session.clone());
        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.id.clone());

        info!(session_id = %session.id, user_id = %session.user_id, extended = remember_me, "Session created");
        self.telemetry.track(
            TelemetryEvent::new(events::SESSION_CREATED)
                .with("session_id", &session.id)
                .with("user_id", &session.user_id)
                .with("extended", remember_me)
                .with(
                    "login_method",
                    session.client.login_method.as_deref().unwrap_or("unknown"),
                )
                .measure("lifetime_secs", lifetime.as_secs_f64()),
        );
        session
    }

    /// Record a request on an active session.
    ///
    /// Bumps `last_activity` and, with sliding expiry, moves `expires_at`
    /// forward by the session's window unless the session sat idle longer
    /// than the inactivity timeout. A session found past its expiry is
    /// expired instead and the call fails.
    ///
    /// `fingerprint` is bound on first sight and must match afterwards.
    pub fn record_activity(
        &self,
        session_id: &str,
        fingerprint: Option<&str>,
    ) -> Result<Session, SessionError> {
        let now = self.clock.now();

        let outcome = match self.active.get_mut(session_id) {
            None => None,
            Some(mut session) => {
                if now > session.expires_at {
                    Some(Err(()))
                } else {
                    match (session.fingerprint.as_deref(), fingerprint) {
                        (Some(bound), Some(presented)) if !fingerprints_match(bound, presented) => {
                            warn!(session_id, user_id = %session.user_id, "Session fingerprint mismatch");
                            return Err(SessionError::FingerprintMismatch(session_id.to_string()));
                        }
                        (None, Some(presented)) => session.fingerprint = Some(presented.to_string()),
                        _ => {}
                    }

                    let idle = (now - session.last_activity).to_std().unwrap_or(Duration::ZERO);
                    session.last_activity = now;
                    session.activity_count += 1;

                    if self.config.sliding && idle < self.config.inactivity_timeout {
                        let window = if session.extended {
                            self.config.extended_timeout
                        } else {
                            self.config.timeout
                        };
                        let ceiling = now + chrono_duration(self.config.extended_timeout);
                        let slid = (now + chrono_duration(window)).min(ceiling);
                        if slid > session.expires_at {
                            session.expires_at = slid;
                        }
                    } else if self.config.sliding {
                        debug!(session_id, idle_secs = idle.as_secs(), "Idle too long, expiry not extended");
                    }
                    Some(Ok(session.clone()))
                }
            }
        };

        match outcome {
            Some(Ok(session)) => Ok(session),
            Some(Err(())) => {
                self.expire(session_id, ExpiryReason::Timeout);
                Err(SessionError::Expired {
                    session_id: session_id.to_string(),
                    reason: ExpiryReason::Timeout,
                })
            }
            None => match self.expired.get(session_id) {
                Some(expired) => Err(SessionError::Expired {
                    session_id: session_id.to_string(),
                    reason: expired.reason.clone(),
                }),
                None => Err(SessionError::NotFound(session_id.to_string())),
            },
        }
    }

    /// Apply login choices to an already open session.
    ///
    /// `remember_me` upgrades the session to the extended lifetime; it never
    /// shortens one. A `login_method` replaces the recorded one.
    pub fn remember(
        &self,
        session_id: &str,
        remember_me: bool,
        login_method: Option<String>,
    ) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let mut session = self
            .active
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if remember_me && !session.extended {
            session.extended = true;
            let extended_until = now + chrono_duration(self.config.extended_timeout);
            if extended_until > session.expires_at {
                session.expires_at = extended_until;
            }
            debug!(session_id, user_id = %session.user_id, "Session extended");
        }
        if login_method.is_some() {
            session.client.login_method = login_method;
        }
        Ok(session.clone())
    }

    /// Terminate one session. Returns the expired record if it was active.
    pub fn terminate(&self, session_id: &str, reason: ExpiryReason) -> Option<ExpiredSession> {
        self.expire(session_id, reason)
    }

    /// Terminate every active session of `user_id`, optionally sparing `except`.
    pub fn terminate_all_for_user(
        &self,
        user_id: &str,
        except: Option<&str>,
        reason: &ExpiryReason,
    ) -> usize {
        let ids: Vec<String> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().filter(|id| Some(id.as_str()) != except).cloned().collect())
            .unwrap_or_default();

        let count = ids
            .iter()
            .filter(|id| self.expire(id, reason.clone()).is_some())
            .count();
        info!(user_id, count, "Terminated user sessions");
        count
    }

    /// Expire active sessions past `expiry + grace_period` and hard-delete
    /// expired records older than the retention ceiling.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let grace = chrono_duration(self.config.grace_period);
        let retention = chrono_duration(self.config.retention);

        let overdue: Vec<String> = self
            .active
            .iter()
            .filter(|s| now > s.expires_at + grace)
            .map(|s| s.key().clone())
            .collect();
        let expired = overdue
            .iter()
            .filter(|id| self.expire(id, ExpiryReason::Timeout).is_some())
            .count();

        let before = self.expired.len();
        self.expired.retain(|_, e| now - e.expired_at <= retention);
        let purged = before - self.expired.len();

        if expired > 0 || purged > 0 {
            debug!(expired, purged, "Session sweep");
        }
        SweepReport { expired, purged }
    }

    /// Drop the expired record once its resources are released.
    pub fn mark_cleaned(&self, session_id: &str) -> bool {
        self.expired.remove(session_id).is_some()
    }

    /// Active session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.active.get(session_id).map(|s| s.clone())
    }

    /// Expired session by id.
    #[must_use]
    pub fn get_expired(&self, session_id: &str) -> Option<ExpiredSession> {
        self.expired.get(session_id).map(|e| e.clone())
    }

    /// Active sessions of `user_id`.
    #[must_use]
    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        let ids: Vec<String> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Store counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.active.len(),
            expired: self.expired.len(),
            users: self.by_user.len(),
            queued: self.queue.len(),
        }
    }

    /// Cleanup queue fed by this store.
    #[must_use]
    pub fn queue(&self) -> &Arc<CleanupQueue> {
        &self.queue
    }

    /// Move a session from Active to Expired and queue its cleanup.
    fn expire(&self, session_id: &str, reason: ExpiryReason) -> Option<ExpiredSession> {
        let (_, session) = self.active.remove(session_id)?;
        let now = self.clock.now();

        if let Some(mut ids) = self.by_user.get_mut(&session.user_id) {
            ids.remove(session_id);
        }
        self.by_user.remove_if(&session.user_id, |_, ids| ids.is_empty());

        let record = ExpiredSession {
            session,
            reason: reason.clone(),
            expired_at: now,
        };
        self.expired.insert(session_id.to_string(), record.clone());
        self.queue.push(CleanupJob {
            session_id: session_id.to_string(),
            user_id: record.session.user_id.clone(),
            reason: reason.clone(),
            expired_at: now,
        });

        info!(session_id, user_id = %record.session.user_id, reason = %reason, "Session expired");
        let age = (now - record.session.created_at).to_std().unwrap_or(Duration::ZERO);
        self.telemetry.track(
            TelemetryEvent::new(events::SESSION_EXPIRED)
                .with("session_id", session_id)
                .with("user_id", &record.session.user_id)
                .with("reason", &reason)
                .measure("age_secs", age.as_secs_f64())
                .measure("activity_count", record.session.activity_count as f64),
        );
        Some(record)
    }
}
