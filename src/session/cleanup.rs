//! Expired-session cleanup.
//!
//! Expired sessions are queued as [`CleanupJob`]s. The [`CleanupEngine`]
//! drains the queue in batches, releasing each session's resources through a
//! pluggable [`SessionResources`] backend. Only one batch runs at a time; when
//! the queue is still at batch size after a batch, the next one waits out a
//! cooldown.
//!
//! Resource classes (files, temporary files, cache, preferences, audit logs)
//! are enabled independently. A failure in one class is logged and counted
//! but never aborts the others or the rest of the batch.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use super::store::{ExpiryReason, SessionStore};
use crate::clock::{Clock, chrono_duration};
use crate::config::CleanupConfig;
use crate::telemetry::{TelemetryEvent, TelemetrySink, events};

/// Cleanup errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CleanupError {
    /// A resource backend call failed.
    #[error("Failed to clean {class} for session {session_id}: {message}")]
    Resource {
        /// Resource class being cleaned
        class: ResourceClass,
        /// Session being cleaned
        session_id: String,
        /// Backend error
        message: String,
    },
}

/// Kinds of per-session resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Uploaded files
    Files,
    /// Temporary files
    TempFiles,
    /// Cached data
    Cache,
    /// Stored preferences
    Preferences,
    /// Audit log entries
    AuditLogs,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Files => "files",
            Self::TempFiles => "temp_files",
            Self::Cache => "cache",
            Self::Preferences => "preferences",
            Self::AuditLogs => "audit_logs",
        })
    }
}

/// A queued cleanup request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    /// Expired session
    pub session_id: String,
    /// Owner of the session
    pub user_id: String,
    /// Why the session expired
    pub reason: ExpiryReason,
    /// When it expired
    pub expired_at: DateTime<Utc>,
}

/// FIFO of pending cleanup jobs.
///
/// Pushing the job that brings the queue to `batch_size` wakes the engine.
#[derive(Debug)]
pub struct CleanupQueue {
    jobs: Mutex<VecDeque<CleanupJob>>,
    notify: Notify,
    batch_size: usize,
}

impl CleanupQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Enqueue a job. Returns the new queue length.
    pub fn push(&self, job: CleanupJob) -> usize {
        let len = {
            let mut jobs = self.jobs.lock();
            jobs.push_back(job);
            jobs.len()
        };
        if len >= self.batch_size {
            self.notify.notify_one();
        }
        len
    }

    /// Take up to `max` jobs from the front.
    pub fn drain(&self, max: usize) -> Vec<CleanupJob> {
        let mut jobs = self.jobs.lock();
        let n = max.min(jobs.len());
        jobs.drain(..n).collect()
    }

    /// Queued jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Configured batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Wait until the queue reaches batch size.
    pub async fn full(&self) {
        self.notify.notified().await;
    }
}

/// A stored file belonging to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    /// Backend identifier
    pub id: String,
    /// Upload time
    pub created_at: DateTime<Utc>,
    /// Marked temporary by the uploader
    pub temporary: bool,
}

/// Backend holding per-session resources.
///
/// Each method acts on the session named by `job`. Counts returned are the
/// number of items removed.
#[async_trait]
pub trait SessionResources: Send + Sync + 'static {
    /// Files uploaded during the session.
    async fn list_files(&self, job: &CleanupJob) -> Result<Vec<StoredFile>, String>;

    /// Delete one file.
    async fn delete_file(&self, job: &CleanupJob, file: &StoredFile) -> Result<(), String>;

    /// Delete temporary files.
    async fn purge_temp_files(&self, job: &CleanupJob) -> Result<usize, String>;

    /// Drop cached data.
    async fn purge_cache(&self, job: &CleanupJob) -> Result<usize, String>;

    /// Delete stored preferences.
    async fn purge_preferences(&self, job: &CleanupJob) -> Result<usize, String>;

    /// Delete audit log entries.
    async fn purge_audit_logs(&self, job: &CleanupJob) -> Result<usize, String>;
}

/// Backend with nothing to clean.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResources;

#[async_trait]
impl SessionResources for NoResources {
    async fn list_files(&self, _job: &CleanupJob) -> Result<Vec<StoredFile>, String> {
        Ok(Vec::new())
    }

    async fn delete_file(&self, _job: &CleanupJob, _file: &StoredFile) -> Result<(), String> {
        Ok(())
    }

    async fn purge_temp_files(&self, _job: &CleanupJob) -> Result<usize, String> {
        Ok(0)
    }

    async fn purge_cache(&self, _job: &CleanupJob) -> Result<usize, String> {
        Ok(0)
    }

    async fn purge_preferences(&self, _job: &CleanupJob) -> Result<usize, String> {
        Ok(0)
    }

    async fn purge_audit_logs(&self, _job: &CleanupJob) -> Result<usize, String> {
        Ok(0)
    }
}

/// Files eligible for deletion.
///
/// Files younger than `retention` always survive. Past that, a timed-out
/// session loses all its files; any other expiry reason only loses files
/// marked temporary.
#[must_use]
pub fn files_to_remove<'a>(
    files: &'a [StoredFile],
    reason: &ExpiryReason,
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<&'a StoredFile> {
    let cutoff = now - chrono_duration(retention);
    files
        .iter()
        .filter(|f| f.created_at < cutoff)
        .filter(|f| matches!(reason, ExpiryReason::Timeout) || f.temporary)
        .collect()
}

/// Outcome of cleaning one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCleanup {
    /// Session cleaned
    pub session_id: String,
    /// Items removed across all classes
    pub removed: usize,
    /// Per-class failures
    pub failures: Vec<CleanupError>,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Sessions processed
    pub processed: usize,
    /// Sessions cleaned without failures
    pub succeeded: usize,
    /// Sessions with at least one failed class
    pub failed: usize,
    /// Items removed
    pub removed: usize,
}

impl CleanupReport {
    fn absorb(&mut self, other: &Self) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.removed += other.removed;
    }
}

/// Batch cleanup engine.
pub struct CleanupEngine {
    config: CleanupConfig,
    queue: Arc<CleanupQueue>,
    store: Arc<SessionStore>,
    resources: Arc<dyn SessionResources>,
    in_flight: AtomicBool,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink>,
}

/// Clears the in-flight flag when a batch ends, including on cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CleanupEngine {
    /// Create an engine draining `store`'s queue.
    #[must_use]
    pub fn new(
        config: CleanupConfig,
        store: Arc<SessionStore>,
        resources: Arc<dyn SessionResources>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            queue: Arc::clone(store.queue()),
            config,
            store,
            resources,
            in_flight: AtomicBool::new(false),
            clock,
            telemetry,
        }
    }

    /// Whether a batch is currently running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Process one batch. Returns `None` if another batch is in flight.
    pub async fn process_batch(&self) -> Option<CleanupReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Cleanup batch already in flight");
            return None;
        }
        let _guard = InFlight(&self.in_flight);

        let jobs = self.queue.drain(self.config.batch_size);
        if jobs.is_empty() {
            return Some(CleanupReport::default());
        }

        let started = Instant::now();
        let outcomes = join_all(jobs.iter().map(|job| self.clean_session(job))).await;

        let mut report = CleanupReport {
            processed: outcomes.len(),
            ..CleanupReport::default()
        };
        for (job, outcome) in jobs.iter().zip(&outcomes) {
            report.removed += outcome.removed;
            if outcome.failures.is_empty() {
                report.succeeded += 1;
                self.store.mark_cleaned(&job.session_id);
            } else {
                // the expired record stays until the retention sweep
                report.failed += 1;
            }
        }

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            removed = report.removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cleanup batch complete"
        );
        Some(report)
    }

    /// Process batches until the queue is empty, pausing for the cooldown
    /// whenever the queue is still at batch size.
    pub async fn drain(&self) -> CleanupReport {
        let mut total = CleanupReport::default();
        loop {
            let Some(report) = self.process_batch().await else {
                tokio::time::sleep(self.config.cooldown).await;
                continue;
            };
            total.absorb(&report);

            if self.queue.is_empty() {
                return total;
            }
            if self.queue.len() >= self.config.batch_size {
                debug!(queued = self.queue.len(), cooldown = ?self.config.cooldown, "Cleanup cooldown");
                tokio::time::sleep(self.config.cooldown).await;
            }
        }
    }

    /// Run until shutdown: drain on every tick and whenever the queue fills.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.queue.full() => {}
                _ = shutdown.recv() => {
                    debug!("Cleanup engine shutting down");
                    break;
                }
            }
            if !self.queue.is_empty() {
                self.drain().await;
            }
        }
    }

    /// Release every enabled resource class for one session.
    async fn clean_session(&self, job: &CleanupJob) -> SessionCleanup {
        let mut steps = Vec::new();
        if self.config.files {
            steps.push(ResourceClass::Files);
        }
        if self.config.temp_files {
            steps.push(ResourceClass::TempFiles);
        }
        if self.config.cache {
            steps.push(ResourceClass::Cache);
        }
        if self.config.preferences {
            steps.push(ResourceClass::Preferences);
        }
        if self.config.audit_logs {
            steps.push(ResourceClass::AuditLogs);
        }

        let results = join_all(steps.iter().map(|class| self.clean_class(job, *class))).await;

        let mut outcome = SessionCleanup {
            session_id: job.session_id.clone(),
            ..SessionCleanup::default()
        };
        for (class, result) in steps.into_iter().zip(results) {
            match result {
                Ok(n) => outcome.removed += n,
                Err(message) => {
                    warn!(session_id = %job.session_id, class = %class, error = %message, "Cleanup step failed");
                    self.telemetry.track(
                        TelemetryEvent::new(events::SESSION_CLEANUP_FAILED)
                            .with("session_id", &job.session_id)
                            .with("class", class)
                            .with("error", &message),
                    );
                    outcome.failures.push(CleanupError::Resource {
                        class,
                        session_id: job.session_id.clone(),
                        message,
                    });
                }
            }
        }

        if outcome.failures.is_empty() {
            self.telemetry.track(
                TelemetryEvent::new(events::SESSION_CLEANED_UP)
                    .with("session_id", &job.session_id)
                    .with("user_id", &job.user_id)
                    .with("reason", &job.reason)
                    .measure("removed", outcome.removed as f64),
            );
        }
        outcome
    }

    async fn clean_class(&self, job: &CleanupJob, class: ResourceClass) -> Result<usize, String> {
        match class {
            ResourceClass::Files => self.clean_files(job).await,
            ResourceClass::TempFiles => self.resources.purge_temp_files(job).await,
            ResourceClass::Cache => self.resources.purge_cache(job).await,
            ResourceClass::Preferences => self.resources.purge_preferences(job).await,
            ResourceClass::AuditLogs => self.resources.purge_audit_logs(job).await,
        }
    }

    async fn clean_files(&self, job: &CleanupJob) -> Result<usize, String> {
        let files = self.resources.list_files(job).await?;
        let doomed = files_to_remove(
            &files,
            &job.reason,
            self.clock.now(),
            self.config.file_retention,
        );

        let results = join_all(doomed.iter().map(|f| self.resources.delete_file(job, f))).await;
        let mut removed = 0;
        let mut errors = Vec::new();
        for (file, result) in doomed.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(e) => errors.push(format!("{}: {e}", file.id)),
            }
        }
        if errors.is_empty() {
            Ok(removed)
        } else {
            Err(errors.join("; "))
        }
    }
}
