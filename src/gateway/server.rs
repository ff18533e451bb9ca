//! Access control service object and HTTP server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::router::create_router;
use crate::auth::{
    HttpIdentityProvider, HttpJwksSource, IdentityProvider, JwksSource, KeyResolver, TokenRefresher,
    TokenValidator,
};
use crate::clock::{Clock, SystemClock, chrono_duration};
use crate::config::Config;
use crate::guard::{AbuseDetector, PruneReport, RateLimiter};
use crate::session::{
    CleanupEngine, CleanupQueue, FingerprintGuard, NoResources, SessionResources, SessionStore,
};
use crate::telemetry::{TelemetrySink, TracingSink};
use crate::{Error, Result};

/// External systems the access gate talks to.
pub struct Collaborators {
    /// Signing key set
    pub jwks: Arc<dyn JwksSource>,
    /// Refresh and revocation endpoints
    pub provider: Arc<dyn IdentityProvider>,
    /// Per-session resources released by cleanup
    pub resources: Arc<dyn SessionResources>,
}

impl Collaborators {
    /// HTTP collaborators for the configured endpoints. Session resources are
    /// not managed by the standalone server.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if an HTTP client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            jwks: Arc::new(HttpJwksSource::new(
                config.keys.resolved_jwks_uri(),
                config.keys.fetch_timeout,
            )?),
            provider: Arc::new(HttpIdentityProvider::new(config.refresh.clone())?),
            resources: Arc::new(NoResources),
        })
    }
}

/// Every access-control component, wired together.
///
/// Request handlers and background tasks share the same stores through this
/// object; each store guards its own state.
pub struct AccessControl {
    /// Resolved configuration
    pub config: Config,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Telemetry sink
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Signing key resolver
    pub keys: Arc<KeyResolver>,
    /// Bearer token validator
    pub validator: Arc<TokenValidator>,
    /// Refresh token exchange
    pub refresher: Arc<TokenRefresher>,
    /// Session store
    pub sessions: Arc<SessionStore>,
    /// Expired session cleanup
    pub cleanup: Arc<CleanupEngine>,
    /// Session fingerprint guard
    pub fingerprint: FingerprintGuard,
    /// Per-IP rate limiter
    pub rate_limiter: Arc<RateLimiter>,
    /// Abuse scoring and IP blocks
    pub abuse: Arc<AbuseDetector>,
}

impl AccessControl {
    /// Wire all components.
    ///
    /// # Errors
    ///
    /// Returns an error if the validator configuration is unusable.
    pub fn build(
        config: Config,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self> {
        let keys = Arc::new(KeyResolver::new(
            config.keys.clone(),
            collaborators.jwks,
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));
        let validator = Arc::new(TokenValidator::new(
            config.validator.clone(),
            Arc::clone(&keys),
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        )?);
        let refresher = Arc::new(TokenRefresher::new(
            config.refresh.clone(),
            collaborators.provider,
            Arc::clone(&validator),
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));
        let queue = Arc::new(CleanupQueue::new(config.cleanup.batch_size));
        let sessions = Arc::new(SessionStore::new(
            config.session.clone(),
            queue,
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));
        let cleanup = Arc::new(CleanupEngine::new(
            config.cleanup.clone(),
            Arc::clone(&sessions),
            collaborators.resources,
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));
        let abuse = Arc::new(AbuseDetector::new(
            config.abuse.clone(),
            Arc::clone(&clock),
            Arc::clone(&telemetry),
        ));

        Ok(Self {
            fingerprint: FingerprintGuard::new(config.fingerprint.clone()),
            config,
            clock,
            telemetry,
            keys,
            validator,
            refresher,
            sessions,
            cleanup,
            rate_limiter,
            abuse,
        })
    }

    /// Production wiring: HTTP collaborators, system clock, tracing telemetry.
    ///
    /// # Errors
    ///
    /// Returns an error if the validator configuration is unusable.
    pub fn from_config(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::build(config, collaborators, Arc::new(SystemClock), Arc::new(TracingSink))
    }

    /// Whether `path` skips token validation.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.config
            .server
            .public_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    /// Start the periodic maintenance tasks. Each task stops when `shutdown` fires.
    pub fn spawn_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let keys = Arc::clone(&self.keys);
        let validator = Arc::clone(&self.validator);
        let sessions = Arc::clone(&self.sessions);
        let refresher = Arc::clone(&self.refresher);
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let abuse = Arc::clone(&self.abuse);
        let clock = Arc::clone(&self.clock);
        let revocation_horizon = chrono_duration(self.config.session.extended_timeout);

        vec![
            spawn_periodic("key-cache", self.config.keys.sweep_interval, shutdown.subscribe(), move || {
                let evicted = keys.evict_expired();
                if evicted > 0 {
                    debug!(count = evicted, "Evicted expired signing keys");
                }
            }),
            spawn_periodic(
                "validation-cache",
                self.config.validator.sweep_interval,
                shutdown.subscribe(),
                move || {
                    let evicted = validator.evict_expired();
                    if evicted > 0 {
                        debug!(count = evicted, "Evicted expired validation results");
                    }
                },
            ),
            spawn_periodic("session-sweep", self.config.session.sweep_interval, shutdown.subscribe(), move || {
                let report = sessions.sweep();
                let pruned = refresher.registry().prune(clock.now() - revocation_horizon);
                if report.expired > 0 || report.purged > 0 || pruned > 0 {
                    info!(
                        expired = report.expired,
                        purged = report.purged,
                        revocations_pruned = pruned,
                        "Session sweep"
                    );
                }
            }),
            spawn_periodic(
                "rate-limit-prune",
                self.config.rate_limit.prune_interval,
                shutdown.subscribe(),
                move || {
                    let pruned = rate_limiter.prune();
                    if pruned > 0 {
                        debug!(count = pruned, "Pruned stale rate-limit windows");
                    }
                },
            ),
            spawn_periodic("abuse-prune", self.config.abuse.prune_interval, shutdown.subscribe(), move || {
                let report = abuse.prune();
                if report != PruneReport::default() {
                    debug!(
                        trackers = report.trackers_removed,
                        blocks = report.blocks_lifted,
                        forgotten_blocks = report.block_history_forgotten,
                        "Pruned abuse state"
                    );
                }
            }),
            tokio::spawn(Arc::clone(&self.cleanup).run(shutdown.subscribe())),
        ]
    }
}

/// Run `tick` every `interval` until `shutdown` fires. The first tick is skipped.
fn spawn_periodic<F>(
    name: &'static str,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(),
                _ = shutdown.recv() => {
                    debug!(task = name, "Background task shutting down");
                    break;
                }
            }
        }
    })
}

/// Access gate HTTP server
pub struct Gateway {
    gate: Arc<AccessControl>,
}

impl Gateway {
    /// Create a server over production wiring.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_access_control(Arc::new(AccessControl::from_config(config)?)))
    }

    /// Create a server over an existing service object.
    #[must_use]
    pub fn with_access_control(gate: Arc<AccessControl>) -> Self {
        Self { gate }
    }

    /// Shared service object.
    #[must_use]
    pub fn access_control(&self) -> &Arc<AccessControl> {
        &self.gate
    }

    /// Serve until Ctrl+C or SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound or the server fails.
    pub async fn run(self) -> Result<()> {
        let config = &self.gate.config;
        let addr = SocketAddr::new(
            config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let tasks = self.gate.spawn_background(&shutdown_tx);

        match self.gate.keys.warm().await {
            Ok(count) => info!(keys = count, "Signing keys loaded"),
            Err(e) => warn!(error = %e, "Signing keys unavailable at startup, will fetch on demand"),
        }

        info!("============================================================");
        info!("ACCESS GATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %config.server.host, port = config.server.port, "Listening");
        info!(jwks = %config.keys.resolved_jwks_uri(), "Signing keys");
        info!(
            rate_limit = config.rate_limit.enabled,
            abuse = config.abuse.enabled,
            fingerprint = config.fingerprint.enabled,
            "Guards"
        );
        info!(paths = ?config.server.public_paths, "Public paths");
        info!("============================================================");

        let app = create_router(Arc::clone(&self.gate));
        self.serve(listener, app, shutdown_tx).await?;

        futures::future::join_all(tasks).await;
        info!("Background tasks stopped");
        Ok(())
    }

    async fn serve(
        &self,
        listener: TcpListener,
        app: axum::Router,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<()> {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }
}

/// Resolve on Ctrl+C or SIGTERM, then notify background tasks.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
