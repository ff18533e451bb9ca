//! Session lifecycle: store, fingerprint guard and expired-session cleanup.

pub mod cleanup;
pub mod fingerprint;
pub mod store;

pub use cleanup::{
    CleanupEngine, CleanupError, CleanupJob, CleanupQueue, CleanupReport, NoResources,
    ResourceClass, SessionResources, StoredFile,
};
pub use fingerprint::FingerprintGuard;
pub use store::{
    ClientMetadata, ExpiredSession, ExpiryReason, Session, SessionError, SessionStats,
    SessionStore, SweepReport,
};
