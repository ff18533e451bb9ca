//! Error types for the access gate

use std::io;

use thiserror::Error;

use crate::auth::keys::KeyFetchError;
use crate::auth::refresh::RefreshError;
use crate::auth::validator::ValidationError;
use crate::session::cleanup::CleanupError;
use crate::session::store::SessionError;

/// Result type alias for the access gate
pub type Result<T> = std::result::Result<T, Error>;

/// Access gate errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signing key could not be resolved
    #[error(transparent)]
    KeyFetch(#[from] KeyFetchError),

    /// Token failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Token refresh failed
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    /// Session lookup or update failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Resource cleanup failed
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Category reported to external callers.
    ///
    /// Everything that is not a server fault collapses into `unauthorized` so a
    /// caller cannot tell which control rejected it.
    #[must_use]
    pub fn public_code(&self) -> &'static str {
        match self {
            Self::KeyFetch(_) | Self::Validation(_) | Self::Refresh(_) | Self::Session(_) => {
                "unauthorized"
            }
            _ => "internal_error",
        }
    }
}
