//! Access Gate Library
//!
//! Access-control runtime for APIs protected by bearer tokens.
//!
//! # Features
//!
//! - **Key Resolver**: cached, rate-limited signing key lookup from the identity provider
//! - **Token Validator**: signature, issuer, audience, expiry and policy checks with result caching
//! - **Token Refresher**: retrying refresh grant with verified results and refresh token rotation
//! - **Sessions**: sliding expiry, fingerprint binding, periodic sweep and batched cleanup
//! - **Guards**: fixed-window rate limiting with slow-down, abuse scoring and timed IP blocks
//! - **Middleware**: axum interceptor running every check in a fixed order

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
