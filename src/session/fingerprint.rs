//! Session fingerprinting
//!
//! A fingerprint is the SHA-256 of a configurable set of stable client
//! signals (by default user agent, accept-language, accept-encoding and the
//! client IP). Highly volatile headers are left out of the default set.
//! The fingerprint is bound to a session on first sight; a later mismatch is
//! a hijacking signal.

use std::net::IpAddr;

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::FingerprintConfig;

/// Computes and compares client fingerprints.
#[derive(Debug, Clone)]
pub struct FingerprintGuard {
    config: FingerprintConfig,
}

impl FingerprintGuard {
    /// Create a guard.
    #[must_use]
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    /// Whether fingerprints are bound and checked.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Fingerprint of a request, or `None` when the guard is disabled.
    #[must_use]
    pub fn compute(&self, headers: &HeaderMap, ip: IpAddr) -> Option<String> {
        if !self.config.enabled {
            return None;
        }

        let mut hasher = Sha256::new();
        for name in &self.config.headers {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            hasher.update(name.to_ascii_lowercase().as_bytes());
            hasher.update(b"=");
            hasher.update(value.trim().as_bytes());
            hasher.update(b"\n");
        }
        if self.config.include_ip {
            hasher.update(b"ip=");
            hasher.update(ip.to_string().as_bytes());
        }
        Some(hex::encode(hasher.finalize()))
    }
}

/// Constant-time fingerprint comparison.
#[must_use]
pub fn fingerprints_match(bound: &str, presented: &str) -> bool {
    bound.as_bytes().ct_eq(presented.as_bytes()).into()
}
