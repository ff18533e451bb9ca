//! Request guards: per-class rate limiting and abuse detection.

pub mod abuse;
pub mod rate_limit;

pub use abuse::{AbuseDetector, AbuseRejection, AbuseVerdict, BlockReason, IpBlock, PruneReport, RequestSignals};
pub use rate_limit::{EndpointClass, RateDecision, RateLimitRejection, RateLimiter};
