//! Access middleware
//!
//! Checks run in a fixed order, cheapest first:
//!
//! 1. IP block (403)
//! 2. Declared payload size (413, counted toward the oversized-payload rule)
//! 3. Rate limit (429), then progressive slow-down
//! 4. Abuse score (403)
//! 5. Bearer token (401), skipped on public paths
//! 6. Session: activity is recorded on the session the header names, and an
//!    authenticated request without a usable session id gets a new session,
//!    returned in the same header. Expired, foreign or fingerprint-mismatched
//!    sessions are refused (401).
//!
//! A blocked IP never reaches token validation. Rejection bodies only carry
//! the generic category; the specific reason goes to the log.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::server::AccessControl;
use crate::auth::{TokenType, UserProfile, ValidationOptions};
use crate::guard::{AbuseVerdict, EndpointClass, RateDecision, RateLimitRejection, RequestSignals};
use crate::session::{ClientMetadata, Session, SessionError};

/// Set to `true` when the bearer token is close to expiry.
pub const TOKEN_REFRESH_NEEDED: &str = "x-token-refresh-needed";
/// RFC 3339 expiry of a bearer token that needs refreshing.
pub const TOKEN_EXPIRES_AT: &str = "x-token-expires-at";
/// Seconds left on a bearer token that needs refreshing.
pub const TOKEN_EXPIRES_IN: &str = "x-token-expires-in";
/// RFC 3339 expiry of the session named in the request.
pub const SESSION_EXPIRES_AT: &str = "x-session-expires-at";

/// What the middleware learned about a request that passed.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Client address
    pub ip: IpAddr,
    /// Endpoint class used for rate limiting
    pub class: EndpointClass,
    /// Authenticated user, absent on public paths
    pub user: Option<UserProfile>,
    /// Inferred type of the bearer token
    pub token_type: Option<TokenType>,
    /// Bearer token expiry
    pub token_expires_at: Option<DateTime<Utc>>,
    /// The bearer token is within the refresh threshold
    pub refresh_needed: bool,
    /// Roles granted by the bearer token's `roles` claim
    pub roles: Vec<String>,
    /// Session named by the session header after its activity update, or
    /// the one opened for this request
    pub session: Option<Session>,
    /// The session was opened by this request
    pub session_created: bool,
}

impl RequestContext {
    /// Whether the bearer token grants `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Access control middleware
pub async fn access_middleware(
    State(gate): State<Arc<AccessControl>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&request, gate.config.server.trust_forwarded_for);
    let path = request.uri().path().to_string();

    if let Some(block) = gate.abuse.is_blocked(ip) {
        debug!(ip = %ip, path = %path, reason = block.reason.as_str(), "Blocked IP rejected");
        return forbidden(Some(seconds_until(block.until, gate.clock.now())));
    }

    if declared_length(request.headers()).is_some_and(|len| len > gate.abuse.max_payload_bytes()) {
        warn!(ip = %ip, path = %path, "Oversized payload rejected");
        gate.abuse.record_oversized_payload(ip);
        return reject(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            "Request body too large",
        );
    }

    let class = gate.rate_limiter.classify(&path);
    let limit = gate.config.rate_limit.limit_for(class).max_requests;
    let (remaining, reset_after) = match gate.rate_limiter.check(ip, class) {
        RateDecision::Allowed {
            remaining,
            reset_after,
            delay,
        } => {
            if !delay.is_zero() {
                debug!(ip = %ip, class = class.as_str(), delay = ?delay, "Slowing down client");
                tokio::time::sleep(delay).await;
            }
            (remaining, reset_after)
        }
        RateDecision::Limited(rejection) => return rate_limited(&rejection),
    };

    let signals = RequestSignals::from_headers(request.headers());
    if let AbuseVerdict::Reject(rejection) = gate.abuse.inspect(ip, &signals) {
        debug!(ip = %ip, path = %path, reason = rejection.reason_code, "Abuse check rejected request");
        let now = gate.clock.now();
        return forbidden(rejection.blocked_until.map(|until| seconds_until(until, now)));
    }

    let mut context = RequestContext {
        ip,
        class,
        user: None,
        token_type: None,
        token_expires_at: None,
        refresh_needed: false,
        roles: Vec::new(),
        session: None,
        session_created: false,
    };

    if gate.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping authentication");
    } else if let Err(response) = authenticate(&gate, request.headers(), &path, &mut context).await {
        return response;
    }

    request.extensions_mut().insert(context.clone());
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    set_header(headers, "ratelimit-limit", limit);
    set_header(headers, "ratelimit-remaining", remaining);
    set_header(headers, "ratelimit-reset", ceil_secs(reset_after));
    if context.refresh_needed {
        if let Some(expires_at) = context.token_expires_at {
            let now = gate.clock.now();
            set_header(headers, TOKEN_REFRESH_NEEDED, "true");
            set_header(headers, TOKEN_EXPIRES_AT, rfc3339(expires_at));
            set_header(headers, TOKEN_EXPIRES_IN, seconds_until(expires_at, now));
        }
    }
    if let Some(session) = &context.session {
        set_header(headers, SESSION_EXPIRES_AT, rfc3339(session.expires_at));
        if context.session_created {
            set_header(headers, &gate.config.session.header, &session.id);
        }
    }
    response
}

/// Validate the bearer token, then resume or open the caller's session.
async fn authenticate(
    gate: &AccessControl,
    headers: &HeaderMap,
    path: &str,
    context: &mut RequestContext,
) -> Result<(), Response> {
    let Some(token) = bearer_token(headers) else {
        debug!(ip = %context.ip, path, "Missing bearer token");
        return Err(unauthorized());
    };

    let validated = match gate.validator.validate(token, &ValidationOptions::default()).await {
        Ok(result) => result,
        Err(e) => {
            debug!(ip = %context.ip, reason = e.code(), "Bearer token rejected");
            gate.abuse.record_auth_failure(context.ip);
            return Err(unauthorized());
        }
    };

    let fingerprint = gate.fingerprint.compute(headers, context.ip);
    let mut resumed = None;
    if let Some(session_id) = header_str(headers, &gate.config.session.header) {
        if let Some(existing) = gate.sessions.get(session_id) {
            if existing.user_id != validated.user.id {
                warn!(ip = %context.ip, session_id, "Session presented with another user's token");
                gate.abuse.record_auth_failure(context.ip);
                return Err(unauthorized());
            }
        }

        match gate.sessions.record_activity(session_id, fingerprint.as_deref()) {
            Ok(session) => resumed = Some(session),
            Err(SessionError::NotFound(_)) => {
                debug!(ip = %context.ip, "Unknown session id, opening a new session");
            }
            Err(e) => {
                debug!(ip = %context.ip, error = %e, "Session rejected");
                return Err(unauthorized());
            }
        }
    }

    let session = match resumed {
        Some(session) => session,
        None => {
            context.session_created = true;
            let client = ClientMetadata {
                user_agent: header_str(headers, header::USER_AGENT.as_str()).map(ToString::to_string),
                ip: Some(context.ip),
                login_method: None,
            };
            gate.sessions.create(&validated.user.id, client, false, fingerprint)
        }
    };

    context.session = Some(session);
    context.refresh_needed = gate.refresher.needs_refresh(token);
    context.token_type = Some(validated.token_type);
    context.token_expires_at = Some(validated.expires_at);
    context.roles = claim_roles(&validated.claims);
    context.user = Some(validated.user);
    Ok(())
}

/// Roles from the `roles` claim, as an array or a single string.
fn claim_roles(claims: &Map<String, Value>) -> Vec<String> {
    match claims.get("roles") {
        Some(Value::String(role)) => vec![role.clone()],
        Some(Value::Array(roles)) => roles
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Client address: the first `X-Forwarded-For` hop when trusted, otherwise the peer.
pub fn client_ip(request: &Request<Body>, trust_forwarded_for: bool) -> IpAddr {
    trust_forwarded_for
        .then(|| forwarded_client(request.headers()))
        .flatten()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

fn forwarded_client(headers: &HeaderMap) -> Option<IpAddr> {
    header_str(headers, "x-forwarded-for")?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH.as_str())?.parse().ok()
}

fn seconds_until(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (until - now).to_std().map_or(0, ceil_secs)
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn set_header(headers: &mut HeaderMap, name: &str, value: impl ToString) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&value.to_string()),
    ) {
        headers.insert(name, value);
    }
}

/// JSON error response with the generic `{"error": {"code", "message"}}` shape.
pub(crate) fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}

/// 401 shared by every authentication failure.
pub(crate) fn unauthorized() -> Response {
    let mut response = reject(StatusCode::UNAUTHORIZED, "unauthorized", "Authentication required");
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}

pub(crate) fn forbidden(retry_after: Option<u64>) -> Response {
    let mut response = reject(StatusCode::FORBIDDEN, "forbidden", "Request rejected");
    if let Some(secs) = retry_after {
        set_header(response.headers_mut(), "retry-after", secs);
    }
    response
}

fn rate_limited(rejection: &RateLimitRejection) -> Response {
    let mut response = reject(
        StatusCode::TOO_MANY_REQUESTS,
        rejection.reason_code,
        "Too many requests",
    );
    let headers = response.headers_mut();
    set_header(headers, "retry-after", rejection.retry_after_secs);
    set_header(headers, "ratelimit-limit", rejection.limit);
    set_header(headers, "ratelimit-remaining", 0);
    set_header(headers, "ratelimit-reset", rejection.retry_after_secs);
    response
}
