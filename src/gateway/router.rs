//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension, Json, Router,
    extract::State,
    http::{Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use super::middleware::{RequestContext, access_middleware, forbidden, reject, unauthorized};
use super::server::AccessControl;
use crate::auth::{RefreshError, RefreshOptions};
use crate::session::ExpiryReason;

/// Create the router
pub fn create_router(gate: Arc<AccessControl>) -> Router {
    let timeout = gate.config.server.request_timeout;

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/auth/refresh", post(refresh_handler))
        .route("/api/auth/revoke", post(revoke_handler))
        .route(
            "/api/auth/session",
            post(create_session_handler).delete(logout_handler),
        )
        .route(
            "/api/auth/sessions",
            get(list_sessions_handler).delete(terminate_others_handler),
        )
        .route("/api/admin/stats", get(stats_handler))
        .route("/api/{*rest}", any(context_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&gate),
            access_middleware,
        ))
        .layer(request_timeout(timeout))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(gate)
}

#[allow(deprecated)]
fn request_timeout(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::new(timeout)
}

/// Health check
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
    #[serde(flatten)]
    options: RefreshOptions,
}

/// Exchange a refresh token for a new token set
async fn refresh_handler(
    State(gate): State<Arc<AccessControl>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<RefreshRequest>,
) -> Response {
    match gate.refresher.refresh_with(&body.refresh_token, &body.options).await {
        Ok(tokens) => Json(tokens).into_response(),
        Err(RefreshError::Exhausted { .. }) => reject(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Identity provider unavailable",
        ),
        Err(e) => {
            debug!(ip = %ctx.ip, reason = e.code(), "Refresh rejected");
            gate.abuse.record_auth_failure(ctx.ip);
            unauthorized()
        }
    }
}

/// Revoke a refresh token
async fn revoke_handler(
    State(gate): State<Arc<AccessControl>>,
    Json(body): Json<RefreshRequest>,
) -> StatusCode {
    gate.refresher.revoke(&body.refresh_token).await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    remember_me: bool,
    #[serde(default)]
    login_method: Option<String>,
}

/// Open a session for the authenticated user, or apply login choices to the
/// one the middleware resumed or opened for this request
async fn create_session_handler(
    State(gate): State<Arc<AccessControl>>,
    Extension(ctx): Extension<RequestContext>,
    Json(body): Json<CreateSessionRequest>,
) -> Response {
    let Some(current) = &ctx.session else {
        return unauthorized();
    };
    let session = match gate
        .sessions
        .remember(&current.id, body.remember_me, body.login_method)
    {
        Ok(session) => session,
        Err(e) => {
            debug!(ip = %ctx.ip, error = %e, "Session vanished before login completed");
            return unauthorized();
        }
    };

    let status = if ctx.session_created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(json!({
            "session_id": session.id,
            "header": gate.config.session.header,
            "created_at": session.created_at,
            "expires_at": session.expires_at,
            "extended": session.extended,
        })),
    )
        .into_response()
}

/// End the session named in the request
async fn logout_handler(
    State(gate): State<Arc<AccessControl>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    let Some(session) = &ctx.session else {
        return reject(StatusCode::NOT_FOUND, "not_found", "No active session");
    };
    match gate.sessions.terminate(&session.id, ExpiryReason::Logout) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => reject(StatusCode::NOT_FOUND, "not_found", "No active session"),
    }
}

/// Active sessions of the authenticated user
async fn list_sessions_handler(
    State(gate): State<Arc<AccessControl>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    let Some(user) = &ctx.user else {
        return unauthorized();
    };
    let current = ctx.session.as_ref().map(|s| s.id.as_str());

    let sessions: Vec<Value> = gate
        .sessions
        .sessions_for_user(&user.id)
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "current": Some(s.id.as_str()) == current,
                "created_at": s.created_at,
                "last_activity": s.last_activity,
                "expires_at": s.expires_at,
                "extended": s.extended,
                "user_agent": s.client.user_agent,
                "login_method": s.client.login_method,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions })).into_response()
}

/// Log out everywhere except the current session
async fn terminate_others_handler(
    State(gate): State<Arc<AccessControl>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    let Some(user) = &ctx.user else {
        return unauthorized();
    };
    let except = ctx.session.as_ref().map(|s| s.id.as_str());
    let terminated = gate
        .sessions
        .terminate_all_for_user(&user.id, except, &ExpiryReason::Terminated);

    info!(user_id = %user.id, terminated, "Terminated other sessions");
    Json(json!({ "terminated": terminated })).into_response()
}

/// Component statistics, for holders of the admin role
async fn stats_handler(
    State(gate): State<Arc<AccessControl>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    if !ctx.has_role(&gate.config.server.admin_role) {
        debug!(ip = %ctx.ip, "Stats requested without the admin role");
        return forbidden(None);
    }

    Json(json!({
        "sessions": gate.sessions.stats(),
        "keys": gate.keys.stats(),
        "validator": gate.validator.stats(),
        "cleanup": {
            "queued": gate.sessions.queue().len(),
            "busy": gate.cleanup.is_busy(),
        },
        "rate_limit": {
            "tracked": gate.rate_limiter.tracked(),
        },
        "abuse": {
            "blocked_ips": gate.abuse.block_count(),
        },
        "revoked_refresh_tokens": gate.refresher.registry().len(),
    }))
    .into_response()
}

/// Echo what the middleware attached to the request
async fn context_handler(
    method: Method,
    uri: Uri,
    Extension(ctx): Extension<RequestContext>,
) -> impl IntoResponse {
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "ip": ctx.ip,
        "class": ctx.class,
        "user": ctx.user,
        "token_type": ctx.token_type,
        "token_expires_at": ctx.token_expires_at,
        "refresh_needed": ctx.refresh_needed,
        "session": ctx.session.as_ref().map(|s| json!({
            "id": s.id,
            "expires_at": s.expires_at,
            "activity_count": s.activity_count,
        })),
    }))
}
