//! End-to-end tests of the access middleware over a real HTTP server
//!
//! Covers:
//! - Public paths and bearer token rejection
//! - Context propagation and token-expiry hint headers
//! - Session open / use / logout and implicit session creation
//! - Admin-only statistics
//! - Rate limiting, oversized payloads and IP blocks

mod common;

use std::time::Duration;

use access_gate::guard::BlockReason;
use access_gate::telemetry::events;
use access_gate::clock::Clock;
use common::{AUDIENCE, ISSUER, TestGate, access_token, client, sign, test_config};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{Value, json};

#[tokio::test]
async fn health_is_public() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;

    let response = client().get(format!("{base}/health")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("ratelimit-remaining"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn missing_and_invalid_tokens_share_one_rejection() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;

    let missing = client().get(format!("{base}/api/documents")).send().await.unwrap();
    let invalid = client()
        .get(format!("{base}/api/documents"))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();

    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
    let missing: Value = missing.json().await.unwrap();
    let invalid: Value = invalid.json().await.unwrap();
    assert_eq!(missing, invalid);
    assert_eq!(missing["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn valid_token_reaches_handler_with_context() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let token = access_token(&gate.clock, "ada", 3600);

    let response = client()
        .get(format!("{base}/api/documents/42"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key("x-token-refresh-needed"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["path"], "/api/documents/42");
    assert_eq!(body["user"]["id"], "ada");
    assert_eq!(body["token_type"], "access");
    assert_eq!(body["refresh_needed"], false);
    assert_eq!(body["ip"], "127.0.0.1");
}

#[tokio::test]
async fn token_near_expiry_gets_refresh_hints() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let token = access_token(&gate.clock, "ada", 120);

    let response = client()
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers["x-token-refresh-needed"], "true");
    assert!(headers.contains_key("x-token-expires-at"));
    let expires_in: u64 = headers["x-token-expires-in"].to_str().unwrap().parse().unwrap();
    assert!(expires_in <= 120);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let token = access_token(&gate.clock, "ada", 3600);
    let http = client();

    // GIVEN: a session opened with remember-me
    let created: Value = http
        .post(format!("{base}/api/auth/session"))
        .bearer_auth(&token)
        .json(&json!({"remember_me": true, "login_method": "password"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["session_id"].as_str().unwrap().to_string();
    assert_eq!(created["extended"], true);
    assert_eq!(gate.gate.sessions.get(&session_id).unwrap().client.login_method.as_deref(), Some("password"));

    // WHEN: the session header accompanies a request
    let response = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("x-session-id", &session_id)
        .send()
        .await
        .unwrap();

    // THEN: activity is recorded and the session expiry is reported
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-session-expires-at"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["session"]["id"], session_id.as_str());
    assert_eq!(body["session"]["activity_count"], 2);

    // WHEN: the user logs out
    let logout = http
        .delete(format!("{base}/api/auth/session"))
        .bearer_auth(&token)
        .header("x-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), StatusCode::NO_CONTENT);

    // THEN: the session is no longer accepted
    let after = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("x-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(after.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gate.gate.sessions.queue().len(), 1);
}

#[tokio::test]
async fn authenticated_request_without_session_opens_one() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let token = access_token(&gate.clock, "ada", 3600);
    let http = client();

    // WHEN: an authenticated request names no session
    let first = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    // THEN: a session is opened and its id handed back in the session header
    assert_eq!(first.status(), StatusCode::OK);
    let session_id = first.headers()["x-session-id"].to_str().unwrap().to_string();
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["session"]["id"], session_id.as_str());
    assert_eq!(body["session"]["activity_count"], 1);
    let opened = gate.gate.sessions.get(&session_id).unwrap();
    assert_eq!(opened.user_id, "ada");
    assert_eq!(opened.client.ip, Some("127.0.0.1".parse().unwrap()));

    // WHEN: the id is presented back
    let second = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("x-session-id", &session_id)
        .send()
        .await
        .unwrap();

    // THEN: the same session is resumed, not replaced
    assert_eq!(second.status(), StatusCode::OK);
    assert!(!second.headers().contains_key("x-session-id"));
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["session"]["activity_count"], 2);
    assert_eq!(gate.gate.sessions.sessions_for_user("ada").len(), 1);
    assert_eq!(gate.sink.count(events::SESSION_CREATED), 1);
}

#[tokio::test]
async fn unknown_session_id_is_replaced_with_a_new_session() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let token = access_token(&gate.clock, "ada", 3600);

    let response = client()
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("x-session-id", "never-issued")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let issued = response.headers()["x-session-id"].to_str().unwrap().to_string();
    assert_ne!(issued, "never-issued");
    assert!(gate.gate.sessions.get(&issued).is_some());
    assert!(gate.gate.sessions.get("never-issued").is_none());
}

#[tokio::test]
async fn stats_require_the_admin_role() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let http = client();
    let now = gate.clock.now().timestamp();
    let admin = sign(
        "k1",
        &json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "sub": "root",
            "scp": "read",
            "roles": ["access-gate.admin"],
            "iat": now,
            "exp": now + 3600,
        }),
    );

    // WHEN: a regular user asks for statistics
    let denied = http
        .get(format!("{base}/api/admin/stats"))
        .bearer_auth(access_token(&gate.clock, "ada", 3600))
        .send()
        .await
        .unwrap();

    // THEN: it is forbidden
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");

    // WHEN: an admin asks
    let allowed = http
        .get(format!("{base}/api/admin/stats"))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();

    // THEN: the counters are returned
    assert_eq!(allowed.status(), StatusCode::OK);
    let body: Value = allowed.json().await.unwrap();
    assert_eq!(body["sessions"]["active"], 2);
    assert!(body["validator"].is_object());
}

#[tokio::test]
async fn session_of_another_user_is_rejected() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let session = gate
        .gate
        .sessions
        .create("grace", Default::default(), false, None);
    let token = access_token(&gate.clock, "ada", 3600);

    let response = client()
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("x-session-id", &session.id)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gate.gate.sessions.get(&session.id).unwrap().activity_count, 1);
}

#[tokio::test]
async fn fingerprint_mismatch_rejects_session() {
    let mut config = test_config();
    config.fingerprint.enabled = true;
    let gate = TestGate::new(config);
    let base = gate.serve().await;
    let token = access_token(&gate.clock, "ada", 3600);
    let http = client();

    let created: Value = http
        .post(format!("{base}/api/auth/session"))
        .bearer_auth(&token)
        .header("accept-language", "en-GB")
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = created["session_id"].as_str().unwrap().to_string();

    let same = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("accept-language", "en-GB")
        .header("x-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(same.status(), StatusCode::OK);

    let different = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .header("accept-language", "fi-FI")
        .header("x-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(different.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rate_limit_rejects_request_past_quota() {
    // GIVEN: the general class allows 100 requests per minute
    let mut config = test_config();
    config.rate_limit.general.slow_down.enabled = false;
    let gate = TestGate::new(config);
    let base = gate.serve().await;
    let http = client();
    let token = access_token(&gate.clock, "ada", 3600);

    // WHEN: 101 requests arrive within the window
    for i in 1..=100 {
        let response = http
            .get(format!("{base}/api/documents"))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }
    let limited = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    // THEN: the 101st is rejected with a retry hint
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = limited.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after <= 60);
    assert_eq!(limited.headers()["ratelimit-remaining"], "0");
    assert_eq!(gate.sink.count(events::RATE_LIMIT_EXCEEDED), 1);

    // AND: a new window admits requests again
    gate.clock.advance(Duration::from_secs(61));
    let next = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(next.status(), StatusCode::OK);
}

#[tokio::test]
async fn oversized_payloads_escalate_to_block_before_validation() {
    // GIVEN: three oversized payloads within a minute trigger a block
    let mut config = test_config();
    config.abuse.max_payload_bytes = 1024;
    let gate = TestGate::new(config);
    let base = gate.serve().await;
    let http = client();
    let token = access_token(&gate.clock, "ada", 3600);
    let big = vec![b'x'; 4096];

    for _ in 0..3 {
        let response = http
            .post(format!("{base}/api/documents"))
            .bearer_auth(&token)
            .body(big.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    // WHEN: the same IP sends a valid request
    let response = http
        .get(format!("{base}/api/documents"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    // THEN: it is rejected before the token is looked at
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().contains_key("retry-after"));
    let block = gate.gate.abuse.is_blocked("127.0.0.1".parse().unwrap()).unwrap();
    assert_eq!(block.reason, BlockReason::OversizedPayloads);
    assert_eq!(gate.gate.validator.stats().verifications, 0);
    assert_eq!(gate.jwks.count(), 0);
}

#[tokio::test]
async fn bot_user_agent_is_rejected() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;

    let response = reqwest::Client::builder()
        .user_agent("curl/8.0")
        .build()
        .unwrap()
        .get(format!("{base}/health"))
        .header("origin", "http://192.168.0.7")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");
    assert_eq!(gate.sink.count(events::ABUSE_DETECTED), 1);
}

#[tokio::test]
async fn block_is_lifted_after_it_runs_out() {
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let ip = "127.0.0.1".parse().unwrap();
    gate.gate
        .abuse
        .block(ip, BlockReason::Manual, Duration::from_secs(600));

    let blocked = client().get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    gate.clock.advance(Duration::from_secs(601));
    let lifted = client().get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(lifted.status(), StatusCode::OK);
    assert_eq!(gate.sink.count(events::IP_UNBLOCKED), 1);
}
