//! Token validation and signing key resolution through the wired access gate

mod common;

use std::time::Duration;

use access_gate::auth::validator::access_token_hash;
use access_gate::auth::{KeyFetchError, TokenType, ValidationError, ValidationOptions};
use access_gate::clock::Clock;
use access_gate::telemetry::events;
use common::{AUDIENCE, CLIENT_ID, ISSUER, TestGate, access_token, sign, test_config};
use jsonwebtoken::Algorithm;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn repeated_validation_is_served_from_cache() {
    // GIVEN: a valid access token
    let gate = TestGate::new(test_config());
    let token = access_token(&gate.clock, "ada", 3600);
    let options = ValidationOptions::default();

    // WHEN: it is validated twice
    let first = gate.gate.validator.validate(&token, &options).await.unwrap();
    let second = gate.gate.validator.validate(&token, &options).await.unwrap();

    // THEN: signature verification and key fetch ran once
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.user, first.user);
    assert_eq!(gate.gate.validator.stats().verifications, 1);
    assert_eq!(gate.jwks.count(), 1);
}

#[tokio::test]
async fn token_expired_one_second_ago_is_rejected() {
    let mut config = test_config();
    config.validator.clock_skew = Duration::ZERO;
    let gate = TestGate::new(config);
    let token = access_token(&gate.clock, "ada", -1);

    let err = gate
        .gate
        .validator
        .validate(&token, &ValidationOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_expired());
    assert_eq!(gate.sink.count(events::TOKEN_VALIDATION_FAILED), 1);
}

#[tokio::test]
async fn unknown_key_id_fails_validation() {
    let gate = TestGate::new(test_config());
    let now = gate.clock.now().timestamp();
    let token = sign(
        "rotated-away",
        &json!({"iss": ISSUER, "aud": AUDIENCE, "sub": "ada", "scp": "read", "exp": now + 600}),
    );

    let err = gate
        .gate
        .validator
        .validate(&token, &ValidationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, ValidationError::Key(KeyFetchError::UnknownKeyId(ref kid)) if kid == "rotated-away"));
}

#[tokio::test]
async fn wrong_issuer_and_audience_are_rejected() {
    let gate = TestGate::new(test_config());
    let now = gate.clock.now().timestamp();
    let options = ValidationOptions::default();

    let foreign_issuer = sign(
        "k1",
        &json!({"iss": "https://evil.test", "aud": AUDIENCE, "sub": "ada", "exp": now + 600}),
    );
    let foreign_audience = sign(
        "k1",
        &json!({"iss": ISSUER, "aud": "api://other", "sub": "ada", "exp": now + 600}),
    );

    assert!(matches!(
        gate.gate.validator.validate(&foreign_issuer, &options).await,
        Err(ValidationError::InvalidIssuer(_))
    ));
    assert_eq!(
        gate.gate.validator.validate(&foreign_audience, &options).await.unwrap_err(),
        ValidationError::InvalidAudience
    );
}

#[tokio::test]
async fn id_token_must_bind_its_access_token() {
    // GIVEN: an ID token issued alongside `access`
    let gate = TestGate::new(test_config());
    let now = gate.clock.now().timestamp();
    let access = access_token(&gate.clock, "ada", 3600);
    let other_access = access_token(&gate.clock, "mallory", 3600);
    let id_token = sign(
        "k1",
        &json!({
            "iss": ISSUER,
            "aud": CLIENT_ID,
            "sub": "ada",
            "nonce": "n-0S6",
            "at_hash": access_token_hash(&access, Algorithm::RS256),
            "iat": now,
            "exp": now + 3600,
        }),
    );

    // WHEN / THEN: paired with its own access token it validates as an ID token
    let bound = ValidationOptions {
        expected_type: Some(TokenType::Id),
        nonce: Some("n-0S6".to_string()),
        access_token: Some(access),
        ..ValidationOptions::default()
    };
    let result = gate.gate.validator.validate(&id_token, &bound).await.unwrap();
    assert_eq!(result.token_type, TokenType::Id);

    // WHEN / THEN: paired with another access token it is rejected
    let swapped = ValidationOptions {
        access_token: Some(other_access),
        ..bound.clone()
    };
    assert_eq!(
        gate.gate.validator.validate(&id_token, &swapped).await.unwrap_err(),
        ValidationError::AtHashMismatch
    );

    // WHEN / THEN: a replayed nonce is rejected
    let replayed = ValidationOptions {
        nonce: Some("other".to_string()),
        ..bound
    };
    assert_eq!(
        gate.gate.validator.validate(&id_token, &replayed).await.unwrap_err(),
        ValidationError::NonceMismatch
    );
}

#[tokio::test]
async fn profile_prefers_extension_claims() {
    let gate = TestGate::new(test_config());
    let now = gate.clock.now().timestamp();
    let token = sign(
        "k1",
        &json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "sub": "subject-1",
            "oid": "object-1",
            "emails": ["ada@example.com"],
            "extension_Department": "Research",
            "department": "Legacy",
            "companyName": "Analytical Engines",
            "scp": "read",
            "exp": now + 600,
        }),
    );

    let user = gate
        .gate
        .validator
        .validate(&token, &ValidationOptions::default())
        .await
        .unwrap()
        .user;

    assert_eq!(user.id, "object-1");
    assert_eq!(user.email.as_deref(), Some("ada@example.com"));
    assert_eq!(user.attributes["department"], "Research");
    assert_eq!(user.attributes["company"], "Analytical Engines");
}

#[tokio::test]
async fn key_cache_serves_until_ttl() {
    let mut config = test_config();
    config.keys.cache_ttl = Duration::from_secs(60);
    let gate = TestGate::new(config);

    gate.gate.keys.get_signing_key("k1").await.unwrap();
    gate.gate.keys.get_signing_key("k1").await.unwrap();
    assert_eq!(gate.jwks.count(), 1);

    gate.clock.advance(Duration::from_secs(61));
    assert_eq!(gate.gate.keys.evict_expired(), 1);
    gate.gate.keys.get_signing_key("k1").await.unwrap();
    assert_eq!(gate.jwks.count(), 2);
}
