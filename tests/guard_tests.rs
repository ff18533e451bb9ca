//! Rate limiting and abuse detection through the wired access gate

mod common;

use std::net::IpAddr;
use std::time::Duration;

use access_gate::guard::{AbuseVerdict, BlockReason, EndpointClass, RateDecision, RequestSignals};
use access_gate::telemetry::events;
use common::{TestGate, client, test_config};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn browser() -> RequestSignals {
    RequestSignals {
        origin: Some("https://app.example.com".to_string()),
        user_agent: Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0)".to_string()),
        forwarded_for: None,
    }
}

#[test]
fn routes_classify_by_longest_prefix() {
    let gate = TestGate::new(test_config());
    let limiter = &gate.gate.rate_limiter;

    assert_eq!(limiter.classify("/api/auth/refresh"), EndpointClass::Auth);
    assert_eq!(limiter.classify("/api/admin/stats"), EndpointClass::Sensitive);
    assert_eq!(limiter.classify("/api/upload/files"), EndpointClass::Upload);
    assert_eq!(limiter.classify("/api/documents"), EndpointClass::General);
    assert_eq!(limiter.classify("/health"), EndpointClass::Public);
}

#[test]
fn quotas_are_per_ip_and_class() {
    // GIVEN: the auth class allows five requests per fifteen minutes
    let gate = TestGate::new(test_config());
    let limiter = &gate.gate.rate_limiter;
    let client_a = ip("10.0.0.1");

    for _ in 0..5 {
        assert!(limiter.check(client_a, EndpointClass::Auth).is_allowed());
    }

    // WHEN: the sixth auth request arrives
    let decision = limiter.check(client_a, EndpointClass::Auth);

    // THEN: it is limited, while other IPs and classes are unaffected
    let RateDecision::Limited(rejection) = decision else {
        panic!("expected a rate limit rejection");
    };
    assert_eq!(rejection.class, EndpointClass::Auth);
    assert_eq!(rejection.limit, 5);
    assert!(rejection.retry_after_secs > 0 && rejection.retry_after_secs <= 15 * 60);
    assert!(limiter.check(ip("10.0.0.2"), EndpointClass::Auth).is_allowed());
    assert!(limiter.check(client_a, EndpointClass::General).is_allowed());
    assert_eq!(gate.sink.count(events::RATE_LIMIT_EXCEEDED), 1);
}

#[test]
fn slow_down_grows_and_is_capped() {
    // GIVEN: general requests slow down after 50, by 100ms each, up to 2s
    let gate = TestGate::new(test_config());
    let limiter = &gate.gate.rate_limiter;
    let client = ip("10.0.0.3");

    // WHEN: the whole quota is used
    let delays: Vec<Duration> = (0..100)
        .map(|_| match limiter.check(client, EndpointClass::General) {
            RateDecision::Allowed { delay, .. } => delay,
            RateDecision::Limited(_) => panic!("quota not yet used up"),
        })
        .collect();

    // THEN: no delay up to the threshold, then a non-decreasing delay up to the cap
    assert!(delays[..50].iter().all(Duration::is_zero));
    assert_eq!(delays[50], Duration::from_millis(100));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(delays[99], Duration::from_secs(2));
}

#[test]
fn window_prune_forgets_idle_clients() {
    let gate = TestGate::new(test_config());
    let limiter = &gate.gate.rate_limiter;
    limiter.check(ip("10.0.0.4"), EndpointClass::General);
    limiter.check(ip("10.0.0.4"), EndpointClass::Chat);

    gate.clock.advance(Duration::from_secs(61));

    assert_eq!(limiter.prune(), 2);
    assert_eq!(limiter.tracked(), 0);
}

#[test]
fn score_is_stable_for_the_same_request() {
    // GIVEN: a request with a bot user agent and an IP-literal origin
    let gate = TestGate::new(test_config());
    let abuse = &gate.gate.abuse;
    let suspicious = RequestSignals {
        origin: Some("http://10.1.2.3".to_string()),
        user_agent: Some("curl/8".to_string()),
        forwarded_for: None,
    };

    // WHEN: it is scored repeatedly
    let first = abuse.score(ip("10.0.0.5"), &suspicious);
    let second = abuse.score(ip("10.0.0.5"), &suspicious);

    // THEN: the score does not drift and crosses the threshold
    assert!((first - second).abs() < f64::EPSILON);
    assert!(first > 0.7);
    assert!(abuse.score(ip("10.0.0.5"), &browser()).abs() < f64::EPSILON);
}

#[test]
fn prior_block_raises_score() {
    let gate = TestGate::new(test_config());
    let abuse = &gate.gate.abuse;
    let offender = ip("10.0.0.6");
    let before = abuse.score(offender, &browser());

    abuse.block(offender, BlockReason::Manual, Duration::from_secs(60));
    assert!(abuse.unblock(offender));

    let after = abuse.score(offender, &browser());
    assert!(after > before);
    assert!(matches!(abuse.inspect(offender, &browser()), AbuseVerdict::Allow { .. }));
}

#[test]
fn prune_lifts_expired_blocks_and_idle_trackers() {
    let gate = TestGate::new(test_config());
    let abuse = &gate.gate.abuse;
    let offender = ip("10.0.0.7");
    abuse.inspect(offender, &browser());
    abuse.block(offender, BlockReason::Manual, Duration::from_secs(60));

    gate.clock.advance(Duration::from_secs(2 * 60 * 60));
    let report = abuse.prune();

    assert_eq!(report.blocks_lifted, 1);
    assert_eq!(report.trackers_removed, 1);
    assert_eq!(abuse.block_count(), 0);
    assert!(abuse.tracker(offender).is_none());
    assert_eq!(gate.sink.count(events::IP_UNBLOCKED), 1);
}

#[tokio::test]
async fn repeated_auth_failures_block_the_ip() {
    // GIVEN: ten failed authentications within fifteen minutes trigger a block
    let gate = TestGate::new(test_config());
    let base = gate.serve().await;
    let http = client();

    for _ in 0..10 {
        let response = http
            .get(format!("{base}/api/documents"))
            .bearer_auth("forged.token.value")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // WHEN: the same IP tries again
    let response = http.get(format!("{base}/health")).send().await.unwrap();

    // THEN: it is refused as blocked
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let block = gate.gate.abuse.is_blocked(ip("127.0.0.1")).unwrap();
    assert_eq!(block.reason, BlockReason::AuthFailures);
    assert_eq!(gate.sink.count(events::IP_BLOCKED), 1);
}
