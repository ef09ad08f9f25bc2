// Retry decision engine unit tests

use http::{HeaderMap, HeaderValue, Response};
use relaycore::http::StreamResetReason;
use relaycore::retry::*;
use rstest::rstest;

fn engine(retry_on: &str, codes: Vec<u32>) -> RetryDecisionEngine {
    let (mut conditions, _) = parse_retry_on(retry_on);
    conditions.merge(&parse_retry_grpc_on(retry_on).0);
    RetryDecisionEngine::new(conditions, codes, Vec::new())
}

fn response(status: u16) -> Response<()> {
    Response::builder().status(status).body(()).unwrap()
}

#[test]
fn test_too_early_without_early_data_retries_immediately() {
    let engine = engine("retriable-status-codes", vec![425]);
    let evaluation = engine.evaluate_headers(&response(425), &HeaderMap::new(), true);
    assert_eq!(evaluation.decision, RetryDecision::RetryNoBackoff);
    assert!(evaluation.disable_early_data);
}

#[test]
fn test_too_early_for_early_data_request_is_forwarded() {
    let engine = engine("retriable-status-codes", vec![425]);
    let mut original = HeaderMap::new();
    original.insert("early-data", HeaderValue::from_static("1"));
    let evaluation = engine.evaluate_headers(&response(425), &original, true);
    assert_eq!(evaluation.decision, RetryDecision::NoRetry);
    assert!(!evaluation.disable_early_data);
}

#[test]
fn test_too_early_with_feature_off_uses_backoff() {
    let engine = engine("retriable-status-codes", vec![425]);
    let evaluation = engine.evaluate_headers(&response(425), &HeaderMap::new(), false);
    assert_eq!(evaluation.decision, RetryDecision::RetryWithBackoff);
    // With the feature off every retry avoids early data
    assert!(evaluation.disable_early_data);
}

#[rstest]
#[case(StreamResetReason::Overflow, Some(true))]
#[case(StreamResetReason::Overflow, Some(false))]
#[case(StreamResetReason::Overflow, None)]
fn test_overflow_is_never_retried(
    #[case] reason: StreamResetReason,
    #[case] alt_protocol: Option<bool>,
) {
    let everything = engine(
        "5xx,gateway-error,reset,connect-failure,refused-stream,http3-post-connect-failure",
        vec![],
    );
    for feature in [true, false] {
        let evaluation = everything.evaluate_reset(reason, alt_protocol, feature);
        assert_eq!(evaluation.decision, RetryDecision::NoRetry);
        assert!(!evaluation.disable_alt_protocol);
    }
}

#[test]
fn test_rate_limited_marker_takes_precedence() {
    let mut limited = response(503);
    limited
        .headers_mut()
        .insert("x-envoy-ratelimited", HeaderValue::from_static("true"));

    let without = engine("5xx", vec![]);
    assert_eq!(
        without.evaluate_headers(&limited, &HeaderMap::new(), true).decision,
        RetryDecision::NoRetry
    );

    let with = engine("5xx,envoy-ratelimited", vec![]);
    assert_eq!(
        with.evaluate_headers(&limited, &HeaderMap::new(), true).decision,
        RetryDecision::RetryWithBackoff
    );
}

#[rstest]
#[case("5xx", 500, RetryDecision::RetryWithBackoff)]
#[case("5xx", 404, RetryDecision::NoRetry)]
#[case("gateway-error", 504, RetryDecision::RetryWithBackoff)]
#[case("gateway-error", 500, RetryDecision::NoRetry)]
#[case("retriable-4xx", 409, RetryDecision::RetryWithBackoff)]
#[case("retriable-4xx", 429, RetryDecision::NoRetry)]
fn test_status_families(
    #[case] retry_on: &str,
    #[case] status: u16,
    #[case] expected: RetryDecision,
) {
    let engine = engine(retry_on, vec![]);
    assert_eq!(
        engine
            .evaluate_headers(&response(status), &HeaderMap::new(), true)
            .decision,
        expected
    );
}

#[test]
fn test_grpc_status_in_headers() {
    let engine = engine("unavailable", vec![]);
    let mut unavailable = response(200);
    unavailable
        .headers_mut()
        .insert("grpc-status", HeaderValue::from_static("14"));
    assert_eq!(
        engine
            .evaluate_headers(&unavailable, &HeaderMap::new(), true)
            .decision,
        RetryDecision::RetryWithBackoff
    );

    let mut internal = response(200);
    internal
        .headers_mut()
        .insert("grpc-status", HeaderValue::from_static("13"));
    assert_eq!(
        engine
            .evaluate_headers(&internal, &HeaderMap::new(), true)
            .decision,
        RetryDecision::NoRetry
    );
}

#[test]
fn test_zero_rtt_failure_retries_before_alt_protocol_rule() {
    let engine = engine("http3-post-connect-failure", vec![]);

    let handshake = engine.evaluate_reset(StreamResetReason::ConnectionFailure, Some(true), true);
    assert_eq!(handshake.decision, RetryDecision::RetryNoBackoff);
    assert!(!handshake.disable_alt_protocol);

    let post_connect = engine.evaluate_reset(StreamResetReason::RemoteReset, Some(true), true);
    assert_eq!(post_connect.decision, RetryDecision::RetryNoBackoff);
    assert!(post_connect.disable_alt_protocol);

    let over_tcp = engine.evaluate_reset(StreamResetReason::RemoteReset, Some(false), true);
    assert_eq!(over_tcp.decision, RetryDecision::NoRetry);
}

#[test]
fn test_refused_stream_only_matches_remote_refusal() {
    let engine = engine("refused-stream", vec![]);
    assert_eq!(
        engine
            .evaluate_reset(StreamResetReason::RemoteRefusedStreamReset, Some(false), true)
            .decision,
        RetryDecision::RetryWithBackoff
    );
    assert_eq!(
        engine
            .evaluate_reset(StreamResetReason::RemoteReset, Some(false), true)
            .decision,
        RetryDecision::NoRetry
    );
}
