//! Retry conditions and the per-route retry policy

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use super::header_matcher::HeaderMatcher;
use super::reset_header::ResetHeaderParser;
use crate::constants::{
    DEFAULT_HOST_SELECTION_MAX_ATTEMPTS, DEFAULT_MAX_RATE_LIMITED_INTERVAL_MS, DEFAULT_NUM_RETRIES,
};
use crate::http::headers::split_tokens;

/// A single condition that makes a failed attempt eligible for retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RetryOn {
    FiveXx,
    GatewayError,
    ConnectFailure,
    EnvoyRateLimited,
    Retriable4xx,
    RefusedStream,
    RetriableStatusCodes,
    RetriableHeaders,
    Reset,
    AltProtocolsPostConnectFailure,
    GrpcCancelled,
    GrpcDeadlineExceeded,
    GrpcResourceExhausted,
    GrpcUnavailable,
    GrpcInternal,
}

impl RetryOn {
    /// HTTP and transport conditions, accepted in `x-envoy-retry-on`
    pub const HTTP: [RetryOn; 10] = [
        RetryOn::FiveXx,
        RetryOn::GatewayError,
        RetryOn::ConnectFailure,
        RetryOn::EnvoyRateLimited,
        RetryOn::Retriable4xx,
        RetryOn::RefusedStream,
        RetryOn::RetriableStatusCodes,
        RetryOn::RetriableHeaders,
        RetryOn::Reset,
        RetryOn::AltProtocolsPostConnectFailure,
    ];

    /// gRPC status conditions, accepted in `x-envoy-retry-grpc-on`
    pub const GRPC: [RetryOn; 5] = [
        RetryOn::GrpcCancelled,
        RetryOn::GrpcDeadlineExceeded,
        RetryOn::GrpcResourceExhausted,
        RetryOn::GrpcUnavailable,
        RetryOn::GrpcInternal,
    ];

    /// Token used in configuration and request headers
    pub fn token(&self) -> &'static str {
        match self {
            RetryOn::FiveXx => "5xx",
            RetryOn::GatewayError => "gateway-error",
            RetryOn::ConnectFailure => "connect-failure",
            RetryOn::EnvoyRateLimited => "envoy-ratelimited",
            RetryOn::Retriable4xx => "retriable-4xx",
            RetryOn::RefusedStream => "refused-stream",
            RetryOn::RetriableStatusCodes => "retriable-status-codes",
            RetryOn::RetriableHeaders => "retriable-headers",
            RetryOn::Reset => "reset",
            RetryOn::AltProtocolsPostConnectFailure => "http3-post-connect-failure",
            RetryOn::GrpcCancelled => "cancelled",
            RetryOn::GrpcDeadlineExceeded => "deadline-exceeded",
            RetryOn::GrpcResourceExhausted => "resource-exhausted",
            RetryOn::GrpcUnavailable => "unavailable",
            RetryOn::GrpcInternal => "internal",
        }
    }

    pub fn is_grpc(&self) -> bool {
        Self::GRPC.contains(self)
    }
}

impl fmt::Display for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Set of enabled retry conditions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOnSet(BTreeSet<RetryOn>);

impl RetryOnSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, condition: RetryOn) -> bool {
        self.0.insert(condition)
    }

    pub fn contains(&self, condition: RetryOn) -> bool {
        self.0.contains(&condition)
    }

    pub fn contains_any(&self, conditions: &[RetryOn]) -> bool {
        conditions.iter().any(|c| self.0.contains(c))
    }

    /// Union `other` into this set
    pub fn merge(&mut self, other: &RetryOnSet) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = RetryOn> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<RetryOn> for RetryOnSet {
    fn from_iter<I: IntoIterator<Item = RetryOn>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for RetryOnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<&str> = self.0.iter().map(RetryOn::token).collect();
        f.write_str(&tokens.join(","))
    }
}

fn parse_tokens(value: &str, allowed: &[RetryOn]) -> (RetryOnSet, bool) {
    let mut set = RetryOnSet::new();
    let mut all_valid = true;
    for token in split_tokens(value) {
        match allowed.iter().find(|c| c.token() == token) {
            Some(condition) => {
                set.insert(*condition);
            }
            None => all_valid = false,
        }
    }
    (set, all_valid)
}

/// Parse a comma list of HTTP retry conditions.
///
/// Unknown tokens are skipped; the flag reports whether every token was
/// recognised.
pub fn parse_retry_on(value: &str) -> (RetryOnSet, bool) {
    parse_tokens(value, &RetryOn::HTTP)
}

/// Parse a comma list of gRPC retry conditions
pub fn parse_retry_grpc_on(value: &str) -> (RetryOnSet, bool) {
    parse_tokens(value, &RetryOn::GRPC)
}

/// Immutable retry configuration of a route
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_on: RetryOnSet,
    pub num_retries: u32,
    pub retriable_status_codes: Vec<u32>,
    /// Response headers that make a response retriable
    pub retriable_headers: Vec<HeaderMatcher>,
    /// When non-empty, only requests matching one of these are retried
    pub retriable_request_headers: Vec<HeaderMatcher>,
    /// Headers carrying a rate-limit reset interval
    pub reset_headers: Vec<ResetHeaderParser>,
    pub max_rate_limited_interval: Duration,
    /// Falls back to the `upstream.base_retry_backoff_ms` runtime key
    pub base_interval: Option<Duration>,
    /// Falls back to ten times the base interval
    pub max_interval: Option<Duration>,
    pub host_selection_max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(retry_on: RetryOnSet, num_retries: u32) -> Self {
        Self {
            retry_on,
            num_retries,
            ..Self::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_on: RetryOnSet::new(),
            num_retries: DEFAULT_NUM_RETRIES,
            retriable_status_codes: Vec::new(),
            retriable_headers: Vec::new(),
            retriable_request_headers: Vec::new(),
            reset_headers: Vec::new(),
            max_rate_limited_interval: Duration::from_millis(DEFAULT_MAX_RATE_LIMITED_INTERVAL_MS),
            base_interval: None,
            max_interval: None,
            host_selection_max_attempts: DEFAULT_HOST_SELECTION_MAX_ATTEMPTS,
        }
    }
}
