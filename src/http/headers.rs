//! Well-known header names and small header helpers

use http::HeaderMap;

/// Retry conditions requested by the client (comma list)
pub const ENVOY_RETRY_ON: &str = "x-envoy-retry-on";
/// gRPC retry conditions requested by the client (comma list)
pub const ENVOY_RETRY_GRPC_ON: &str = "x-envoy-retry-grpc-on";
pub const ENVOY_MAX_RETRIES: &str = "x-envoy-max-retries";
pub const ENVOY_HEDGE_ON_PER_TRY_TIMEOUT: &str = "x-envoy-hedge-on-per-try-timeout";
pub const ENVOY_RETRIABLE_HEADER_NAMES: &str = "x-envoy-retriable-header-names";
pub const ENVOY_RETRIABLE_STATUS_CODES: &str = "x-envoy-retriable-status-codes";
pub const ENVOY_UPSTREAM_RQ_PER_TRY_TIMEOUT_MS: &str = "x-envoy-upstream-rq-per-try-timeout-ms";
/// Set on responses that an upstream proxy rate limited
pub const ENVOY_RATELIMITED: &str = "x-envoy-ratelimited";
/// RFC 8470: request was received in TLS early data
pub const EARLY_DATA: &str = "early-data";

/// Request headers that control retries; never forwarded upstream
pub const RETRY_CONTROL_HEADERS: [&str; 7] = [
    ENVOY_RETRY_ON,
    ENVOY_RETRY_GRPC_ON,
    ENVOY_MAX_RETRIES,
    ENVOY_HEDGE_ON_PER_TRY_TIMEOUT,
    ENVOY_RETRIABLE_HEADER_NAMES,
    ENVOY_RETRIABLE_STATUS_CODES,
    ENVOY_UPSTREAM_RQ_PER_TRY_TIMEOUT_MS,
];

/// First value of `name` as a string, if present and visible ASCII
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// All values of `name` joined with `,`, the way repeated headers are
/// folded for matching. `None` if the header is absent.
pub fn joined_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let mut values = headers.get_all(name).iter().peekable();
    values.peek()?;
    let joined = values
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect::<Vec<_>>()
        .join(",");
    Some(joined)
}

/// Split a comma list, trimming whitespace and skipping empty tokens
pub fn split_tokens(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|t| !t.is_empty())
}

pub fn is_5xx(status: u16) -> bool {
    (500..600).contains(&status)
}

pub fn is_gateway_error(status: u16) -> bool {
    matches!(status, 502..=504)
}
