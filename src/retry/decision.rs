//! Retry decision engine
//!
//! Pure evaluation of one failed attempt against the merged retry
//! conditions. Nothing here touches budgets, timers or counters.
//!
//! ## Response evaluation order (first match wins)
//!
//! 1. `x-envoy-ratelimited` marker: retry only under `envoy-ratelimited`
//! 2. `5xx`
//! 3. `gateway-error` (502, 503, 504)
//! 4. `retriable-4xx` (409 only)
//! 5. `retriable-status-codes`, with the 425 Too Early carve-out
//! 6. `retriable-headers`
//! 7. gRPC status conditions
//!
//! ## Reset evaluation order
//!
//! 1. Overflow is never retried
//! 2. Early-data/alt-protocol dispositions (runtime gated)
//! 3. `reset`, then `5xx`/`gateway-error`, then `refused-stream`, then
//!    `connect-failure`

use http::{HeaderMap, Response, StatusCode};

use super::header_matcher::HeaderMatcher;
use super::policy::{RetryOn, RetryOnSet};
use crate::http::grpc::{grpc_status, GrpcStatus};
use crate::http::headers::{is_5xx, is_gateway_error, EARLY_DATA, ENVOY_RATELIMITED};
use crate::http::StreamResetReason;

/// Outcome of evaluating one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    /// Retry on the next event-loop iteration
    RetryNoBackoff,
    /// Retry after a backoff interval
    RetryWithBackoff,
}

/// Decision for a response, plus whether the retry must avoid early data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadersEvaluation {
    pub decision: RetryDecision,
    pub disable_early_data: bool,
}

/// Decision for a reset, plus whether the retry must avoid the alt protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetEvaluation {
    pub decision: RetryDecision,
    pub disable_alt_protocol: bool,
}

impl ResetEvaluation {
    fn plain(decision: RetryDecision) -> Self {
        Self {
            decision,
            disable_alt_protocol: false,
        }
    }
}

/// Retry conditions of one request (route policy merged with request overrides)
#[derive(Debug, Clone, Default)]
pub struct RetryDecisionEngine {
    retry_on: RetryOnSet,
    retriable_status_codes: Vec<u32>,
    retriable_headers: Vec<HeaderMatcher>,
}

const GRPC_CONDITIONS: [(GrpcStatus, RetryOn); 5] = [
    (GrpcStatus::Cancelled, RetryOn::GrpcCancelled),
    (GrpcStatus::DeadlineExceeded, RetryOn::GrpcDeadlineExceeded),
    (GrpcStatus::ResourceExhausted, RetryOn::GrpcResourceExhausted),
    (GrpcStatus::Unavailable, RetryOn::GrpcUnavailable),
    (GrpcStatus::Internal, RetryOn::GrpcInternal),
];

impl RetryDecisionEngine {
    pub fn new(
        retry_on: RetryOnSet,
        retriable_status_codes: Vec<u32>,
        retriable_headers: Vec<HeaderMatcher>,
    ) -> Self {
        Self {
            retry_on,
            retriable_status_codes,
            retriable_headers,
        }
    }

    pub fn retry_on(&self) -> &RetryOnSet {
        &self.retry_on
    }

    pub fn retry_on_mut(&mut self) -> &mut RetryOnSet {
        &mut self.retry_on
    }

    pub fn retriable_status_codes(&self) -> &[u32] {
        &self.retriable_status_codes
    }

    pub fn add_retriable_status_code(&mut self, code: u32) {
        self.retriable_status_codes.push(code);
    }

    pub fn add_retriable_header(&mut self, matcher: HeaderMatcher) {
        self.retriable_headers.push(matcher);
    }

    /// Evaluate a response.
    ///
    /// `early_data_and_alt_svc` is the runtime gate for early-data aware
    /// dispositions; while it is off every retry avoids early data.
    pub fn evaluate_headers<T>(
        &self,
        response: &Response<T>,
        original_request: &HeaderMap,
        early_data_and_alt_svc: bool,
    ) -> HeadersEvaluation {
        let mut disable_early_data = !early_data_and_alt_svc;
        let decision = self.decide_from_headers(
            response,
            original_request,
            early_data_and_alt_svc,
            &mut disable_early_data,
        );
        HeadersEvaluation {
            decision,
            disable_early_data,
        }
    }

    fn decide_from_headers<T>(
        &self,
        response: &Response<T>,
        original_request: &HeaderMap,
        early_data_and_alt_svc: bool,
        disable_early_data: &mut bool,
    ) -> RetryDecision {
        // An upstream proxy rate limited this request
        if response.headers().contains_key(ENVOY_RATELIMITED) {
            return if self.retry_on.contains(RetryOn::EnvoyRateLimited) {
                RetryDecision::RetryWithBackoff
            } else {
                RetryDecision::NoRetry
            };
        }

        let status = response.status().as_u16();

        if self.retry_on.contains(RetryOn::FiveXx) && is_5xx(status) {
            return RetryDecision::RetryWithBackoff;
        }

        if self.retry_on.contains(RetryOn::GatewayError) && is_gateway_error(status) {
            return RetryDecision::RetryWithBackoff;
        }

        if self.retry_on.contains(RetryOn::Retriable4xx) && response.status() == StatusCode::CONFLICT {
            return RetryDecision::RetryWithBackoff;
        }

        if self.retry_on.contains(RetryOn::RetriableStatusCodes) {
            for &code in &self.retriable_status_codes {
                if code != u32::from(status) {
                    continue;
                }
                if !early_data_and_alt_svc || code != u32::from(StatusCode::TOO_EARLY.as_u16()) {
                    return RetryDecision::RetryWithBackoff;
                }
                // A request that arrived as early data gets the 425 forwarded instead
                if !original_request.contains_key(EARLY_DATA) {
                    *disable_early_data = true;
                    return RetryDecision::RetryNoBackoff;
                }
            }
        }

        if self.retry_on.contains(RetryOn::RetriableHeaders)
            && self.retriable_headers.iter().any(|m| m.matches_response(response))
        {
            return RetryDecision::RetryWithBackoff;
        }

        if self.retry_on.contains_any(&RetryOn::GRPC) {
            if let Some(status) = grpc_status(response.headers()) {
                let retriable = GRPC_CONDITIONS
                    .iter()
                    .any(|(s, condition)| *s == status && self.retry_on.contains(*condition));
                if retriable {
                    return RetryDecision::RetryWithBackoff;
                }
            }
        }

        RetryDecision::NoRetry
    }

    /// Evaluate a stream reset.
    ///
    /// `was_using_alt_protocol` is `None` when no request was ever encoded
    /// (the failure happened in the pool), otherwise whether the attempt ran
    /// over the alternate protocol.
    ///
    /// A connection failure with an encoded request is a 0-RTT handshake
    /// failure and is retried immediately, before any post-connect
    /// alt-protocol rule is considered; the two never apply to the same
    /// reset, so `disable_alt_protocol` is only ever set for resets other
    /// than `ConnectionFailure`.
    pub fn evaluate_reset(
        &self,
        reason: StreamResetReason,
        was_using_alt_protocol: Option<bool>,
        early_data_and_alt_svc: bool,
    ) -> ResetEvaluation {
        if reason == StreamResetReason::Overflow {
            return ResetEvaluation::plain(RetryDecision::NoRetry);
        }

        if early_data_and_alt_svc {
            if reason == StreamResetReason::ConnectionFailure {
                if was_using_alt_protocol.is_some() {
                    return ResetEvaluation::plain(RetryDecision::RetryNoBackoff);
                }
                if self.retry_on.contains(RetryOn::ConnectFailure) {
                    return ResetEvaluation::plain(RetryDecision::RetryWithBackoff);
                }
            } else if was_using_alt_protocol == Some(true)
                && self.retry_on.contains(RetryOn::AltProtocolsPostConnectFailure)
            {
                return ResetEvaluation {
                    decision: RetryDecision::RetryNoBackoff,
                    disable_alt_protocol: true,
                };
            }
        }

        if self.retry_on.contains(RetryOn::Reset) {
            return ResetEvaluation::plain(RetryDecision::RetryWithBackoff);
        }

        // A transport reset surfaces as a 5xx to the client
        if self
            .retry_on
            .contains_any(&[RetryOn::FiveXx, RetryOn::GatewayError])
        {
            return ResetEvaluation::plain(RetryDecision::RetryWithBackoff);
        }

        if self.retry_on.contains(RetryOn::RefusedStream)
            && reason == StreamResetReason::RemoteRefusedStreamReset
        {
            return ResetEvaluation::plain(RetryDecision::RetryWithBackoff);
        }

        if self.retry_on.contains(RetryOn::ConnectFailure)
            && reason == StreamResetReason::ConnectionFailure
        {
            return ResetEvaluation::plain(RetryDecision::RetryWithBackoff);
        }

        ResetEvaluation::plain(RetryDecision::NoRetry)
    }

    /// Whether `status` is one of the retriable status codes (and that
    /// condition is enabled)
    pub fn would_retry_from_retriable_status_code(&self, status: StatusCode) -> bool {
        self.retry_on.contains(RetryOn::RetriableStatusCodes)
            && self
                .retriable_status_codes
                .iter()
                .any(|&code| code == u32::from(status.as_u16()))
    }
}
