//! Retry decisions and retry scheduling for proxied requests
//!
//! A request gets a [`RetryState`] when its route policy or its own
//! `x-envoy-retry-on` / `x-envoy-retry-grpc-on` headers enable a retry
//! condition. After each failed attempt the router asks the state whether to
//! retry:
//!
//! 1. [`RetryDecisionEngine`] classifies the response or reset against the
//!    enabled conditions (pure, no side effects).
//! 2. [`RetryState`] enforces the per-request retry count and the shared
//!    cluster retry budget, then schedules the retry callback either after a
//!    backoff delay or on the next event-loop iteration.
//!
//! ## Configuration Example
//!
//! ```yaml
//! retry:
//!   retry_on: "5xx,reset,connect-failure"
//!   num_retries: 2
//!   retriable_status_codes: [409]
//!   rate_limited_reset_headers:
//!     - name: retry-after
//!       format: seconds
//! ```

pub mod backoff;
pub mod decision;
pub mod header_matcher;
pub mod policy;
pub mod reset_header;
pub mod state;

pub use backoff::{BackOffStrategy, JitteredExponentialBackOff, JitteredLowerBoundBackOff};
pub use decision::{HeadersEvaluation, ResetEvaluation, RetryDecision, RetryDecisionEngine};
pub use header_matcher::{HeaderMatch, HeaderMatcher};
pub use policy::{parse_retry_grpc_on, parse_retry_on, RetryOn, RetryOnSet, RetryPolicy};
pub use reset_header::{ResetHeaderFormat, ResetHeaderParser};
pub use state::{RetryContext, RetryState, RetryStatus};
