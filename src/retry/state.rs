//! Per-request retry state and budget controller

use http::{HeaderMap, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

use super::backoff::{BackOffStrategy, JitteredExponentialBackOff, JitteredLowerBoundBackOff};
use super::decision::{RetryDecision, RetryDecisionEngine};
use super::header_matcher::HeaderMatcher;
use super::policy::{parse_retry_grpc_on, parse_retry_on, RetryOnSet, RetryPolicy};
use super::reset_header::ResetHeaderParser;
use crate::constants::{
    DEFAULT_BASE_RETRY_BACKOFF_MS, DEFAULT_MAX_INTERVAL_FACTOR, RUNTIME_BASE_RETRY_BACKOFF_MS,
    RUNTIME_EARLY_DATA_AND_ALT_SVC, RUNTIME_USE_RETRY,
};
use crate::event::{Callback, Dispatcher, SchedulableCallback, Timer};
use crate::http::headers::{
    header_str, split_tokens, ENVOY_MAX_RETRIES, ENVOY_RETRIABLE_HEADER_NAMES,
    ENVOY_RETRIABLE_STATUS_CODES, ENVOY_RETRY_GRPC_ON, ENVOY_RETRY_ON, RETRY_CONTROL_HEADERS,
};
use crate::http::StreamResetReason;
use crate::metrics::RetryStats;
use crate::resources::{ResourceLimit, ResourceManager, ResourcePriority};
use crate::runtime::{RandomGenerator, Runtime, TimeSource};

/// Result of asking whether a failed attempt will be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    /// Not retriable
    No,
    /// Retriable, but the request has used up its retries
    NoRetryLimitExceeded,
    /// Retriable, but the cluster retry budget is full
    NoOverflow,
    /// A retry has been scheduled
    Yes,
}

/// Collaborators shared by every retry state of a cluster
#[derive(Clone)]
pub struct RetryContext {
    pub runtime: Arc<dyn Runtime>,
    pub random: Arc<dyn RandomGenerator>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub time_source: Arc<dyn TimeSource>,
    pub resources: ResourceManager,
    pub priority: ResourcePriority,
    pub stats: RetryStats,
    /// Virtual cluster counters, incremented alongside the cluster's
    pub vcluster_stats: Option<RetryStats>,
}

impl std::fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryContext")
            .field("priority", &self.priority)
            .field("stats", &self.stats)
            .field("vcluster_stats", &self.vcluster_stats.is_some())
            .finish()
    }
}

/// The one outstanding retry; its handle stays here after firing until the
/// next decision releases the budget slot it holds.
enum PendingRetry {
    Backoff(Box<dyn Timer>),
    NextLoop(Box<dyn SchedulableCallback>),
}

/// Retry bookkeeping for one in-flight request.
///
/// Owns at most one pending retry. Each admitted retry holds one slot of the
/// cluster retry budget until the next call to `should_retry_*`, an explicit
/// [`reset_retry`](Self::reset_retry), or drop, whichever comes first.
/// Dropping the state cancels a retry that has not fired yet.
pub struct RetryState {
    engine: RetryDecisionEngine,
    retries_remaining: u32,
    host_selection_max_attempts: u32,
    reset_headers: Vec<ResetHeaderParser>,
    max_rate_limited_interval: Duration,
    backoff: JitteredExponentialBackOff,
    rate_limited_backoff: Option<JitteredLowerBoundBackOff>,
    pending: Option<PendingRetry>,
    budget: Arc<dyn ResourceLimit>,
    ctx: RetryContext,
}

impl RetryState {
    /// Build the retry state for a request, or `None` when neither the route
    /// nor the request enables any retry condition.
    ///
    /// Retry-control headers are always stripped from `request_headers` so
    /// they never reach the upstream.
    pub fn create(
        policy: &RetryPolicy,
        request_headers: &mut HeaderMap,
        ctx: RetryContext,
    ) -> Option<Self> {
        let wants_retry = request_headers.contains_key(ENVOY_RETRY_ON)
            || request_headers.contains_key(ENVOY_RETRY_GRPC_ON)
            || !policy.retry_on.is_empty();

        let state = wants_retry.then(|| Self::new(policy, request_headers, ctx));

        for name in RETRY_CONTROL_HEADERS {
            request_headers.remove(name);
        }

        state
    }

    fn new(policy: &RetryPolicy, request_headers: &HeaderMap, ctx: RetryContext) -> Self {
        let base_interval = policy.base_interval.unwrap_or_else(|| {
            Duration::from_millis(
                ctx.runtime
                    .get_integer(RUNTIME_BASE_RETRY_BACKOFF_MS, DEFAULT_BASE_RETRY_BACKOFF_MS),
            )
        });
        let max_interval = policy.max_interval.unwrap_or_else(|| {
            base_interval.saturating_mul(DEFAULT_MAX_INTERVAL_FACTOR as u32)
        });

        let mut retry_on = policy.retry_on.clone();
        if let Some(value) = header_str(request_headers, ENVOY_RETRY_ON) {
            let (parsed, all_valid) = parse_retry_on(value);
            if !all_valid {
                tracing::debug!(header = ENVOY_RETRY_ON, value, "Ignoring unknown retry conditions");
            }
            retry_on.merge(&parsed);
        }
        if let Some(value) = header_str(request_headers, ENVOY_RETRY_GRPC_ON) {
            let (parsed, all_valid) = parse_retry_grpc_on(value);
            if !all_valid {
                tracing::debug!(header = ENVOY_RETRY_GRPC_ON, value, "Ignoring unknown retry conditions");
            }
            retry_on.merge(&parsed);
        }

        if !policy.retriable_request_headers.is_empty()
            && !policy
                .retriable_request_headers
                .iter()
                .any(|m| m.matches(request_headers))
        {
            retry_on = RetryOnSet::new();
        }

        let mut retries_remaining = policy.num_retries;
        if !retry_on.is_empty() {
            if let Some(max) = header_str(request_headers, ENVOY_MAX_RETRIES)
                .and_then(|v| v.trim().parse::<u32>().ok())
            {
                retries_remaining = max;
            }
        }

        let mut engine = RetryDecisionEngine::new(
            retry_on,
            policy.retriable_status_codes.clone(),
            policy.retriable_headers.clone(),
        );
        if let Some(value) = header_str(request_headers, ENVOY_RETRIABLE_STATUS_CODES) {
            for code in split_tokens(value).filter_map(|c| c.parse::<u32>().ok()) {
                engine.add_retriable_status_code(code);
            }
        }
        if let Some(value) = header_str(request_headers, ENVOY_RETRIABLE_HEADER_NAMES) {
            for name in split_tokens(value) {
                engine.add_retriable_header(HeaderMatcher::present(name));
            }
        }

        tracing::debug!(
            retry_on = %engine.retry_on(),
            retries = retries_remaining,
            base_interval_ms = base_interval.as_millis() as u64,
            max_interval_ms = max_interval.as_millis() as u64,
            "Retry state created"
        );

        Self {
            engine,
            retries_remaining,
            host_selection_max_attempts: policy.host_selection_max_attempts,
            reset_headers: policy.reset_headers.clone(),
            max_rate_limited_interval: policy.max_rate_limited_interval,
            backoff: JitteredExponentialBackOff::new(
                base_interval,
                max_interval,
                Arc::clone(&ctx.random),
            ),
            rate_limited_backoff: None,
            pending: None,
            budget: ctx.resources.retries(ctx.priority),
            ctx,
        }
    }

    /// Decide on a response. `callback` receives `disable_early_data` when
    /// the retry runs.
    pub fn should_retry_headers<T, F>(
        &mut self,
        response: &Response<T>,
        original_request: &HeaderMap,
        callback: F,
    ) -> RetryStatus
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let early_data_and_alt_svc = self
            .ctx
            .runtime
            .get_boolean(RUNTIME_EARLY_DATA_AND_ALT_SVC, true);
        let evaluation =
            self.engine
                .evaluate_headers(response, original_request, early_data_and_alt_svc);

        if evaluation.decision == RetryDecision::RetryWithBackoff && !self.reset_headers.is_empty() {
            if let Some(interval) = self.parse_reset_interval(response.headers()) {
                if interval > Duration::from_millis(1) {
                    self.rate_limited_backoff = Some(JitteredLowerBoundBackOff::new(
                        interval,
                        Arc::clone(&self.ctx.random),
                    ));
                }
            }
        }

        tracing::debug!(
            status = response.status().as_u16(),
            decision = ?evaluation.decision,
            disable_early_data = evaluation.disable_early_data,
            "Evaluated response for retry"
        );

        let disable_early_data = evaluation.disable_early_data;
        self.should_retry(evaluation.decision, once(move || callback(disable_early_data)))
    }

    /// Decide on a stream reset. `callback` receives `disable_alt_protocol`
    /// when the retry runs.
    pub fn should_retry_reset<F>(
        &mut self,
        reason: StreamResetReason,
        was_using_alt_protocol: Option<bool>,
        callback: F,
    ) -> RetryStatus
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let early_data_and_alt_svc = self
            .ctx
            .runtime
            .get_boolean(RUNTIME_EARLY_DATA_AND_ALT_SVC, true);
        let evaluation =
            self.engine
                .evaluate_reset(reason, was_using_alt_protocol, early_data_and_alt_svc);

        tracing::debug!(
            reason = %reason,
            decision = ?evaluation.decision,
            disable_alt_protocol = evaluation.disable_alt_protocol,
            "Evaluated reset for retry"
        );

        let disable_alt_protocol = evaluation.disable_alt_protocol;
        self.should_retry(evaluation.decision, once(move || callback(disable_alt_protocol)))
    }

    /// A hedged attempt after a per-try timeout is retried whenever retries
    /// remain, regardless of the retry conditions.
    pub fn should_hedge_retry_per_try_timeout<F>(&mut self, callback: F) -> RetryStatus
    where
        F: FnOnce() + Send + 'static,
    {
        self.should_retry(RetryDecision::RetryWithBackoff, once(callback))
    }

    fn should_retry(&mut self, decision: RetryDecision, callback: Callback) -> RetryStatus {
        // A retry was scheduled and this attempt is not retriable: the retry worked
        if self.pending.is_some() && decision == RetryDecision::NoRetry {
            self.backoff.reset();
            self.for_each_stats(|s| s.upstream_rq_retry_success.inc());
        }

        self.reset_retry();

        if decision == RetryDecision::NoRetry {
            return RetryStatus::No;
        }

        if self.retries_remaining == 0 {
            tracing::warn!(
                retry_on = %self.engine.retry_on(),
                "Retry limit exceeded"
            );
            self.for_each_stats(|s| s.upstream_rq_retry_limit_exceeded.inc());
            return RetryStatus::NoRetryLimitExceeded;
        }

        self.retries_remaining -= 1;

        if !self.budget.can_create() {
            tracing::warn!(
                in_flight = self.budget.count(),
                priority = ?self.ctx.priority,
                "Retry budget overflow"
            );
            self.for_each_stats(|s| s.upstream_rq_retry_overflow.inc());
            return RetryStatus::NoOverflow;
        }

        if !self.ctx.runtime.feature_enabled(RUNTIME_USE_RETRY, 100) {
            tracing::debug!("Retries disabled by runtime");
            return RetryStatus::No;
        }

        // Admission races with other connections; the CAS decides
        if !self.budget.try_create() {
            self.for_each_stats(|s| s.upstream_rq_retry_overflow.inc());
            return RetryStatus::NoOverflow;
        }

        self.for_each_stats(|s| s.upstream_rq_retry.inc());

        let pending = match decision {
            RetryDecision::RetryWithBackoff => {
                let delay = self.next_backoff();
                let mut timer = self.ctx.dispatcher.create_timer(callback);
                timer.enable(delay);
                tracing::debug!(
                    delay_ms = delay.as_millis() as u64,
                    retries_remaining = self.retries_remaining,
                    "Retry scheduled with backoff"
                );
                PendingRetry::Backoff(timer)
            }
            _ => {
                let mut deferred = self.ctx.dispatcher.create_schedulable_callback(callback);
                deferred.schedule_next_iteration();
                tracing::debug!(
                    retries_remaining = self.retries_remaining,
                    "Retry scheduled for next iteration"
                );
                PendingRetry::NextLoop(deferred)
            }
        };
        self.pending = Some(pending);

        RetryStatus::Yes
    }

    fn next_backoff(&mut self) -> Duration {
        // A rate-limit interval applies to the response that carried it only
        match self.rate_limited_backoff.take() {
            Some(mut rate_limited) => {
                self.for_each_stats(|s| s.upstream_rq_retry_backoff_ratelimited.inc());
                rate_limited.next_back_off()
            }
            None => {
                self.for_each_stats(|s| s.upstream_rq_retry_backoff_exponential.inc());
                self.backoff.next_back_off()
            }
        }
    }

    fn parse_reset_interval(&self, headers: &HeaderMap) -> Option<Duration> {
        self.reset_headers
            .iter()
            .filter_map(|parser| parser.parse_interval(self.ctx.time_source.as_ref(), headers))
            .find(|interval| *interval <= self.max_rate_limited_interval)
    }

    fn for_each_stats(&self, f: impl Fn(&RetryStats)) {
        f(&self.ctx.stats);
        if let Some(vcluster) = &self.ctx.vcluster_stats {
            f(vcluster);
        }
    }

    /// Cancel the pending retry, if any, and release its budget slot.
    /// Calling it again is a no-op.
    pub fn reset_retry(&mut self) {
        if let Some(pending) = self.pending.take() {
            // Dropping the handle cancels it if it has not fired yet
            drop(pending);
            self.budget.dec();
        }
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn retry_on(&self) -> &RetryOnSet {
        self.engine.retry_on()
    }

    /// True while any retry condition is enabled
    pub fn enabled(&self) -> bool {
        !self.engine.retry_on().is_empty()
    }

    pub fn host_selection_max_attempts(&self) -> u32 {
        self.host_selection_max_attempts
    }

    pub fn would_retry_from_retriable_status_code(&self, status: StatusCode) -> bool {
        self.engine.would_retry_from_retriable_status_code(status)
    }

    /// Whether a retry holds a budget slot (armed, or fired but not yet released)
    pub fn has_pending_retry(&self) -> bool {
        self.pending.is_some()
    }

    pub fn backoff_timer_armed(&self) -> bool {
        matches!(&self.pending, Some(PendingRetry::Backoff(timer)) if timer.enabled())
    }

    pub fn next_loop_callback_armed(&self) -> bool {
        matches!(&self.pending, Some(PendingRetry::NextLoop(cb)) if cb.enabled())
    }
}

impl Drop for RetryState {
    fn drop(&mut self) {
        self.reset_retry();
    }
}

impl std::fmt::Debug for RetryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryState")
            .field("retry_on", self.engine.retry_on())
            .field("retries_remaining", &self.retries_remaining)
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// Adapt a one-shot closure to the re-invocable dispatcher callback type
fn once<F>(f: F) -> Callback
where
    F: FnOnce() + Send + 'static,
{
    let mut f = Some(f);
    Box::new(move || {
        if let Some(f) = f.take() {
            f();
        }
    })
}
