// Retry state unit tests: retry counts, the shared budget and scheduling

use chrono::Utc;
use http::{HeaderMap, HeaderValue, Response};
use relaycore::event::ManualDispatcher;
use relaycore::http::StreamResetReason;
use relaycore::metrics::RetryStats;
use relaycore::resources::{ResourceLimit, ResourceManager, ResourcePriority};
use relaycore::retry::*;
use relaycore::runtime::{FixedRandom, FixedTimeSource, RuntimeValue, StaticRuntime};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    dispatcher: ManualDispatcher,
    resources: ResourceManager,
    stats: RetryStats,
    random: Arc<FixedRandom>,
}

impl Fixture {
    fn new(max_retries: u64) -> Self {
        Self {
            dispatcher: ManualDispatcher::new(),
            resources: ResourceManager::new(max_retries, max_retries),
            stats: RetryStats::new("unit").unwrap(),
            random: Arc::new(FixedRandom::new(0)),
        }
    }

    fn ctx(&self, runtime: StaticRuntime) -> RetryContext {
        RetryContext {
            runtime: Arc::new(runtime),
            random: self.random.clone(),
            dispatcher: Arc::new(self.dispatcher.clone()),
            time_source: Arc::new(FixedTimeSource::new(Utc::now())),
            resources: self.resources.clone(),
            priority: ResourcePriority::Default,
            stats: self.stats.clone(),
            vcluster_stats: None,
        }
    }

    fn state(&self, policy: &RetryPolicy) -> RetryState {
        self.state_with_runtime(policy, StaticRuntime::empty())
    }

    fn state_with_runtime(&self, policy: &RetryPolicy, runtime: StaticRuntime) -> RetryState {
        let mut headers = HeaderMap::new();
        RetryState::create(policy, &mut headers, self.ctx(runtime)).unwrap()
    }

    fn budget(&self) -> Arc<dyn ResourceLimit> {
        self.resources.retries(ResourcePriority::Default)
    }
}

fn policy(retry_on: &str, num_retries: u32) -> RetryPolicy {
    RetryPolicy::new(parse_retry_on(retry_on).0, num_retries)
}

fn response(status: u16) -> Response<()> {
    Response::builder().status(status).body(()).unwrap()
}

fn counting() -> (Arc<AtomicUsize>, impl Fn(bool) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_retry_then_success_counts_success() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("5xx", 1));

    let (fired, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(503), &HeaderMap::new(), cb),
        RetryStatus::Yes
    );
    assert!(state.backoff_timer_armed());
    assert_eq!(fixture.budget().count(), 1);

    fixture.dispatcher.advance(Duration::from_secs(1));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let (_, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(200), &HeaderMap::new(), cb),
        RetryStatus::No
    );
    assert_eq!(fixture.stats.upstream_rq_retry.get(), 1);
    assert_eq!(fixture.stats.upstream_rq_retry_success.get(), 1);
    assert_eq!(fixture.budget().count(), 0);
}

#[test]
fn test_budget_full_is_overflow_after_decrement() {
    let fixture = Fixture::new(1);
    // Another request holds the only slot
    assert!(fixture.budget().try_create());

    let mut state = fixture.state(&policy("5xx", 2));
    let (fired, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(503), &HeaderMap::new(), cb),
        RetryStatus::NoOverflow
    );
    assert_eq!(state.retries_remaining(), 1);
    assert_eq!(fixture.dispatcher.armed_timers(), 0);
    assert!(!state.has_pending_retry());
    assert_eq!(fixture.stats.upstream_rq_retry_overflow.get(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_limit_exceeded_leaves_budget_untouched() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("reset", 0));

    let (_, cb) = counting();
    assert_eq!(
        state.should_retry_reset(StreamResetReason::RemoteReset, Some(false), cb),
        RetryStatus::NoRetryLimitExceeded
    );
    assert_eq!(fixture.budget().count(), 0);
    assert_eq!(fixture.stats.upstream_rq_retry_limit_exceeded.get(), 1);
}

#[test]
fn test_dropping_state_cancels_retry_and_releases_budget() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("5xx", 1));

    let (fired, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(500), &HeaderMap::new(), cb),
        RetryStatus::Yes
    );
    assert_eq!(fixture.dispatcher.armed_timers(), 1);

    drop(state);
    assert_eq!(fixture.dispatcher.armed_timers(), 0);
    assert_eq!(fixture.budget().count(), 0);

    fixture.dispatcher.advance(Duration::from_secs(10));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_reset_retry_is_idempotent() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("5xx", 2));

    let (_, cb) = counting();
    state.should_retry_headers(&response(502), &HeaderMap::new(), cb);
    state.reset_retry();
    state.reset_retry();
    assert_eq!(fixture.budget().count(), 0);
    assert!(!state.has_pending_retry());
}

#[test]
fn test_zero_rtt_failure_schedules_next_iteration() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("reset", 1));

    let disabled = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&disabled);
    assert_eq!(
        state.should_retry_reset(StreamResetReason::ConnectionFailure, Some(true), move |alt| {
            d.store(if alt { 2 } else { 1 }, Ordering::SeqCst);
        }),
        RetryStatus::Yes
    );
    assert!(state.next_loop_callback_armed());
    assert_eq!(fixture.dispatcher.armed_timers(), 0);

    assert_eq!(fixture.dispatcher.run_deferred(), 1);
    assert_eq!(disabled.load(Ordering::SeqCst), 1);
}

#[test]
fn test_backoff_grant_replaced_by_next_iteration_grant() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("5xx,reset", 3));

    let (backoff_fired, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(503), &HeaderMap::new(), cb),
        RetryStatus::Yes
    );
    assert!(state.backoff_timer_armed());
    assert!(!state.next_loop_callback_armed());
    assert_eq!(state.retries_remaining(), 2);
    assert_eq!(fixture.budget().count(), 1);

    // The timer never fired; the next decision takes over its slot
    let (deferred_fired, cb) = counting();
    assert_eq!(
        state.should_retry_reset(StreamResetReason::ConnectionFailure, Some(true), cb),
        RetryStatus::Yes
    );
    assert!(!state.backoff_timer_armed());
    assert!(state.next_loop_callback_armed());
    assert_eq!(fixture.dispatcher.armed_timers(), 0);
    assert_eq!(fixture.dispatcher.scheduled_callbacks(), 1);
    assert_eq!(state.retries_remaining(), 1);
    assert_eq!(fixture.budget().count(), 1);

    fixture.dispatcher.advance(Duration::from_secs(10));
    assert_eq!(fixture.dispatcher.run_deferred(), 1);
    assert_eq!(backoff_fired.load(Ordering::SeqCst), 0);
    assert_eq!(deferred_fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_next_iteration_grant_replaced_by_backoff_grant() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("5xx,reset", 3));

    let (deferred_fired, cb) = counting();
    assert_eq!(
        state.should_retry_reset(StreamResetReason::ConnectionFailure, Some(true), cb),
        RetryStatus::Yes
    );
    assert!(state.next_loop_callback_armed());
    assert_eq!(state.retries_remaining(), 2);

    let (backoff_fired, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(503), &HeaderMap::new(), cb),
        RetryStatus::Yes
    );
    assert!(state.backoff_timer_armed());
    assert!(!state.next_loop_callback_armed());
    assert_eq!(fixture.dispatcher.scheduled_callbacks(), 0);
    assert_eq!(fixture.dispatcher.armed_timers(), 1);
    assert_eq!(state.retries_remaining(), 1);
    assert_eq!(fixture.budget().count(), 1);

    assert_eq!(fixture.dispatcher.run_deferred(), 0);
    fixture.dispatcher.advance(Duration::from_secs(10));
    assert_eq!(deferred_fired.load(Ordering::SeqCst), 0);
    assert_eq!(backoff_fired.load(Ordering::SeqCst), 1);

    // A reset between grants leaves nothing armed
    state.reset_retry();
    assert!(!state.has_pending_retry());
    assert_eq!(fixture.budget().count(), 0);
}

#[test]
fn test_rate_limited_reset_header_sets_lower_bound() {
    let fixture = Fixture::new(3);
    let mut retry_policy = policy("5xx", 2);
    retry_policy.reset_headers = vec![ResetHeaderParser::new("Retry-After", ResetHeaderFormat::Seconds)];
    let mut state = fixture.state(&retry_policy);

    let mut limited = response(503);
    limited
        .headers_mut()
        .insert("retry-after", HeaderValue::from_static("2"));
    let (_, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&limited, &HeaderMap::new(), cb),
        RetryStatus::Yes
    );
    assert_eq!(
        fixture.dispatcher.armed_durations(),
        vec![Duration::from_secs(2)]
    );
    assert_eq!(fixture.stats.upstream_rq_retry_backoff_ratelimited.get(), 1);

    // The interval only applies to the response that carried it
    let (_, cb) = counting();
    state.should_retry_headers(&response(503), &HeaderMap::new(), cb);
    assert_eq!(fixture.stats.upstream_rq_retry_backoff_exponential.get(), 1);
}

#[test]
fn test_rate_limited_interval_above_cap_is_ignored() {
    let fixture = Fixture::new(3);
    let mut retry_policy = policy("5xx", 1);
    retry_policy.reset_headers = vec![ResetHeaderParser::new("retry-after", ResetHeaderFormat::Seconds)];
    retry_policy.max_rate_limited_interval = Duration::from_secs(1);
    let mut state = fixture.state(&retry_policy);

    let mut limited = response(503);
    limited
        .headers_mut()
        .insert("retry-after", HeaderValue::from_static("30"));
    let (_, cb) = counting();
    state.should_retry_headers(&limited, &HeaderMap::new(), cb);
    assert_eq!(fixture.stats.upstream_rq_retry_backoff_ratelimited.get(), 0);
    assert_eq!(fixture.stats.upstream_rq_retry_backoff_exponential.get(), 1);
}

#[test]
fn test_runtime_can_disable_retries() {
    let fixture = Fixture::new(3);
    let runtime = StaticRuntime::empty().with_value("upstream.use_retry", RuntimeValue::Integer(0));
    let mut state = fixture.state_with_runtime(&policy("5xx", 2), runtime);

    let (_, cb) = counting();
    assert_eq!(
        state.should_retry_headers(&response(503), &HeaderMap::new(), cb),
        RetryStatus::No
    );
    assert_eq!(state.retries_remaining(), 1);
    assert_eq!(fixture.budget().count(), 0);
}

#[test]
fn test_hedge_retry_ignores_conditions() {
    let fixture = Fixture::new(3);
    let mut state = fixture.state(&policy("retriable-4xx", 1));

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    assert_eq!(
        state.should_hedge_retry_per_try_timeout(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }),
        RetryStatus::Yes
    );
    fixture.dispatcher.advance(Duration::from_secs(1));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_vcluster_stats_follow_cluster_stats() {
    let fixture = Fixture::new(3);
    let vcluster = RetryStats::new("vcluster").unwrap();
    let mut ctx = fixture.ctx(StaticRuntime::empty());
    ctx.vcluster_stats = Some(vcluster.clone());

    let mut headers = HeaderMap::new();
    let mut state = RetryState::create(&policy("5xx", 1), &mut headers, ctx).unwrap();
    let (_, cb) = counting();
    state.should_retry_headers(&response(503), &HeaderMap::new(), cb);

    assert_eq!(fixture.stats.upstream_rq_retry.get(), 1);
    assert_eq!(vcluster.upstream_rq_retry.get(), 1);
}
