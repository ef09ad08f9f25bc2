// Metrics module - Prometheus counters for retry observability
//
// Counters are created unregistered so several clusters (and tests) can each
// own a set; call `register` to expose them on a registry.

use prometheus::{IntCounter, Opts, Registry};

/// Retry counters for one upstream cluster (or virtual cluster)
#[derive(Clone)]
pub struct RetryStats {
    /// Retries admitted and scheduled
    pub upstream_rq_retry: IntCounter,
    /// A previously scheduled retry was followed by a non-retriable outcome
    pub upstream_rq_retry_success: IntCounter,
    /// Retry refused because the shared budget was full
    pub upstream_rq_retry_overflow: IntCounter,
    /// Retry refused because the request ran out of retries
    pub upstream_rq_retry_limit_exceeded: IntCounter,
    /// Retry delayed by the jittered exponential strategy
    pub upstream_rq_retry_backoff_exponential: IntCounter,
    /// Retry delayed by a rate-limit reset header
    pub upstream_rq_retry_backoff_ratelimited: IntCounter,
}

fn counter(scope: &str, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help).const_label("cluster", scope))
}

impl RetryStats {
    /// Create a fresh set of counters labelled with `cluster=<scope>`
    pub fn new(scope: &str) -> prometheus::Result<Self> {
        Ok(Self {
            upstream_rq_retry: counter(scope, "upstream_rq_retry", "Retries scheduled")?,
            upstream_rq_retry_success: counter(
                scope,
                "upstream_rq_retry_success",
                "Requests that succeeded after a retry",
            )?,
            upstream_rq_retry_overflow: counter(
                scope,
                "upstream_rq_retry_overflow",
                "Retries refused by the retry budget",
            )?,
            upstream_rq_retry_limit_exceeded: counter(
                scope,
                "upstream_rq_retry_limit_exceeded",
                "Retries refused because the request exhausted its retries",
            )?,
            upstream_rq_retry_backoff_exponential: counter(
                scope,
                "upstream_rq_retry_backoff_exponential",
                "Retries delayed by jittered exponential backoff",
            )?,
            upstream_rq_retry_backoff_ratelimited: counter(
                scope,
                "upstream_rq_retry_backoff_ratelimited",
                "Retries delayed by a rate-limit reset header",
            )?,
        })
    }

    /// Register every counter on `registry`
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        for c in [
            &self.upstream_rq_retry,
            &self.upstream_rq_retry_success,
            &self.upstream_rq_retry_overflow,
            &self.upstream_rq_retry_limit_exceeded,
            &self.upstream_rq_retry_backoff_exponential,
            &self.upstream_rq_retry_backoff_ratelimited,
        ] {
            registry.register(Box::new(c.clone()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RetryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryStats")
            .field("upstream_rq_retry", &self.upstream_rq_retry.get())
            .field("upstream_rq_retry_success", &self.upstream_rq_retry_success.get())
            .field("upstream_rq_retry_overflow", &self.upstream_rq_retry_overflow.get())
            .field(
                "upstream_rq_retry_limit_exceeded",
                &self.upstream_rq_retry_limit_exceeded.get(),
            )
            .finish()
    }
}
