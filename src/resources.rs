//! Shared retry budget
//!
//! Each upstream cluster caps the number of retries that may be in flight at
//! once, per routing priority. The counters are touched from every
//! connection thread, so admission is a lock-free compare-and-swap rather
//! than a load followed by an increment: two threads racing for the last
//! slot can never both win.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::constants::DEFAULT_MAX_RETRIES;

/// Routing priority of a request; each priority has its own budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourcePriority {
    #[default]
    Default,
    High,
}

/// A counter with a ceiling, shared across threads
pub trait ResourceLimit: Send + Sync {
    /// Whether one more resource may be created right now
    fn can_create(&self) -> bool;

    fn inc(&self);

    fn dec(&self);

    /// Current number of outstanding resources
    fn count(&self) -> u64;

    /// Atomically admit one resource if below the ceiling
    fn try_create(&self) -> bool {
        if self.can_create() {
            self.inc();
            true
        } else {
            false
        }
    }
}

/// Atomic counter with a fixed ceiling
#[derive(Debug)]
pub struct ResourceCounter {
    current: AtomicU64,
    max: u64,
}

impl ResourceCounter {
    pub fn new(max: u64) -> Self {
        Self {
            current: AtomicU64::new(0),
            max,
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

impl ResourceLimit for ResourceCounter {
    fn can_create(&self) -> bool {
        self.current.load(Ordering::Acquire) < self.max
    }

    fn inc(&self) {
        self.current.fetch_add(1, Ordering::AcqRel);
    }

    fn dec(&self) {
        let result = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        if result.is_err() {
            tracing::error!("Resource counter decremented below zero");
        }
    }

    fn count(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    fn try_create(&self) -> bool {
        let max = self.max;
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v < max).then_some(v + 1)
            })
            .is_ok()
    }
}

/// Per-priority retry budgets for one upstream cluster
#[derive(Debug, Clone)]
pub struct ResourceManager {
    default_retries: Arc<ResourceCounter>,
    high_retries: Arc<ResourceCounter>,
}

impl ResourceManager {
    pub fn new(max_retries: u64, max_retries_high: u64) -> Self {
        Self {
            default_retries: Arc::new(ResourceCounter::new(max_retries)),
            high_retries: Arc::new(ResourceCounter::new(max_retries_high)),
        }
    }

    /// Retry budget for the given priority
    pub fn retries(&self, priority: ResourcePriority) -> Arc<dyn ResourceLimit> {
        let counter = match priority {
            ResourcePriority::Default => &self.default_retries,
            ResourcePriority::High => &self.high_retries,
        };
        Arc::clone(counter) as Arc<dyn ResourceLimit>
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES)
    }
}
