//! Runtime collaborators: feature flags, randomness and wall-clock time.
//!
//! The retry engine never reads global state directly. Everything that can
//! change at runtime (feature flags, backoff overrides), everything random
//! (jitter, percentage rollouts) and the wall clock (rate-limit reset
//! timestamps) is reached through the small traits in this module so tests
//! can pin them down.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Pseudo-random source used for jitter and percentage feature rollouts
pub trait RandomGenerator: Send + Sync {
    fn random(&self) -> u64;
}

/// Thread-local RNG from the `rand` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomGenerator for ThreadRandom {
    fn random(&self) -> u64 {
        rand::random::<u64>()
    }
}

/// Random generator that always returns the configured value
#[derive(Debug, Default)]
pub struct FixedRandom {
    value: AtomicU64,
}

impl FixedRandom {
    pub fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }
}

impl RandomGenerator for FixedRandom {
    fn random(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Wall-clock source
pub trait TimeSource: Send + Sync {
    fn system_time(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn system_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Time source frozen at a settable instant
#[derive(Debug)]
pub struct FixedTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl FixedTimeSource {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl TimeSource for FixedTimeSource {
    fn system_time(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Feature-flag and tunable lookup
pub trait Runtime: Send + Sync {
    /// Percentage rollout check. `default_percent` applies when the key is unset.
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool;

    fn get_integer(&self, key: &str, default: u64) -> u64;

    fn get_boolean(&self, key: &str, default: bool) -> bool;
}

/// A single runtime override value (YAML scalar)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeValue {
    Bool(bool),
    Integer(u64),
}

/// Runtime backed by a fixed map of overrides
pub struct StaticRuntime {
    values: HashMap<String, RuntimeValue>,
    random: Arc<dyn RandomGenerator>,
}

impl StaticRuntime {
    pub fn new(values: HashMap<String, RuntimeValue>, random: Arc<dyn RandomGenerator>) -> Self {
        Self { values, random }
    }

    /// Runtime with no overrides: every lookup returns its default
    pub fn empty() -> Self {
        Self::new(HashMap::new(), Arc::new(ThreadRandom))
    }

    pub fn with_value(mut self, key: &str, value: RuntimeValue) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }
}

impl Default for StaticRuntime {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for StaticRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticRuntime")
            .field("values", &self.values)
            .finish()
    }
}

impl Runtime for StaticRuntime {
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool {
        let percent = match self.values.get(key) {
            Some(RuntimeValue::Integer(p)) => *p,
            Some(RuntimeValue::Bool(true)) => 100,
            Some(RuntimeValue::Bool(false)) => 0,
            None => default_percent,
        };
        match percent {
            0 => false,
            p if p >= 100 => true,
            p => self.random.random() % 100 < p,
        }
    }

    fn get_integer(&self, key: &str, default: u64) -> u64 {
        match self.values.get(key) {
            Some(RuntimeValue::Integer(v)) => *v,
            _ => default,
        }
    }

    fn get_boolean(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(RuntimeValue::Bool(v)) => *v,
            Some(RuntimeValue::Integer(v)) => *v != 0,
            None => default,
        }
    }
}
