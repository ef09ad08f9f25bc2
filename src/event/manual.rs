// Deterministic dispatcher driven by hand.
//
// Virtual time only moves on `advance`, deferred callbacks only run on
// `run_deferred`. Used by tests and by embedders that drive their own loop.

use super::{Callback, Dispatcher, SchedulableCallback, Timer};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

type SharedCallback = Arc<Mutex<Callback>>;

struct TimerEntry {
    deadline: Option<Duration>,
    last_duration: Option<Duration>,
    callback: SharedCallback,
}

struct DeferredEntry {
    scheduled: bool,
    callback: SharedCallback,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<u64, TimerEntry>,
    deferred: BTreeMap<u64, DeferredEntry>,
}

impl ManualState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Dispatcher with virtual time
#[derive(Clone, Default)]
pub struct ManualDispatcher {
    state: Arc<Mutex<ManualState>>,
}

impl ManualDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move virtual time forward, firing every timer whose deadline is reached
    /// in deadline order. Returns the number of timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.state.lock();
                let next = state
                    .timers
                    .iter()
                    .filter_map(|(id, t)| t.deadline.map(|d| (d, *id)))
                    .filter(|(deadline, _)| *deadline <= target)
                    .min();
                match next {
                    Some((deadline, id)) => {
                        state.now = state.now.max(deadline);
                        state.timers.get_mut(&id).map(|t| {
                            t.deadline = None;
                            Arc::clone(&t.callback)
                        })
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };
            match due {
                Some(callback) => {
                    (callback.lock())();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }

    /// Run every deferred callback scheduled before this call. Callbacks
    /// scheduled while running wait for the next call. Returns the number run.
    pub fn run_deferred(&self) -> usize {
        let ready: Vec<SharedCallback> = {
            let mut state = self.state.lock();
            state
                .deferred
                .values_mut()
                .filter(|d| d.scheduled)
                .map(|d| {
                    d.scheduled = false;
                    Arc::clone(&d.callback)
                })
                .collect()
        };
        let count = ready.len();
        for callback in ready {
            (callback.lock())();
        }
        count
    }

    /// Number of timers currently armed
    pub fn armed_timers(&self) -> usize {
        self.state
            .lock()
            .timers
            .values()
            .filter(|t| t.deadline.is_some())
            .count()
    }

    /// Number of deferred callbacks waiting for the next iteration
    pub fn scheduled_callbacks(&self) -> usize {
        self.state
            .lock()
            .deferred
            .values()
            .filter(|d| d.scheduled)
            .count()
    }

    /// Durations the currently armed timers were last enabled with
    pub fn armed_durations(&self) -> Vec<Duration> {
        self.state
            .lock()
            .timers
            .values()
            .filter(|t| t.deadline.is_some())
            .filter_map(|t| t.last_duration)
            .collect()
    }
}

impl std::fmt::Debug for ManualDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualDispatcher")
            .field("now", &state.now)
            .field("timers", &state.timers.len())
            .field("deferred", &state.deferred.len())
            .finish()
    }
}

impl Dispatcher for ManualDispatcher {
    fn create_timer(&self, callback: Callback) -> Box<dyn Timer> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.timers.insert(
            id,
            TimerEntry {
                deadline: None,
                last_duration: None,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Box::new(ManualTimer {
            id,
            state: Arc::clone(&self.state),
        })
    }

    fn create_schedulable_callback(&self, callback: Callback) -> Box<dyn SchedulableCallback> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.deferred.insert(
            id,
            DeferredEntry {
                scheduled: false,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        Box::new(ManualSchedulableCallback {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

struct ManualTimer {
    id: u64,
    state: Arc<Mutex<ManualState>>,
}

impl Timer for ManualTimer {
    fn enable(&mut self, duration: Duration) {
        let mut state = self.state.lock();
        let deadline = state.now + duration;
        if let Some(timer) = state.timers.get_mut(&self.id) {
            timer.deadline = Some(deadline);
            timer.last_duration = Some(duration);
        }
    }

    fn disable(&mut self) {
        if let Some(timer) = self.state.lock().timers.get_mut(&self.id) {
            timer.deadline = None;
        }
    }

    fn enabled(&self) -> bool {
        self.state
            .lock()
            .timers
            .get(&self.id)
            .is_some_and(|t| t.deadline.is_some())
    }
}

impl Drop for ManualTimer {
    fn drop(&mut self) {
        self.state.lock().timers.remove(&self.id);
    }
}

struct ManualSchedulableCallback {
    id: u64,
    state: Arc<Mutex<ManualState>>,
}

impl SchedulableCallback for ManualSchedulableCallback {
    fn schedule_next_iteration(&mut self) {
        if let Some(entry) = self.state.lock().deferred.get_mut(&self.id) {
            entry.scheduled = true;
        }
    }

    fn cancel(&mut self) {
        if let Some(entry) = self.state.lock().deferred.get_mut(&self.id) {
            entry.scheduled = false;
        }
    }

    fn enabled(&self) -> bool {
        self.state
            .lock()
            .deferred
            .get(&self.id)
            .is_some_and(|d| d.scheduled)
    }
}

impl Drop for ManualSchedulableCallback {
    fn drop(&mut self) {
        self.state.lock().deferred.remove(&self.id);
    }
}
