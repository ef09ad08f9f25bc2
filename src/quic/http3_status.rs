// Tracks whether HTTP/3 to an origin currently works.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{HTTP3_BROKEN_BASE_EXPIRATION_SECS, HTTP3_MAX_CONSECUTIVE_BROKEN_COUNT};
use crate::event::{Dispatcher, Timer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http3Status {
    /// No attempt has succeeded or failed yet
    Pending,
    /// Recently failed; do not attempt until the broken period expires
    Broken,
    /// The broken period expired; attempts may resume but failure is likely
    FailedRecently,
    /// A connection succeeded
    Confirmed,
}

#[derive(Debug)]
struct TrackerState {
    status: Http3Status,
    consecutive_broken_count: u32,
}

/// HTTP/3 health for one origin.
///
/// Marking HTTP/3 broken arms an expiry timer of 5 minutes doubled for each
/// consecutive breakage (the doubling is capped). When it fires the status
/// drops to [`Http3Status::FailedRecently`]. Confirming HTTP/3 resets the
/// doubling and disarms the timer.
pub struct Http3StatusTracker {
    state: Arc<Mutex<TrackerState>>,
    expiration_timer: Box<dyn Timer>,
}

impl Http3StatusTracker {
    pub fn new(dispatcher: &dyn Dispatcher) -> Self {
        let state = Arc::new(Mutex::new(TrackerState {
            status: Http3Status::Pending,
            consecutive_broken_count: 0,
        }));
        let timer_state = Arc::clone(&state);
        let expiration_timer = dispatcher.create_timer(Box::new(move || {
            let mut state = timer_state.lock();
            if state.status == Http3Status::Broken {
                tracing::debug!("HTTP/3 broken period expired");
                state.status = Http3Status::FailedRecently;
            }
        }));
        Self {
            state,
            expiration_timer,
        }
    }

    pub fn status(&self) -> Http3Status {
        self.state.lock().status
    }

    pub fn is_http3_broken(&self) -> bool {
        self.status() == Http3Status::Broken
    }

    pub fn is_http3_confirmed(&self) -> bool {
        self.status() == Http3Status::Confirmed
    }

    pub fn has_http3_failed_recently(&self) -> bool {
        self.status() == Http3Status::FailedRecently
    }

    /// Whether a new connection attempt should try HTTP/3
    pub fn should_attempt_http3(&self) -> bool {
        !self.is_http3_broken()
    }

    pub fn mark_http3_broken(&mut self) {
        let mut state = self.state.lock();
        state.status = Http3Status::Broken;
        if self.expiration_timer.enabled() {
            return;
        }
        let period = Duration::from_secs(
            HTTP3_BROKEN_BASE_EXPIRATION_SECS << state.consecutive_broken_count,
        );
        tracing::debug!(
            period_secs = period.as_secs(),
            consecutive_broken_count = state.consecutive_broken_count,
            "Marking HTTP/3 broken"
        );
        // The timer callback takes the same lock; release it before arming.
        if state.consecutive_broken_count < HTTP3_MAX_CONSECUTIVE_BROKEN_COUNT {
            state.consecutive_broken_count += 1;
        }
        drop(state);
        self.expiration_timer.enable(period);
    }

    pub fn mark_http3_confirmed(&mut self) {
        {
            let mut state = self.state.lock();
            state.status = Http3Status::Confirmed;
            state.consecutive_broken_count = 0;
        }
        if self.expiration_timer.enabled() {
            self.expiration_timer.disable();
        }
    }

    pub fn mark_http3_failed_recently(&mut self) {
        self.state.lock().status = Http3Status::FailedRecently;
    }
}

impl std::fmt::Debug for Http3StatusTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Http3StatusTracker")
            .field("status", &state.status)
            .field("consecutive_broken_count", &state.consecutive_broken_count)
            .finish()
    }
}
