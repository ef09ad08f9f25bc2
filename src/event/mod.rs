//! Timer and deferred-callback services
//!
//! Backoff-scheduled and next-iteration retries are the only suspension
//! points of the retry engine. Both are modelled as one-shot registrations
//! on a [`Dispatcher`]; nothing here ever blocks a thread.
//!
//! Handles own their registration: dropping a [`Timer`] or a
//! [`SchedulableCallback`] cancels it, so a callback can never fire into
//! state that has already been torn down.

mod manual;
mod tokio_dispatcher;

pub use manual::ManualDispatcher;
pub use tokio_dispatcher::TokioDispatcher;

use std::time::Duration;

/// Callback invoked when a timer fires or a deferred callback runs
pub type Callback = Box<dyn FnMut() + Send + 'static>;

/// A re-armable one-shot timer. Dropping the handle disarms it.
pub trait Timer: Send {
    /// Arm (or re-arm) the timer to fire once after `duration`
    fn enable(&mut self, duration: Duration);

    /// Disarm the timer; a no-op when not armed
    fn disable(&mut self);

    /// Whether the timer is armed and has not fired yet
    fn enabled(&self) -> bool;
}

/// A callback that runs on the next event-loop iteration rather than inline.
/// Dropping the handle cancels it.
pub trait SchedulableCallback: Send {
    fn schedule_next_iteration(&mut self);

    fn cancel(&mut self);

    fn enabled(&self) -> bool;
}

/// Factory for timers and deferred callbacks
pub trait Dispatcher: Send + Sync {
    fn create_timer(&self, callback: Callback) -> Box<dyn Timer>;

    fn create_schedulable_callback(&self, callback: Callback) -> Box<dyn SchedulableCallback>;
}
