// Tokio-backed dispatcher: timers are spawned sleep tasks, deferred callbacks
// are spawned tasks that yield once before running.

use super::{Callback, Dispatcher, SchedulableCallback, Timer};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Dispatcher spawning onto a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioDispatcher {
    handle: Handle,
}

impl TokioDispatcher {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Dispatcher bound to the runtime of the calling task.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Dispatcher for TokioDispatcher {
    fn create_timer(&self, callback: Callback) -> Box<dyn Timer> {
        Box::new(TokioTimer {
            handle: self.handle.clone(),
            callback: Arc::new(Mutex::new(callback)),
            task: None,
        })
    }

    fn create_schedulable_callback(&self, callback: Callback) -> Box<dyn SchedulableCallback> {
        Box::new(TokioSchedulableCallback {
            handle: self.handle.clone(),
            callback: Arc::new(Mutex::new(callback)),
            task: None,
        })
    }
}

struct TokioTimer {
    handle: Handle,
    callback: Arc<Mutex<Callback>>,
    task: Option<JoinHandle<()>>,
}

impl Timer for TokioTimer {
    fn enable(&mut self, duration: Duration) {
        self.disable();
        let callback = Arc::clone(&self.callback);
        self.task = Some(self.handle.spawn(async move {
            tokio::time::sleep(duration).await;
            (callback.lock())();
        }));
    }

    fn disable(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn enabled(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.disable();
    }
}

struct TokioSchedulableCallback {
    handle: Handle,
    callback: Arc<Mutex<Callback>>,
    task: Option<JoinHandle<()>>,
}

impl SchedulableCallback for TokioSchedulableCallback {
    fn schedule_next_iteration(&mut self) {
        if self.enabled() {
            return;
        }
        let callback = Arc::clone(&self.callback);
        self.task = Some(self.handle.spawn(async move {
            tokio::task::yield_now().await;
            (callback.lock())();
        }));
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn enabled(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TokioSchedulableCallback {
    fn drop(&mut self) {
        self.cancel();
    }
}
