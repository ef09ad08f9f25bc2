// Observer list for stream callbacks.

use super::{StreamCallbacks, StreamResetReason};
use std::sync::Arc;

/// Handle returned by [`StreamCallbackRegistry::add`], used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Ordered list of stream observers.
///
/// Reset notification is latched: once reset callbacks have run for a
/// stream, later resets are not reported again.
#[derive(Default)]
pub struct StreamCallbackRegistry {
    entries: Vec<(CallbackId, Arc<dyn StreamCallbacks>)>,
    next_id: u64,
    reset_callbacks_started: bool,
}

impl StreamCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, callbacks: Arc<dyn StreamCallbacks>) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        self.entries.push((id, callbacks));
        id
    }

    /// Returns false if `id` was not registered
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset_callbacks_started(&self) -> bool {
        self.reset_callbacks_started
    }

    /// Notify every observer of a reset. Returns false when a reset was
    /// already reported for this stream.
    pub fn run_reset_callbacks(&mut self, reason: StreamResetReason, details: &str) -> bool {
        if self.reset_callbacks_started {
            return false;
        }
        self.reset_callbacks_started = true;
        for (_, callbacks) in &self.entries {
            callbacks.on_reset_stream(reason, details);
        }
        true
    }

    pub fn run_high_watermark_callbacks(&self) {
        for (_, callbacks) in &self.entries {
            callbacks.on_above_write_buffer_high_watermark();
        }
    }

    pub fn run_low_watermark_callbacks(&self) {
        for (_, callbacks) in &self.entries {
            callbacks.on_below_write_buffer_low_watermark();
        }
    }
}

impl std::fmt::Debug for StreamCallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCallbackRegistry")
            .field("callbacks", &self.entries.len())
            .field("reset_callbacks_started", &self.reset_callbacks_started)
            .finish()
    }
}
