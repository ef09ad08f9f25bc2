//! Send-buffer watermark tracking
//!
//! The transport buffers outbound bytes itself; this module only watches the
//! byte counts it reports and turns threshold crossings into edges. A buffer
//! goes "above" when it exceeds the high watermark and comes back "below"
//! only once it drops under the low watermark (half the high one), so small
//! oscillations around one threshold never produce a storm of callbacks.

/// A threshold crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEdge {
    /// Rose above the high watermark
    High,
    /// Fell below the low watermark
    Low,
}

/// Hysteresis tracker for one send buffer
#[derive(Debug, Clone)]
pub struct SendBufferWatermark {
    high: u64,
    low: u64,
    above: bool,
}

impl SendBufferWatermark {
    /// A zero high watermark disables tracking
    pub fn new(high: u64) -> Self {
        Self {
            high,
            low: high / 2,
            above: false,
        }
    }

    pub fn is_above(&self) -> bool {
        self.above
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    /// Feed a change in buffered bytes; returns the edge crossed, if any
    pub fn check(&mut self, old: u64, new: u64) -> Option<WatermarkEdge> {
        if self.high == 0 || old == new {
            return None;
        }
        if new > old {
            if !self.above && new > self.high {
                self.above = true;
                return Some(WatermarkEdge::High);
            }
        } else if self.above && new < self.low {
            self.above = false;
            return Some(WatermarkEdge::Low);
        }
        None
    }
}

/// Counts how many sources currently hold a stream above its watermark.
///
/// A stream is above when its own buffer or the connection's buffer is.
/// Callbacks fire on the combined 0 -> 1 and 1 -> 0 transitions only.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatermarkSources(u32);

impl WatermarkSources {
    /// Returns true on the 0 -> 1 transition
    pub fn raise(&mut self) -> bool {
        self.0 += 1;
        self.0 == 1
    }

    /// Returns true on the 1 -> 0 transition. Lowering at zero is ignored.
    pub fn lower(&mut self) -> bool {
        if self.0 == 0 {
            tracing::warn!("Watermark lowered without a matching raise");
            return false;
        }
        self.0 -= 1;
        self.0 == 0
    }

    pub fn is_above(&self) -> bool {
        self.0 > 0
    }
}

/// Connection-wide accounting of bytes buffered by all streams
#[derive(Debug, Clone)]
pub struct ConnectionSendBuffer {
    bytes_to_send: u64,
    watermark: SendBufferWatermark,
    pending_edges: Vec<WatermarkEdge>,
}

impl ConnectionSendBuffer {
    pub fn new(high_watermark: u64) -> Self {
        Self {
            bytes_to_send: 0,
            watermark: SendBufferWatermark::new(high_watermark),
            pending_edges: Vec::new(),
        }
    }

    pub fn bytes_to_send(&self) -> u64 {
        self.bytes_to_send
    }

    pub fn is_above(&self) -> bool {
        self.watermark.is_above()
    }

    /// Apply a stream's change in buffered bytes
    pub fn adjust_bytes_to_send(&mut self, delta: i64) {
        let old = self.bytes_to_send;
        let new = if delta >= 0 {
            old.saturating_add(delta.unsigned_abs())
        } else {
            old.saturating_sub(delta.unsigned_abs())
        };
        self.bytes_to_send = new;
        if let Some(edge) = self.watermark.check(old, new) {
            self.pending_edges.push(edge);
        }
    }

    /// Edges crossed since the last call, oldest first
    pub fn take_edges(&mut self) -> Vec<WatermarkEdge> {
        std::mem::take(&mut self.pending_edges)
    }
}
