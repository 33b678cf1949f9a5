//! Connection-side signals consumed by the shaper
//!
//! The transport owns connections; the shaper only observes them through
//! [`ConnectionLink`] and fires packets back at them through `write`.

use std::sync::Arc;

use crate::net::packet::OutboundPacket;
use crate::util::vec3::Vec3;

/// Transport-assigned connection identifier
pub type ConnectionId = u64;

/// Short- and long-window latency averages in milliseconds
#[derive(Debug, Clone, Copy, Default)]
pub struct PingSample {
    pub short_ms: f64,
    pub long_ms: f64,
}

/// A short-window average more than twice the long-window average marks the
/// connection as degraded for the current tick.
pub const PING_DEGRADED_RATIO: f64 = 2.0;

impl PingSample {
    pub fn is_degraded(&self) -> bool {
        (self.short_ms + 1.0) / (self.long_ms + 1.0) > PING_DEGRADED_RATIO
    }
}

/// Outbound buffer backpressure signal
#[derive(Debug, Clone, Copy)]
pub struct BufferStatus {
    /// Bytes that can still be written before the channel becomes unwritable
    pub free_bytes: u64,
    /// The channel's high watermark
    pub high_watermark: u64,
}

impl BufferStatus {
    /// Free fraction of the outbound buffer. A zero watermark means the
    /// transport exposes no backpressure; treat it as fully writable.
    pub fn free_ratio(&self) -> f64 {
        if self.high_watermark == 0 {
            1.0
        } else {
            self.free_bytes as f64 / self.high_watermark as f64
        }
    }
}

/// The shaper's view of one live connection.
///
/// All methods are cheap snapshot reads. `write` is fire-and-forget and must
/// bypass the interception point, otherwise scheduler-driven sends would be
/// re-intercepted and re-queued.
pub trait ConnectionLink: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Current player position, or `None` for setup/non-player connections.
    /// Without a position, distance-based prioritization is disabled but the
    /// queue still drains.
    fn position(&self) -> Option<Vec3>;

    fn ping(&self) -> PingSample;

    /// Whether the peer is on the same machine (shaping usually skipped).
    fn is_local(&self) -> bool;

    /// Whether the connection is fully active. Writes to inactive channels
    /// (login, teardown) still happen but are excluded from delay metrics.
    fn is_live(&self) -> bool;

    fn buffer_status(&self) -> BufferStatus;

    fn write(&self, packet: Arc<dyn OutboundPacket>);
}
