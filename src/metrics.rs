//! Shaper counters for the operator-facing status view
//!
//! Lock-free: producers bump atomics from transport threads while the
//! scheduler reads them. All accounting is best-effort; nothing here is
//! transactionally exact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::net::budget::ThrottleReason;

/// Counter registry for the shaper
#[derive(Debug)]
pub struct Metrics {
    /// Queued packets actually delivered
    pub packets_sent: AtomicU64,
    /// Cumulative time packets spent queued, nanoseconds
    pub delay_nanos: AtomicU64,
    pub throttle_ping: AtomicU64,
    pub throttle_buffer: AtomicU64,
    pub throttle_max: AtomicU64,
    /// Entries dropped because their chunk column was unloaded first
    pub evicted: AtomicU64,
    /// Packets sent immediately because they were too close to delay
    pub prioritized: AtomicU64,
    /// Cumulative time spent re-sorting chunk queues, nanoseconds
    pub sort_nanos: AtomicU64,
    /// Base traffic accumulated since the last estimate window rollover
    base_window_bytes: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            packets_sent: AtomicU64::new(0),
            delay_nanos: AtomicU64::new(0),
            throttle_ping: AtomicU64::new(0),
            throttle_buffer: AtomicU64::new(0),
            throttle_max: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            prioritized: AtomicU64::new(0),
            sort_nanos: AtomicU64::new(0),
            base_window_bytes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a delivered queued packet and the time it waited
    pub fn record_send(&self, delay: Duration) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.delay_nanos
            .fetch_add(delay.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_throttle(&self, reason: ThrottleReason) {
        let counter = match reason {
            ThrottleReason::MaxBandwidth => &self.throttle_max,
            ThrottleReason::PingDegraded => &self.throttle_ping,
            ThrottleReason::BufferFull => &self.throttle_buffer,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count non-throttled traffic toward the base-bandwidth window
    pub fn add_base(&self, bytes: u64) {
        self.base_window_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Drain the base window at estimate rollover
    pub fn take_base_window(&self) -> u64 {
        self.base_window_bytes.swap(0, Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Snapshot the counters together with the budget's current base
    /// bandwidth estimate
    pub fn snapshot(&self, base_bandwidth: f64) -> StatsSnapshot {
        let packets = self.packets_sent.load(Ordering::Relaxed);
        let delay_nanos = self.delay_nanos.load(Ordering::Relaxed);
        StatsSnapshot {
            base_bandwidth,
            packets_sent: packets,
            average_delay_ms: delay_nanos as f64 / 1e6 / packets.max(1) as f64,
            throttle_ping: self.throttle_ping.load(Ordering::Relaxed),
            throttle_buffer: self.throttle_buffer.load(Ordering::Relaxed),
            throttle_max: self.throttle_max.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            prioritized: self.prioritized.load(Ordering::Relaxed),
            sort_micros: self.sort_nanos.load(Ordering::Relaxed) / 1_000,
            uptime_seconds: self.uptime_seconds(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate counters for the status view
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Decayed base bandwidth estimate, bytes per second
    pub base_bandwidth: f64,
    pub packets_sent: u64,
    pub average_delay_ms: f64,
    pub throttle_ping: u64,
    pub throttle_buffer: u64,
    pub throttle_max: u64,
    pub evicted: u64,
    pub prioritized: u64,
    pub sort_micros: u64,
    pub uptime_seconds: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Per-connection pending state for the status view
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub connection_id: u64,
    pub pending_packets: usize,
    pub pending_bytes: u64,
    pub pending_map_tiles: usize,
}
