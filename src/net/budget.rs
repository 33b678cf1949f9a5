//! Dual token-bucket bandwidth budget
//!
//! The minimum bucket is a soft budget: while positive, connections may
//! burst freely and no throttle condition is even evaluated. The maximum
//! bucket is the hard budget, shared with continuous ("base") traffic via a
//! decayed moving estimate of base bandwidth.

use std::time::Instant;

use crate::config::ShaperConfig;
use crate::metrics::Metrics;

/// Smoothing window for the base-bandwidth estimate, seconds
const BASE_WINDOW_SECS: f64 = 1.0;

/// Exponential smoothing factor: estimate keeps 90% of its previous value
const BASE_DECAY: f64 = 0.9;

/// Why a candidate send was blocked this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// Hard budget exhausted after accounting for base traffic
    MaxBandwidth,
    /// Connection latency degraded relative to its long-term baseline
    PingDegraded,
    /// Transport send buffer too close to its high watermark
    BufferFull,
}

/// Bucket levels and the base-traffic estimate.
///
/// Mutated only on the scheduler thread; producers feed the base window
/// through the atomic accumulator in [`Metrics`].
#[derive(Debug)]
pub struct BandwidthBudget {
    min_bucket: i64,
    max_bucket: i64,
    base_estimate: f64,
    window_elapsed: f64,
    last_refill: Instant,
}

impl BandwidthBudget {
    pub fn new(config: &ShaperConfig) -> Self {
        Self {
            min_bucket: config.min_bandwidth as i64,
            max_bucket: config.max_bandwidth as i64,
            base_estimate: 0.0,
            window_elapsed: 0.0,
            last_refill: Instant::now(),
        }
    }

    /// Refill both buckets for wall-clock time elapsed since the last call
    /// and fold the accumulated base-traffic window into the decayed
    /// estimate. Returns the elapsed seconds used.
    pub fn refill(&mut self, config: &ShaperConfig, metrics: &Metrics) -> f64 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.advance(dt, config, metrics);
        dt
    }

    /// Deterministic refill step, split out so tests can drive time directly
    pub fn advance(&mut self, dt: f64, config: &ShaperConfig, metrics: &Metrics) {
        self.window_elapsed += dt;
        if self.window_elapsed > BASE_WINDOW_SECS {
            let window_bytes = metrics.take_base_window() as f64;
            self.base_estimate = self.base_estimate * BASE_DECAY
                + window_bytes / self.window_elapsed * (1.0 - BASE_DECAY);
            self.window_elapsed = 0.0;
        }

        // Each bucket caps at one second's worth of its configured rate
        self.min_bucket = (self.min_bucket + (config.min_bandwidth as f64 * dt) as i64)
            .min(config.min_bandwidth as i64);
        self.max_bucket = (self.max_bucket + (config.max_bandwidth as f64 * dt) as i64)
            .min(config.max_bandwidth as i64);
    }

    /// Account a sent packet against both buckets.
    ///
    /// A bucket is only decremented while positive, so a level can dip one
    /// packet below zero but refill alone always restores forward progress.
    pub fn consume(&mut self, size: u64) {
        if self.min_bucket > 0 {
            self.min_bucket -= size as i64;
        }
        if self.max_bucket > 0 {
            self.max_bucket -= size as i64;
        }
    }

    /// Evaluate the throttle conditions for one candidate send, in
    /// precedence order. `None` while the minimum bucket is positive.
    pub fn check(
        &self,
        config: &ShaperConfig,
        ping_degraded: bool,
        buffer_free_ratio: f64,
    ) -> Option<ThrottleReason> {
        if self.min_bucket > 0 {
            return None;
        }
        if self.max_bucket - self.base_estimate as i64 <= 0 {
            return Some(ThrottleReason::MaxBandwidth);
        }
        if ping_degraded && config.throttle_when_ping_degrades {
            return Some(ThrottleReason::PingDegraded);
        }
        if buffer_free_ratio <= config.buffer_reserve_fraction {
            return Some(ThrottleReason::BufferFull);
        }
        None
    }

    pub fn min_bucket(&self) -> i64 {
        self.min_bucket
    }

    pub fn max_bucket(&self) -> i64 {
        self.max_bucket
    }

    /// Decayed estimate of continuous traffic, bytes per second
    pub fn base_bandwidth(&self) -> f64 {
        self.base_estimate
    }

    #[cfg(test)]
    pub(crate) fn set_levels(&mut self, min: i64, max: i64) {
        self.min_bucket = min;
        self.max_bucket = max;
    }
}
