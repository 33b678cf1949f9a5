//! The adaptive per-connection packet scheduler
//!
//! [`PacketShaper`] is wired into the transport's write path: every outbound
//! packet is offered to [`PacketShaper::intercept`], which classifies it and
//! either lets it pass or defers it into the owning connection's queue.
//! A periodic tick then drains all queues in randomized order under the
//! shared bandwidth budget.
//!
//! Interception runs on the transport's per-connection writer threads; the
//! tick runs on one dedicated task. Each connection's queue is guarded by
//! its own mutex, and ticks iterate a snapshot of the registry so
//! connections can come and go mid-tick.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::{ConfigError, ShaperConfig};
use crate::metrics::{ConnectionStats, Metrics, StatsSnapshot};
use crate::net::budget::BandwidthBudget;
use crate::net::classify::{classify, Classification, PacketCategory};
use crate::net::connection::{ConnectionId, ConnectionLink};
use crate::net::packet::{OutboundPacket, WorldMapBatch};
use crate::net::queue::{ConnectionQueue, QueuedPacket};

/// Verdict for one intercepted packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDecision {
    /// The transport sends the packet now, unchanged
    Pass,
    /// The shaper took ownership; the transport must not send the packet
    Defer,
}

impl SendDecision {
    pub fn is_deferred(&self) -> bool {
        matches!(self, SendDecision::Defer)
    }
}

/// Per-connection registry entry
struct ConnectionState {
    link: Arc<dyn ConnectionLink>,
    queue: Mutex<ConnectionQueue>,
}

/// Outbound bandwidth shaper and packet scheduler
pub struct PacketShaper {
    config: RwLock<ShaperConfig>,
    budget: Mutex<BandwidthBudget>,
    metrics: Arc<Metrics>,
    connections: RwLock<FxHashMap<ConnectionId, Arc<ConnectionState>>>,
}

impl PacketShaper {
    pub fn new(config: ShaperConfig) -> Self {
        Self {
            budget: Mutex::new(BandwidthBudget::new(&config)),
            config: RwLock::new(config),
            metrics: Arc::new(Metrics::new()),
            connections: RwLock::new(FxHashMap::default()),
        }
    }

    /// Offer an outbound packet to the shaper.
    ///
    /// Called from the transport's write path, before the packet hits the
    /// wire. [`SendDecision::Defer`] means the shaper took the packet and
    /// will deliver it later through `link.write`.
    pub fn intercept(
        &self,
        link: &Arc<dyn ConnectionLink>,
        packet: Arc<dyn OutboundPacket>,
    ) -> SendDecision {
        let class = classify(packet.as_ref());
        let state = self.state_for(link);

        match class.category {
            PacketCategory::ChunkUnload => {
                // Drop stale queued updates for the column before the client
                // is told to discard it
                if let Some(key) = class.spatial_key {
                    state.queue.lock().evict_unloaded(key, &self.metrics);
                }
                self.metrics.add_base(class.size_estimate);
                SendDecision::Pass
            }
            PacketCategory::MapTileUpdate => self.coalesce_map_update(&state, link, &packet, &class),
            category if category.is_bulk() => self.shape_bulk(&state, link, packet, &class),
            _ => {
                // Continuous traffic: passes through, feeds the base estimate
                self.metrics.add_base(class.size_estimate);
                SendDecision::Pass
            }
        }
    }

    /// Remove a connection's pending state. Host calls this from its
    /// disconnect handling; nothing else reclaims queues.
    pub fn disconnect(&self, id: ConnectionId) {
        if let Some(state) = self.connections.write().remove(&id) {
            let queue = state.queue.lock();
            debug!(
                connection = id,
                pending = queue.len(),
                pending_bytes = queue.total_bytes(),
                "dropping queue for disconnected connection"
            );
        }
    }

    /// One scheduler pass: refill the budget for elapsed wall-clock time,
    /// then drain every connection in randomized order.
    pub fn tick(&self) {
        let config = self.config.read().clone();
        self.budget.lock().refill(&config, &self.metrics);
        self.drain_connections(&config);
    }

    /// Deterministic tick used by tests and simulations
    pub fn tick_with(&self, dt: f64) {
        let config = self.config.read().clone();
        self.budget.lock().advance(dt, &config, &self.metrics);
        self.drain_connections(&config);
    }

    /// Drive [`PacketShaper::tick`] on a periodic task. Runs until aborted.
    pub fn run(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        info!(period_ms = period.as_millis() as u64, "packet shaper started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }

    /// Replace the active configuration
    pub fn update_config(&self, config: ShaperConfig) -> Result<(), ConfigError> {
        config.validate()?;
        info!(
            min_bandwidth = config.min_bandwidth,
            max_bandwidth = config.max_bandwidth,
            "shaper config updated"
        );
        *self.config.write() = config;
        Ok(())
    }

    /// Aggregate counters for the status view
    pub fn stats(&self) -> StatsSnapshot {
        let base = self.budget.lock().base_bandwidth();
        self.metrics.snapshot(base)
    }

    /// Per-connection pending totals for the status view
    pub fn connection_stats(&self) -> Vec<ConnectionStats> {
        self.connections
            .read()
            .iter()
            .map(|(id, state)| {
                let queue = state.queue.lock();
                ConnectionStats {
                    connection_id: *id,
                    pending_packets: queue.len(),
                    pending_bytes: queue.total_bytes(),
                    pending_map_tiles: queue.pending_map_tiles(),
                }
            })
            .collect()
    }

    /// Current bucket levels (min, max), for diagnostics
    pub fn bucket_levels(&self) -> (i64, i64) {
        let budget = self.budget.lock();
        (budget.min_bucket(), budget.max_bucket())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Registry entry for a link, created lazily on first interception
    fn state_for(&self, link: &Arc<dyn ConnectionLink>) -> Arc<ConnectionState> {
        if let Some(state) = self.connections.read().get(&link.id()) {
            return state.clone();
        }
        let mut connections = self.connections.write();
        connections
            .entry(link.id())
            .or_insert_with(|| {
                debug!(connection = link.id(), "tracking new connection");
                Arc::new(ConnectionState {
                    link: link.clone(),
                    queue: Mutex::new(ConnectionQueue::new(link.position())),
                })
            })
            .clone()
    }

    /// Route one bulk packet: pass, send-now, or queue
    fn shape_bulk(
        &self,
        state: &ConnectionState,
        link: &Arc<dyn ConnectionLink>,
        packet: Arc<dyn OutboundPacket>,
        class: &Classification,
    ) -> SendDecision {
        let (throttle_local, throttle_assets, min_safe_distance) = {
            let config = self.config.read();
            (
                config.throttle_local_connections,
                config.throttle_asset_downloads,
                config.min_safe_distance,
            )
        };

        if link.is_local() && !throttle_local {
            self.metrics.add_base(class.size_estimate);
            return SendDecision::Pass;
        }
        if class.category == PacketCategory::AssetTransfer && !throttle_assets {
            self.metrics.add_base(class.size_estimate);
            return SendDecision::Pass;
        }

        // Too close to the player to delay: let the transport send it now
        if let (Some(key), Some(position)) = (class.spatial_key, link.position()) {
            let safe_sq = min_safe_distance * min_safe_distance;
            if key.distance_sq_to(position) < safe_sq {
                self.metrics.prioritized.fetch_add(1, Ordering::Relaxed);
                return SendDecision::Pass;
            }
        }

        state.queue.lock().enqueue(QueuedPacket::new(packet, class));
        SendDecision::Defer
    }

    /// Absorb a map tile update and answer with the coalescer's next batch
    /// in place of the original packet
    fn coalesce_map_update(
        &self,
        state: &ConnectionState,
        link: &Arc<dyn ConnectionLink>,
        packet: &Arc<dyn OutboundPacket>,
        class: &Classification,
    ) -> SendDecision {
        let Some(tiles) = packet.map_tiles() else {
            // No tile payload exposed: nothing to coalesce, pass unchanged
            self.metrics.add_base(class.size_estimate);
            return SendDecision::Pass;
        };

        let batch = {
            let mut queue = state.queue.lock();
            queue.coalescer_mut().absorb(tiles);
            queue.coalescer_mut().next_batch()
        };

        if let Some(batch) = batch {
            let grouped: Arc<dyn OutboundPacket> = Arc::new(WorldMapBatch::new(batch.into_vec()));
            self.metrics.add_base(classify(grouped.as_ref()).size_estimate);
            link.write(grouped);
        }
        SendDecision::Defer
    }

    /// Drain all queues for one tick
    fn drain_connections(&self, config: &ShaperConfig) {
        let mut entries: Vec<Arc<ConnectionState>> =
            self.connections.read().values().cloned().collect();
        // Random order to prevent starvation
        entries.shuffle(&mut rand::thread_rng());

        for state in entries {
            let link = &state.link;
            let mut queue = state.queue.lock();
            if queue.is_empty() {
                continue;
            }

            let degraded = link.ping().is_degraded();

            // Re-prioritize around the player's current position; chunks now
            // inside the safety distance bypass the budget entirely
            queue.verify(link.position(), config.min_safe_distance, &self.metrics, |p| {
                link.write(p)
            });

            loop {
                // Throttle counters mean "a send was blocked"; an empty
                // queue is not a blocked send
                if queue.is_empty() {
                    break;
                }
                let throttle = self.budget.lock().check(
                    config,
                    degraded,
                    link.buffer_status().free_ratio(),
                );
                if let Some(reason) = throttle {
                    self.metrics.record_throttle(reason);
                    break;
                }

                let Some(item) = queue.poll() else {
                    break;
                };
                let size = item.size;
                let queued_at = item.queued_at;
                link.write(item.packet);

                self.budget.lock().consume(size);
                // Writes to inactive channels (login, teardown) do not
                // consume real bandwidth worth measuring
                if link.is_live() {
                    self.metrics.record_send(queued_at.elapsed());
                }
            }
        }
    }
}
