//! Per-connection packet queue
//!
//! Two sub-queues per connection: an unordered FIFO for asset/config bulk
//! (no spatial key) and a min-heap of chunk packets ordered by squared
//! distance to the player's last-verified position. Byte accounting covers
//! both sub-queues plus pending map tiles and must match the held entries
//! exactly after every mutation.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::Metrics;
use crate::net::classify::{
    estimated_tile_size, ChunkPos, Classification, PacketCategory, REVERIFY_DISTANCE,
};
use crate::net::packet::{OutboundPacket, WorldMapBatch};
use crate::net::worldmap::WorldMapCoalescer;
use crate::util::vec3::Vec3;

/// One deferred outbound packet. Immutable once queued.
pub struct QueuedPacket {
    pub packet: Arc<dyn OutboundPacket>,
    /// Estimated wire size, used for all byte accounting
    pub size: u64,
    pub queued_at: Instant,
    pub chunk_pos: Option<ChunkPos>,
    pub category: PacketCategory,
}

impl QueuedPacket {
    pub fn new(packet: Arc<dyn OutboundPacket>, class: &Classification) -> Self {
        Self {
            packet,
            size: class.size_estimate,
            queued_at: Instant::now(),
            chunk_pos: class.spatial_key,
            category: class.category,
        }
    }
}

/// Heap entry: distance decided at insert/verify time, sequence number
/// breaks ties so equal distances stay FIFO.
struct ChunkEntry {
    dist_sq: f64,
    seq: u64,
    item: QueuedPacket,
}

impl PartialEq for ChunkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for ChunkEntry {}

impl PartialOrd for ChunkEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.dist_sq
            .partial_cmp(&other.dist_sq)
            .unwrap_or(CmpOrdering::Equal)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Per-connection queue state. Guarded by the connection's mutex; safe
/// against concurrent enqueue (producer) and poll/verify/evict (scheduler).
pub struct ConnectionQueue {
    /// Player position at the last verification, `None` for setup
    /// connections without one
    last_position: Option<Vec3>,
    assets: VecDeque<QueuedPacket>,
    chunks: BinaryHeap<Reverse<ChunkEntry>>,
    coalescer: WorldMapCoalescer,
    queued_bytes: u64,
    next_seq: u64,
}

impl ConnectionQueue {
    pub fn new(position: Option<Vec3>) -> Self {
        Self {
            last_position: position,
            assets: VecDeque::new(),
            chunks: BinaryHeap::new(),
            coalescer: WorldMapCoalescer::new(),
            queued_bytes: 0,
            next_seq: 0,
        }
    }

    /// Route a packet into the asset FIFO or the chunk heap
    pub fn enqueue(&mut self, item: QueuedPacket) {
        self.queued_bytes += item.size;
        match item.chunk_pos {
            Some(key) => self.push_chunk(item, key),
            None => self.assets.push_back(item),
        }
        self.assert_accounting();
    }

    fn push_chunk(&mut self, item: QueuedPacket, key: ChunkPos) {
        // Without a reference position the heap degrades to FIFO order
        let dist_sq = self
            .last_position
            .map(|pos| key.distance_sq_to(pos))
            .unwrap_or(0.0);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.chunks.push(Reverse(ChunkEntry { dist_sq, seq, item }));
    }

    /// Next packet to send: assets first (they must not starve behind an
    /// ever-growing chunk stream), then the closest chunk, then a coalesced
    /// map tile batch.
    pub fn poll(&mut self) -> Option<QueuedPacket> {
        if let Some(item) = self.assets.pop_front() {
            self.queued_bytes -= item.size;
            self.assert_accounting();
            return Some(item);
        }
        if let Some(Reverse(entry)) = self.chunks.pop() {
            self.queued_bytes -= entry.item.size;
            self.assert_accounting();
            return Some(entry.item);
        }
        let batch = self.coalescer.next_batch()?;
        let size: u64 = batch.iter().map(estimated_tile_size).sum();
        let packet: Arc<dyn OutboundPacket> = Arc::new(WorldMapBatch::new(batch.into_vec()));
        Some(QueuedPacket {
            packet,
            size,
            queued_at: Instant::now(),
            chunk_pos: None,
            category: PacketCategory::MapTileUpdate,
        })
    }

    /// Drop every pending chunk entry in the unloaded column. Runs before
    /// the unload notification itself goes out, so the client never receives
    /// a stale update for a region it was told to discard.
    pub fn evict_unloaded(&mut self, key: ChunkPos, metrics: &Metrics) -> usize {
        let before = self.chunks.len();
        let kept = std::mem::take(&mut self.chunks);
        for Reverse(entry) in kept {
            match entry.item.chunk_pos {
                Some(pos) if pos.same_column(key) => {
                    self.queued_bytes -= entry.item.size;
                }
                _ => self.chunks.push(Reverse(entry)),
            }
        }
        let dropped = before - self.chunks.len();
        if dropped > 0 {
            metrics.evicted.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        self.assert_accounting();
        dropped
    }

    /// Re-prioritize after significant player movement.
    ///
    /// No-op unless the player moved at least [`REVERIFY_DISTANCE`] since
    /// the last verification (or had no known position before). Entries now
    /// inside the safety distance are handed to `send` immediately and
    /// counted as prioritized; the rest are re-ordered around the new
    /// position. Returns the number of immediate sends.
    pub fn verify(
        &mut self,
        current: Option<Vec3>,
        min_safe_distance: f64,
        metrics: &Metrics,
        mut send: impl FnMut(Arc<dyn OutboundPacket>),
    ) -> usize {
        let Some(position) = current else {
            // Unknown position: keep whatever ordering we have
            return 0;
        };
        if let Some(last) = self.last_position {
            if position.distance_sq_to(last) < REVERIFY_DISTANCE * REVERIFY_DISTANCE {
                return 0;
            }
        }
        self.last_position = Some(position);

        let started = Instant::now();
        let safe_sq = min_safe_distance * min_safe_distance;
        let mut prioritized = 0;

        let old = std::mem::take(&mut self.chunks);
        for Reverse(entry) in old {
            // Chunk entries always carry a key; routed here because of it
            let Some(key) = entry.item.chunk_pos else {
                self.chunks.push(Reverse(entry));
                continue;
            };
            let dist_sq = key.distance_sq_to(position);
            if dist_sq < safe_sq {
                self.queued_bytes -= entry.item.size;
                send(entry.item.packet);
                prioritized += 1;
            } else {
                self.chunks.push(Reverse(ChunkEntry { dist_sq, ..entry }));
            }
        }

        if prioritized > 0 {
            metrics
                .prioritized
                .fetch_add(prioritized as u64, Ordering::Relaxed);
        }
        metrics
            .sort_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.assert_accounting();
        prioritized
    }

    pub fn coalescer_mut(&mut self) -> &mut WorldMapCoalescer {
        &mut self.coalescer
    }

    /// Pending packet count across both sub-queues
    pub fn len(&self) -> usize {
        self.assets.len() + self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty() && self.chunks.is_empty() && self.coalescer.is_empty()
    }

    /// Byte total: sub-queue entries plus pending map tiles
    pub fn total_bytes(&self) -> u64 {
        self.queued_bytes + self.coalescer.pending_bytes()
    }

    pub fn pending_map_tiles(&self) -> usize {
        self.coalescer.len()
    }

    #[inline]
    fn assert_accounting(&self) {
        #[cfg(debug_assertions)]
        {
            let held: u64 = self.assets.iter().map(|p| p.size).sum::<u64>()
                + self
                    .chunks
                    .iter()
                    .map(|Reverse(e)| e.item.size)
                    .sum::<u64>();
            debug_assert_eq!(held, self.queued_bytes, "queue byte accounting drifted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::classify::{classify, REGION_SIZE};
    use crate::net::packet::{id, MapTile};

    struct TestPacket {
        id: u16,
        len: usize,
        pos: Option<ChunkPos>,
    }

    impl OutboundPacket for TestPacket {
        fn packet_id(&self) -> u16 {
            self.id
        }
        fn encoded_len(&self) -> usize {
            self.len
        }
        fn chunk_pos(&self) -> Option<ChunkPos> {
            self.pos
        }
    }

    fn chunk_packet(x: i32, z: i32) -> QueuedPacket {
        let packet = Arc::new(TestPacket {
            id: id::SET_CHUNK,
            len: 10_000,
            pos: Some(ChunkPos::new(x, 0, z)),
        });
        let class = classify(packet.as_ref());
        QueuedPacket::new(packet, &class)
    }

    fn asset_packet(len: usize) -> QueuedPacket {
        let packet = Arc::new(TestPacket { id: id::ASSET_PART, len, pos: None });
        let class = classify(packet.as_ref());
        QueuedPacket::new(packet, &class)
    }

    fn chunk_center(x: i32, z: i32) -> Vec3 {
        Vec3::new(
            x as f64 * REGION_SIZE as f64 + 16.0,
            0.0,
            z as f64 * REGION_SIZE as f64 + 16.0,
        )
    }

    #[test]
    fn test_byte_accounting_across_operations() {
        let metrics = Metrics::new();
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));

        queue.enqueue(chunk_packet(10, 10));
        queue.enqueue(asset_packet(1000));
        queue.enqueue(chunk_packet(20, 20));
        let expected = 650 + 850 + 650;
        assert_eq!(queue.total_bytes(), expected);
        assert_eq!(queue.len(), 3);

        let polled = queue.poll().unwrap();
        assert_eq!(queue.total_bytes(), expected - polled.size);

        queue.evict_unloaded(ChunkPos::new(10, 0, 10), &metrics);
        queue.evict_unloaded(ChunkPos::new(20, 0, 20), &metrics);
        assert_eq!(queue.total_bytes(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_assets_drain_before_chunks() {
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));
        queue.enqueue(chunk_packet(1, 1));
        queue.enqueue(asset_packet(100));

        assert_eq!(queue.poll().unwrap().category, PacketCategory::AssetTransfer);
        assert_eq!(queue.poll().unwrap().category, PacketCategory::BulkTerrain);
    }

    #[test]
    fn test_chunks_polled_closest_first() {
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));
        queue.enqueue(chunk_packet(50, 0));
        queue.enqueue(chunk_packet(5, 0));
        queue.enqueue(chunk_packet(200, 0));
        queue.enqueue(chunk_packet(20, 0));

        let order: Vec<i32> = std::iter::from_fn(|| queue.poll())
            .map(|p| p.chunk_pos.unwrap().x)
            .collect();
        assert_eq!(order, vec![5, 20, 50, 200]);
    }

    #[test]
    fn test_unknown_position_drains_fifo() {
        let mut queue = ConnectionQueue::new(None);
        queue.enqueue(chunk_packet(200, 0));
        queue.enqueue(chunk_packet(5, 0));

        // No distance ordering without a reference position
        assert_eq!(queue.poll().unwrap().chunk_pos.unwrap().x, 200);
        assert_eq!(queue.poll().unwrap().chunk_pos.unwrap().x, 5);
    }

    #[test]
    fn test_evict_matches_whole_column() {
        let metrics = Metrics::new();
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));

        // Three vertical sections of the same column plus one neighbor
        for y in 0..3 {
            let packet = Arc::new(TestPacket {
                id: id::SET_CHUNK,
                len: 10_000,
                pos: Some(ChunkPos::new(7, y, 9)),
            });
            let class = classify(packet.as_ref());
            queue.enqueue(QueuedPacket::new(packet, &class));
        }
        queue.enqueue(chunk_packet(8, 9));

        let dropped = queue.evict_unloaded(ChunkPos::new(7, 0, 9), &metrics);
        assert_eq!(dropped, 3);
        assert_eq!(queue.len(), 1);
        assert_eq!(metrics.evicted.load(Ordering::Relaxed), 3);

        // Polled survivor must be the neighbor
        assert_eq!(queue.poll().unwrap().chunk_pos.unwrap().x, 8);
    }

    #[test]
    fn test_verify_noop_below_movement_threshold() {
        let metrics = Metrics::new();
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));
        queue.enqueue(chunk_packet(100, 100));

        let moved = Vec3::new(10.0, 0.0, 10.0);
        let sent = queue.verify(Some(moved), 96.0, &metrics, |_| panic!("must not send"));
        assert_eq!(sent, 0);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_verify_sends_close_chunks_and_reorders() {
        let metrics = Metrics::new();
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));

        queue.enqueue(chunk_packet(100, 0));
        queue.enqueue(chunk_packet(104, 0));
        // From origin, chunk (100,0) is nearest of the two

        // Player teleports next to chunk (104, 0)
        let new_pos = chunk_center(104, 0);
        let mut sent = Vec::new();
        queue.verify(Some(new_pos), 96.0, &metrics, |p| sent.push(p));

        // (104,0) is now inside the safety distance: sent immediately
        assert_eq!(sent.len(), 1);
        assert_eq!(metrics.prioritized.load(Ordering::Relaxed), 1);
        // (100,0) stays queued, 4 regions away
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.poll().unwrap().chunk_pos.unwrap().x, 100);
    }

    #[test]
    fn test_verify_with_unknown_position_is_noop() {
        let metrics = Metrics::new();
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));
        queue.enqueue(chunk_packet(1, 1));

        let sent = queue.verify(None, 96.0, &metrics, |_| panic!("must not send"));
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_poll_wraps_map_batch_when_queues_empty() {
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));
        queue
            .coalescer_mut()
            .absorb(&[MapTile::present(0, 0, vec![0; 100]), MapTile::removed(1, 0)]);
        assert_eq!(queue.pending_map_tiles(), 2);

        let item = queue.poll().unwrap();
        assert_eq!(item.category, PacketCategory::MapTileUpdate);
        assert_eq!(item.packet.map_tiles().map(<[MapTile]>::len), Some(2));
        assert_eq!(item.size, 39 + 9);
        assert!(queue.is_empty());
        assert!(queue.poll().is_none());
    }

    #[test]
    fn test_equal_distance_stays_fifo() {
        let mut queue = ConnectionQueue::new(Some(Vec3::ZERO));
        // Mirrored coordinates, identical distance from origin
        queue.enqueue(chunk_packet(10, 0));
        queue.enqueue(chunk_packet(-11, 0));

        assert_eq!(queue.poll().unwrap().chunk_pos.unwrap().x, 10);
        assert_eq!(queue.poll().unwrap().chunk_pos.unwrap().x, -11);
    }
}
