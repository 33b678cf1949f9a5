//! World map tile coalescing
//!
//! Map tile deltas arrive far faster than they are worth sending: only the
//! latest state per tile ever reaches the client's screen. The coalescer
//! keeps at most one pending entry per tile coordinate and hands back
//! batches of a fixed size. A removal tombstone always supersedes a pending
//! image for the same tile.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::net::classify::estimated_tile_size;
use crate::net::packet::MapTile;

/// Tiles per outbound grouped update
pub const MAP_BATCH_SIZE: usize = 8;

/// Per-connection map tile dedupe store
#[derive(Debug, Default)]
pub struct WorldMapCoalescer {
    tiles: FxHashMap<(i32, i32), MapTile>,
    pending_bytes: u64,
}

impl WorldMapCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge incoming tile deltas. Later updates replace earlier ones for
    /// the same coordinate; a tombstone replaces a pending image.
    pub fn absorb(&mut self, tiles: &[MapTile]) {
        for tile in tiles {
            let key = (tile.x, tile.z);
            if let Some(previous) = self.tiles.remove(&key) {
                self.pending_bytes -= estimated_tile_size(&previous);
            }
            self.pending_bytes += estimated_tile_size(tile);
            self.tiles.insert(key, tile.clone());
        }
    }

    /// Pop up to [`MAP_BATCH_SIZE`] pending entries, tombstones ahead of
    /// images, or `None` when nothing is pending.
    ///
    /// A removal must reach the client in the very next grouped update; a
    /// stale tile lingering on the map is worse than a late one.
    pub fn next_batch(&mut self) -> Option<SmallVec<[MapTile; MAP_BATCH_SIZE]>> {
        if self.tiles.is_empty() {
            return None;
        }
        let mut keys: SmallVec<[(i32, i32); MAP_BATCH_SIZE]> = self
            .tiles
            .iter()
            .filter(|(_, tile)| tile.is_tombstone())
            .map(|(key, _)| *key)
            .take(MAP_BATCH_SIZE)
            .collect();
        if keys.len() < MAP_BATCH_SIZE {
            keys.extend(
                self.tiles
                    .iter()
                    .filter(|(_, tile)| !tile.is_tombstone())
                    .map(|(key, _)| *key)
                    .take(MAP_BATCH_SIZE - keys.len()),
            );
        }
        let mut batch = SmallVec::new();
        for key in keys {
            if let Some(tile) = self.tiles.remove(&key) {
                self.pending_bytes -= estimated_tile_size(&tile);
                batch.push(tile);
            }
        }
        Some(batch)
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Estimated wire bytes of everything pending
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }
}
