//! Transport-facing packet abstraction
//!
//! The shaper never deserializes packets. It only needs the protocol id, the
//! serialized size, and - for spatial packets - either the structured chunk
//! coordinate or raw access to the already-serialized bytes so the
//! coordinate can be read at a fixed offset without a full decode.

use crate::net::classify::ChunkPos;

/// Protocol packet-type identifiers recognized by the classifier.
///
/// These mirror the host protocol's id space; everything else is treated as
/// continuous base traffic and passed through unshaped.
pub mod id {
    /// Full chunk payload (3-axis coordinate)
    pub const SET_CHUNK: u16 = 0x20;
    /// Fluid cell updates for a chunk (3-axis coordinate)
    pub const SET_FLUIDS: u16 = 0x21;
    /// Heightmap overlay (2-axis coordinate)
    pub const SET_CHUNK_HEIGHTMAP: u16 = 0x22;
    /// Tintmap overlay (2-axis coordinate)
    pub const SET_CHUNK_TINTMAP: u16 = 0x23;
    /// Environment overlay (2-axis coordinate)
    pub const SET_CHUNK_ENVIRONMENTS: u16 = 0x24;
    /// Tells the client to discard a chunk column (2-axis coordinate)
    pub const UNLOAD_CHUNK: u16 = 0x25;
    /// World map tile delta batch
    pub const UPDATE_WORLD_MAP: u16 = 0x30;
    pub const ASSET_INITIALIZE: u16 = 0x40;
    pub const ASSET_PART: u16 = 0x41;
    pub const ASSET_FINALIZE: u16 = 0x42;
    pub const JOIN_WORLD: u16 = 0x43;
    pub const WORLD_LOAD_PROGRESS: u16 = 0x44;
    pub const WORLD_LOAD_FINISHED: u16 = 0x45;
    /// Config-bulk update packets (item/block/sound/recipe tables and the
    /// like) occupy a contiguous id range.
    pub const CONFIG_UPDATE_FIRST: u16 = 0x50;
    pub const CONFIG_UPDATE_LAST: u16 = 0x6F;
}

/// A single world map tile delta. `image` of `None` is a removal tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTile {
    pub x: i32,
    pub z: i32,
    pub image: Option<Vec<u8>>,
}

impl MapTile {
    pub fn present(x: i32, z: i32, image: Vec<u8>) -> Self {
        Self { x, z, image: Some(image) }
    }

    pub fn removed(x: i32, z: i32) -> Self {
        Self { x, z, image: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.image.is_none()
    }

    /// Serialized footprint: coords + presence flag + image bytes.
    pub fn encoded_len(&self) -> usize {
        9 + self.image.as_ref().map_or(0, Vec::len)
    }
}

/// An outbound packet as seen by the shaper.
///
/// Implemented by the transport layer's packet type. The accessors degrade
/// rather than fail: a packet that cannot expose a coordinate in either form
/// is simply treated as non-spatial.
pub trait OutboundPacket: Send + Sync {
    /// Protocol packet-type identifier.
    fn packet_id(&self) -> u16;

    /// Raw serialized size in bytes (before transport-level compression).
    fn encoded_len(&self) -> usize;

    /// Serialized bytes, if the packet has already been encoded for reuse.
    /// Lets the classifier read coordinates at fixed offsets instead of
    /// deserializing.
    fn cached_bytes(&self) -> Option<&[u8]> {
        None
    }

    /// Structured chunk coordinate, for packets that have not been
    /// serialized yet.
    fn chunk_pos(&self) -> Option<ChunkPos> {
        None
    }

    /// Tile deltas carried by a world map update packet.
    fn map_tiles(&self) -> Option<&[MapTile]> {
        None
    }
}

/// Synthetic grouped world map update emitted by the coalescer in place of
/// the intercepted per-tile packets.
#[derive(Debug)]
pub struct WorldMapBatch {
    tiles: Vec<MapTile>,
}

impl WorldMapBatch {
    pub fn new(tiles: Vec<MapTile>) -> Self {
        Self { tiles }
    }

    pub fn tiles(&self) -> &[MapTile] {
        &self.tiles
    }
}

impl OutboundPacket for WorldMapBatch {
    fn packet_id(&self) -> u16 {
        id::UPDATE_WORLD_MAP
    }

    fn encoded_len(&self) -> usize {
        1 + self.tiles.iter().map(MapTile::encoded_len).sum::<usize>()
    }

    fn map_tiles(&self) -> Option<&[MapTile]> {
        Some(&self.tiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_encoded_len() {
        assert_eq!(MapTile::removed(1, 2).encoded_len(), 9);
        assert_eq!(MapTile::present(1, 2, vec![0u8; 64]).encoded_len(), 73);
    }

    #[test]
    fn test_batch_packet_shape() {
        let batch = WorldMapBatch::new(vec![
            MapTile::present(0, 0, vec![1, 2, 3]),
            MapTile::removed(1, 0),
        ]);
        assert_eq!(batch.packet_id(), id::UPDATE_WORLD_MAP);
        assert_eq!(batch.encoded_len(), 1 + 12 + 9);
        assert_eq!(batch.map_tiles().map(<[MapTile]>::len), Some(2));
        assert!(batch.cached_bytes().is_none());
        assert!(batch.chunk_pos().is_none());
    }
}
