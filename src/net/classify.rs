//! Packet classification and spatial-key extraction
//!
//! Stateless. Maps a protocol packet-type id to a category, estimates the
//! on-wire size after transport compression, and pulls the chunk coordinate
//! out of spatial packets - from the cached serialized bytes when available
//! (fixed-offset little-endian reads), falling back to the structured
//! accessor otherwise. Extraction failure means "non-spatial", never an
//! error.

use crate::net::packet::{id, MapTile, OutboundPacket};
use crate::util::vec3::Vec3;

/// Horizontal extent of one chunk region in world units
pub const REGION_SIZE: i32 = 32;

/// Offset from a region's corner to its center
pub const REGION_CENTER_OFFSET: f64 = REGION_SIZE as f64 / 2.0;

/// Players moving less than this since the last verification do not trigger
/// a queue re-prioritization.
pub const REVERIFY_DISTANCE: f64 = 32.0;

/// Empirical on-wire compression ratios per category. Budgets are computed
/// against the wire estimate; raw serialized sizes overstate terrain by an
/// order of magnitude.
pub mod ratio {
    pub const TERRAIN: f64 = 0.065;
    pub const OVERLAY: f64 = 0.5;
    pub const MAP_TILE: f64 = 0.3;
    pub const ASSET_PART: f64 = 0.85;
    pub const DEFAULT: f64 = 0.25;
}

/// Chunk coordinate in region space. 2D-only categories carry y = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Same chunk column, ignoring the vertical component. Unload
    /// notifications address whole columns.
    #[inline]
    pub fn same_column(&self, other: ChunkPos) -> bool {
        self.x == other.x && self.z == other.z
    }

    /// Squared horizontal distance from the center of this region to a
    /// world-space point. Squared to keep a sqrt off the drain loop.
    #[inline]
    pub fn distance_sq_to(&self, point: Vec3) -> f64 {
        let cx = self.x as f64 * REGION_SIZE as f64 + REGION_CENTER_OFFSET;
        let cz = self.z as f64 * REGION_SIZE as f64 + REGION_CENTER_OFFSET;
        let dx = point.x - cx;
        let dz = point.z - cz;
        dx * dx + dz * dz
    }
}

/// Outbound packet category, decided once at classification time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCategory {
    /// Full chunk payloads (3-axis coordinate)
    BulkTerrain,
    /// Fluid updates (3-axis coordinate)
    BulkFluid,
    /// Heightmap/tintmap/environment overlays (2-axis coordinate)
    BulkOverlay,
    /// Asset streams, config-bulk tables, world-load progress (no coordinate)
    AssetTransfer,
    /// World map tile deltas, routed through the coalescer
    MapTileUpdate,
    /// Chunk column unload notification (2-axis coordinate)
    ChunkUnload,
    /// Everything else: continuous base traffic, passed through
    Other,
}

impl PacketCategory {
    /// Whether this category is subject to queueing and budget throttling
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            PacketCategory::BulkTerrain
                | PacketCategory::BulkFluid
                | PacketCategory::BulkOverlay
                | PacketCategory::AssetTransfer
        )
    }

    fn compression_ratio(&self) -> f64 {
        match self {
            PacketCategory::BulkTerrain => ratio::TERRAIN,
            PacketCategory::BulkOverlay => ratio::OVERLAY,
            PacketCategory::MapTileUpdate => ratio::MAP_TILE,
            PacketCategory::AssetTransfer => ratio::ASSET_PART,
            PacketCategory::BulkFluid | PacketCategory::ChunkUnload | PacketCategory::Other => {
                ratio::DEFAULT
            }
        }
    }
}

/// Static lookup from protocol id to category
pub fn category_of(packet_id: u16) -> PacketCategory {
    match packet_id {
        id::SET_CHUNK => PacketCategory::BulkTerrain,
        id::SET_FLUIDS => PacketCategory::BulkFluid,
        id::SET_CHUNK_HEIGHTMAP | id::SET_CHUNK_TINTMAP | id::SET_CHUNK_ENVIRONMENTS => {
            PacketCategory::BulkOverlay
        }
        id::UNLOAD_CHUNK => PacketCategory::ChunkUnload,
        id::UPDATE_WORLD_MAP => PacketCategory::MapTileUpdate,
        id::ASSET_INITIALIZE
        | id::ASSET_PART
        | id::ASSET_FINALIZE
        | id::JOIN_WORLD
        | id::WORLD_LOAD_PROGRESS
        | id::WORLD_LOAD_FINISHED => PacketCategory::AssetTransfer,
        id::CONFIG_UPDATE_FIRST..=id::CONFIG_UPDATE_LAST => PacketCategory::AssetTransfer,
        _ => PacketCategory::Other,
    }
}

/// Classification result for one outbound packet
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub category: PacketCategory,
    /// Estimated on-wire size after transport compression
    pub size_estimate: u64,
    pub spatial_key: Option<ChunkPos>,
}

/// Classify an outbound packet
pub fn classify(packet: &dyn OutboundPacket) -> Classification {
    let category = category_of(packet.packet_id());
    let size_estimate = (packet.encoded_len() as f64 * category.compression_ratio()) as u64;
    let spatial_key = spatial_key(packet, category);
    Classification { category, size_estimate, spatial_key }
}

/// Estimated wire size of one pending map tile entry
pub fn estimated_tile_size(tile: &MapTile) -> u64 {
    match &tile.image {
        Some(image) => 9 + (image.len() as f64 * ratio::MAP_TILE) as u64,
        None => 9,
    }
}

/// Extract the chunk coordinate for a spatial category.
///
/// Fast path: fixed-offset reads from the cached serialized form. Fallback:
/// the structured accessor. Either failing yields `None` - the packet is
/// then treated as non-spatial for eviction and prioritization.
fn spatial_key(packet: &dyn OutboundPacket, category: PacketCategory) -> Option<ChunkPos> {
    if let Some(buf) = packet.cached_bytes() {
        let from_cached = match category {
            PacketCategory::BulkTerrain | PacketCategory::BulkFluid => read_chunk_3d(buf),
            PacketCategory::BulkOverlay => read_chunk_2d(buf),
            PacketCategory::ChunkUnload => read_unload(buf),
            _ => None,
        };
        if from_cached.is_some() {
            return from_cached;
        }
    }
    match category {
        PacketCategory::BulkTerrain
        | PacketCategory::BulkFluid
        | PacketCategory::BulkOverlay
        | PacketCategory::ChunkUnload => packet.chunk_pos(),
        _ => None,
    }
}

/// Terrain/fluid wire layout: tag byte, then x/y/z at offsets 1/5/9
fn read_chunk_3d(buf: &[u8]) -> Option<ChunkPos> {
    Some(ChunkPos::new(
        read_i32_le(buf, 1)?,
        read_i32_le(buf, 5)?,
        read_i32_le(buf, 9)?,
    ))
}

/// Overlay wire layout: tag byte, then x/z at offsets 1/5, no vertical
fn read_chunk_2d(buf: &[u8]) -> Option<ChunkPos> {
    Some(ChunkPos::new(read_i32_le(buf, 1)?, 0, read_i32_le(buf, 5)?))
}

/// Unload wire layout: x/z at offsets 0/4
fn read_unload(buf: &[u8]) -> Option<ChunkPos> {
    Some(ChunkPos::new(read_i32_le(buf, 0)?, 0, read_i32_le(buf, 4)?))
}

#[inline]
fn read_i32_le(buf: &[u8], offset: usize) -> Option<i32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
