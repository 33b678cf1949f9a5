//! Scheduler benchmarks for the chunkflow shaper
//!
//! Measures classification, queue maintenance, and full tick throughput at
//! various queue depths and connection counts.
//!
//! Run with: cargo bench --bench shaper

use std::sync::Arc;

use chunkflow::config::ShaperConfig;
use chunkflow::net::classify::{classify, ChunkPos};
use chunkflow::net::connection::{BufferStatus, ConnectionId, ConnectionLink, PingSample};
use chunkflow::net::packet::{id, MapTile, OutboundPacket};
use chunkflow::net::shaper::PacketShaper;
use chunkflow::util::vec3::Vec3;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;

/// Chunk payload with coordinates baked into the serialized form, the way
/// the transport hands packets to the shaper
struct RawChunkPacket {
    bytes: Vec<u8>,
}

impl RawChunkPacket {
    fn new(x: i32, y: i32, z: i32, payload: usize) -> Arc<Self> {
        let mut bytes = vec![0u8; 13 + payload];
        bytes[1..5].copy_from_slice(&x.to_le_bytes());
        bytes[5..9].copy_from_slice(&y.to_le_bytes());
        bytes[9..13].copy_from_slice(&z.to_le_bytes());
        Arc::new(Self { bytes })
    }
}

impl OutboundPacket for RawChunkPacket {
    fn packet_id(&self) -> u16 {
        id::SET_CHUNK
    }
    fn encoded_len(&self) -> usize {
        self.bytes.len()
    }
    fn cached_bytes(&self) -> Option<&[u8]> {
        Some(&self.bytes)
    }
}

struct MapUpdatePacket {
    tiles: Vec<MapTile>,
}

impl OutboundPacket for MapUpdatePacket {
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

/// Connection double that swallows writes
struct NullLink {
    id: ConnectionId,
    position: parking_lot::Mutex<Vec3>,
}

impl ConnectionLink for NullLink {
    fn id(&self) -> ConnectionId {
        self.id
    }
    fn position(&self) -> Option<Vec3> {
        Some(*self.position.lock())
    }
    fn ping(&self) -> PingSample {
        PingSample { short_ms: 30.0, long_ms: 28.0 }
    }
    fn is_local(&self) -> bool {
        false
    }
    fn is_live(&self) -> bool {
        true
    }
    fn buffer_status(&self) -> BufferStatus {
        BufferStatus { free_bytes: 1 << 22, high_watermark: 1 << 22 }
    }
    fn write(&self, packet: Arc<dyn OutboundPacket>) {
        black_box(packet.encoded_len());
    }
}

fn link(id: ConnectionId) -> Arc<dyn ConnectionLink> {
    Arc::new(NullLink { id, position: parking_lot::Mutex::new(Vec3::ZERO) })
}

/// A shaper with `connections` links, each holding `depth` queued chunks
/// spread over distant regions
fn loaded_shaper(connections: u64, depth: i32) -> (PacketShaper, Vec<Arc<dyn ConnectionLink>>) {
    let shaper = PacketShaper::new(ShaperConfig {
        max_bandwidth: u32::MAX as u64,
        min_bandwidth: u32::MAX as u64,
        ..Default::default()
    });
    let mut rng = rand::thread_rng();

    let links: Vec<_> = (0..connections).map(link).collect();
    for l in &links {
        for _ in 0..depth {
            let x = rng.gen_range(50..500);
            let z = rng.gen_range(50..500);
            shaper.intercept(l, RawChunkPacket::new(x, 0, z, 8192));
        }
    }
    (shaper, links)
}

/// Benchmark packet classification from serialized bytes
fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    group.sample_size(100);

    let packets: Vec<Arc<RawChunkPacket>> = (0..1000)
        .map(|i| RawChunkPacket::new(i, 0, -i, 8192))
        .collect();

    group.throughput(Throughput::Elements(packets.len() as u64));
    group.bench_function("chunk_bytes", |b| {
        b.iter(|| {
            for packet in &packets {
                black_box(classify(packet.as_ref()));
            }
        })
    });
    group.finish();
}

/// Benchmark interception at various pending-queue depths
fn bench_intercept(c: &mut Criterion) {
    let mut group = c.benchmark_group("intercept");
    group.sample_size(50);

    for depth in [100, 1000, 10_000] {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("enqueue", depth), &depth, |b, &depth| {
            let (shaper, links) = loaded_shaper(1, depth);
            let packet = RawChunkPacket::new(400, 0, 400, 8192);
            b.iter(|| {
                black_box(shaper.intercept(&links[0], packet.clone()));
            })
        });
    }
    group.finish();
}

/// Benchmark map tile coalescing throughput
fn bench_map_coalescing(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_tiles");
    group.sample_size(50);

    for tiles in [64, 512, 2048] {
        let update: Arc<dyn OutboundPacket> = Arc::new(MapUpdatePacket {
            tiles: (0..tiles).map(|i| MapTile::present(i, i / 4, vec![0; 256])).collect(),
        });

        group.throughput(Throughput::Elements(tiles as u64));
        group.bench_with_input(BenchmarkId::new("absorb", tiles), &tiles, |b, _| {
            let shaper = PacketShaper::new(ShaperConfig::default());
            let l = link(1);
            b.iter(|| {
                black_box(shaper.intercept(&l, update.clone()));
            })
        });
    }
    group.finish();
}

/// Benchmark a full scheduler tick draining many connections
fn bench_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("tick");
    group.sample_size(30);

    for connections in [10, 100, 500] {
        let depth = 20;
        group.throughput(Throughput::Elements(connections * depth as u64));
        group.bench_with_input(
            BenchmarkId::new("drain", connections),
            &connections,
            |b, &connections| {
                b.iter_batched(
                    || loaded_shaper(connections, depth),
                    |(shaper, _links)| shaper.tick_with(black_box(1.0)),
                    criterion::BatchSize::LargeInput,
                )
            },
        );
    }
    group.finish();
}

/// Benchmark movement re-verification over a deep queue
fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");
    group.sample_size(50);

    for depth in [1000, 10_000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("resort", depth), &depth, |b, &depth| {
            b.iter_batched(
                || {
                    // A near-zero budget keeps the drain loop out of the
                    // measurement; the tick cost is dominated by the re-sort
                    let shaper = PacketShaper::new(ShaperConfig {
                        min_bandwidth: 1,
                        max_bandwidth: 1,
                        ..Default::default()
                    });
                    let moved = Arc::new(NullLink {
                        id: 1,
                        position: parking_lot::Mutex::new(Vec3::ZERO),
                    });
                    let as_link: Arc<dyn ConnectionLink> = moved.clone();
                    let mut rng = rand::thread_rng();
                    for _ in 0..depth {
                        let x = rng.gen_range(50..500);
                        let z = rng.gen_range(50..500);
                        shaper.intercept(&as_link, RawChunkPacket::new(x, 0, z, 8192));
                    }
                    *moved.position.lock() = Vec3::new(8000.0, 0.0, 8000.0);
                    shaper
                },
                |shaper| shaper.tick_with(black_box(0.0)),
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_classify,
    bench_intercept,
    bench_map_coalescing,
    bench_tick,
    bench_verify,
);

criterion_main!(benches);
