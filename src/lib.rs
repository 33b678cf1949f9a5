//! Chunkflow - outbound bandwidth shaper for voxel world servers
//!
//! Sits between a game server's simulation layer and its transport and keeps
//! bulk world-streaming traffic (terrain chunks, overlays, asset downloads,
//! map tile deltas) from starving latency-sensitive packets or overflowing
//! per-connection send buffers.
//!
//! The host server wires it in at two points:
//!
//! - Every outbound packet is offered to [`net::shaper::PacketShaper::intercept`],
//!   which either lets it pass through or takes ownership and defers it.
//! - A periodic tick ([`net::shaper::PacketShaper::tick`], or the
//!   [`net::shaper::PacketShaper::run`] helper) drains the per-connection
//!   queues under a dual token-bucket budget, closest chunks first.

pub mod config;
pub mod metrics;
pub mod net;
pub mod util;
