//! Voxel Chunk Streaming Server Library
//!
//! Per-player chunk streaming for a voxel world server: a send scheduler that
//! loads, compresses and transmits the chunks around each player nearest
//! first, with an adaptive send rate and safe cancellation, plus a sector
//! hashed index of player positions.
//!
//! # Features
//!
//! - `services` - Background chunk saver and lighting queue (enabled by default)
//! - `minimal` - Build without optional features for testing/debugging

pub mod config;
pub mod constants;
pub mod metrics;
pub mod sim;
pub mod stream;
pub mod util;
pub mod world;

pub mod services;

pub use config::StreamingConfig;
pub use stream::{ChunkSendScheduler, StreamSession};
pub use world::PlayerSpatialIndex;
