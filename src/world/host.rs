//! Seams between the chunk streamer and the hosting server
//!
//! The streamer never owns players, chunk storage or sockets. It reaches them
//! through these traits, which the server (or `crate::sim` in tests) provides.

use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::stream::pipeline::LoadRequest;
use crate::stream::protocol::OutboundPacket;
use crate::util::{ChunkKey, Vec3};
use crate::world::chunk::{Chunk, ChunkSnapshot};

pub type PlayerId = Uuid;

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a chunk load service through `LoadRequest::complete`
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("chunk {0} could not be read: {1}")]
    Io(ChunkKey, String),
    #[error("chunk {0} is corrupt")]
    Corrupt(ChunkKey),
    #[error("loader is shutting down")]
    ShuttingDown,
}

/// Failure reported to a write listener
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Error)]
pub enum WatchError {
    #[error("player {player} already watches chunk {key}")]
    AlreadyWatching { key: ChunkKey, player: PlayerId },
}

// ============================================================================
// Players
// ============================================================================

/// Anything with a stable id and a position, as stored by the spatial index
pub trait IndexedPlayer: Send + Sync {
    fn id(&self) -> PlayerId;
    fn position(&self) -> Vec3;
}

/// The player side of a streaming session
pub trait StreamingPlayer: IndexedPlayer {
    fn name(&self) -> &str;
    /// Yaw in degrees, 0 = south
    fn yaw(&self) -> f32;
    /// View distance the client asked for, in chunks
    fn client_view_distance(&self) -> i32;
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Transport
// ============================================================================

/// Invoked exactly once when a scheduled packet is written or dropped
pub type WriteListener = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Outbound packet queue of one player's connection
pub trait PacketSink: Send + Sync {
    /// Queue a packet. If a listener is given it must fire exactly once.
    fn schedule_packet(&self, packet: OutboundPacket, listener: Option<WriteListener>);
}

// ============================================================================
// World services
// ============================================================================

/// Asynchronous chunk provider of one world
pub trait ChunkLoadService: Send + Sync {
    /// Load or generate the chunk at (cx, cz) with neighbours out to
    /// `preload_radius`, then call `request.complete` from any thread.
    /// Completing more than once is tolerated.
    fn load_async(&self, cx: i32, cz: i32, preload_radius: i32, request: LoadRequest);

    /// Whether every chunk within `radius` of (cx, cz) is loaded
    fn round_exists(&self, cx: i32, cz: i32, radius: i32) -> bool;

    /// Let the provider unload a chunk nobody watches any more
    fn unbind(&self, chunk: &Chunk);
}

/// Per-chunk watcher sets of one world
pub trait WatcherRegistry: Send + Sync {
    /// Register `player` on the chunk's watcher set, creating it if needed
    fn add_player(&self, key: ChunkKey, player: PlayerId) -> Result<(), WatchError>;

    /// Remove `player` if a watcher set exists. Never creates one.
    fn remove_player(&self, key: ChunkKey, player: PlayerId) -> bool;

    fn has_watchers(&self, key: ChunkKey) -> bool;
}

/// The world a scheduler is attached to
pub trait WorldHost: Send + Sync {
    fn dimension(&self) -> i32;

    /// Server-side view distance in chunks
    fn view_distance(&self) -> i32;

    fn loader(&self) -> &dyn ChunkLoadService;

    fn watchers(&self) -> &dyn WatcherRegistry;

    /// A chunk was delivered to a player (entity tracker + chunk-watch event)
    fn chunk_watched(&self, chunk: &Chunk, player: &dyn StreamingPlayer);
}

// ============================================================================
// Obfuscation
// ============================================================================

pub type ObfuscationToken = Box<dyn Any + Send>;

/// Pre-send transformer run on every outgoing chunk
pub trait ChunkObfuscator: Send + Sync {
    /// Runs on the tick thread with live world access
    fn prepare_sync(&self, snapshot: &ChunkSnapshot, chunk: &Chunk) -> Option<ObfuscationToken>;

    /// Runs on the compressor thread against the snapshot only
    fn prepare_async(&self, snapshot: &mut ChunkSnapshot, token: Option<ObfuscationToken>);
}

/// Sends chunks untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoObfuscation;

impl ChunkObfuscator for NoObfuscation {
    fn prepare_sync(&self, _snapshot: &ChunkSnapshot, _chunk: &Chunk) -> Option<ObfuscationToken> {
        None
    }

    fn prepare_async(&self, _snapshot: &mut ChunkSnapshot, _token: Option<ObfuscationToken>) {}
}

pub fn no_obfuscation() -> Arc<dyn ChunkObfuscator> {
    Arc::new(NoObfuscation)
}
