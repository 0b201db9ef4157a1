//! World-side owner of every streaming player
//!
//! The session holds one [`ChunkSendScheduler`] per player, the shared
//! compressor and the player spatial index, and drives them once per tick.

use rustc_hash::FxHashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::StreamingConfig;
use crate::metrics::Metrics;
use crate::services::worker::ServiceError;
use crate::stream::compressor::CompressorPool;
use crate::stream::scheduler::{ChunkSendScheduler, SchedulerError};
use crate::stream::stats::StreamSnapshot;
use crate::world::chunk::Chunk;
use crate::world::host::{ChunkObfuscator, PacketSink, PlayerId, StreamingPlayer, WorldHost};
use crate::world::spatial::PlayerSpatialIndex;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("player {0} is already streaming")]
    DuplicatePlayer(PlayerId),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("compressor unavailable: {0}")]
    Compressor(#[from] ServiceError),
}

pub struct StreamSession {
    config: Arc<StreamingConfig>,
    world: Arc<dyn WorldHost>,
    compressor: Arc<CompressorPool>,
    obfuscator: Arc<dyn ChunkObfuscator>,
    metrics: Arc<Metrics>,
    players: FxHashMap<PlayerId, ChunkSendScheduler>,
    index: PlayerSpatialIndex<dyn StreamingPlayer>,
    tick_count: u64,
}

impl StreamSession {
    pub fn new(
        config: Arc<StreamingConfig>,
        world: Arc<dyn WorldHost>,
        obfuscator: Arc<dyn ChunkObfuscator>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SessionError> {
        let compressor = Arc::new(CompressorPool::new(Arc::clone(&metrics))?);
        Ok(Self {
            config,
            world,
            compressor,
            obfuscator,
            metrics,
            players: FxHashMap::default(),
            index: PlayerSpatialIndex::new(),
            tick_count: 0,
        })
    }

    /// Start streaming to a player through its connection
    pub fn join(
        &mut self,
        player: Arc<dyn StreamingPlayer>,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), SessionError> {
        let id = player.id();
        if self.players.contains_key(&id) {
            return Err(SessionError::DuplicatePlayer(id));
        }

        let mut scheduler = ChunkSendScheduler::new(
            Arc::clone(&player),
            sink,
            &self.compressor,
            Arc::clone(&self.obfuscator),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
        );
        scheduler.attach(Arc::clone(&self.world))?;

        self.index.upsert(&player);
        self.players.insert(id, scheduler);
        self.metrics
            .players_streaming
            .store(self.players.len() as u64, Ordering::Relaxed);

        info!("{} joined ({} streaming)", player.name(), self.players.len());
        Ok(())
    }

    /// Stop streaming to a player. Returns its final statistics.
    pub fn leave(&mut self, id: PlayerId) -> Option<StreamSnapshot> {
        let mut scheduler = self.players.remove(&id)?;
        scheduler.detach();
        self.index.remove(id);
        self.metrics
            .players_streaming
            .store(self.players.len() as u64, Ordering::Relaxed);

        let snapshot = scheduler.snapshot();
        info!(
            "{} left after {} chunk(s) ({} streaming)",
            snapshot.player_name,
            snapshot.total_chunks_sent,
            self.players.len()
        );
        Some(snapshot)
    }

    /// Run one server tick for every player
    pub fn tick(&mut self) {
        let start = Instant::now();

        for scheduler in self.players.values_mut() {
            self.index.upsert(scheduler.player());
            scheduler.update();
        }

        self.tick_count += 1;
        self.metrics.record_tick_time(start.elapsed());
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        let (mut queued, mut in_flight, mut network, mut watched) = (0, 0, 0, 0);
        for scheduler in self.players.values() {
            queued += scheduler.to_send_len();
            in_flight += scheduler.sending_len();
            network += scheduler.network_queue();
            watched += scheduler.sent_len();
        }

        let m = &self.metrics;
        m.send_queue_depth.store(queued as u64, Ordering::Relaxed);
        m.in_flight_chunks.store(in_flight as u64, Ordering::Relaxed);
        m.network_queue_depth.store(network as u64, Ordering::Relaxed);
        m.watched_chunks.store(watched as u64, Ordering::Relaxed);
        m.index_sectors.store(self.index.sector_count() as u64, Ordering::Relaxed);
        m.compressor_backlog
            .store(self.compressor.backlog() as u64, Ordering::Relaxed);
    }

    /// Forward a chunk change to every player that has it
    pub fn on_chunk_modified(&self, chunk: &Arc<Chunk>) {
        for scheduler in self.players.values() {
            scheduler.on_chunk_modified(chunk);
        }
    }

    // ========================================================================
    // Spatial queries
    // ========================================================================

    /// Players within horizontal `radius` of (x, z), as of the last tick
    pub fn players_in_radius(&self, x: f64, z: f64, radius: f64) -> Vec<Arc<dyn StreamingPlayer>> {
        self.index.players_in_radius(x, z, radius)
    }

    /// Nearest player to (x, y, z); a negative `max_radius` searches without bound
    pub fn closest_player(&self, x: f64, y: f64, z: f64, max_radius: f64) -> Option<Arc<dyn StreamingPlayer>> {
        self.index.closest_player(x, y, z, max_radius)
    }

    pub fn index(&self) -> &PlayerSpatialIndex<dyn StreamingPlayer> {
        &self.index
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn scheduler(&self, id: PlayerId) -> Option<&ChunkSendScheduler> {
        self.players.get(&id)
    }

    pub fn scheduler_mut(&mut self, id: PlayerId) -> Option<&mut ChunkSendScheduler> {
        self.players.get_mut(&id)
    }

    pub fn snapshots(&self) -> Vec<StreamSnapshot> {
        self.players.values().map(|s| s.snapshot()).collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn world(&self) -> &Arc<dyn WorldHost> {
        &self.world
    }

    /// Wait for queued compression jobs
    pub fn flush_compressor(&self, timeout: Duration) -> bool {
        self.compressor.flush(timeout)
    }

    /// Detach every player and drain the compressor
    pub fn shutdown(&mut self, timeout: Duration) {
        info!("Stopping chunk streaming for {} player(s)", self.players.len());

        for scheduler in self.players.values_mut() {
            scheduler.detach();
        }
        if !self.compressor.flush(timeout) {
            warn!("Compressor still busy after {:?}", timeout);
        }
        // Release chunks whose compression finished after the detach
        for scheduler in self.players.values_mut() {
            scheduler.update();
        }

        self.players.clear();
        self.index.clear();
        self.metrics.players_streaming.store(0, Ordering::Relaxed);
        self.compressor.shutdown(timeout);
    }
}
