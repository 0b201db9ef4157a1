//! Per-player chunk send scheduler
//!
//! Owns the tick-thread side of one player's stream: the send queue, the set
//! of delivered chunks and the adaptive rate. Chunks move
//! `to_send -> sending -> sent`, where `sending` lives in the shared
//! [`Pipeline`] because loader and compressor threads consult it.
//!
//! The scheduler never blocks. Loads, compression and network writes report
//! back through the pipeline, and their results are applied on the next
//! [`ChunkSendScheduler::update`].

use crossbeam_channel::Receiver;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::StreamingConfig;
use crate::constants::view::INITIAL_LOAD_RADIUS;
use crate::metrics::Metrics;
use crate::stream::comparator::DistanceComparator;
use crate::stream::compressor::CompressorPool;
use crate::stream::pipeline::{Completion, LoadRequest, Pipeline, PipelineOptions};
use crate::stream::protocol::{OutboundPacket, TileEntityPacket};
use crate::stream::queue::SendQueue;
use crate::stream::rate::RateController;
use crate::stream::stats::{StreamSnapshot, StreamStats};
use crate::util::chunk_key::square;
use crate::util::{ChunkKey, DirectionFace, Vec3};
use crate::world::chunk::Chunk;
use crate::world::host::{ChunkObfuscator, PacketSink, StreamingPlayer, WorldHost};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("player {0} is already attached to a world")]
    AlreadyAttached(String),
}

/// View distance actually streamed: the client's request capped by the world
#[inline]
pub fn effective_view_distance(client: i32, world: i32) -> i32 {
    client.min(world).max(1)
}

pub struct ChunkSendScheduler {
    player: Arc<dyn StreamingPlayer>,
    config: Arc<StreamingConfig>,
    /// Kept after detach so late completions can still release their chunks
    world: Option<Arc<dyn WorldHost>>,
    attached: bool,

    pipeline: Arc<Pipeline>,
    completions: Receiver<Completion>,

    to_send: SendQueue,
    sent: FxHashSet<ChunkKey>,

    view_distance: i32,
    /// Position the current view square was built around
    anchor: Vec3,
    /// Facing of the last sort
    facing: Option<DirectionFace>,
    rate: RateController,

    sort_dirty: bool,
    last_sort_anchor: Option<(i32, i32)>,
    sort_skip_count: u64,

    last_stats_log: Instant,
}

impl ChunkSendScheduler {
    pub fn new(
        player: Arc<dyn StreamingPlayer>,
        sink: Arc<dyn PacketSink>,
        compressor: &Arc<CompressorPool>,
        obfuscator: Arc<dyn ChunkObfuscator>,
        config: Arc<StreamingConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let options = PipelineOptions {
            compression_level: config.compression_level,
            gen_preload_radius: config.gen_chunk_preload_radius,
            debug: config.debug,
        };
        let (pipeline, completions) = Pipeline::new(
            player.name().to_string(),
            sink,
            obfuscator,
            compressor,
            StreamStats::new(metrics),
            options,
        );

        Self {
            rate: RateController::new(config.max_rate()),
            player,
            config,
            world: None,
            attached: false,
            pipeline,
            completions,
            to_send: SendQueue::new(),
            sent: FxHashSet::default(),
            view_distance: 0,
            anchor: Vec3::ZERO,
            facing: None,
            sort_dirty: false,
            last_sort_anchor: None,
            sort_skip_count: 0,
            last_stats_log: Instant::now(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start streaming `world` around the player's current position
    pub fn attach(&mut self, world: Arc<dyn WorldHost>) -> Result<(), SchedulerError> {
        if self.attached {
            return Err(SchedulerError::AlreadyAttached(self.player.name().to_string()));
        }

        self.view_distance =
            effective_view_distance(self.player.client_view_distance(), world.view_distance());
        self.anchor = self.player.position();
        let (cx, cz) = self.anchor.chunk_coords();

        for key in square(cx, cz, self.view_distance) {
            self.to_send.push(key);
        }
        self.sort_dirty = true;
        self.last_sort_anchor = None;
        self.rate.prime(self.config.max_send_rate);

        self.world = Some(Arc::clone(&world));
        self.attached = true;

        debug!(
            "[{}] Attached to dimension {} at chunk ({}, {}), view {}",
            self.player.name(),
            world.dimension(),
            cx,
            cz,
            self.view_distance
        );

        let prime = (self.rate.rate().ceil() as usize).max(1);
        self.dispatch(&world, prime);
        Ok(())
    }

    /// Stop streaming: forget queued chunks, cancel in-flight ones and
    /// unregister from every delivered chunk
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;

        self.to_send.clear();
        let cancelled = self.pipeline.cancel_all();

        let connected = self.player.is_connected();
        if let Some(world) = self.world.clone() {
            let id = self.player.id();
            for key in self.sent.drain() {
                world.watchers().remove_player(key, id);
                if connected {
                    self.pipeline.send_unload(key);
                }
            }
        }
        self.sort_dirty = false;

        self.drain_completions();

        debug!(
            "[{}] Detached, {} in-flight chunk(s) cancelled",
            self.player.name(),
            cancelled
        );
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one server tick
    pub fn update(&mut self) {
        if let Some(world) = self.world.clone().filter(|_| self.attached) {
            self.reconcile_view(&world);
            self.reconcile_movement(&world);

            let facing = self.current_facing();
            if self.facing != Some(facing) {
                self.sort_dirty = true;
            }
            self.sort_if_needed();

            if self.to_send.is_empty() {
                self.rate.idle();
            } else {
                let before = self.rate.rate();
                let count = self.rate.plan(self.pipeline.network_queue());
                if self.config.debug && self.rate.rate() != before {
                    debug!(
                        "[{}] Rate adjusted to {:.2} (queue: {}/{})",
                        self.player.name(),
                        self.rate.rate(),
                        self.pipeline.network_queue(),
                        self.config.max_send_rate
                    );
                }
                self.dispatch(&world, count);
            }
        }

        self.drain_completions();
        self.maybe_log_statistics();
    }

    /// A chunk changed. Delivered chunks are re-sent; in-flight ones pick the
    /// change up from their own snapshot.
    pub fn on_chunk_modified(&self, chunk: &Arc<Chunk>) {
        if self.attached && self.sent.contains(&chunk.key()) && self.player.is_connected() {
            self.pipeline.refresh(chunk);
        }
    }

    fn current_facing(&self) -> DirectionFace {
        DirectionFace::from_yaw(self.player.yaw(), true)
    }

    fn dispatch(&mut self, world: &Arc<dyn WorldHost>, count: usize) {
        if count == 0 {
            return;
        }
        self.sort_if_needed();

        for _ in 0..count {
            let Some(key) = self.to_send.pop() else {
                break;
            };
            let attempt = self.pipeline.begin(key);
            if self.config.debug {
                debug!("[{}] Loading chunk {} (attempt {})", self.player.name(), key, attempt);
            }
            let request = LoadRequest::new(Arc::clone(&self.pipeline), Arc::clone(world), key, attempt);
            world
                .loader()
                .load_async(key.x(), key.z(), INITIAL_LOAD_RADIUS, request);
        }
    }

    /// Re-sort the send queue unless the anchor has barely moved since the
    /// last sort. The first sort after attach always runs.
    fn sort_if_needed(&mut self) {
        if !self.sort_dirty {
            return;
        }

        let (cx, cz) = self.anchor.chunk_coords();
        if let Some((lx, lz)) = self.last_sort_anchor {
            let threshold = self.config.sort_position_threshold;
            if (cx - lx).abs() < threshold && (cz - lz).abs() < threshold {
                self.sort_skip_count += 1;
                return;
            }
        }

        let facing = self.current_facing();
        let started = Instant::now();
        self.to_send.sort(&DistanceComparator::new(cx, cz, facing));

        self.facing = Some(facing);
        self.last_sort_anchor = Some((cx, cz));
        self.sort_dirty = false;
        self.pipeline.stats().record_sort();

        if self.config.debug {
            debug!(
                "[{}] Sorted {} chunk(s) around ({}, {}) facing {:?} in {:?}, skipped {} time(s) before",
                self.player.name(),
                self.to_send.len(),
                cx,
                cz,
                facing,
                started.elapsed(),
                self.sort_skip_count
            );
        }
        self.sort_skip_count = 0;
    }

    /// Follow a change of the client or world view distance
    fn reconcile_view(&mut self, world: &Arc<dyn WorldHost>) {
        let view = effective_view_distance(self.player.client_view_distance(), world.view_distance());
        if view == self.view_distance {
            return;
        }

        let old = self.view_distance;
        self.view_distance = view;
        let (cx, cz) = self.anchor.chunk_coords();

        if view > old {
            for key in square(cx, cz, view) {
                if !key.within(cx, cz, old) && !self.sent.contains(&key) && !self.pipeline.is_sending(key) {
                    self.to_send.push(key);
                }
            }
        } else {
            self.to_send.retain(|key| key.within(cx, cz, view));
            for key in self.pipeline.sending_keys() {
                if !key.within(cx, cz, view) {
                    self.pipeline.cancel(key);
                }
            }
            let outside: Vec<ChunkKey> = self
                .sent
                .iter()
                .copied()
                .filter(|key| !key.within(cx, cz, view))
                .collect();
            for key in outside {
                self.evict_sent(world, key);
            }
        }
        self.sort_dirty = true;

        debug!("[{}] View distance {} -> {}", self.player.name(), old, view);
    }

    /// Shift the view square once the player has wandered far enough from the anchor
    fn reconcile_movement(&mut self, world: &Arc<dyn WorldHost>) {
        let position = self.player.position();
        let view = self.view_distance;
        let limit = 4.0 * (view * view) as f64;
        if position.horizontal_distance_sq_to(self.anchor) <= limit {
            return;
        }

        let (cx, cz) = position.chunk_coords();
        let (last_x, last_z) = self.anchor.chunk_coords();
        let (mov_x, mov_z) = (cx - last_x, cz - last_z);
        if mov_x == 0 && mov_z == 0 {
            return;
        }

        for key in square(cx, cz, view) {
            if !key.within(last_x, last_z, view)
                && !self.sent.contains(&key)
                && !self.pipeline.is_sending(key)
            {
                self.to_send.push(key);
            }

            let old = ChunkKey::new(key.x() - mov_x, key.z() - mov_z);
            if !old.within(cx, cz, view) {
                self.drop_key(world, old);
            }
        }

        self.anchor = position;
        self.sort_dirty = true;

        if self.config.debug {
            debug!(
                "[{}] Moved ({}, {}) -> ({}, {})",
                self.player.name(),
                last_x,
                last_z,
                cx,
                cz
            );
        }
    }

    /// Remove a key that left the view from whichever stage holds it
    fn drop_key(&mut self, world: &Arc<dyn WorldHost>, key: ChunkKey) {
        if self.to_send.remove(key) {
            return;
        }
        if self.sent.contains(&key) {
            self.evict_sent(world, key);
        } else {
            self.pipeline.cancel(key);
        }
    }

    fn evict_sent(&mut self, world: &Arc<dyn WorldHost>, key: ChunkKey) {
        self.sent.remove(&key);
        world.watchers().remove_player(key, self.player.id());
        if self.player.is_connected() {
            self.pipeline.send_unload(key);
        }
    }

    /// Apply completions reported by the loader and compressor threads
    fn drain_completions(&mut self) {
        while let Ok(Completion { key, attempt, chunk }) = self.completions.try_recv() {
            let Some(world) = self.world.clone() else {
                continue;
            };

            if !self.attached || !self.pipeline.promote(key, attempt) {
                self.release_stale(&world, key, &chunk);
                continue;
            }

            match world.watchers().add_player(key, self.player.id()) {
                Ok(()) => {
                    if self.player.is_connected() {
                        for tile in chunk.valid_tile_entities() {
                            if let Some(packet) = TileEntityPacket::describe(&tile) {
                                self.pipeline
                                    .sink()
                                    .schedule_packet(OutboundPacket::TileEntity(packet), None);
                            }
                        }
                        world.chunk_watched(&chunk, self.player.as_ref());
                    }
                }
                Err(e) => {
                    self.pipeline.stats().record_duplicate_watch();
                    debug!("[{}] {}", self.player.name(), e);
                }
            }

            self.sent.insert(key);
            self.pipeline.stats().record_sent();

            if self.config.debug {
                debug!(
                    "[{}] Sent chunk {}, total sent: {}",
                    self.player.name(),
                    key,
                    self.pipeline.stats().chunks_sent()
                );
            }
        }
    }

    /// Let the world unload a chunk this player no longer wants, unless
    /// someone still watches it or a newer attempt is using it
    fn release_stale(&self, world: &Arc<dyn WorldHost>, key: ChunkKey, chunk: &Chunk) {
        if self.sent.contains(&key) || self.pipeline.is_sending(key) {
            return;
        }
        if !world.watchers().has_watchers(key) {
            world.loader().unbind(chunk);
        }
    }

    fn maybe_log_statistics(&mut self) {
        if !self.attached || self.last_stats_log.elapsed() < self.config.stats_log_interval {
            return;
        }
        self.last_stats_log = Instant::now();

        let stats = self.pipeline.stats();
        info!(
            "[ChunkSend] Player {}: Rate={:.2}, Sent={}, Cancelled={}, Sorts={}, AvgCompression={:.1}us, ToSend={}, Sending={}, NetQueue={}",
            self.player.name(),
            self.rate.rate(),
            stats.chunks_sent(),
            stats.chunks_cancelled(),
            stats.sort_operations(),
            stats.avg_compression_micros(),
            self.to_send.len(),
            self.pipeline.sending_len(),
            self.pipeline.network_queue()
        );
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn debug_info(&self) -> String {
        format!(
            "Player: {}, Rate: {:.2}, ToSend: {}, Sending: {}, Sent: {}, NetQueue: {}, ViewDist: {}, SortSkips: {}",
            self.player.name(),
            self.rate.rate(),
            self.to_send.len(),
            self.pipeline.sending_len(),
            self.sent.len(),
            self.pipeline.network_queue(),
            self.view_distance,
            self.sort_skip_count
        )
    }

    /// Zero this player's counters
    pub fn reset_statistics(&mut self) {
        self.pipeline.stats().reset();
        self.sort_skip_count = 0;
        self.last_stats_log = Instant::now();
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let stats = self.pipeline.stats();
        StreamSnapshot {
            player_name: self.player.name().to_string(),
            rate: self.rate.rate(),
            total_chunks_sent: stats.chunks_sent(),
            total_chunks_cancelled: stats.chunks_cancelled(),
            total_sort_operations: stats.sort_operations(),
            avg_compression_micros: stats.avg_compression_micros(),
            to_send: self.to_send.len(),
            sending: self.pipeline.sending_len(),
            sent: self.sent.len(),
            network_queue: self.pipeline.network_queue(),
            view_distance: self.view_distance,
        }
    }

    pub fn player(&self) -> &Arc<dyn StreamingPlayer> {
        &self.player
    }

    pub fn stats(&self) -> &StreamStats {
        self.pipeline.stats()
    }

    #[inline]
    pub fn rate(&self) -> f64 {
        self.rate.rate()
    }

    #[inline]
    pub fn view_distance(&self) -> i32 {
        self.view_distance
    }

    pub fn anchor(&self) -> Vec3 {
        self.anchor
    }

    pub fn facing(&self) -> Option<DirectionFace> {
        self.facing
    }

    pub fn sort_skip_count(&self) -> u64 {
        self.sort_skip_count
    }

    pub fn to_send_len(&self) -> usize {
        self.to_send.len()
    }

    pub fn is_queued(&self, key: ChunkKey) -> bool {
        self.to_send.contains(key)
    }

    /// Queued keys, least urgent first
    pub fn queued_keys(&self) -> Vec<ChunkKey> {
        self.to_send.iter().collect()
    }

    pub fn sending_len(&self) -> usize {
        self.pipeline.sending_len()
    }

    pub fn is_sending(&self, key: ChunkKey) -> bool {
        self.pipeline.is_sending(key)
    }

    pub fn sending_keys(&self) -> Vec<ChunkKey> {
        self.pipeline.sending_keys()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_sent(&self, key: ChunkKey) -> bool {
        self.sent.contains(&key)
    }

    pub fn sent_keys(&self) -> impl Iterator<Item = ChunkKey> + '_ {
        self.sent.iter().copied()
    }

    pub fn network_queue(&self) -> usize {
        self.pipeline.network_queue()
    }

    /// Whether nothing is queued, loading or compressing
    pub fn is_idle(&self) -> bool {
        self.to_send.is_empty() && self.pipeline.sending_len() == 0
    }

    /// Longest time the statistics line can be late
    pub fn stats_log_interval(&self) -> Duration {
        self.config.stats_log_interval
    }
}

impl Drop for ChunkSendScheduler {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPlayer, SimTransport, SimWorld};
    use crate::world::host::IndexedPlayer;

    struct Harness {
        player: Arc<SimPlayer>,
        world: Arc<SimWorld>,
        transport: Arc<SimTransport>,
        compressor: Arc<CompressorPool>,
        scheduler: ChunkSendScheduler,
    }

    fn harness(view: i32, max_send_rate: u32) -> Harness {
        let metrics = Arc::new(Metrics::new());
        let compressor = Arc::new(CompressorPool::new(Arc::clone(&metrics)).unwrap());
        let player = Arc::new(SimPlayer::new("steve", Vec3::new(8.0, 64.0, 8.0), view));
        let world = Arc::new(SimWorld::new(view));
        let transport = Arc::new(SimTransport::new());
        let config = Arc::new(StreamingConfig {
            max_send_rate,
            ..StreamingConfig::default()
        });
        let scheduler = ChunkSendScheduler::new(
            player.clone(),
            transport.clone(),
            &compressor,
            crate::world::host::no_obfuscation(),
            config,
            metrics,
        );
        Harness {
            player,
            world,
            transport,
            compressor,
            scheduler,
        }
    }

    impl Harness {
        fn attach(&mut self) {
            let world: Arc<dyn WorldHost> = self.world.clone();
            self.scheduler.attach(world).unwrap();
        }

        fn settle(&mut self, max_ticks: usize) {
            for _ in 0..max_ticks {
                self.scheduler.update();
                self.compressor.flush(Duration::from_secs(5));
                if self.scheduler.is_idle() {
                    break;
                }
            }
            self.compressor.flush(Duration::from_secs(5));
            self.scheduler.update();
        }
    }

    #[test]
    fn test_effective_view_distance() {
        assert_eq!(effective_view_distance(12, 8), 8);
        assert_eq!(effective_view_distance(4, 8), 4);
        assert_eq!(effective_view_distance(0, 8), 1);
    }

    #[test]
    fn test_attach_queues_view_square() {
        let mut h = harness(2, 2);
        h.attach();
        // rate primed to 1, one chunk dispatched right away
        assert_eq!(h.scheduler.rate(), 1.0);
        assert_eq!(h.scheduler.sending_len() + h.scheduler.to_send_len(), 25);
        assert_eq!(h.scheduler.stats().sort_operations(), 1);
    }

    #[test]
    fn test_attach_twice_is_rejected() {
        let mut h = harness(2, 2);
        h.attach();
        let world: Arc<dyn WorldHost> = h.world.clone();
        assert_eq!(
            h.scheduler.attach(world),
            Err(SchedulerError::AlreadyAttached("steve".to_string()))
        );
    }

    #[test]
    fn test_nearest_chunk_goes_first() {
        let mut h = harness(3, 2);
        h.attach();
        assert!(h.scheduler.is_sending(ChunkKey::new(0, 0)));
    }

    #[test]
    fn test_settles_into_sent() {
        let mut h = harness(2, 4);
        h.attach();
        h.settle(200);

        assert_eq!(h.scheduler.sent_len(), 25);
        assert_eq!(h.scheduler.to_send_len(), 0);
        assert_eq!(h.scheduler.sending_len(), 0);
        assert_eq!(h.scheduler.network_queue(), 0);
        assert_eq!(h.scheduler.stats().chunks_sent(), 25);
        assert_eq!(h.world.watched_by(h.player.id()), 25);
    }

    #[test]
    fn test_idle_update_dispatches_nothing() {
        let mut h = harness(1, 4);
        h.attach();
        h.settle(100);
        let loads = h.world.loads();

        h.scheduler.update();
        h.scheduler.update();

        assert_eq!(h.world.loads(), loads);
    }

    #[test]
    fn test_detach_unregisters_everything() {
        let mut h = harness(2, 4);
        h.attach();
        h.settle(200);
        h.transport.clear();

        h.scheduler.detach();

        assert!(!h.scheduler.is_attached());
        assert_eq!(h.scheduler.sent_len(), 0);
        assert_eq!(h.world.watched_by(h.player.id()), 0);
        assert_eq!(h.transport.unload_keys().len(), 25);
    }

    #[test]
    fn test_diagonal_facing_leads_the_queue() {
        let mut h = harness(3, 2);
        h.player.set_yaw(45.0);
        h.attach();

        assert_eq!(h.scheduler.facing(), Some(DirectionFace::SouthWest));
        assert!(h.scheduler.is_sending(ChunkKey::new(0, 0)));
        // The diagonal ahead outranks the straight neighbour
        let queued = h.scheduler.queued_keys();
        assert_eq!(queued.last(), Some(&ChunkKey::new(-1, 1)));
        let position = |key| queued.iter().position(|k| *k == key).unwrap();
        assert!(position(ChunkKey::new(-1, 1)) > position(ChunkKey::new(0, 1)));
        assert!(position(ChunkKey::new(0, 1)) > position(ChunkKey::new(1, -1)));
    }

    #[test]
    fn test_half_turn_waits_for_movement() {
        let mut h = harness(3, 2);
        h.attach();
        let sorts = h.scheduler.stats().sort_operations();
        assert_eq!(h.scheduler.facing(), Some(DirectionFace::South));

        h.player.set_yaw(45.0);
        h.scheduler.update();
        assert!(h.scheduler.sort_dirty);
        assert!(h.scheduler.sort_skip_count() > 0);
        assert_eq!(h.scheduler.facing(), Some(DirectionFace::South));
        assert_eq!(h.scheduler.stats().sort_operations(), sorts);

        h.player.set_position(Vec3::new(8.0 + 64.0, 64.0, 8.0));
        h.scheduler.update();
        assert!(!h.scheduler.sort_dirty);
        assert_eq!(h.scheduler.facing(), Some(DirectionFace::SouthWest));
        assert_eq!(h.scheduler.stats().sort_operations(), sorts + 1);
        assert_eq!(h.scheduler.sort_skip_count(), 0);
        assert!(h.scheduler.debug_info().ends_with("SortSkips: 0"));
    }

    #[test]
    fn test_small_movement_keeps_anchor() {
        let mut h = harness(2, 4);
        h.attach();
        h.settle(200);

        // 4 * view^2 = 16, so a 3 block step stays inside
        h.player.set_position(Vec3::new(11.0, 64.0, 8.0));
        h.scheduler.update();

        assert_eq!(h.scheduler.anchor(), Vec3::new(8.0, 64.0, 8.0));
        assert_eq!(h.scheduler.to_send_len(), 0);
    }

    #[test]
    fn test_movement_shifts_square() {
        let mut h = harness(2, 4);
        h.attach();
        h.settle(200);

        h.player.set_position(Vec3::new(8.0 + 16.0, 64.0, 8.0));
        h.scheduler.update();

        assert!(!h.scheduler.is_sent(ChunkKey::new(-2, 0)));
        assert!(h.scheduler.is_sent(ChunkKey::new(-1, 0)));

        h.settle(200);
        assert_eq!(h.scheduler.sent_len(), 25);
        assert!(h.scheduler.is_sent(ChunkKey::new(3, 2)));
    }

    #[test]
    fn test_sort_hysteresis() {
        let mut h = harness(4, 2);
        h.attach();
        let sorts = h.scheduler.stats().sort_operations();

        // Turning around marks the queue dirty, but the anchor has not moved
        h.player.set_yaw(180.0);
        h.scheduler.update();
        assert_eq!(h.scheduler.stats().sort_operations(), sorts);
        assert!(h.scheduler.sort_skip_count() > 0);
    }

    #[test]
    fn test_debug_info() {
        let mut h = harness(2, 2);
        h.attach();
        let info = h.scheduler.debug_info();
        assert!(info.starts_with("Player: steve"));
        assert!(info.contains("ViewDist: 2"));
    }

    #[test]
    fn test_reset_statistics() {
        let mut h = harness(1, 4);
        h.attach();
        h.settle(100);
        assert!(h.scheduler.stats().chunks_sent() > 0);

        h.scheduler.reset_statistics();
        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.total_chunks_sent, 0);
        assert_eq!(snapshot.sent, 9);
    }
}
