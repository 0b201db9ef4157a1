//! State of one player's send pipeline shared across threads
//!
//! A chunk moves through three stages once dispatched:
//!
//! 1. loading: `sending` holds its current attempt id
//! 2. handed to the network: the key is also in `stage2`
//! 3. delivered: the tick thread drains the completion and moves the key
//!    into the scheduler's `sent` set
//!
//! `sending` and `stage2` share one lock. The compressor re-checks the
//! attempt id under that lock before handing a packet to the transport, and
//! cancellation takes the same lock, so a cancelled attempt can never reach
//! the wire after its cancellation.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::services::worker::ServiceError;
use crate::stream::compressor::CompressorPool;
use crate::stream::protocol::{ChunkDataPacket, OutboundPacket, ProtocolError};
use crate::stream::stats::StreamStats;
use crate::util::ChunkKey;
use crate::world::chunk::{BindState, Chunk, ChunkSnapshot};
use crate::world::host::{
    ChunkObfuscator, LoadError, ObfuscationToken, PacketSink, TransportError, WorldHost,
    WriteListener,
};

/// Identifies one dispatch of a chunk; a re-dispatch gets a fresh id
pub type AttemptId = u64;

/// A chunk that finished loading and compression, waiting for the tick thread
#[derive(Debug)]
pub(crate) struct Completion {
    pub key: ChunkKey,
    pub attempt: AttemptId,
    pub chunk: Arc<Chunk>,
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pub sending: FxHashMap<ChunkKey, AttemptId>,
    pub stage2: FxHashSet<ChunkKey>,
    /// Re-sends of delivered chunks waiting for the compressor
    pub refreshing: FxHashMap<ChunkKey, AttemptId>,
}

impl InFlight {
    #[inline]
    fn is_current(&self, key: ChunkKey, attempt: AttemptId) -> bool {
        self.sending.get(&key) == Some(&attempt)
    }
}

pub struct PipelineOptions {
    pub compression_level: u32,
    pub gen_preload_radius: i32,
    pub debug: bool,
}

pub struct Pipeline {
    player_name: String,
    sink: Arc<dyn PacketSink>,
    obfuscator: Arc<dyn ChunkObfuscator>,
    compressor: Weak<CompressorPool>,
    in_flight: Mutex<InFlight>,
    /// Chunk packets handed to the transport and not yet written
    network_queue: AtomicUsize,
    next_attempt: AtomicU64,
    completions: Sender<Completion>,
    stats: StreamStats,
    options: PipelineOptions,
}

impl Pipeline {
    pub(crate) fn new(
        player_name: String,
        sink: Arc<dyn PacketSink>,
        obfuscator: Arc<dyn ChunkObfuscator>,
        compressor: &Arc<CompressorPool>,
        stats: StreamStats,
        options: PipelineOptions,
    ) -> (Arc<Self>, Receiver<Completion>) {
        let (completions, receiver) = unbounded();
        let pipeline = Arc::new(Self {
            player_name,
            sink,
            obfuscator,
            compressor: Arc::downgrade(compressor),
            in_flight: Mutex::new(InFlight::default()),
            network_queue: AtomicUsize::new(0),
            next_attempt: AtomicU64::new(1),
            completions,
            stats,
            options,
        });
        (pipeline, receiver)
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub(crate) fn sink(&self) -> &Arc<dyn PacketSink> {
        &self.sink
    }

    #[inline]
    pub fn network_queue(&self) -> usize {
        self.network_queue.load(Ordering::Acquire)
    }

    /// Give back one network slot. Never goes below zero.
    pub(crate) fn release_slot(&self) {
        let _ = self
            .network_queue
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn acquire_slot(&self) {
        self.network_queue.fetch_add(1, Ordering::AcqRel);
    }

    fn allocate_attempt(&self) -> AttemptId {
        self.next_attempt.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Tick-thread side
    // ========================================================================

    /// Record a dispatch: new attempt in `sending`, one network slot taken
    pub(crate) fn begin(&self, key: ChunkKey) -> AttemptId {
        let attempt = self.allocate_attempt();
        self.in_flight.lock().sending.insert(key, attempt);
        self.acquire_slot();
        attempt
    }

    pub fn is_current(&self, key: ChunkKey, attempt: AttemptId) -> bool {
        self.in_flight.lock().is_current(key, attempt)
    }

    pub fn is_sending(&self, key: ChunkKey) -> bool {
        self.in_flight.lock().sending.contains_key(&key)
    }

    pub fn sending_len(&self) -> usize {
        self.in_flight.lock().sending.len()
    }

    pub fn sending_keys(&self) -> Vec<ChunkKey> {
        self.in_flight.lock().sending.keys().copied().collect()
    }

    /// Abort an in-flight key. Sends an unload packet only if the chunk was
    /// already handed to the network. Returns false if the key was not in flight.
    pub(crate) fn cancel(&self, key: ChunkKey) -> bool {
        let mut in_flight = self.in_flight.lock();
        if in_flight.sending.remove(&key).is_none() {
            return false;
        }
        if in_flight.stage2.remove(&key) {
            self.sink.schedule_packet(
                OutboundPacket::ChunkData(ChunkDataPacket::make_for_unload(key)),
                None,
            );
            self.stats.record_cancelled();
            self.stats.record_unload();
            if self.options.debug {
                debug!("[{}] Cancelled chunk {} after hand-off", self.player_name, key);
            }
        } else if self.options.debug {
            debug!("[{}] Cancelled chunk {} before hand-off", self.player_name, key);
        }
        true
    }

    /// Promote a drained completion. True if the attempt was still current.
    pub(crate) fn promote(&self, key: ChunkKey, attempt: AttemptId) -> bool {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.is_current(key, attempt) {
            return false;
        }
        in_flight.sending.remove(&key);
        in_flight.stage2.remove(&key);
        true
    }

    /// Tell the client to drop a delivered chunk
    pub(crate) fn send_unload(&self, key: ChunkKey) {
        let mut in_flight = self.in_flight.lock();
        in_flight.refreshing.remove(&key);
        self.sink.schedule_packet(
            OutboundPacket::ChunkData(ChunkDataPacket::make_for_unload(key)),
            None,
        );
        self.stats.record_unload();
    }

    /// Drop every in-flight attempt, sending unloads for those on the wire
    pub(crate) fn cancel_all(&self) -> usize {
        let keys = self.sending_keys();
        for key in &keys {
            self.cancel(*key);
        }
        self.in_flight.lock().refreshing.clear();
        keys.len()
    }

    /// Compress and re-send a chunk the player already has
    pub(crate) fn refresh(self: &Arc<Self>, chunk: &Arc<Chunk>) {
        let key = chunk.key();
        let attempt = self.allocate_attempt();
        self.in_flight.lock().refreshing.insert(key, attempt);

        let snapshot = chunk.snapshot();
        let token = self.obfuscator.prepare_sync(&snapshot, chunk);
        self.acquire_slot();

        let pipeline = Arc::clone(self);
        let submitted = self.submit(Box::new(move || {
            pipeline.compress_refresh(key, attempt, snapshot, token)
        }));
        if let Err(e) = submitted {
            debug!("[{}] Refresh of {} dropped: {}", self.player_name, key, e);
            let mut in_flight = self.in_flight.lock();
            if in_flight.refreshing.get(&key) == Some(&attempt) {
                in_flight.refreshing.remove(&key);
            }
            drop(in_flight);
            self.release_slot();
        }
    }

    // ========================================================================
    // Loader and compressor side
    // ========================================================================

    fn submit(&self, task: crate::services::worker::Task) -> Result<(), ServiceError> {
        match self.compressor.upgrade() {
            Some(compressor) => compressor.submit(task),
            None => Err(ServiceError::ShutDown("chunk-compressor".to_string())),
        }
    }

    /// Release the slot of a failed attempt and forget it if still current
    fn abandon(&self, key: ChunkKey, attempt: AttemptId) {
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.is_current(key, attempt) {
                in_flight.sending.remove(&key);
                in_flight.stage2.remove(&key);
            }
        }
        self.release_slot();
    }

    fn push_completion(&self, key: ChunkKey, attempt: AttemptId, chunk: Arc<Chunk>) {
        // The receiver only disappears with the scheduler
        let _ = self.completions.send(Completion { key, attempt, chunk });
    }

    fn write_listener(self: &Arc<Self>) -> WriteListener {
        let pipeline = Arc::clone(self);
        Box::new(move |result| pipeline.on_write_complete(result))
    }

    fn on_write_complete(&self, result: Result<(), TransportError>) {
        self.release_slot();
        if let Err(e) = result {
            self.stats.record_write_failure();
            debug!("[{}] Chunk packet write failed: {}", self.player_name, e);
        }
    }

    /// Obfuscate, build and deflate. A panicking obfuscator fails the encode.
    fn encode(&self, mut snapshot: ChunkSnapshot, token: Option<ObfuscationToken>) -> Result<ChunkDataPacket, ProtocolError> {
        let obfuscator = &self.obfuscator;
        panic::catch_unwind(AssertUnwindSafe(|| obfuscator.prepare_async(&mut snapshot, token)))
            .map_err(|payload| ProtocolError::Obfuscation(panic_message(payload.as_ref())))?;
        let mut packet = ChunkDataPacket::make_for_send(snapshot)?;
        packet.deflate(self.options.compression_level)?;
        Ok(packet)
    }

    fn compress_refresh(
        self: &Arc<Self>,
        key: ChunkKey,
        attempt: AttemptId,
        snapshot: ChunkSnapshot,
        token: Option<ObfuscationToken>,
    ) {
        if self.in_flight.lock().refreshing.get(&key) != Some(&attempt) {
            self.release_slot();
            return;
        }

        let started = Instant::now();
        let packet = match self.encode(snapshot, token) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.record_compress_failure();
                warn!("[{}] Failed to encode refresh of {}: {}", self.player_name, key, e);
                self.in_flight.lock().refreshing.remove(&key);
                self.release_slot();
                return;
            }
        };
        self.stats.record_compression(started.elapsed());

        let mut in_flight = self.in_flight.lock();
        if in_flight.refreshing.get(&key) == Some(&attempt) {
            in_flight.refreshing.remove(&key);
            self.sink
                .schedule_packet(OutboundPacket::ChunkData(packet), Some(self.write_listener()));
        } else {
            drop(in_flight);
            self.release_slot();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("player", &self.player_name)
            .field("network_queue", &self.network_queue())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Load requests
// ============================================================================

/// Callback value handed to the chunk load service for one attempt.
///
/// Clones share one claim flag: whichever invocation first takes a terminal
/// path (hand-off to the compressor, failure, staleness) releases the
/// attempt's network slot, and later invocations are ignored. They also share
/// the re-arm flag, so an unpopulated chunk triggers at most one preload.
#[derive(Clone)]
pub struct LoadRequest {
    pipeline: Arc<Pipeline>,
    world: Arc<dyn WorldHost>,
    key: ChunkKey,
    attempt: AttemptId,
    /// Set on the callback handed to the re-armed load
    retry: bool,
    rearmed: Arc<AtomicBool>,
    claimed: Arc<AtomicBool>,
}

impl LoadRequest {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        world: Arc<dyn WorldHost>,
        key: ChunkKey,
        attempt: AttemptId,
    ) -> Self {
        Self {
            pipeline,
            world,
            key,
            attempt,
            retry: false,
            rearmed: Arc::new(AtomicBool::new(false)),
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn attempt(&self) -> AttemptId {
        self.attempt
    }

    /// Whether the player still wants this attempt
    pub fn is_current(&self) -> bool {
        self.pipeline.is_current(self.key, self.attempt)
    }

    fn claim(&self) -> bool {
        !self.claimed.swap(true, Ordering::AcqRel)
    }

    /// Deliver the result of the load. Callable from any thread, any number of times.
    pub fn complete(&self, result: Result<Arc<Chunk>, LoadError>) {
        let pipeline = &self.pipeline;
        let (key, attempt) = (self.key, self.attempt);

        let chunk = match result {
            Ok(chunk) => chunk,
            Err(e) => {
                if self.claim() {
                    pipeline.stats.record_load_failure();
                    warn!("[{}] Chunk {} failed to load: {}", pipeline.player_name, key, e);
                    pipeline.abandon(key, attempt);
                }
                return;
            }
        };

        if !pipeline.is_current(key, attempt) {
            if self.claim() {
                pipeline.release_slot();
                pipeline.stats.record_stale();
                pipeline.push_completion(key, attempt, chunk);
            }
            return;
        }

        if chunk.is_populated() {
            if !self.claim() {
                return;
            }
            let snapshot = chunk.snapshot();
            chunk.set_bind_state(BindState::Player);
            let token = pipeline.obfuscator.prepare_sync(&snapshot, &chunk);
            self.submit_compression(chunk, snapshot, token);
        } else if self.retry {
            self.fail_unpopulated();
        } else if self.rearmed.load(Ordering::Acquire) {
            // the re-armed load settles the attempt
        } else if self
            .world
            .loader()
            .round_exists(key.x(), key.z(), pipeline.options.gen_preload_radius)
        {
            self.fail_unpopulated();
        } else if !self.rearmed.swap(true, Ordering::AcqRel) {
            let mut retry = self.clone();
            retry.retry = true;
            self.world.loader().load_async(
                key.x(),
                key.z(),
                pipeline.options.gen_preload_radius,
                retry,
            );
        }
    }

    fn fail_unpopulated(&self) {
        if !self.claim() {
            return;
        }
        let pipeline = &self.pipeline;
        error!(
            "[{}] Chunk {} is still unpopulated after preloading radius {}",
            pipeline.player_name, self.key, pipeline.options.gen_preload_radius
        );
        pipeline.stats.record_load_failure();
        pipeline.abandon(self.key, self.attempt);
    }

    fn submit_compression(&self, chunk: Arc<Chunk>, snapshot: ChunkSnapshot, token: Option<ObfuscationToken>) {
        let job = self.clone();
        let job_chunk = Arc::clone(&chunk);
        let submitted = self
            .pipeline
            .submit(Box::new(move || job.compress(job_chunk, snapshot, token)));

        if let Err(e) = submitted {
            debug!("[{}] Compression of {} dropped: {}", self.pipeline.player_name, self.key, e);
            self.pipeline.abandon(self.key, self.attempt);
            self.pipeline.push_completion(self.key, self.attempt, chunk);
        }
    }

    /// Runs on the compressor thread
    fn compress(self, chunk: Arc<Chunk>, snapshot: ChunkSnapshot, token: Option<ObfuscationToken>) {
        let pipeline = &self.pipeline;
        let (key, attempt) = (self.key, self.attempt);

        if !pipeline.is_current(key, attempt) {
            pipeline.release_slot();
            pipeline.stats.record_stale();
            drop(snapshot);
            pipeline.push_completion(key, attempt, chunk);
            return;
        }

        let started = Instant::now();
        let packet = match pipeline.encode(snapshot, token) {
            Ok(packet) => packet,
            Err(e) => {
                pipeline.stats.record_compress_failure();
                warn!("[{}] Failed to encode chunk {}: {}", pipeline.player_name, key, e);
                pipeline.abandon(key, attempt);
                pipeline.push_completion(key, attempt, chunk);
                return;
            }
        };
        let elapsed = started.elapsed();
        pipeline.stats.record_compression(elapsed);

        {
            let mut in_flight = pipeline.in_flight.lock();
            if in_flight.is_current(key, attempt) {
                pipeline
                    .sink
                    .schedule_packet(OutboundPacket::ChunkData(packet), Some(pipeline.write_listener()));
                in_flight.stage2.insert(key);
                if pipeline.options.debug {
                    debug!("[{}] Chunk {} compressed in {:?}", pipeline.player_name, key, elapsed);
                }
            } else {
                drop(in_flight);
                pipeline.release_slot();
                pipeline.stats.record_stale();
            }
        }

        pipeline.push_completion(key, attempt, chunk);
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("key", &self.key)
            .field("attempt", &self.attempt)
            .field("retry", &self.retry)
            .field("rearmed", &self.rearmed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::sim::{generate_chunk, LoadMode, SimTransport, SimWorld};
    use crate::world::host::no_obfuscation;
    use std::time::Duration;

    const FLUSH: Duration = Duration::from_secs(5);

    struct Rig {
        pipeline: Arc<Pipeline>,
        completions: Receiver<Completion>,
        transport: Arc<SimTransport>,
        compressor: Arc<CompressorPool>,
        metrics: Arc<Metrics>,
    }

    fn rig(obfuscator: Arc<dyn ChunkObfuscator>) -> Rig {
        let metrics = Arc::new(Metrics::new());
        let compressor = Arc::new(CompressorPool::new(Arc::clone(&metrics)).unwrap());
        let transport = Arc::new(SimTransport::new());
        let (pipeline, completions) = Pipeline::new(
            "steve".to_string(),
            transport.clone(),
            obfuscator,
            &compressor,
            StreamStats::new(Arc::clone(&metrics)),
            PipelineOptions {
                compression_level: 6,
                gen_preload_radius: 2,
                debug: false,
            },
        );
        Rig {
            pipeline,
            completions,
            transport,
            compressor,
            metrics,
        }
    }

    struct PanickingObfuscator;

    impl ChunkObfuscator for PanickingObfuscator {
        fn prepare_sync(&self, _snapshot: &ChunkSnapshot, _chunk: &Chunk) -> Option<ObfuscationToken> {
            None
        }

        fn prepare_async(&self, _snapshot: &mut ChunkSnapshot, _token: Option<ObfuscationToken>) {
            panic!("obfuscation table missing");
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let r = rig(no_obfuscation());
        let key = ChunkKey::new(3, -1);
        let unloads = || r.metrics.unloads_sent.load(Ordering::Relaxed);

        assert!(!r.pipeline.cancel(key));
        assert_eq!(r.pipeline.network_queue(), 0);

        r.pipeline.begin(key);
        r.pipeline.in_flight.lock().stage2.insert(key);
        assert!(r.pipeline.cancel(key));
        assert_eq!(r.pipeline.stats().chunks_cancelled(), 1);
        assert_eq!(unloads(), 1);
        assert_eq!(r.transport.unload_keys(), vec![key]);
        let queue = r.pipeline.network_queue();

        assert!(!r.pipeline.cancel(key));
        assert_eq!(r.pipeline.stats().chunks_cancelled(), 1);
        assert_eq!(unloads(), 1);
        assert_eq!(r.pipeline.network_queue(), queue);
        assert_eq!(r.transport.packets().len(), 1);
        assert!(!r.pipeline.in_flight.lock().stage2.contains(&key));
    }

    #[test]
    fn test_cancel_before_hand_off_is_silent() {
        let r = rig(no_obfuscation());
        let key = ChunkKey::new(0, 0);
        r.pipeline.begin(key);

        assert!(r.pipeline.cancel(key));
        assert!(!r.pipeline.cancel(key));
        assert_eq!(r.pipeline.stats().chunks_cancelled(), 0);
        assert!(r.transport.packets().is_empty());
        assert!(!r.pipeline.is_sending(key));
    }

    #[test]
    fn test_attempt_ids_increase() {
        let r = rig(no_obfuscation());
        let key = ChunkKey::new(1, 1);

        let first = r.pipeline.begin(key);
        let second = r.pipeline.begin(key);
        let other = r.pipeline.begin(ChunkKey::new(2, 2));
        assert!(first < second && second < other);

        assert!(!r.pipeline.is_current(key, first));
        assert!(r.pipeline.is_current(key, second));
        assert!(!r.pipeline.promote(key, first));
        assert!(r.pipeline.promote(key, second));
        assert!(!r.pipeline.is_sending(key));
    }

    #[test]
    fn test_unpopulated_chunk_rearms_once() {
        let r = rig(no_obfuscation());
        let world = Arc::new(SimWorld::new(4));
        world.set_load_mode(LoadMode::Deferred);
        let key = ChunkKey::new(0, 0);
        world.generate_lazily(key);

        let attempt = r.pipeline.begin(key);
        let host: Arc<dyn WorldHost> = world.clone();
        let request = LoadRequest::new(Arc::clone(&r.pipeline), host, key, attempt);

        let bare = Arc::new(Chunk::new(0, 0));
        request.complete(Ok(Arc::clone(&bare)));
        request.complete(Ok(Arc::clone(&bare)));
        request.clone().complete(Ok(bare));

        assert_eq!(world.loads(), 1);
        assert_eq!(world.pending_loads(), 1);
        assert!(r.pipeline.is_current(key, attempt));
        assert_eq!(r.pipeline.stats().load_failures(), 0);

        assert_eq!(world.run_pending(), 1);
        assert!(r.compressor.flush(FLUSH));

        assert_eq!(r.transport.chunk_data_keys(), vec![key]);
        assert!(r.pipeline.in_flight.lock().stage2.contains(&key));
        let completion = r.completions.try_recv().unwrap();
        assert_eq!((completion.key, completion.attempt), (key, attempt));
        assert!(completion.chunk.is_populated());
    }

    #[test]
    fn test_obfuscator_panic_abandons_attempt() {
        let r = rig(Arc::new(PanickingObfuscator));
        let world = Arc::new(SimWorld::new(4));
        let key = ChunkKey::new(0, 0);

        let attempt = r.pipeline.begin(key);
        let host: Arc<dyn WorldHost> = world;
        let request = LoadRequest::new(Arc::clone(&r.pipeline), host, key, attempt);
        let chunk = Arc::new(generate_chunk(0, 0));
        chunk.set_populated(true);
        request.complete(Ok(chunk));
        assert!(r.compressor.flush(FLUSH));

        assert!(!r.pipeline.is_sending(key));
        assert_eq!(r.pipeline.network_queue(), 0);
        assert_eq!(r.pipeline.stats().compress_failures(), 1);
        assert!(r.transport.packets().is_empty());
        let completion = r.completions.try_recv().unwrap();
        assert_eq!(completion.attempt, attempt);
        assert!(!r.pipeline.promote(key, attempt));
    }
}
