//! End-to-end streaming scenarios against the in-memory world
//!
//! Every scenario uses max_send_rate = 20 and view distance 8 unless noted.

use rand::Rng;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::Duration;

use voxel_stream_server::config::StreamingConfig;
use voxel_stream_server::metrics::Metrics;
use voxel_stream_server::sim::{LoadMode, SimPlayer, SimTransport, SimWorld, SlowObfuscator};
use voxel_stream_server::stream::{ChunkSendScheduler, StreamSession};
use voxel_stream_server::util::chunk_key::square;
use voxel_stream_server::util::{ChunkKey, DirectionFace, Vec3};
use voxel_stream_server::world::chunk::{Chunk, ChunkSnapshot};
use voxel_stream_server::world::host::{no_obfuscation, ChunkObfuscator, IndexedPlayer, ObfuscationToken};

const MAX_SEND_RATE: u32 = 20;
const VIEW: i32 = 8;
const FLUSH: Duration = Duration::from_secs(10);

struct Rig {
    session: StreamSession,
    world: Arc<SimWorld>,
    player: Arc<SimPlayer>,
    transport: Arc<SimTransport>,
}

fn rig_with(view: i32, obfuscator: Arc<dyn ChunkObfuscator>, transport: SimTransport) -> Rig {
    let world = Arc::new(SimWorld::new(view));
    let config = Arc::new(StreamingConfig {
        max_send_rate: MAX_SEND_RATE,
        view_distance: view,
        ..StreamingConfig::default()
    });
    let session = StreamSession::new(config, world.clone(), obfuscator, Arc::new(Metrics::new())).unwrap();
    Rig {
        session,
        world,
        player: Arc::new(SimPlayer::new("alex", Vec3::new(0.0, 64.0, 0.0), view)),
        transport: Arc::new(transport),
    }
}

fn rig(view: i32) -> Rig {
    rig_with(view, no_obfuscation(), SimTransport::new())
}

impl Rig {
    fn join(&mut self) {
        self.session
            .join(self.player.clone(), self.transport.clone())
            .unwrap();
    }

    fn scheduler(&self) -> &ChunkSendScheduler {
        self.session.scheduler(self.player.id()).unwrap()
    }

    fn tick(&mut self) {
        self.session.tick();
        self.session.flush_compressor(FLUSH);
    }

    /// Tick until nothing is queued or in flight, then apply the last completions
    fn settle(&mut self) -> usize {
        let mut ticks = 0;
        while !self.scheduler().is_idle() {
            assert!(ticks < 500, "stream did not settle: {}", self.scheduler().debug_info());
            self.tick();
            ticks += 1;
        }
        self.tick();
        ticks
    }

    fn assert_consistent(&self) {
        let scheduler = self.scheduler();
        let (ax, az) = scheduler.anchor().chunk_coords();
        let view = scheduler.view_distance();

        let queued: FxHashSet<ChunkKey> = scheduler.queued_keys().into_iter().collect();
        let sending: FxHashSet<ChunkKey> = scheduler.sending_keys().into_iter().collect();
        let sent: FxHashSet<ChunkKey> = scheduler.sent_keys().collect();

        assert!(queued.is_disjoint(&sending));
        assert!(queued.is_disjoint(&sent));
        assert!(sending.is_disjoint(&sent));
        for key in queued.iter().chain(&sending).chain(&sent) {
            assert!(key.within(ax, az, view), "{} outside view {} of ({}, {})", key, view, ax, az);
        }

        let rate = scheduler.rate();
        assert!((0.2..=MAX_SEND_RATE as f64).contains(&rate));
    }
}

fn unique(keys: Vec<ChunkKey>) -> FxHashSet<ChunkKey> {
    keys.into_iter().collect()
}

#[test]
fn test_steady_state_prime() {
    let mut rig = rig(VIEW);
    rig.join();

    for _ in 0..10 {
        rig.tick();
        rig.assert_consistent();
        assert!(rig.scheduler().network_queue() <= 2 * MAX_SEND_RATE as usize + MAX_SEND_RATE as usize);
    }
    assert!(rig.scheduler().sent_len() > 0);

    rig.settle();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.sent_len(), 289);
    assert_eq!(scheduler.to_send_len(), 0);
    assert_eq!(scheduler.sending_len(), 0);
    assert_eq!(scheduler.network_queue(), 0);
    assert_eq!(scheduler.stats().chunks_sent(), 289);
    for key in square(0, 0, VIEW) {
        assert!(scheduler.is_sent(key));
    }
    assert_eq!(rig.world.watched_by(rig.player.id()), 289);
    assert_eq!(unique(rig.transport.chunk_data_keys()).len(), 289);
    assert_eq!(rig.transport.chunk_data_keys().len(), 289);
}

#[test]
fn test_walk_forward() {
    let mut rig = rig(VIEW);
    rig.join();
    rig.settle();
    let sorts_before = rig.scheduler().stats().sort_operations();
    rig.transport.clear();

    rig.player.set_yaw(270.0);
    rig.player.set_position(Vec3::new(256.0, 64.0, 0.0));
    rig.settle();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.anchor().chunk_coords(), (16, 0));
    for key in square(16, 0, VIEW) {
        assert!(scheduler.is_sent(key), "{} missing", key);
    }
    assert_eq!(scheduler.sent_len(), 289);

    // The squares share one column of 17 chunks
    let newly_sent = unique(rig.transport.chunk_data_keys());
    assert_eq!(newly_sent.len(), 272);
    assert!(newly_sent.iter().all(|k| k.x() > 8));

    let unloaded = unique(rig.transport.unload_keys());
    assert_eq!(unloaded.len(), 272);
    assert!(unloaded.iter().all(|k| k.x() < 8));
    assert_eq!(rig.world.watched_by(rig.player.id()), 289);

    assert!(scheduler.stats().sort_operations() > sorts_before);
    assert_eq!(scheduler.facing(), Some(DirectionFace::East));
}

#[test]
fn test_shrink_view() {
    let mut rig = rig(VIEW);
    rig.join();
    rig.settle();
    rig.transport.clear();

    rig.player.set_view_distance(4);
    rig.tick();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.view_distance(), 4);
    assert!(scheduler.queued_keys().iter().all(|k| k.within(0, 0, 4)));
    assert!(scheduler.sending_keys().iter().all(|k| k.within(0, 0, 4)));
    assert_eq!(scheduler.sent_len(), 81);
    assert!(scheduler.sent_keys().all(|k| k.within(0, 0, 4)));

    let unloaded = rig.transport.unload_keys();
    assert_eq!(unloaded.len(), 208);
    assert!(unloaded.iter().all(|k| !k.within(0, 0, 4)));
    assert_eq!(rig.world.watched_by(rig.player.id()), 81);
}

#[test]
fn test_world_view_follows_server() {
    let mut rig = rig(4);
    rig.join();
    rig.settle();
    rig.transport.clear();
    let id = rig.player.id();

    rig.world.set_view_distance(3);
    rig.tick();
    assert_eq!(rig.scheduler().view_distance(), 3);
    assert_eq!(rig.scheduler().sent_len(), 49);
    let packets = rig.transport.packets();
    assert_eq!(packets.len(), 32);
    assert!(packets.iter().all(|p| p.is_unload() && !p.chunk_key().within(0, 0, 3)));
    for key in square(0, 0, 4) {
        assert_eq!(rig.world.is_watching(key, id), key.within(0, 0, 3), "{}", key);
    }

    rig.transport.clear();
    rig.world.set_view_distance(4);
    rig.tick();
    let scheduler = rig.scheduler();
    assert_eq!(scheduler.view_distance(), 4);
    for key in square(0, 0, 4).filter(|k| !k.within(0, 0, 3)) {
        assert!(scheduler.is_queued(key) || scheduler.is_sending(key) || scheduler.is_sent(key));
    }

    rig.settle();
    assert_eq!(rig.scheduler().sent_len(), 81);
    assert_eq!(unique(rig.transport.chunk_data_keys()).len(), 32);
    assert!(rig.transport.unload_keys().is_empty());
    assert_eq!(rig.world.watched_by(id), 81);
}

#[test]
fn test_grow_view() {
    let mut rig = rig(VIEW);
    rig.player.set_view_distance(4);
    rig.join();
    rig.settle();
    assert_eq!(rig.scheduler().sent_len(), 81);

    rig.player.set_view_distance(6);
    rig.settle();
    assert_eq!(rig.scheduler().sent_len(), 169);
    assert_eq!(rig.scheduler().stats().chunks_sent(), 169);

    // The world caps what the client asks for
    rig.player.set_view_distance(12);
    rig.settle();
    assert_eq!(rig.scheduler().view_distance(), VIEW);
    assert_eq!(rig.scheduler().sent_len(), 289);
}

#[test]
fn test_cancel_mid_compression() {
    let origin = ChunkKey::new(0, 0);
    let slow: Arc<dyn ChunkObfuscator> = Arc::new(SlowObfuscator::new([origin], Duration::from_millis(300)));
    let mut rig = rig_with(VIEW, slow, SimTransport::new());

    // The origin is dispatched first and stalls the compressor
    rig.join();
    assert!(rig.scheduler().is_sending(origin));

    rig.player.set_position(Vec3::new(10_000.0, 64.0, 0.0));
    rig.session.tick();
    assert!(!rig.scheduler().is_sending(origin));

    rig.session.flush_compressor(FLUSH);
    rig.session.tick();

    let scheduler = rig.scheduler();
    assert!(!rig.transport.chunk_data_keys().contains(&origin));
    assert!(!rig.transport.unload_keys().contains(&origin));
    assert_eq!(scheduler.stats().chunks_cancelled(), 0);
    assert!(!scheduler.is_sending(origin));
    assert!(!scheduler.is_sent(origin));
    assert!(scheduler.stats().stale_completions() > 0);
    assert!(rig.world.unbinds() > 0);
}

#[test]
fn test_view_shrink_cancels_mid_compression() {
    let origin = ChunkKey::new(0, 0);
    let slow: Arc<dyn ChunkObfuscator> = Arc::new(SlowObfuscator::new([origin], Duration::from_millis(300)));
    let mut rig = rig_with(2, slow, SimTransport::new());

    // The prime reaches past ring 1 while the origin holds the compressor
    rig.join();
    let outside: Vec<ChunkKey> = rig
        .scheduler()
        .sending_keys()
        .into_iter()
        .filter(|k| !k.within(0, 0, 1))
        .collect();
    assert!(!outside.is_empty());

    rig.player.set_view_distance(1);
    rig.session.tick();
    let scheduler = rig.scheduler();
    assert_eq!(scheduler.view_distance(), 1);
    assert!(outside.iter().all(|k| !scheduler.is_sending(*k)));
    assert_eq!(scheduler.stats().chunks_cancelled(), 0);

    rig.settle();
    let scheduler = rig.scheduler();
    let delivered = unique(rig.transport.chunk_data_keys());
    let unloaded = unique(rig.transport.unload_keys());
    for key in &outside {
        assert!(!delivered.contains(key) && !unloaded.contains(key), "{}", key);
        assert!(!scheduler.is_sent(*key));
        assert!(!rig.world.is_watching(*key, rig.player.id()));
    }
    assert!(scheduler.stats().stale_completions() >= outside.len() as u64);
    assert!(rig.world.unbinds() >= outside.len());
    assert_eq!(scheduler.sent_len(), 9);
    assert_eq!(scheduler.network_queue(), 0);
}

#[test]
fn test_cancel_after_hand_off_sends_unload() {
    let mut rig = rig(2);
    rig.join();
    // Primed chunks are compressed and handed to the transport, not yet promoted
    rig.session.flush_compressor(FLUSH);
    let primed = unique(rig.transport.chunk_data_keys());
    assert_eq!(primed.len(), 10);

    rig.player.set_position(Vec3::new(10_000.0, 64.0, 0.0));
    rig.session.tick();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.stats().chunks_cancelled(), 10);
    assert_eq!(unique(rig.transport.unload_keys()), primed);
    assert!(primed.iter().all(|k| !scheduler.is_sent(*k)));
    assert_eq!(rig.world.watched_by(rig.player.id()), 0);
}

#[test]
fn test_attach_detach_round_trip() {
    let mut rig = rig(4);
    rig.join();
    rig.settle();
    assert_eq!(rig.world.watched_by(rig.player.id()), 81);
    rig.transport.clear();

    let snapshot = rig.session.leave(rig.player.id()).unwrap();

    assert_eq!(snapshot.total_chunks_sent, 81);
    assert_eq!(rig.world.watched_by(rig.player.id()), 0);
    assert_eq!(rig.transport.unload_keys().len(), 81);
    assert!(rig.transport.chunk_data_keys().is_empty());
    assert!(!rig.session.index().contains(rig.player.id()));
}

#[test]
fn test_idle_ticks_dispatch_nothing() {
    let mut rig = rig(3);
    rig.join();
    rig.settle();
    let loads = rig.world.loads();

    rig.tick();
    rig.tick();

    assert_eq!(rig.world.loads(), loads);
}

#[test]
fn test_load_failure_is_absorbed() {
    let mut rig = rig(2);
    let broken = ChunkKey::new(1, 1);
    rig.world.fail_loads(broken);
    rig.join();
    rig.settle();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.sent_len(), 24);
    assert!(!scheduler.is_sent(broken));
    assert!(!scheduler.is_sending(broken));
    assert_eq!(scheduler.stats().load_failures(), 1);
    assert_eq!(scheduler.network_queue(), 0);
}

#[test]
fn test_unpopulated_chunk_is_reloaded_with_neighbours() {
    let mut rig = rig(1);
    let origin = ChunkKey::new(0, 0);
    rig.world.generate_lazily(origin);
    rig.join();
    rig.settle();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.sent_len(), 9);
    assert!(scheduler.is_sent(origin));
    assert_eq!(scheduler.stats().load_failures(), 0);
    assert_eq!(rig.world.loads(), 10);
    assert!(rig.world.chunk(origin).unwrap().is_populated());
}

#[test]
fn test_duplicate_load_callbacks() {
    let mut rig = rig(2);
    rig.world.set_duplicate_callbacks(true);
    rig.join();
    rig.settle();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.sent_len(), 25);
    assert_eq!(scheduler.stats().chunks_sent(), 25);
    assert_eq!(scheduler.network_queue(), 0);
    assert_eq!(rig.transport.chunk_data_keys().len(), 25);
}

#[test]
fn test_deferred_loads() {
    let mut rig = rig(2);
    rig.world.set_load_mode(LoadMode::Deferred);
    rig.join();

    for _ in 0..100 {
        rig.world.run_pending();
        rig.tick();
        if rig.scheduler().is_idle() && rig.world.pending_loads() == 0 {
            break;
        }
    }
    rig.tick();
    assert_eq!(rig.scheduler().sent_len(), 25);
}

#[test]
fn test_disconnected_player_gets_no_extras() {
    let mut rig = rig(2);
    rig.join();
    rig.player.set_connected(false);
    rig.settle();

    assert_eq!(rig.scheduler().sent_len(), 25);
    assert_eq!(rig.transport.tile_entity_count(), 0);
    assert_eq!(rig.world.watch_events(), 0);

    rig.transport.clear();
    rig.session.leave(rig.player.id());
    assert!(rig.transport.unload_keys().is_empty());
    assert_eq!(rig.world.watched_by(rig.player.id()), 0);
}

#[test]
fn test_tile_entities_follow_their_chunk() {
    let mut rig = rig(2);
    rig.join();
    rig.settle();

    // Only (0, 0) carries a sign; its chest is invalid
    assert_eq!(rig.transport.tile_entity_count(), 1);
    assert_eq!(rig.world.watch_events(), 25);
}

#[test]
fn test_network_backpressure() {
    let mut rig = rig_with(VIEW, no_obfuscation(), SimTransport::deferred());
    rig.join();

    for _ in 0..50 {
        rig.tick();
        assert!(rig.scheduler().network_queue() <= 3 * MAX_SEND_RATE as usize);
    }
    assert!(rig.scheduler().to_send_len() > 0);

    for _ in 0..1000 {
        rig.transport.complete_pending();
        rig.tick();
        if rig.scheduler().is_idle() {
            break;
        }
    }
    rig.transport.complete_pending();
    rig.tick();
    assert_eq!(rig.scheduler().sent_len(), 289);
    assert_eq!(rig.scheduler().network_queue(), 0);
}

/// Anti-cheat hook that fails on selected chunks
struct FaultyObfuscator(ChunkKey);

impl ChunkObfuscator for FaultyObfuscator {
    fn prepare_sync(&self, _snapshot: &ChunkSnapshot, _chunk: &Chunk) -> Option<ObfuscationToken> {
        None
    }

    fn prepare_async(&self, snapshot: &mut ChunkSnapshot, _token: Option<ObfuscationToken>) {
        if snapshot.key == self.0 {
            panic!("no obfuscation table for {}", snapshot.key);
        }
    }
}

#[test]
fn test_obfuscator_panic_is_absorbed() {
    let origin = ChunkKey::new(0, 0);
    let mut rig = rig_with(1, Arc::new(FaultyObfuscator(origin)), SimTransport::new());
    rig.join();
    rig.settle();

    let scheduler = rig.scheduler();
    assert!(scheduler.is_idle());
    assert_eq!(scheduler.sending_len(), 0);
    assert_eq!(scheduler.network_queue(), 0);
    assert_eq!(scheduler.sent_len(), 8);
    assert!(!scheduler.is_sent(origin));
    assert_eq!(scheduler.stats().compress_failures(), 1);
    assert!(!rig.transport.chunk_data_keys().contains(&origin));
    assert!(!rig.world.is_watching(origin, rig.player.id()));
    rig.assert_consistent();
}

#[test]
fn test_write_failures_release_the_queue() {
    let mut rig = rig(2);
    rig.transport.close();
    rig.join();
    rig.settle();

    let scheduler = rig.scheduler();
    assert_eq!(scheduler.stats().write_failures(), 25);
    assert_eq!(scheduler.network_queue(), 0);
}

#[test]
fn test_modified_chunk_is_resent() {
    let mut rig = rig(2);
    rig.join();
    rig.settle();
    rig.transport.clear();

    let chunk = rig.world.set_block(3, 70, 3, 4).unwrap();
    rig.session.on_chunk_modified(&chunk);
    rig.session.flush_compressor(FLUSH);

    assert_eq!(rig.transport.chunk_data_keys(), vec![ChunkKey::new(0, 0)]);
    assert_eq!(rig.scheduler().network_queue(), 0);
}

#[test]
fn test_random_walk_keeps_invariants() {
    let mut rig = rig(4);
    rig.join();
    let mut rng = rand::thread_rng();

    for _ in 0..200 {
        let position = rig.player.position();
        rig.player.set_position(Vec3::new(
            position.x + rng.gen_range(-40.0..40.0),
            64.0,
            position.z + rng.gen_range(-40.0..40.0),
        ));
        rig.player.set_yaw(rng.gen_range(0.0..360.0));
        if rng.gen_bool(0.05) {
            rig.player.set_view_distance(rng.gen_range(2..=4));
        }
        rig.tick();
        rig.assert_consistent();
    }

    rig.settle();
    rig.assert_consistent();
    let scheduler = rig.scheduler();
    let (ax, az) = scheduler.anchor().chunk_coords();
    let view = scheduler.view_distance();
    assert_eq!(scheduler.sent_len(), ((2 * view + 1) * (2 * view + 1)) as usize);
    assert!(scheduler.sent_keys().all(|k| k.within(ax, az, view)));
    assert_eq!(rig.world.watched_by(rig.player.id()), scheduler.sent_len());
}
