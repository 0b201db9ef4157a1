//! In-memory world, players and transport
//!
//! Backs the demo binary, the integration tests and the benches. The world
//! generates terrain on demand and can load chunks immediately on the
//! calling thread or hold requests until `run_pending`.

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::stream::pipeline::LoadRequest;
use crate::stream::protocol::OutboundPacket;
use crate::util::{ChunkKey, Vec3};
use crate::world::chunk::{BindState, Chunk, ChunkColumn, ChunkSnapshot, TileEntity};
use crate::world::host::{
    ChunkLoadService, ChunkObfuscator, IndexedPlayer, LoadError, ObfuscationToken, PacketSink,
    PlayerId, StreamingPlayer, TransportError, WatchError, WatcherRegistry, WorldHost,
    WriteListener,
};

/// Preload radius at which a lazily generated chunk becomes populated
pub const POPULATE_RADIUS: i32 = 2;

const STONE: u16 = 1;
const GRASS: u16 = 2;

// ============================================================================
// Player
// ============================================================================

#[derive(Debug)]
pub struct SimPlayer {
    id: PlayerId,
    name: String,
    position: Mutex<Vec3>,
    yaw: Mutex<f32>,
    view_distance: AtomicI32,
    connected: AtomicBool,
}

impl SimPlayer {
    pub fn new(name: &str, position: Vec3, view_distance: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            position: Mutex::new(position),
            yaw: Mutex::new(0.0),
            view_distance: AtomicI32::new(view_distance),
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_position(&self, position: Vec3) {
        *self.position.lock() = position;
    }

    pub fn set_yaw(&self, yaw: f32) {
        *self.yaw.lock() = yaw;
    }

    pub fn set_view_distance(&self, view_distance: i32) {
        self.view_distance.store(view_distance, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

impl IndexedPlayer for SimPlayer {
    fn id(&self) -> PlayerId {
        self.id
    }

    fn position(&self) -> Vec3 {
        *self.position.lock()
    }
}

impl StreamingPlayer for SimPlayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn yaw(&self) -> f32 {
        *self.yaw.lock()
    }

    fn client_view_distance(&self) -> i32 {
        self.view_distance.load(Ordering::Relaxed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Records every packet. Writes complete inside `schedule_packet` unless the
/// transport is deferred, in which case `complete_pending` finishes them.
#[derive(Default)]
pub struct SimTransport {
    packets: Mutex<Vec<OutboundPacket>>,
    pending: Mutex<Vec<WriteListener>>,
    deferred: AtomicBool,
    closed: AtomicBool,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deferred() -> Self {
        let transport = Self::default();
        transport.deferred.store(true, Ordering::Relaxed);
        transport
    }

    /// Fail every later write with `TransportError::Closed`
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Finish held writes. Returns how many listeners fired.
    pub fn complete_pending(&self) -> usize {
        let listeners: Vec<WriteListener> = self.pending.lock().drain(..).collect();
        let count = listeners.len();
        for listener in listeners {
            listener(self.write_result());
        }
        count
    }

    fn write_result(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn packets(&self) -> Vec<OutboundPacket> {
        self.packets.lock().clone()
    }

    /// Keys of chunk data packets carrying terrain
    pub fn chunk_data_keys(&self) -> Vec<ChunkKey> {
        self.packets
            .lock()
            .iter()
            .filter(|p| matches!(p, OutboundPacket::ChunkData(_)) && !p.is_unload())
            .map(|p| p.chunk_key())
            .collect()
    }

    pub fn unload_keys(&self) -> Vec<ChunkKey> {
        self.packets
            .lock()
            .iter()
            .filter(|p| p.is_unload())
            .map(|p| p.chunk_key())
            .collect()
    }

    pub fn tile_entity_count(&self) -> usize {
        self.packets
            .lock()
            .iter()
            .filter(|p| matches!(p, OutboundPacket::TileEntity(_)))
            .count()
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }
}

impl PacketSink for SimTransport {
    fn schedule_packet(&self, packet: OutboundPacket, listener: Option<WriteListener>) {
        self.packets.lock().push(packet);
        if let Some(listener) = listener {
            if self.deferred.load(Ordering::Relaxed) {
                self.pending.lock().push(listener);
            } else {
                listener(self.write_result());
            }
        }
    }
}

// ============================================================================
// Obfuscation
// ============================================================================

/// Stalls the compressor on selected chunks
pub struct SlowObfuscator {
    keys: FxHashSet<ChunkKey>,
    delay: Duration,
}

impl SlowObfuscator {
    pub fn new(keys: impl IntoIterator<Item = ChunkKey>, delay: Duration) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            delay,
        }
    }
}

impl ChunkObfuscator for SlowObfuscator {
    fn prepare_sync(&self, _snapshot: &ChunkSnapshot, _chunk: &Chunk) -> Option<ObfuscationToken> {
        None
    }

    fn prepare_async(&self, snapshot: &mut ChunkSnapshot, _token: Option<ObfuscationToken>) {
        if self.keys.contains(&snapshot.key) {
            std::thread::sleep(self.delay);
        }
    }
}

// ============================================================================
// World
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Complete on the calling thread
    Immediate,
    /// Hold until `run_pending`
    Deferred,
}

pub struct SimWorld {
    dimension: i32,
    view_distance: AtomicI32,
    chunks: Mutex<FxHashMap<ChunkKey, Arc<Chunk>>>,
    watchers: Mutex<FxHashMap<ChunkKey, FxHashSet<PlayerId>>>,
    mode: Mutex<LoadMode>,
    pending: Mutex<Vec<(ChunkKey, i32, LoadRequest)>>,
    failing: Mutex<FxHashSet<ChunkKey>>,
    lazy: Mutex<FxHashSet<ChunkKey>>,
    duplicate_callbacks: AtomicBool,
    loads: AtomicUsize,
    unbinds: AtomicUsize,
    watch_events: AtomicUsize,
    light_updates: AtomicUsize,
    world_saves: AtomicUsize,
    world_time: AtomicU64,
    disk: Mutex<FxHashMap<ChunkKey, Vec<u8>>>,
}

impl SimWorld {
    pub fn new(view_distance: i32) -> Self {
        Self {
            dimension: 0,
            view_distance: AtomicI32::new(view_distance),
            chunks: Mutex::new(FxHashMap::default()),
            watchers: Mutex::new(FxHashMap::default()),
            mode: Mutex::new(LoadMode::Immediate),
            pending: Mutex::new(Vec::new()),
            failing: Mutex::new(FxHashSet::default()),
            lazy: Mutex::new(FxHashSet::default()),
            duplicate_callbacks: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
            watch_events: AtomicUsize::new(0),
            light_updates: AtomicUsize::new(0),
            world_saves: AtomicUsize::new(0),
            world_time: AtomicU64::new(0),
            disk: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn set_view_distance(&self, view_distance: i32) {
        self.view_distance.store(view_distance, Ordering::Relaxed);
    }

    pub fn set_load_mode(&self, mode: LoadMode) {
        *self.mode.lock() = mode;
    }

    /// Loads of `key` fail with an I/O error
    pub fn fail_loads(&self, key: ChunkKey) {
        self.failing.lock().insert(key);
    }

    /// `key` is generated unpopulated and only populates once its
    /// neighbourhood is loaded out to `POPULATE_RADIUS`
    pub fn generate_lazily(&self, key: ChunkKey) {
        self.lazy.lock().insert(key);
    }

    /// Invoke every load callback twice
    pub fn set_duplicate_callbacks(&self, duplicate: bool) {
        self.duplicate_callbacks.store(duplicate, Ordering::Relaxed);
    }

    /// Complete held loads. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let pending: Vec<_> = self.pending.lock().drain(..).collect();
        let count = pending.len();
        for (key, radius, request) in pending {
            self.load_now(key, radius, request);
        }
        count
    }

    pub fn pending_loads(&self) -> usize {
        self.pending.lock().len()
    }

    fn load_now(&self, key: ChunkKey, radius: i32, request: LoadRequest) {
        if self.failing.lock().contains(&key) {
            request.complete(Err(LoadError::Io(key, "simulated read failure".to_string())));
            return;
        }

        for neighbour in crate::util::chunk_key::square(key.x(), key.z(), radius) {
            self.get_or_generate(neighbour);
        }
        let chunk = self.get_or_generate(key);
        if radius >= POPULATE_RADIUS {
            chunk.set_populated(true);
        }

        if self.duplicate_callbacks.load(Ordering::Relaxed) {
            request.complete(Ok(Arc::clone(&chunk)));
        }
        request.complete(Ok(chunk));
    }

    fn get_or_generate(&self, key: ChunkKey) -> Arc<Chunk> {
        let lazy = self.lazy.lock().contains(&key);
        let mut chunks = self.chunks.lock();
        Arc::clone(chunks.entry(key).or_insert_with(|| {
            let chunk = generate_chunk(key.x(), key.z());
            chunk.set_populated(!lazy);
            Arc::new(chunk)
        }))
    }

    pub fn chunk(&self, key: ChunkKey) -> Option<Arc<Chunk>> {
        self.chunks.lock().get(&key).cloned()
    }

    pub fn loaded_chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.lock().values().cloned().collect()
    }

    /// Set a block, returning the chunk if it is loaded
    pub fn set_block(&self, x: i32, y: i32, z: i32, id: u16) -> Option<Arc<Chunk>> {
        let chunk = self.chunk(ChunkKey::from_block(x, z))?;
        if !(0..256).contains(&y) {
            return None;
        }
        chunk
            .write()
            .section_mut((y >> 4) as usize)
            .set_block((x & 15) as usize, (y & 15) as usize, (z & 15) as usize, id);
        Some(chunk)
    }

    pub fn advance_time(&self, ticks: u64) {
        self.world_time.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Number of chunks `player` is registered on
    pub fn watched_by(&self, player: PlayerId) -> usize {
        self.watchers
            .lock()
            .values()
            .filter(|set| set.contains(&player))
            .count()
    }

    pub fn is_watching(&self, key: ChunkKey, player: PlayerId) -> bool {
        self.watchers
            .lock()
            .get(&key)
            .is_some_and(|set| set.contains(&player))
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn unbinds(&self) -> usize {
        self.unbinds.load(Ordering::Relaxed)
    }

    pub fn watch_events(&self) -> usize {
        self.watch_events.load(Ordering::Relaxed)
    }

    pub fn light_updates(&self) -> usize {
        self.light_updates.load(Ordering::Relaxed)
    }

    pub fn saved_chunks(&self) -> usize {
        self.disk.lock().len()
    }
}

impl ChunkLoadService for SimWorld {
    fn load_async(&self, cx: i32, cz: i32, preload_radius: i32, request: LoadRequest) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let key = ChunkKey::new(cx, cz);
        let mode = *self.mode.lock();
        match mode {
            LoadMode::Immediate => self.load_now(key, preload_radius, request),
            LoadMode::Deferred => self.pending.lock().push((key, preload_radius, request)),
        }
    }

    fn round_exists(&self, cx: i32, cz: i32, radius: i32) -> bool {
        let chunks = self.chunks.lock();
        crate::util::chunk_key::square(cx, cz, radius).all(|key| chunks.contains_key(&key))
    }

    fn unbind(&self, chunk: &Chunk) {
        chunk.set_bind_state(BindState::Unbound);
        self.unbinds.fetch_add(1, Ordering::Relaxed);
    }
}

impl WatcherRegistry for SimWorld {
    fn add_player(&self, key: ChunkKey, player: PlayerId) -> Result<(), WatchError> {
        if self.watchers.lock().entry(key).or_default().insert(player) {
            Ok(())
        } else {
            Err(WatchError::AlreadyWatching { key, player })
        }
    }

    fn remove_player(&self, key: ChunkKey, player: PlayerId) -> bool {
        let mut watchers = self.watchers.lock();
        let Some(set) = watchers.get_mut(&key) else {
            return false;
        };
        let removed = set.remove(&player);
        if set.is_empty() {
            watchers.remove(&key);
        }
        removed
    }

    fn has_watchers(&self, key: ChunkKey) -> bool {
        self.watchers.lock().get(&key).is_some_and(|set| !set.is_empty())
    }
}

impl WorldHost for SimWorld {
    fn dimension(&self) -> i32 {
        self.dimension
    }

    fn view_distance(&self) -> i32 {
        self.view_distance.load(Ordering::Relaxed)
    }

    fn loader(&self) -> &dyn ChunkLoadService {
        self
    }

    fn watchers(&self) -> &dyn WatcherRegistry {
        self
    }

    fn chunk_watched(&self, _chunk: &Chunk, _player: &dyn StreamingPlayer) {
        self.watch_events.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(feature = "services")]
impl crate::services::saver::ChunkStore for SimWorld {
    fn dimension(&self) -> i32 {
        self.dimension
    }

    fn world_time(&self) -> u64 {
        self.world_time.load(Ordering::Relaxed)
    }

    fn save_chunk(&self, chunk: &Chunk) -> Result<(), crate::services::saver::SaveError> {
        use crate::services::saver::SaveError;
        use crate::stream::protocol::{encode, ChunkDataPacket};

        let packet = ChunkDataPacket::make_for_send(chunk.snapshot())
            .map_err(|e| SaveError::Rejected(chunk.key(), e.to_string()))?;
        let bytes = encode(&packet).map_err(|e| SaveError::Io(e.to_string()))?;
        self.disk.lock().insert(chunk.key(), bytes);
        Ok(())
    }

    fn save_world_data(&self) -> Result<(), crate::services::saver::SaveError> {
        self.world_saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(feature = "services")]
impl crate::services::lighting::LightUpdater for SimWorld {
    fn is_area_loaded(&self, x: i32, _y: i32, z: i32, radius: i32) -> bool {
        let chunks = self.chunks.lock();
        ((x - radius) >> 4..=(x + radius) >> 4).all(|cx| {
            ((z - radius) >> 4..=(z + radius) >> 4).all(|cz| chunks.contains_key(&ChunkKey::new(cx, cz)))
        })
    }

    fn update_light(&self, _kind: crate::services::lighting::LightKind, _x: i32, _y: i32, _z: i32) {
        self.light_updates.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Terrain
// ============================================================================

/// Surface height of a column, 60-67
fn surface_height(x: i32, z: i32) -> i32 {
    60 + (x.wrapping_mul(31) ^ z.wrapping_mul(17)).rem_euclid(8)
}

/// Deterministic terrain: stone up to the surface, grass on top, and a sign
/// in every fifth chunk along each axis
pub fn generate_chunk(x: i32, z: i32) -> Chunk {
    let mut column = ChunkColumn::new();

    for lx in 0..16 {
        for lz in 0..16 {
            let height = surface_height(x * 16 + lx, z * 16 + lz);
            for y in 0..=height {
                let id = if y == height { GRASS } else { STONE };
                column
                    .section_mut((y >> 4) as usize)
                    .set_block(lx as usize, (y & 15) as usize, lz as usize, id);
            }
        }
    }

    for (i, biome) in column.biomes.iter_mut().enumerate() {
        *biome = (((x ^ z).rem_euclid(4) as usize + i / 64) % 4) as u8;
    }

    if x.rem_euclid(5) == 0 && z.rem_euclid(5) == 0 {
        let (bx, bz) = (x * 16 + 8, z * 16 + 8);
        let by = surface_height(bx, bz) + 1;
        column.tile_entities.push(TileEntity {
            x: bx,
            y: by,
            z: bz,
            kind: "Sign".to_string(),
            data: format!("chunk {} {}", x, z).into_bytes(),
            invalid: false,
        });
        column.tile_entities.push(TileEntity {
            x: bx + 1,
            y: by,
            z: bz,
            kind: "Chest".to_string(),
            data: vec![0; 27],
            invalid: true,
        });
    }

    Chunk::with_column(x, z, column)
}
