use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use voxel_stream_server::config::StreamingConfig;
use voxel_stream_server::metrics::{self, Metrics};
use voxel_stream_server::services::lighting::{LightKind, LightUpdater, LightingQueue};
use voxel_stream_server::services::saver::{AsyncChunkSaver, ChunkStore};
use voxel_stream_server::sim::{SimPlayer, SimTransport, SimWorld};
use voxel_stream_server::stream::StreamSession;
use voxel_stream_server::util::Vec3;
use voxel_stream_server::world::host::{no_obfuscation, IndexedPlayer};

/// Simulated players walking around when SIM_PLAYERS is unset
const DEFAULT_SIM_PLAYERS: usize = 8;
/// Ticks between autosaves (30 s at 20 Hz)
const AUTOSAVE_INTERVAL_TICKS: u64 = 600;
/// Blocks a walking player covers per tick
const WALK_SPEED: f64 = 0.4;
/// Chance per tick that someone edits a block
const BLOCK_EDIT_CHANCE: f64 = 0.05;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Voxel Stream Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = StreamingConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("Invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: max_send_rate={}, view_distance={}, tick_rate={}Hz",
        config.max_send_rate, config.view_distance, config.tick_rate
    );
    let config = Arc::new(config);

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Background services are built here and drained on shutdown
    let saver = AsyncChunkSaver::new()?;
    let lighting = LightingQueue::new()?;

    let world = Arc::new(SimWorld::new(config.view_distance));
    let mut session = StreamSession::new(config.clone(), world.clone(), no_obfuscation(), metrics.clone())?;

    let player_count = std::env::var("SIM_PLAYERS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SIM_PLAYERS);

    let mut rng = rand::thread_rng();
    let mut players = Vec::with_capacity(player_count);
    for i in 0..player_count {
        let spawn = Vec3::new(rng.gen_range(-256.0..256.0), 64.0, rng.gen_range(-256.0..256.0));
        let player = Arc::new(SimPlayer::new(&format!("walker-{}", i), spawn, config.view_distance));
        player.set_yaw(rng.gen_range(0.0..360.0));
        session.join(player.clone(), Arc::new(SimTransport::new()))?;
        players.push(player);
    }
    info!("Streaming to {} simulated player(s)", players.len());

    let mut interval = tokio::time::interval(config.tick_duration());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                walk(&players, &mut rng);

                if rng.gen_bool(BLOCK_EDIT_CHANCE) {
                    edit_random_block(&session, &world, &lighting, &players, &mut rng);
                }

                world.advance_time(1);
                session.tick();

                if session.tick_count() % AUTOSAVE_INTERVAL_TICKS == 0 {
                    autosave(&saver, &world, false);
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    // Cleanup
    for snapshot in session.snapshots() {
        info!("{}", snapshot.to_json());
    }
    session.shutdown(SHUTDOWN_TIMEOUT);

    autosave(&saver, &world, true);
    lighting.shutdown(SHUTDOWN_TIMEOUT);
    saver.shutdown(SHUTDOWN_TIMEOUT);
    info!("Server stopped");

    Ok(())
}

/// Move every player a step along its heading, turning now and then
fn walk(players: &[Arc<SimPlayer>], rng: &mut impl Rng) {
    use voxel_stream_server::world::host::StreamingPlayer;

    for player in players {
        let mut yaw = player.yaw();
        if rng.gen_bool(0.02) {
            yaw = (yaw + rng.gen_range(-90.0..90.0)).rem_euclid(360.0);
            player.set_yaw(yaw);
        }
        // Yaw 0 faces +Z, 90 faces -X
        let radians = (yaw as f64).to_radians();
        let position = player.position();
        player.set_position(Vec3::new(
            position.x - radians.sin() * WALK_SPEED,
            position.y,
            position.z + radians.cos() * WALK_SPEED,
        ));
    }
}

/// Place a block next to a random player and propagate the change
fn edit_random_block(
    session: &StreamSession,
    world: &Arc<SimWorld>,
    lighting: &LightingQueue,
    players: &[Arc<SimPlayer>],
    rng: &mut impl Rng,
) {
    if players.is_empty() {
        return;
    }
    let player = &players[rng.gen_range(0..players.len())];
    let position = player.position();
    let (x, y, z) = (
        position.x.floor() as i32 + rng.gen_range(-8..=8),
        70,
        position.z.floor() as i32 + rng.gen_range(-8..=8),
    );

    let Some(chunk) = world.set_block(x, y, z, 4) else {
        return;
    };
    session.on_chunk_modified(&chunk);

    let updater: Arc<dyn LightUpdater> = world.clone();
    if !lighting.schedule_light_update(updater, LightKind::Block, x, y, z) {
        debug!("Lighting queue full, updating ({}, {}, {}) inline", x, y, z);
        world.update_light(LightKind::Block, x, y, z);
    }
}

/// Queue every modified chunk for saving; `wait` blocks until written
fn autosave(saver: &AsyncChunkSaver, world: &Arc<SimWorld>, wait: bool) {
    let store: Arc<dyn ChunkStore> = world.clone();
    let dirty: Vec<_> = world
        .loaded_chunks()
        .into_iter()
        .filter(|c| c.needs_saving())
        .collect();
    if dirty.is_empty() {
        return;
    }

    let count = dirty.len();
    let handle = saver.save_batch_async(store.clone(), dirty);
    saver.save_world_data_async(store);
    if !wait {
        debug!("Queued {} chunk(s) for autosave", count);
        return;
    }
    match handle.wait_timeout(SHUTDOWN_TIMEOUT) {
        Some(saved) => debug!("Autosaved {}/{} chunk(s)", saved, count),
        None => warn!("Autosave of {} chunk(s) still running", count),
    }
}
