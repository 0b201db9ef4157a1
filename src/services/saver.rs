//! Background chunk saver
//!
//! Writes modified chunks through a [`ChunkStore`] on its own worker threads
//! so the tick thread never waits on storage. Each request returns a
//! [`SaveHandle`] the caller can wait on or drop.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info};

use crate::services::worker::{ServiceError, WorkerPool};
use crate::util::ChunkKey;
use crate::world::chunk::Chunk;

const SAVER_NAME: &str = "chunk-saver";
const SAVER_THREADS: usize = 2;

/// Accepted range of `set_batch_size`
const BATCH_SIZE_RANGE: (usize, usize) = (1, 100);
/// Upper bound of `set_batch_delay`
const MAX_BATCH_DELAY: Duration = Duration::from_millis(1000);

const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_BATCH_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, Error)]
pub enum SaveError {
    #[error("storage error: {0}")]
    Io(String),
    #[error("chunk {0} rejected: {1}")]
    Rejected(ChunkKey, String),
}

/// Persistent storage of one world
pub trait ChunkStore: Send + Sync {
    fn dimension(&self) -> i32;

    /// Current world time, stamped on saved chunks
    fn world_time(&self) -> u64;

    fn save_chunk(&self, chunk: &Chunk) -> Result<(), SaveError>;

    /// Level metadata (spawn, time, player data)
    fn save_world_data(&self) -> Result<(), SaveError>;
}

/// Result of a queued save
pub struct SaveHandle<T> {
    inner: HandleState<T>,
}

enum HandleState<T> {
    Ready(T),
    Pending(Receiver<T>),
}

impl<T: Default> SaveHandle<T> {
    fn ready(value: T) -> Self {
        Self {
            inner: HandleState::Ready(value),
        }
    }

    fn pending(receiver: Receiver<T>) -> Self {
        Self {
            inner: HandleState::Pending(receiver),
        }
    }

    /// Block until the save finishes. A save dropped by shutdown yields the default.
    pub fn wait(self) -> T {
        match self.inner {
            HandleState::Ready(value) => value,
            HandleState::Pending(rx) => rx.recv().unwrap_or_default(),
        }
    }

    /// Like `wait`, but gives up after `timeout`
    pub fn wait_timeout(self, timeout: Duration) -> Option<T> {
        match self.inner {
            HandleState::Ready(value) => Some(value),
            HandleState::Pending(rx) => match rx.recv_timeout(timeout) {
                Ok(value) => Some(value),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(T::default()),
            },
        }
    }
}

#[derive(Debug, Default)]
struct SaveCounters {
    saved: AtomicU64,
    active: AtomicUsize,
    total_micros: AtomicU64,
}

/// Saver statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaveStats {
    pub total_chunks_saved: u64,
    pub active_saves: usize,
    pub total_save_time: Duration,
}

impl SaveStats {
    pub fn average_save_time_ms(&self) -> f64 {
        if self.total_chunks_saved == 0 {
            return 0.0;
        }
        self.total_save_time.as_secs_f64() * 1_000.0 / self.total_chunks_saved as f64
    }
}

impl fmt::Display for SaveStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SaveStats{{chunks={}, active={}, totalTime={}ms, avgTime={:.2}ms}}",
            self.total_chunks_saved,
            self.active_saves,
            self.total_save_time.as_millis(),
            self.average_save_time_ms()
        )
    }
}

pub struct AsyncChunkSaver {
    pool: WorkerPool,
    enabled: AtomicBool,
    batch_size: Arc<AtomicUsize>,
    batch_delay_ms: Arc<AtomicU64>,
    counters: Arc<SaveCounters>,
}

impl AsyncChunkSaver {
    pub fn new() -> Result<Self, ServiceError> {
        Ok(Self {
            pool: WorkerPool::new(SAVER_NAME, SAVER_THREADS, None)?,
            enabled: AtomicBool::new(true),
            batch_size: Arc::new(AtomicUsize::new(DEFAULT_BATCH_SIZE)),
            batch_delay_ms: Arc::new(AtomicU64::new(DEFAULT_BATCH_DELAY_MS)),
            counters: Arc::new(SaveCounters::default()),
        })
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        info!(
            "Async chunk saver {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Chunks written back to back in a batch before pausing. Clamped to 1-100.
    pub fn set_batch_size(&self, size: usize) {
        let (min, max) = BATCH_SIZE_RANGE;
        self.batch_size.store(size.clamp(min, max), Ordering::Relaxed);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// Pause between groups of a batch. Clamped to 0-1000 ms.
    pub fn set_batch_delay(&self, delay: Duration) {
        let delay = delay.min(MAX_BATCH_DELAY);
        self.batch_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms.load(Ordering::Relaxed))
    }

    /// Save one chunk if it has unsaved changes. Resolves to whether it was written.
    pub fn save_chunk_async(&self, store: Arc<dyn ChunkStore>, chunk: Arc<Chunk>) -> SaveHandle<bool> {
        if !self.is_enabled() {
            return SaveHandle::ready(false);
        }

        let (tx, rx) = bounded(1);
        let counters = Arc::clone(&self.counters);
        let submitted = self.pool.submit(Box::new(move || {
            let saved = save_one(store.as_ref(), &chunk, &counters, "");
            let _ = tx.send(saved);
        }));

        match submitted {
            Ok(()) => SaveHandle::pending(rx),
            Err(_) => SaveHandle::ready(false),
        }
    }

    /// Save every modified chunk of `chunks`, pausing `batch_delay` after each
    /// group of `batch_size`. Resolves to the number written.
    pub fn save_batch_async(&self, store: Arc<dyn ChunkStore>, chunks: Vec<Arc<Chunk>>) -> SaveHandle<usize> {
        if !self.is_enabled() || chunks.is_empty() {
            return SaveHandle::ready(0);
        }

        let (tx, rx) = bounded(1);
        let counters = Arc::clone(&self.counters);
        let batch_size = Arc::clone(&self.batch_size);
        let batch_delay_ms = Arc::clone(&self.batch_delay_ms);

        let submitted = self.pool.submit(Box::new(move || {
            let group = batch_size.load(Ordering::Relaxed).max(1);
            let delay = Duration::from_millis(batch_delay_ms.load(Ordering::Relaxed));
            let mut saved = 0;
            let mut in_group = 0;

            for (i, chunk) in chunks.iter().enumerate() {
                if !chunk.needs_saving() {
                    continue;
                }
                if save_one(store.as_ref(), chunk, &counters, " (batch)") {
                    saved += 1;
                }
                in_group += 1;
                if in_group >= group && i + 1 < chunks.len() && !delay.is_zero() {
                    std::thread::sleep(delay);
                    in_group = 0;
                }
            }
            let _ = tx.send(saved);
        }));

        match submitted {
            Ok(()) => SaveHandle::pending(rx),
            Err(_) => SaveHandle::ready(0),
        }
    }

    /// Save level metadata. Resolves to whether it was written.
    pub fn save_world_data_async(&self, store: Arc<dyn ChunkStore>) -> SaveHandle<bool> {
        if !self.is_enabled() {
            return SaveHandle::ready(false);
        }

        let (tx, rx) = bounded(1);
        let submitted = self.pool.submit(Box::new(move || {
            let saved = match store.save_world_data() {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to save world data for dimension {}: {}", store.dimension(), e);
                    false
                }
            };
            let _ = tx.send(saved);
        }));

        match submitted {
            Ok(()) => SaveHandle::pending(rx),
            Err(_) => SaveHandle::ready(false),
        }
    }

    pub fn stats(&self) -> SaveStats {
        SaveStats {
            total_chunks_saved: self.counters.saved.load(Ordering::Relaxed),
            active_saves: self.counters.active.load(Ordering::Relaxed),
            total_save_time: Duration::from_micros(self.counters.total_micros.load(Ordering::Relaxed)),
        }
    }

    /// Zero the saved count and the accumulated time
    pub fn reset_stats(&self) {
        self.counters.saved.store(0, Ordering::Relaxed);
        self.counters.total_micros.store(0, Ordering::Relaxed);
    }

    /// Wait for every queued save
    pub fn await_completion(&self, timeout: Duration) -> bool {
        self.pool.await_completion(timeout)
    }

    /// Reject new saves, finish queued ones and stop the workers
    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("Shutting down async chunk saver...");
        self.enabled.store(false, Ordering::Release);
        let drained = self.pool.shutdown(timeout);
        info!("Async chunk saver shut down. Stats: {}", self.stats());
        drained
    }
}

fn save_one(store: &dyn ChunkStore, chunk: &Chunk, counters: &SaveCounters, mode: &str) -> bool {
    if !chunk.needs_saving() {
        return false;
    }

    counters.active.fetch_add(1, Ordering::AcqRel);
    let started = Instant::now();

    let saved = match store.save_chunk(chunk) {
        Ok(()) => {
            chunk.mark_saved(store.world_time());
            counters.saved.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(e) => {
            error!(
                "Failed to save chunk [{}, {}] in dimension {}{}: {}",
                chunk.x(),
                chunk.z(),
                store.dimension(),
                mode,
                e
            );
            false
        }
    };

    counters
        .total_micros
        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    counters.active.fetch_sub(1, Ordering::AcqRel);
    saved
}
