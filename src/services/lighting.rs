//! Background light updates
//!
//! Queues light recalculations for a worker thread. When the queue is full
//! or the service is disabled, `schedule_light_update` returns false and the
//! caller recalculates synchronously.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::services::worker::{ServiceError, WorkerPool};

const LIGHTING_NAME: &str = "async-lighting";

/// Most light updates waiting at once
pub const MAX_QUEUED_UPDATES: usize = 8192;

/// Radius in blocks that must be loaded around an update
pub const LOADED_AREA_RADIUS: i32 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Sky,
    Block,
}

/// World side of the lighting service
pub trait LightUpdater: Send + Sync {
    /// Whether every chunk within `radius` blocks of (x, y, z) is loaded
    fn is_area_loaded(&self, x: i32, y: i32, z: i32, radius: i32) -> bool;

    fn update_light(&self, kind: LightKind, x: i32, y: i32, z: i32);
}

#[derive(Debug, Default)]
struct LightingCounters {
    processed: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightingStats {
    pub queued: usize,
    pub active: usize,
    pub processed: u64,
    pub skipped: u64,
    pub rejected: u64,
}

pub struct LightingQueue {
    pool: WorkerPool,
    enabled: AtomicBool,
    counters: Arc<LightingCounters>,
}

impl LightingQueue {
    pub fn new() -> Result<Self, ServiceError> {
        Ok(Self {
            pool: WorkerPool::new(LIGHTING_NAME, 1, Some(MAX_QUEUED_UPDATES))?,
            enabled: AtomicBool::new(true),
            counters: Arc::new(LightingCounters::default()),
        })
    }

    /// Queue a light update. False means the caller must do it synchronously.
    pub fn schedule_light_update(
        &self,
        world: Arc<dyn LightUpdater>,
        kind: LightKind,
        x: i32,
        y: i32,
        z: i32,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let counters = Arc::clone(&self.counters);
        let task = Box::new(move || {
            if !world.is_area_loaded(x, y, z, LOADED_AREA_RADIUS) {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            world.update_light(kind, x, y, z);
            counters.processed.fetch_add(1, Ordering::Relaxed);
        });

        match self.pool.try_submit(task) {
            Ok(()) => true,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        info!(
            "Async lighting {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    /// Updates waiting for the worker
    pub fn queue_size(&self) -> usize {
        self.pool.queued()
    }

    pub fn active_tasks(&self) -> usize {
        self.pool.active()
    }

    pub fn stats(&self) -> LightingStats {
        LightingStats {
            queued: self.pool.queued(),
            active: self.pool.active(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn await_completion(&self, timeout: Duration) -> bool {
        self.pool.await_completion(timeout)
    }

    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("Shutting down async lighting...");
        self.enabled.store(false, Ordering::Release);
        let drained = self.pool.shutdown(timeout);
        info!("Async lighting shut down");
        drained
    }
}
