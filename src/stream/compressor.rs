//! The chunk compressor: one background thread shared by every player of a
//! session, so compression work is totally ordered.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::Metrics;
use crate::services::worker::{ServiceError, Task, WorkerPool};

const COMPRESSOR_NAME: &str = "chunk-compressor";

pub struct CompressorPool {
    pool: WorkerPool,
    metrics: Arc<Metrics>,
}

impl CompressorPool {
    pub fn new(metrics: Arc<Metrics>) -> Result<Self, ServiceError> {
        Ok(Self {
            pool: WorkerPool::new(COMPRESSOR_NAME, 1, None)?,
            metrics,
        })
    }

    pub(crate) fn submit(&self, task: Task) -> Result<(), ServiceError> {
        self.pool.submit(task)?;
        self.metrics
            .compressor_backlog
            .store(self.pool.pending() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Jobs submitted and not yet finished
    pub fn backlog(&self) -> usize {
        self.pool.pending()
    }

    /// Wait for every submitted job to finish
    pub fn flush(&self, timeout: Duration) -> bool {
        let drained = self.pool.await_completion(timeout);
        self.metrics
            .compressor_backlog
            .store(self.pool.pending() as u64, Ordering::Relaxed);
        drained
    }

    /// Finish queued jobs and stop the thread. Later submissions are rejected.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_shut_down()
    }
}
