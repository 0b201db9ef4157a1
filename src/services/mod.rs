//! Explicitly constructed background services
//!
//! Each service owns its worker threads and is drained by `shutdown`.

pub mod worker;

#[cfg(feature = "services")]
pub mod lighting;
#[cfg(feature = "services")]
pub mod saver;

pub use worker::{ServiceError, Task, WorkerPool};

#[cfg(feature = "services")]
pub use lighting::{LightKind, LightUpdater, LightingQueue};
#[cfg(feature = "services")]
pub use saver::{AsyncChunkSaver, ChunkStore, SaveError, SaveHandle, SaveStats};
