//! Per-player chunk streaming
//!
//! `scheduler` decides what to send and when; `pipeline` carries each chunk
//! through load, compression and hand-off to the transport; `session` ties
//! the players of one world together.

pub mod comparator;
pub mod compressor;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod rate;
pub mod scheduler;
pub mod session;
pub mod stats;

pub use comparator::DistanceComparator;
pub use compressor::CompressorPool;
pub use pipeline::{AttemptId, LoadRequest};
pub use protocol::{ChunkDataPacket, OutboundPacket, TileEntityPacket};
pub use queue::SendQueue;
pub use rate::RateController;
pub use scheduler::{ChunkSendScheduler, SchedulerError};
pub use session::{SessionError, StreamSession};
pub use stats::{StreamSnapshot, StreamStats};
