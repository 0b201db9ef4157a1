pub mod chunk;
pub mod host;
pub mod spatial;

pub use chunk::{BindState, Chunk, ChunkColumn, ChunkSnapshot, Section, TileEntity};
pub use host::{
    ChunkLoadService, ChunkObfuscator, IndexedPlayer, LoadError, NoObfuscation, PacketSink,
    PlayerId, StreamingPlayer, TransportError, WatchError, WatcherRegistry, WorldHost,
    WriteListener,
};
pub use spatial::PlayerSpatialIndex;
