pub mod chunk_key;
pub mod direction;
pub mod vec3;

pub use chunk_key::{ChunkKey, SectorKey};
pub use direction::DirectionFace;
pub use vec3::Vec3;
