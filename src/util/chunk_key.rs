//! Packed 32-bit keys for chunk and sector coordinates
//!
//! Both key kinds store the X coordinate in the high 16 bits and the Z
//! coordinate in the low 16 bits, each as a two's-complement `i16`.
//! Coordinates outside the `i16` range wrap.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::spatial::SECTOR_SHIFT;

#[inline(always)]
const fn pack(x: i32, z: i32) -> u32 {
    ((x as u32 & 0xFFFF) << 16) | (z as u32 & 0xFFFF)
}

#[inline(always)]
const fn unpack_high(raw: u32) -> i32 {
    (raw >> 16) as u16 as i16 as i32
}

#[inline(always)]
const fn unpack_low(raw: u32) -> i32 {
    raw as u16 as i16 as i32
}

/// Key of a 16x256x16 chunk column
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey(u32);

impl ChunkKey {
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self(pack(x, z))
    }

    /// Key of the chunk containing a block coordinate
    #[inline]
    pub const fn from_block(block_x: i32, block_z: i32) -> Self {
        Self::new(block_x >> 4, block_z >> 4)
    }

    /// Key of the chunk containing a world position
    #[inline]
    pub fn from_position(x: f64, z: f64) -> Self {
        Self::from_block(x.floor() as i32, z.floor() as i32)
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn x(self) -> i32 {
        unpack_high(self.0)
    }

    #[inline]
    pub const fn z(self) -> i32 {
        unpack_low(self.0)
    }

    /// Chebyshev distance in chunks to another chunk coordinate
    #[inline]
    pub fn chunk_distance(self, x: i32, z: i32) -> i32 {
        (self.x() - x).abs().max((self.z() - z).abs())
    }

    /// Whether this chunk lies inside the square of `radius` around (x, z)
    #[inline]
    pub fn within(self, x: i32, z: i32, radius: i32) -> bool {
        self.chunk_distance(x, z) <= radius
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkKey({}, {})", self.x(), self.z())
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x(), self.z())
    }
}

/// Iterate every chunk key in the square of `radius` around (cx, cz), row by row
pub fn square(cx: i32, cz: i32, radius: i32) -> impl Iterator<Item = ChunkKey> {
    (cx - radius..=cx + radius)
        .flat_map(move |x| (cz - radius..=cz + radius).map(move |z| ChunkKey::new(x, z)))
}

/// Key of a 16x16 block tile of the player spatial index
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorKey(u32);

impl SectorKey {
    #[inline]
    pub const fn new(sector_x: i32, sector_z: i32) -> Self {
        Self(pack(sector_x, sector_z))
    }

    /// Sector containing a block coordinate
    #[inline]
    pub const fn from_block(block_x: i32, block_z: i32) -> Self {
        Self::new(block_x >> SECTOR_SHIFT, block_z >> SECTOR_SHIFT)
    }

    /// Sector containing a world position
    #[inline]
    pub fn from_position(x: f64, z: f64) -> Self {
        Self::from_block(x.floor() as i32, z.floor() as i32)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn x(self) -> i32 {
        unpack_high(self.0)
    }

    #[inline]
    pub const fn z(self) -> i32 {
        unpack_low(self.0)
    }
}

impl fmt::Debug for SectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorKey({}, {})", self.x(), self.z())
    }
}
