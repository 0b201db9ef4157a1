use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

use crate::util::chunk_key::{ChunkKey, SectorKey};

/// World-space position in blocks
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    #[inline]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn length_sq(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    #[inline]
    pub fn distance_sq_to(&self, other: Vec3) -> f64 {
        (*self - other).length_sq()
    }

    /// Squared distance ignoring the vertical axis
    #[inline]
    pub fn horizontal_distance_sq_to(&self, other: Vec3) -> f64 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        dx * dx + dz * dz
    }

    /// Chunk column containing this position
    #[inline]
    pub fn chunk(&self) -> ChunkKey {
        ChunkKey::from_position(self.x, self.z)
    }

    /// Chunk coordinates (x, z) containing this position
    #[inline]
    pub fn chunk_coords(&self) -> (i32, i32) {
        ((self.x.floor() as i32) >> 4, (self.z.floor() as i32) >> 4)
    }

    /// Spatial-index sector containing this position
    #[inline]
    pub fn sector(&self) -> SectorKey {
        SectorKey::from_position(self.x, self.z)
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}
