use std::cmp::Ordering;

use crate::util::{ChunkKey, DirectionFace};

/// Orders chunk keys so that the most urgent chunk sorts last.
///
/// Priority is the squared distance from the center chunk with the component
/// along the facing direction halved when it lies ahead of the player, all
/// scaled by 4 to stay in integers. Chunks ahead therefore win over chunks at
/// the same distance behind. Ties fall back to the packed key so the order is
/// total.
#[derive(Debug, Clone, Copy)]
pub struct DistanceComparator {
    cx: i32,
    cz: i32,
    fx: i64,
    fz: i64,
}

impl DistanceComparator {
    pub fn new(cx: i32, cz: i32, facing: DirectionFace) -> Self {
        let (fx, fz) = if facing.is_horizontal() {
            (facing.dx() as i64, facing.dz() as i64)
        } else {
            (0, 0)
        };
        Self { cx, cz, fx, fz }
    }

    /// Weighted squared distance; smaller is more urgent
    #[inline]
    pub fn priority(&self, key: ChunkKey) -> i64 {
        let dx = (key.x() - self.cx) as i64;
        let dz = (key.z() - self.cz) as i64;

        if self.fx == 0 && self.fz == 0 {
            return 4 * (dx * dx + dz * dz);
        }

        let along = dx * self.fx + dz * self.fz;
        let across = dx * self.fz - dz * self.fx;
        let along_sq = along * along;
        4 * across * across + if along > 0 { along_sq } else { 4 * along_sq }
    }

    /// Farther keys first, nearest (forward-biased) at the tail
    #[inline]
    pub fn compare(&self, a: ChunkKey, b: ChunkKey) -> Ordering {
        self.priority(b)
            .cmp(&self.priority(a))
            .then_with(|| b.raw().cmp(&a.raw()))
    }
}
