//! Sector-hashed index of online players
//!
//! Divides the world into 16x16 block sectors keyed by `SectorKey` and keeps
//! the players of each sector in a small inline list. Radius queries only
//! visit the sectors overlapping the query square, closest-player searches
//! walk rings of sectors outward and stop once no unscanned sector can hold
//! a closer player.

use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::constants::spatial::{SECTOR_SHIFT, UNBOUNDED_SEARCH_RINGS};
use crate::util::{SectorKey, Vec3};
use crate::world::host::{IndexedPlayer, PlayerId};

/// Players stored inline per sector before spilling to the heap
const SECTOR_INLINE: usize = 4;

/// Initial capacity of the sector map
const INDEX_INITIAL_CAPACITY: usize = 256;

type SectorList<P> = SmallVec<[Arc<P>; SECTOR_INLINE]>;

/// Inclusive sector range covering the square of `radius` around (x, z)
#[inline]
fn sector_range(x: f64, z: f64, radius: f64) -> (i32, i32, i32, i32) {
    (
        ((x - radius).floor() as i32) >> SECTOR_SHIFT,
        ((x + radius).floor() as i32) >> SECTOR_SHIFT,
        ((z - radius).floor() as i32) >> SECTOR_SHIFT,
        ((z + radius).floor() as i32) >> SECTOR_SHIFT,
    )
}

/// Number of sectors a radius query around (x, z) visits
pub fn sectors_in_range(x: f64, z: f64, radius: f64) -> usize {
    let (min_x, max_x, min_z, max_z) = sector_range(x, z, radius);
    ((max_x - min_x + 1) * (max_z - min_z + 1)) as usize
}

/// Spatial index of players. Mutated from the tick thread only.
pub struct PlayerSpatialIndex<P: IndexedPlayer + ?Sized> {
    sectors: HashMap<SectorKey, SectorList<P>, FxBuildHasher>,
    /// Sector each player was last filed under
    player_sectors: HashMap<PlayerId, SectorKey, FxBuildHasher>,
}

impl<P: IndexedPlayer + ?Sized> PlayerSpatialIndex<P> {
    pub fn new() -> Self {
        Self {
            sectors: HashMap::with_capacity_and_hasher(INDEX_INITIAL_CAPACITY, FxBuildHasher),
            player_sectors: HashMap::with_capacity_and_hasher(INDEX_INITIAL_CAPACITY, FxBuildHasher),
        }
    }

    /// Insert a player or move it to the sector of its current position
    pub fn upsert(&mut self, player: &Arc<P>) {
        let id = player.id();
        let sector = player.position().sector();

        match self.player_sectors.insert(id, sector) {
            Some(previous) if previous == sector => return,
            Some(previous) => self.detach_from(previous, id),
            None => {}
        }

        self.sectors
            .entry(sector)
            .or_default()
            .push(Arc::clone(player));
    }

    /// Remove a player. Returns false if it was not indexed.
    pub fn remove(&mut self, id: PlayerId) -> bool {
        match self.player_sectors.remove(&id) {
            Some(sector) => {
                self.detach_from(sector, id);
                true
            }
            None => false,
        }
    }

    fn detach_from(&mut self, sector: SectorKey, id: PlayerId) {
        if let Some(list) = self.sectors.get_mut(&sector) {
            if let Some(idx) = list.iter().position(|p| p.id() == id) {
                list.swap_remove(idx);
            }
            if list.is_empty() {
                self.sectors.remove(&sector);
            }
        }
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.player_sectors.contains_key(&id)
    }

    /// Visit every player within horizontal `radius` of (x, z) without allocating
    #[inline]
    pub fn for_each_in_radius<F>(&self, x: f64, z: f64, radius: f64, mut callback: F)
    where
        F: FnMut(&Arc<P>),
    {
        let radius_sq = radius * radius;
        let center = Vec3::new(x, 0.0, z);
        let (min_x, max_x, min_z, max_z) = sector_range(x, z, radius);

        for sx in min_x..=max_x {
            for sz in min_z..=max_z {
                let Some(list) = self.sectors.get(&SectorKey::new(sx, sz)) else {
                    continue;
                };
                for player in list {
                    if player.position().horizontal_distance_sq_to(center) <= radius_sq {
                        callback(player);
                    }
                }
            }
        }
    }

    /// Players within horizontal `radius` of (x, z)
    pub fn players_in_radius(&self, x: f64, z: f64, radius: f64) -> Vec<Arc<P>> {
        let mut found = Vec::new();
        self.for_each_in_radius(x, z, radius, |p| found.push(Arc::clone(p)));
        found
    }

    /// Players within spherical `radius` of (x, y, z)
    pub fn players_in_radius_3d(&self, x: f64, y: f64, z: f64, radius: f64) -> Vec<Arc<P>> {
        let radius_sq = radius * radius;
        let center = Vec3::new(x, y, z);
        let mut found = Vec::new();
        self.for_each_in_radius(x, z, radius, |p| {
            if p.position().distance_sq_to(center) <= radius_sq {
                found.push(Arc::clone(p));
            }
        });
        found
    }

    /// Closest player to (x, y, z) within `max_radius` (3D distance).
    /// A negative radius searches up to a fixed number of rings.
    pub fn closest_player(&self, x: f64, y: f64, z: f64, max_radius: f64) -> Option<Arc<P>> {
        let center = Vec3::new(x, y, z);
        let (max_rings, limit_sq) = if max_radius < 0.0 {
            (UNBOUNDED_SEARCH_RINGS, f64::INFINITY)
        } else {
            (((max_radius.ceil() as i32) >> SECTOR_SHIFT) + 1, max_radius * max_radius)
        };
        let origin = center.sector();
        let (ox, oz) = (origin.x(), origin.z());

        let mut best: Option<(f64, &Arc<P>)> = None;

        for ring in 0..=max_rings {
            for sx in ox - ring..=ox + ring {
                for sz in oz - ring..=oz + ring {
                    // Interior sectors were scanned by earlier rings
                    if (sx - ox).abs() != ring && (sz - oz).abs() != ring {
                        continue;
                    }
                    let Some(list) = self.sectors.get(&SectorKey::new(sx, sz)) else {
                        continue;
                    };
                    for player in list {
                        let dist_sq = player.position().distance_sq_to(center);
                        if dist_sq <= limit_sq && best.map_or(true, |(d, _)| dist_sq < d) {
                            best = Some((dist_sq, player));
                        }
                    }
                }
            }

            if let Some((dist_sq, _)) = best {
                // Gap from the query point to the nearest unscanned sector
                let min_x = ((ox - ring) << SECTOR_SHIFT) as f64;
                let max_x = ((ox + ring + 1) << SECTOR_SHIFT) as f64;
                let min_z = ((oz - ring) << SECTOR_SHIFT) as f64;
                let max_z = ((oz + ring + 1) << SECTOR_SHIFT) as f64;
                let gap = (x - min_x).min(max_x - x).min(z - min_z).min(max_z - z);
                if dist_sq <= gap * gap {
                    break;
                }
            }
        }

        best.map(|(_, p)| Arc::clone(p))
    }

    pub fn clear(&mut self) {
        self.sectors.clear();
        self.player_sectors.clear();
    }

    /// Number of non-empty sectors
    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn player_count(&self) -> usize {
        self.player_sectors.len()
    }

    pub fn stats(&self) -> SpatialIndexStats {
        SpatialIndexStats {
            sectors: self.sectors.len(),
            players: self.player_sectors.len(),
            max_per_sector: self.sectors.values().map(|s| s.len()).max().unwrap_or(0),
        }
    }
}

impl<P: IndexedPlayer + ?Sized> Default for PlayerSpatialIndex<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the spatial index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpatialIndexStats {
    pub sectors: usize,
    pub players: usize,
    pub max_per_sector: usize,
}
