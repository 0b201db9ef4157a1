//! Chunk columns and their immutable snapshots
//!
//! A `Chunk` guards its block data with a per-chunk `RwLock`, so taking a
//! `ChunkSnapshot` is atomic with respect to writers on the tick thread.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::constants::chunk::{BIOME_AREA, SECTIONS, SECTION_VOLUME};
use crate::util::chunk_key::ChunkKey;

/// 16x16x16 block storage of one vertical slice of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    /// Section index from the bottom of the column (0-15)
    pub y: u8,
    /// Block ids in YZX order
    pub blocks: Vec<u16>,
    /// Packed 4-bit block light
    pub block_light: Vec<u8>,
    /// Packed 4-bit sky light
    pub sky_light: Vec<u8>,
}

impl Section {
    pub fn empty(y: u8) -> Self {
        Self {
            y,
            blocks: vec![0; SECTION_VOLUME],
            block_light: vec![0; SECTION_VOLUME / 2],
            sky_light: vec![0xFF; SECTION_VOLUME / 2],
        }
    }

    #[inline]
    fn index(x: usize, y: usize, z: usize) -> usize {
        (y << 8) | (z << 4) | x
    }

    #[inline]
    pub fn block(&self, x: usize, y: usize, z: usize) -> u16 {
        self.blocks[Self::index(x, y, z)]
    }

    #[inline]
    pub fn set_block(&mut self, x: usize, y: usize, z: usize, id: u16) {
        self.blocks[Self::index(x, y, z)] = id;
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }
}

/// Block entity attached to a chunk (signs, skulls, chests...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileEntity {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub kind: String,
    /// Opaque serialized state sent in the description packet
    pub data: Vec<u8>,
    /// Removed from the world but not yet purged from the chunk
    pub invalid: bool,
}

/// Mutable contents of a chunk column
#[derive(Debug, Clone, Default)]
pub struct ChunkColumn {
    pub sections: Vec<Option<Section>>,
    pub biomes: Vec<u8>,
    pub tile_entities: Vec<TileEntity>,
}

impl ChunkColumn {
    pub fn new() -> Self {
        Self {
            sections: vec![None; SECTIONS],
            biomes: vec![0; BIOME_AREA],
            tile_entities: Vec::new(),
        }
    }

    /// Section at index `y`, allocating it if absent
    pub fn section_mut(&mut self, y: usize) -> &mut Section {
        self.sections[y].get_or_insert_with(|| Section::empty(y as u8))
    }
}

/// Who keeps a loaded chunk resident
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BindState {
    /// May be unloaded by the chunk provider at any time
    Unbound = 0,
    /// Bound for a player's send pipeline or watch set
    Player = 1,
    /// Bound by a world ticket (spawn area, forced chunks)
    Ticket = 2,
}

impl BindState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BindState::Player,
            2 => BindState::Ticket,
            _ => BindState::Unbound,
        }
    }
}

/// A loaded chunk column shared between the tick thread and background workers
#[derive(Debug)]
pub struct Chunk {
    key: ChunkKey,
    populated: AtomicBool,
    modified: AtomicBool,
    bind_state: AtomicU8,
    last_save_tick: AtomicU64,
    column: RwLock<ChunkColumn>,
}

impl Chunk {
    pub fn new(x: i32, z: i32) -> Self {
        Self::with_column(x, z, ChunkColumn::new())
    }

    pub fn with_column(x: i32, z: i32, column: ChunkColumn) -> Self {
        Self {
            key: ChunkKey::new(x, z),
            populated: AtomicBool::new(false),
            modified: AtomicBool::new(false),
            bind_state: AtomicU8::new(BindState::Unbound as u8),
            last_save_tick: AtomicU64::new(0),
            column: RwLock::new(column),
        }
    }

    #[inline]
    pub fn key(&self) -> ChunkKey {
        self.key
    }

    #[inline]
    pub fn x(&self) -> i32 {
        self.key.x()
    }

    #[inline]
    pub fn z(&self) -> i32 {
        self.key.z()
    }

    /// Terrain decoration has run (neighbours were present when it did)
    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn set_populated(&self, populated: bool) {
        self.populated.store(populated, Ordering::Release);
    }

    pub fn bind_state(&self) -> BindState {
        BindState::from_u8(self.bind_state.load(Ordering::Acquire))
    }

    pub fn set_bind_state(&self, state: BindState) {
        self.bind_state.store(state as u8, Ordering::Release);
    }

    pub fn needs_saving(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub fn mark_modified(&self) {
        self.modified.store(true, Ordering::Release);
    }

    /// Record a completed save at `tick`
    pub fn mark_saved(&self, tick: u64) {
        self.last_save_tick.store(tick, Ordering::Release);
        self.modified.store(false, Ordering::Release);
    }

    pub fn last_save_tick(&self) -> u64 {
        self.last_save_tick.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ChunkColumn> {
        self.column.read()
    }

    /// Write access; marks the chunk as needing a save
    pub fn write(&self) -> RwLockWriteGuard<'_, ChunkColumn> {
        self.mark_modified();
        self.column.write()
    }

    /// Copy of the tile entities that are still valid
    pub fn valid_tile_entities(&self) -> Vec<TileEntity> {
        self.column
            .read()
            .tile_entities
            .iter()
            .filter(|te| !te.invalid)
            .cloned()
            .collect()
    }

    /// Atomic copy of the block data
    pub fn snapshot(&self) -> ChunkSnapshot {
        ChunkSnapshot::of(self)
    }
}

/// Point-in-time copy of a chunk's blocks, owned by the compressor.
/// Dropping it releases the copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSnapshot {
    pub key: ChunkKey,
    pub sections: Vec<Option<Section>>,
    pub biomes: Vec<u8>,
}

impl ChunkSnapshot {
    pub fn of(chunk: &Chunk) -> Self {
        let column = chunk.column.read();
        Self {
            key: chunk.key,
            sections: column.sections.clone(),
            biomes: column.biomes.clone(),
        }
    }

    /// Bitmask of present, non-empty sections
    pub fn section_mask(&self) -> u16 {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_ref().is_some_and(|s| !s.is_empty()))
            .fold(0u16, |mask, (i, _)| mask | (1 << i))
    }
}
