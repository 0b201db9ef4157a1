use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::util::ChunkKey;
use crate::world::chunk::{ChunkSnapshot, Section, TileEntity};

/// Packets the chunk streamer hands to a player's connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundPacket {
    /// Full column payload, or an unload marker when it carries no sections
    ChunkData(ChunkDataPacket),
    /// Description of a block entity in a freshly sent chunk
    TileEntity(TileEntityPacket),
}

impl OutboundPacket {
    /// Key of the chunk this packet concerns
    pub fn chunk_key(&self) -> ChunkKey {
        match self {
            OutboundPacket::ChunkData(p) => p.key(),
            OutboundPacket::TileEntity(p) => ChunkKey::from_block(p.x, p.z),
        }
    }

    pub fn is_unload(&self) -> bool {
        matches!(self, OutboundPacket::ChunkData(p) if p.is_unload())
    }
}

/// Uncompressed body of a chunk data packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Present sections, bottom to top, matching the packet's section mask
    pub sections: Vec<Section>,
    pub biomes: Vec<u8>,
}

/// A chunk column on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDataPacket {
    pub x: i32,
    pub z: i32,
    /// Full column (as opposed to a section update)
    pub full_column: bool,
    /// Bit i set when section i is present in the payload
    pub section_mask: u16,
    /// bincode-encoded `ChunkPayload`, zlib-deflated once `compressed` is set
    pub payload: Vec<u8>,
    pub uncompressed_len: u32,
    pub compressed: bool,
}

impl ChunkDataPacket {
    /// Build the packet for a snapshot. The snapshot is consumed and released.
    pub fn make_for_send(snapshot: ChunkSnapshot) -> Result<Self, ProtocolError> {
        let section_mask = snapshot.section_mask();
        let ChunkSnapshot { key, sections, biomes } = snapshot;

        let sections: Vec<Section> = sections
            .into_iter()
            .enumerate()
            .filter(|(i, _)| section_mask & (1 << i) != 0)
            .filter_map(|(_, s)| s)
            .collect();

        let payload = encode(&ChunkPayload { sections, biomes })?;
        Ok(Self {
            x: key.x(),
            z: key.z(),
            full_column: true,
            section_mask,
            uncompressed_len: payload.len() as u32,
            payload,
            compressed: false,
        })
    }

    /// Empty full-column packet telling the client to drop the chunk
    pub fn make_for_unload(key: ChunkKey) -> Self {
        Self {
            x: key.x(),
            z: key.z(),
            full_column: true,
            section_mask: 0,
            payload: Vec::new(),
            uncompressed_len: 0,
            compressed: false,
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.x, self.z)
    }

    pub fn is_unload(&self) -> bool {
        self.full_column && self.section_mask == 0 && self.payload.is_empty()
    }

    /// Deflate the payload in place (no-op when already compressed)
    pub fn deflate(&mut self, level: u32) -> Result<(), ProtocolError> {
        if self.compressed {
            return Ok(());
        }
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(self.payload.len() / 4),
            Compression::new(level),
        );
        encoder.write_all(&self.payload)?;
        self.payload = encoder.finish()?;
        self.compressed = true;
        Ok(())
    }

    /// Decode the payload, inflating it first if needed
    pub fn inflate(&self) -> Result<ChunkPayload, ProtocolError> {
        if !self.compressed {
            return decode(&self.payload);
        }
        let mut raw = Vec::with_capacity(self.uncompressed_len as usize);
        ZlibDecoder::new(self.payload.as_slice()).read_to_end(&mut raw)?;
        if raw.len() != self.uncompressed_len as usize {
            return Err(ProtocolError::LengthMismatch {
                expected: self.uncompressed_len as usize,
                actual: raw.len(),
            });
        }
        decode(&raw)
    }
}

/// Block entity description sent after its chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileEntityPacket {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub kind: String,
    pub data: Vec<u8>,
}

impl TileEntityPacket {
    /// Description packet for a block entity, if it has anything to describe
    pub fn describe(tile: &TileEntity) -> Option<Self> {
        if tile.invalid || tile.data.is_empty() {
            return None;
        }
        Some(Self {
            x: tile.x,
            y: tile.y,
            z: tile.z,
            kind: tile.kind.clone(),
            data: tile.data.clone(),
        })
    }
}

/// Encode a message using bincode's legacy (fixed-int) configuration
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, ProtocolError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("Inflated {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Obfuscation hook panicked: {0}")]
    Obfuscation(String),
}
