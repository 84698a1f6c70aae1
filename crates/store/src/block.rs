//! Block framing and payload dispatch.
//!
//! Every block in the file is a frame:
//!
//! ```text
//! [payload_len: u64 LE][crc32: u32 LE][kind: u8][id: u64 LE][payload ...]
//! ```
//!
//! The CRC32 covers `kind`, `id`, and the payload, so a frame read from the
//! wrong offset or half-written by a crash is rejected.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use value::Value;

use crate::big_vector::VectorChunk;
use crate::error::{Result, StoreError};
use crate::index::BlockIndex;
use crate::partial_map::PartialMap;
use crate::BlockId;

/// Size of the frame header preceding each payload: len (8) + crc (4) +
/// kind (1) + id (8).
pub const BLOCK_HEADER_BYTES: u64 = 8 + 4 + 1 + 8;

/// Largest payload the reader will allocate for (1 GiB). Guards against
/// garbage lengths in corrupt files.
pub const MAX_PAYLOAD_BYTES: u64 = 1024 * 1024 * 1024;

/// Encoded size of an optional block id: present flag (1) + id (8).
pub const OPT_ID_BYTES: usize = 1 + 8;

/// The payload variants a block can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockKind {
    Index = 1,
    Value = 2,
    PartialMap = 3,
    VectorChunk = 4,
}

impl BlockKind {
    #[must_use]
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(BlockKind::Index),
            2 => Some(BlockKind::Value),
            3 => Some(BlockKind::PartialMap),
            4 => Some(BlockKind::VectorChunk),
            _ => None,
        }
    }
}

/// A decoded block.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Index(BlockIndex),
    Value(Value),
    PartialMap(PartialMap),
    VectorChunk(Arc<VectorChunk>),
}

impl Block {
    #[must_use]
    pub fn kind(&self) -> BlockKind {
        match self {
            Block::Index(_) => BlockKind::Index,
            Block::Value(_) => BlockKind::Value,
            Block::PartialMap(_) => BlockKind::PartialMap,
            Block::VectorChunk(_) => BlockKind::VectorChunk,
        }
    }

    /// Decodes a payload according to its stored kind.
    pub fn decode(kind: BlockKind, payload: &[u8]) -> Result<Block> {
        Ok(match kind {
            BlockKind::Index => Block::Index(BlockIndex::decode_payload(payload)?),
            BlockKind::Value => Block::Value(Value::from_bytes(payload)?),
            BlockKind::PartialMap => Block::PartialMap(PartialMap::decode_payload(payload)?),
            BlockKind::VectorChunk => {
                Block::VectorChunk(Arc::new(VectorChunk::decode_payload(payload)?))
            }
        })
    }

    /// Ids of every block this block points at: partial-map parents, chunk
    /// `prev` links, and `BlockRef`s embedded in values. Index blocks point
    /// at nothing; they are rebuilt rather than followed.
    #[must_use]
    pub fn block_refs(&self) -> Vec<BlockId> {
        let mut refs = Vec::new();
        match self {
            Block::Index(_) => {}
            Block::Value(v) => v.collect_block_refs(&mut refs),
            Block::PartialMap(pm) => {
                refs.extend(pm.parent);
                for (k, v) in &pm.shallow {
                    k.collect_block_refs(&mut refs);
                    v.collect_block_refs(&mut refs);
                }
            }
            Block::VectorChunk(chunk) => {
                refs.extend(chunk.prev);
                for item in &chunk.items {
                    item.collect_block_refs(&mut refs);
                }
            }
        }
        refs
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u64,
    pub crc: u32,
    pub kind: BlockKind,
    pub id: BlockId,
}

impl FrameHeader {
    /// Bytes occupied by the whole frame.
    #[must_use]
    pub fn frame_len(&self) -> u64 {
        BLOCK_HEADER_BYTES + self.len
    }
}

fn frame_crc(kind: BlockKind, id: BlockId, payload: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(&[kind as u8]);
    hasher.update(&id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Builds a complete frame so it can be written with a single `write_all`.
pub fn encode_frame(id: BlockId, kind: BlockKind, payload: &[u8]) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(BLOCK_HEADER_BYTES as usize + payload.len());
    buf.write_u64::<LittleEndian>(payload.len() as u64)?;
    buf.write_u32::<LittleEndian>(frame_crc(kind, id, payload))?;
    buf.write_u8(kind as u8)?;
    buf.write_u64::<LittleEndian>(id)?;
    buf.write_all(payload)?;
    Ok(buf)
}

/// Reads and sanity-checks the frame header at `offset`.
pub fn read_frame_header<R: Read + Seek>(r: &mut R, offset: u64) -> Result<FrameHeader> {
    r.seek(SeekFrom::Start(offset))?;
    let len = r.read_u64::<LittleEndian>()?;
    let crc = r.read_u32::<LittleEndian>()?;
    let kind_byte = r.read_u8()?;
    let id = r.read_u64::<LittleEndian>()?;

    let kind = BlockKind::from_u8(kind_byte).ok_or_else(|| StoreError::Corrupt {
        offset,
        reason: format!("unknown block kind {}", kind_byte),
    })?;
    if len > MAX_PAYLOAD_BYTES {
        return Err(StoreError::Corrupt {
            offset,
            reason: format!("payload length {} exceeds maximum {}", len, MAX_PAYLOAD_BYTES),
        });
    }
    Ok(FrameHeader { len, crc, kind, id })
}

/// Reads the frame at `offset` and verifies its CRC. Leaves the cursor just
/// past the frame.
pub fn read_frame<R: Read + Seek>(r: &mut R, offset: u64) -> Result<(FrameHeader, Vec<u8>)> {
    let header = read_frame_header(r, offset)?;
    let mut payload = vec![0u8; header.len as usize];
    r.read_exact(&mut payload)?;

    let actual = frame_crc(header.kind, header.id, &payload);
    if actual != header.crc {
        return Err(StoreError::Corrupt {
            offset,
            reason: format!(
                "CRC32 mismatch: expected {:#010x}, got {:#010x}",
                header.crc, actual
            ),
        });
    }
    Ok((header, payload))
}

// -------------------- Payload helpers --------------------

/// Writes an optional block id as a fixed-width `[present: u8][id: u64]`.
pub(crate) fn write_opt_id<W: Write>(w: &mut W, id: Option<BlockId>) -> io::Result<()> {
    match id {
        Some(id) => {
            w.write_u8(1)?;
            w.write_u64::<LittleEndian>(id)
        }
        None => {
            w.write_u8(0)?;
            w.write_u64::<LittleEndian>(0)
        }
    }
}

pub(crate) fn read_opt_id<R: Read>(r: &mut R) -> Result<Option<BlockId>> {
    let present = r.read_u8()?;
    let id = r.read_u64::<LittleEndian>()?;
    match present {
        0 => Ok(None),
        1 => Ok(Some(id)),
        other => Err(payload_error(format!("invalid option flag {}", other))),
    }
}

/// A payload that decoded but did not consume all of its bytes.
pub(crate) fn ensure_consumed(rest: &[u8]) -> Result<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(payload_error(format!("{} trailing bytes in payload", rest.len())))
    }
}

/// Payload-level corruption. The frame CRC already passed, so the bytes are
/// what was written; the offset is filled in as 0 since payload decoders do
/// not know where they live.
pub(crate) fn payload_error(reason: String) -> StoreError {
    StoreError::Corrupt { offset: 0, reason }
}
