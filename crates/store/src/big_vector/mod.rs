//! # Big Vector - a sequence stored as a backward-linked chain of chunks
//!
//! A history can run to millions of operations, far more than anyone wants
//! to hold in one block. The writer cuts the sequence into fixed-size
//! chunks; each chunk names the chunk before it and how many items precede
//! it, so the last chunk id alone identifies the whole vector and its
//! length.
//!
//! ## Chunk payload
//!
//! ```text
//! [prev: present u8 + id u64][count_before: u64][count: u32][item: Value ...]
//! ```
//!
//! The first 21 bytes are fixed-width so the reader can walk the chain by
//! reading only chunk headers.

mod reader;
mod writer;

pub use reader::{BigVector, Iter};
pub use writer::{ChunkHook, VectorWriter};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use value::Value;

use crate::block::{ensure_consumed, payload_error, read_opt_id, write_opt_id, OPT_ID_BYTES};
use crate::error::Result;
use crate::BlockId;

/// Fixed-width prefix of a chunk payload: prev (9) + count_before (8) +
/// count (4).
pub const CHUNK_HEADER_BYTES: usize = OPT_ID_BYTES + 8 + 4;

/// A decoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorChunk {
    /// The chunk holding the items just before this one.
    pub prev: Option<BlockId>,
    /// Number of items in all earlier chunks.
    pub count_before: u64,
    pub items: Vec<Value>,
}

/// The link fields of a chunk, readable without decoding its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub prev: Option<BlockId>,
    pub count_before: u64,
    pub count: u64,
}

impl ChunkHeader {
    /// Length of the vector ending at this chunk.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.count_before + self.count
    }
}

impl VectorChunk {
    #[must_use]
    pub fn header(&self) -> ChunkHeader {
        ChunkHeader {
            prev: self.prev,
            count_before: self.count_before,
            count: self.items.len() as u64,
        }
    }

    pub(crate) fn encode_payload(
        prev: Option<BlockId>,
        count_before: u64,
        items: &[Value],
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CHUNK_HEADER_BYTES + items.len() * 16);
        write_opt_id(&mut buf, prev)?;
        buf.write_u64::<LittleEndian>(count_before)?;
        let count = u32::try_from(items.len())
            .map_err(|_| payload_error("vector chunk has too many items".to_string()))?;
        buf.write_u32::<LittleEndian>(count)?;
        for item in items {
            item.encode(&mut buf)?;
        }
        Ok(buf)
    }

    pub(crate) fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        let prev = read_opt_id(&mut rdr)?;
        let count_before = rdr.read_u64::<LittleEndian>()?;
        let count = rdr.read_u32::<LittleEndian>()? as usize;
        // Every encoded value takes at least one byte.
        if count > rdr.len() {
            return Err(payload_error(format!(
                "vector chunk claims {} items but only {} bytes remain",
                count,
                rdr.len()
            )));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(Value::decode(&mut rdr)?);
        }
        ensure_consumed(rdr)?;
        Ok(Self {
            prev,
            count_before,
            items,
        })
    }
}
