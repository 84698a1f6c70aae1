//! # Block Index - the commit point
//!
//! The index maps every block id to its byte offset and names the current
//! root. It is itself stored as a block (recording its own id and offset),
//! and the header's index pointer is switched to it only after the block is
//! durable. Until that pointer write, nothing new is visible to readers.
//!
//! ## Payload
//!
//! ```text
//! [root: present u8 + id u64][count: u32][(id: u64, offset: u64) ...]
//! ```
//!
//! ## Recovery
//!
//! If the pointer does not lead to an intact index block (torn pointer
//! write, or the file was cut short), the loader scans the block stream from
//! the first block and keeps the last index frame whose CRC checks out. The
//! scan stops at the first frame that is truncated or fails its CRC.
//!
//! A writable handle truncates blocks written after a valid index, since
//! they were never committed. After a recovery scan nothing is truncated:
//! new blocks go after the existing bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use tracing::{debug, warn};

use crate::block::{
    ensure_consumed, payload_error, read_frame, read_frame_header, read_opt_id, write_opt_id,
    BlockKind,
};
use crate::error::{Result, StoreError};
use crate::format::{self, HEADER_BYTES};
use crate::handle::{Handle, Inner};
use crate::BlockId;

/// In-memory block index: `{root, blocks}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockIndex {
    /// Block the file currently represents; `None` before the first root
    /// is committed.
    pub root: Option<BlockId>,
    /// Block id -> byte offset of its frame.
    pub blocks: BTreeMap<BlockId, u64>,
}

impl BlockIndex {
    /// Highest id recorded, or 0 for an empty index.
    #[must_use]
    pub fn max_id(&self) -> BlockId {
        self.blocks.keys().next_back().copied().unwrap_or(0)
    }

    /// All known ids, ascending.
    #[must_use]
    pub fn known_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub(crate) fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(13 + self.blocks.len() * 16);
        write_opt_id(&mut buf, self.root)?;
        let count = u32::try_from(self.blocks.len())
            .map_err(|_| payload_error("block index has too many entries".to_string()))?;
        buf.write_u32::<LittleEndian>(count)?;
        for (id, offset) in &self.blocks {
            buf.write_u64::<LittleEndian>(*id)?;
            buf.write_u64::<LittleEndian>(*offset)?;
        }
        Ok(buf)
    }

    pub(crate) fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        let root = read_opt_id(&mut rdr)?;
        let count = rdr.read_u32::<LittleEndian>()? as usize;
        if count.saturating_mul(16) > rdr.len() {
            return Err(payload_error(format!(
                "block index claims {} entries but only {} bytes remain",
                count,
                rdr.len()
            )));
        }
        let mut blocks = BTreeMap::new();
        for _ in 0..count {
            let id = rdr.read_u64::<LittleEndian>()?;
            let offset = rdr.read_u64::<LittleEndian>()?;
            blocks.insert(id, offset);
        }
        ensure_consumed(rdr)?;
        Ok(Self { root, blocks })
    }
}

impl Inner {
    /// Appends the current index as a new block and points the header at
    /// it. This is the only place a commit happens.
    pub(crate) fn commit(&mut self) -> Result<BlockId> {
        self.ensure_writable()?;
        let id = self.alloc_id();
        let offset = self.cursor;
        // The index lists itself so that readers see every live block.
        self.index.blocks.insert(id, offset);

        let written = self
            .index
            .encode_payload()
            .and_then(|payload| self.write_frame_at(offset, id, BlockKind::Index, &payload));
        let frame_len = match written {
            Ok(n) => n,
            Err(e) => {
                self.index.blocks.remove(&id);
                return Err(e);
            }
        };
        self.cursor = offset + frame_len;
        self.sync_data()?;

        format::write_index_pointer(&mut self.file, offset)?;
        self.sync_data()?;

        debug!(index_id = id, offset, root = ?self.index.root, "committed block index");
        Ok(id)
    }

    pub(crate) fn load_index(&mut self) -> Result<()> {
        let pointer = format::read_index_pointer(&mut self.file)?.ok_or(StoreError::NoBlockIndex)?;

        let (index, end, recovered) = match read_index_at(&mut self.file, pointer) {
            Ok((index, end)) => (index, end, false),
            Err(e) => {
                warn!(
                    offset = pointer,
                    error = %e,
                    "block index pointer is invalid; scanning for last intact index"
                );
                let (index, end) =
                    scan_for_index(&mut self.file)?.ok_or_else(|| StoreError::Corrupt {
                        offset: pointer,
                        reason: "index pointer is invalid and no intact index block was found"
                            .to_string(),
                    })?;
                (index, end, true)
            }
        };

        if self.is_writable() {
            let file_len = self.file.metadata()?.len();
            if recovered {
                // The scan stops at the first bad frame, so bytes past `end`
                // may hold later commits. Keep them and append after.
                if file_len > end {
                    warn!(
                        offset = end,
                        kept = file_len - end,
                        "keeping bytes past recovered index"
                    );
                }
                self.cursor = file_len.max(end);
            } else {
                // Anything past the committed index was never visible; drop
                // it so new blocks follow the last commit directly.
                if file_len > end {
                    warn!(
                        offset = end,
                        dropped = file_len - end,
                        "discarding uncommitted blocks"
                    );
                    self.file.set_len(end)?;
                }
                self.cursor = end;
            }
        }
        self.next_id = self.next_id.max(index.max_id() + 1);
        debug!(blocks = index.blocks.len(), root = ?index.root, "loaded block index");
        self.index = index;
        // Ids are only unique within one committed history; a crashed writer
        // may have left uncommitted blocks whose ids are reused later.
        self.cache.clear();
        Ok(())
    }
}

/// Reads the index block at `offset`, returning it with the offset just past
/// its frame.
fn read_index_at(file: &mut File, offset: u64) -> Result<(BlockIndex, u64)> {
    if offset < HEADER_BYTES {
        return Err(StoreError::Corrupt {
            offset,
            reason: "index pointer points inside the header".to_string(),
        });
    }
    let header = read_frame_header(file, offset)?;
    if offset + header.frame_len() > file.metadata()?.len() {
        return Err(StoreError::Corrupt {
            offset,
            reason: "index block extends past end of file".to_string(),
        });
    }
    let (header, payload) = read_frame(file, offset)?;
    if header.kind != BlockKind::Index {
        return Err(StoreError::UnexpectedBlockKind {
            id: header.id,
            expected: BlockKind::Index,
            actual: header.kind,
        });
    }
    Ok((BlockIndex::decode_payload(&payload)?, offset + header.frame_len()))
}

/// Walks frames from the first block, returning the last intact index.
fn scan_for_index(file: &mut File) -> Result<Option<(BlockIndex, u64)>> {
    let file_len = file.metadata()?.len();
    let mut offset = HEADER_BYTES;
    let mut found = None;

    while offset < file_len {
        let header = match read_frame_header(file, offset) {
            Ok(header) => header,
            Err(StoreError::Io(_)) | Err(StoreError::Corrupt { .. }) => break,
            Err(e) => return Err(e),
        };
        if offset + header.frame_len() > file_len {
            break;
        }
        let payload = match read_frame(file, offset) {
            Ok((_, payload)) => payload,
            Err(StoreError::Io(_)) | Err(StoreError::Corrupt { .. }) => break,
            Err(e) => return Err(e),
        };
        if header.kind == BlockKind::Index {
            if let Ok(index) = BlockIndex::decode_payload(&payload) {
                found = Some((index, offset + header.frame_len()));
            }
        }
        offset += header.frame_len();
    }
    Ok(found)
}

impl Handle {
    /// Serializes the in-memory index as a new block and makes it current.
    /// Returns the id of the index block.
    pub fn write_block_index(&self) -> Result<BlockId> {
        self.lock()?.commit()
    }

    /// Loads the index the header currently points at, replacing this
    /// handle's snapshot. On a writable handle, blocks written after that
    /// index are discarded and appends resume right after it.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoBlockIndex`] if nothing has been committed yet.
    pub fn load_block_index(&self) -> Result<()> {
        self.lock()?.load_index()
    }

    /// Sets the root in memory. Not durable until the next
    /// [`write_block_index`](Handle::write_block_index).
    ///
    /// # Errors
    ///
    /// [`StoreError::BlockNotFound`] if `id` is not in the index.
    pub fn set_root(&self, id: BlockId) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_known(id)?;
        inner.index.root = Some(id);
        Ok(())
    }

    /// Sets the root and commits in one step, so a concurrent writer on the
    /// same handle cannot slip a different root in between.
    pub fn commit_root(&self, id: BlockId) -> Result<BlockId> {
        let mut inner = self.lock()?;
        inner.ensure_known(id)?;
        inner.index.root = Some(id);
        inner.commit()
    }

    /// The root of this handle's index snapshot.
    pub fn root(&self) -> Result<Option<BlockId>> {
        Ok(self.lock()?.index.root)
    }

    /// A copy of this handle's index snapshot.
    pub fn block_index(&self) -> Result<BlockIndex> {
        Ok(self.lock()?.index.clone())
    }
}
