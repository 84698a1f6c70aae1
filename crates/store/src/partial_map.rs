//! Layered maps.
//!
//! A partial map block stores only the keys that changed plus a link to the
//! layer underneath. Updating a test record therefore appends a few bytes
//! instead of rewriting the whole record, and every older layer stays
//! readable as a snapshot.
//!
//! ## Payload
//!
//! ```text
//! [parent: present u8 + id u64][count: u32][(key: Value, value: Value) ...]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use value::Value;

use crate::block::{ensure_consumed, payload_error, read_opt_id, write_opt_id, Block, BlockKind};
use crate::error::{Result, StoreError};
use crate::handle::{Handle, Inner};
use crate::BlockId;

/// One layer: the keys set at this layer and the layer beneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialMap {
    pub shallow: BTreeMap<Value, Value>,
    pub parent: Option<BlockId>,
}

impl PartialMap {
    #[must_use]
    pub fn new(shallow: BTreeMap<Value, Value>, parent: Option<BlockId>) -> Self {
        Self { shallow, parent }
    }

    pub(crate) fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        write_opt_id(&mut buf, self.parent)?;
        let count = u32::try_from(self.shallow.len())
            .map_err(|_| payload_error("partial map has too many entries".to_string()))?;
        buf.write_u32::<LittleEndian>(count)?;
        for (k, v) in &self.shallow {
            k.encode(&mut buf)?;
            v.encode(&mut buf)?;
        }
        Ok(buf)
    }

    pub(crate) fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut rdr = payload;
        let parent = read_opt_id(&mut rdr)?;
        let count = rdr.read_u32::<LittleEndian>()?;
        let mut shallow = BTreeMap::new();
        for _ in 0..count {
            let k = Value::decode(&mut rdr)?;
            let v = Value::decode(&mut rdr)?;
            shallow.insert(k, v);
        }
        ensure_consumed(rdr)?;
        Ok(Self { shallow, parent })
    }
}

impl Inner {
    fn read_partial_map(&mut self, id: BlockId) -> Result<Arc<Block>> {
        let block = self.read_block(id)?;
        match &*block {
            Block::PartialMap(_) => Ok(block),
            other => Err(StoreError::UnexpectedBlockKind {
                id,
                expected: BlockKind::PartialMap,
                actual: other.kind(),
            }),
        }
    }

    /// Walks the parent chain from `id` to the bottom layer, then merges
    /// bottom-up so that newer layers win.
    pub(crate) fn resolve_partial_map(
        &mut self,
        id: Option<BlockId>,
    ) -> Result<BTreeMap<Value, Value>> {
        let mut layers = Vec::new();
        let mut seen = HashSet::new();
        let mut next = id;
        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(payload_error(format!(
                    "partial map chain loops back to block {}",
                    id
                )));
            }
            let block = self.read_partial_map(id)?;
            if let Block::PartialMap(pm) = &*block {
                next = pm.parent;
            }
            layers.push(block);
        }

        let mut merged = BTreeMap::new();
        for block in layers.iter().rev() {
            if let Block::PartialMap(pm) = &**block {
                for (k, v) in &pm.shallow {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(merged)
    }
}

impl Handle {
    /// Appends a layer holding `shallow` on top of `parent`.
    ///
    /// # Errors
    ///
    /// [`StoreError::BlockNotFound`] if `parent` is not a known block.
    pub fn write_partial_map_block(
        &self,
        shallow: &BTreeMap<Value, Value>,
        parent: Option<BlockId>,
    ) -> Result<BlockId> {
        let payload = PartialMap::new(shallow.clone(), parent).encode_payload()?;
        let mut inner = self.lock()?;
        if let Some(parent) = parent {
            inner.ensure_known(parent)?;
        }
        inner.append_block(BlockKind::PartialMap, &payload)
    }

    /// The map `id` represents once every layer beneath it is applied.
    /// `None` resolves to the empty map.
    pub fn resolve_partial_map(&self, id: Option<BlockId>) -> Result<BTreeMap<Value, Value>> {
        self.lock()?.resolve_partial_map(id)
    }

    /// Reads block `id` as a plain value: value blocks as stored, partial
    /// maps resolved into a map, vector chunks materialized as a sequence.
    pub fn read_value(&self, id: BlockId) -> Result<Value> {
        let block = self.read_block_by_id(id)?;
        match &*block {
            Block::Value(v) => Ok(v.clone()),
            Block::PartialMap(_) => Ok(Value::Map(self.resolve_partial_map(Some(id))?)),
            Block::VectorChunk(_) => Ok(Value::Seq(self.read_big_vector(id)?.to_vec()?)),
            Block::Index(_) => Err(StoreError::UnexpectedBlockKind {
                id,
                expected: BlockKind::Value,
                actual: BlockKind::Index,
            }),
        }
    }
}
