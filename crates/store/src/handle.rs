//! The file handle: header checks, the append cursor, block id allocation,
//! and raw block I/O with a per-handle decode cache.

use byteorder::{LittleEndian, ReadBytesExt};
use config::StoreConfig;
use lru::LruCache;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use value::Value;

use crate::big_vector::{ChunkHeader, VectorChunk, CHUNK_HEADER_BYTES};
use crate::block::{encode_frame, read_frame, read_frame_header, Block, BlockKind, FrameHeader};
use crate::error::{Result, StoreError};
use crate::format::{self, CURRENT_VERSION, HEADER_BYTES, MAGIC};
use crate::index::BlockIndex;
use crate::BlockId;

/// A handle on one store file.
///
/// Cloning is cheap: clones share the file, the index snapshot, the append
/// cursor, and the decode cache. A big-vector writer holds a clone so its
/// background worker can append chunks while the caller keeps using the
/// handle. Independent readers should open their own handle with
/// [`open_read`](Handle::open_read); each has its own index snapshot.
///
/// Dropping the last clone of a writable handle syncs the file (best
/// effort); call [`close`](Handle::close) to observe sync errors.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

struct Shared {
    path: PathBuf,
    config: StoreConfig,
    inner: Mutex<Inner>,
}

pub(crate) struct Inner {
    pub(crate) file: File,
    writable: bool,
    fsync: bool,
    pub(crate) index: BlockIndex,
    pub(crate) next_id: BlockId,
    /// Where the next block frame will be written.
    pub(crate) cursor: u64,
    pub(crate) cache: LruCache<BlockId, Arc<Block>>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("Handle");
        d.field("path", &self.shared.path);
        if let Ok(inner) = self.shared.inner.lock() {
            d.field("writable", &inner.writable)
                .field("root", &inner.index.root)
                .field("blocks", &inner.index.blocks.len())
                .field("next_id", &inner.next_id)
                .field("cursor", &inner.cursor);
        }
        d.finish()
    }
}

impl Handle {
    /// Opens `path` for reading and writing, creating it if absent, with
    /// configuration taken from the environment. Does not write the header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, StoreConfig::from_env())
    }

    /// Like [`open`](Handle::open) with an explicit config.
    ///
    /// If the file already holds a committed index the caller should
    /// [`load_block_index`](Handle::load_block_index) before writing, so new
    /// ids continue after the existing ones.
    pub fn open_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Self::from_file(path.as_ref(), file, true, config)
    }

    /// Creates (or truncates) `path` and writes a fresh header.
    pub fn create<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let handle = Self::from_file(path.as_ref(), file, true, config)?;
        handle.write_header()?;
        Ok(handle)
    }

    /// Opens an existing file read-only: checks magic and version, then
    /// loads the committed block index.
    ///
    /// # Errors
    ///
    /// In order: [`StoreError::MagicMismatch`], [`StoreError::VersionIncomplete`]
    /// / [`StoreError::VersionMismatch`], [`StoreError::NoBlockIndex`].
    pub fn open_read<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_read_with(path, StoreConfig::from_env())
    }

    /// Like [`open_read`](Handle::open_read) with an explicit config.
    pub fn open_read_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let handle = Self::from_file(path.as_ref(), file, false, config)?;
        handle.check_magic()?;
        handle.check_version()?;
        handle.load_block_index()?;
        Ok(handle)
    }

    fn from_file(path: &Path, file: File, writable: bool, config: StoreConfig) -> Result<Self> {
        let len = file.metadata()?.len();
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let inner = Inner {
            file,
            writable,
            fsync: config.fsync,
            index: BlockIndex::default(),
            next_id: 1,
            cursor: len.max(HEADER_BYTES),
            cache: LruCache::new(capacity),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                path: path.to_path_buf(),
                config,
                inner: Mutex::new(inner),
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.shared.config
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.shared
            .inner
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    // -------------------- Header --------------------

    /// Writes magic and version at offset 0. Must happen before any block is
    /// written.
    ///
    /// A committed index pointer is kept, so rewriting the header of an
    /// existing file does not hide its commits. The pointer slot is only
    /// zeroed when the file is too short to hold one.
    pub fn write_header(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.ensure_writable()?;
        let len = inner.file.metadata()?.len();
        format::write_header(&mut inner.file, CURRENT_VERSION)?;
        if len < HEADER_BYTES {
            format::write_index_pointer(&mut inner.file, 0)?;
        }
        inner.cursor = inner.cursor.max(HEADER_BYTES);
        inner.sync_data()?;
        Ok(())
    }

    /// Verifies the magic bytes.
    pub fn check_magic(&self) -> Result<()> {
        let mut inner = self.lock()?;
        match format::read_magic(&mut inner.file)? {
            Some(m) if &m == MAGIC => Ok(()),
            found => Err(StoreError::MagicMismatch {
                expected: String::from_utf8_lossy(MAGIC).into_owned(),
                actual: found.map(|m| String::from_utf8_lossy(&m).into_owned()),
            }),
        }
    }

    /// Verifies the version is present and supported.
    pub fn check_version(&self) -> Result<()> {
        match self.read_version()? {
            None => Err(StoreError::VersionIncomplete),
            Some(v) if v == CURRENT_VERSION => Ok(()),
            Some(actual) => Err(StoreError::VersionMismatch {
                expected: CURRENT_VERSION,
                actual,
            }),
        }
    }

    /// The stored version.
    ///
    /// # Errors
    ///
    /// [`StoreError::VersionIncomplete`] if the header is truncated.
    pub fn version(&self) -> Result<u32> {
        self.read_version()?.ok_or(StoreError::VersionIncomplete)
    }

    fn read_version(&self) -> Result<Option<u32>> {
        let mut inner = self.lock()?;
        Ok(format::read_version(&mut inner.file)?)
    }

    // -------------------- Blocks --------------------

    /// Appends `value` as a new block and returns its id.
    pub fn write_value_block(&self, value: &Value) -> Result<BlockId> {
        let payload = value.to_bytes()?;
        self.lock()?.append_block(BlockKind::Value, &payload)
    }

    /// Reads and decodes block `id` from this handle's index snapshot.
    ///
    /// # Errors
    ///
    /// [`StoreError::BlockNotFound`] if `id` is not in the index;
    /// [`StoreError::Corrupt`] if the frame fails its checks.
    pub fn read_block_by_id(&self, id: BlockId) -> Result<Arc<Block>> {
        self.lock()?.read_block(id)
    }

    /// Reads the block the index root points at.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoRoot`] if no root has been set.
    pub fn read_root(&self) -> Result<Arc<Block>> {
        let mut inner = self.lock()?;
        let root = inner.index.root.ok_or(StoreError::NoRoot)?;
        inner.read_block(root)
    }

    /// Syncs the file. The file itself closes when the last clone drops.
    pub fn close(self) -> Result<()> {
        let inner = self.lock()?;
        if inner.writable {
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// Size of the file in bytes.
    pub fn file_len(&self) -> Result<u64> {
        Ok(self.lock()?.file.metadata()?.len())
    }
}

impl Inner {
    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StoreError::ReadOnly)
        }
    }

    pub(crate) fn ensure_known(&self, id: BlockId) -> Result<u64> {
        self.index
            .blocks
            .get(&id)
            .copied()
            .ok_or_else(|| StoreError::BlockNotFound {
                id,
                known_ids: self.index.known_ids(),
            })
    }

    pub(crate) fn alloc_id(&mut self) -> BlockId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn sync_data(&self) -> Result<()> {
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Writes one frame at `offset` and returns its length.
    pub(crate) fn write_frame_at(
        &mut self,
        offset: u64,
        id: BlockId,
        kind: BlockKind,
        payload: &[u8],
    ) -> Result<u64> {
        let frame = encode_frame(id, kind, payload)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&frame)?;
        Ok(frame.len() as u64)
    }

    /// Appends a block with a freshly allocated id. On failure the index is
    /// left as it was; the cursor does not move, so the partial frame is
    /// overwritten by the next append.
    pub(crate) fn append_block(&mut self, kind: BlockKind, payload: &[u8]) -> Result<BlockId> {
        self.ensure_writable()?;
        let id = self.alloc_id();
        self.append_with_id(id, kind, payload)?;
        Ok(id)
    }

    /// Appends a block under a caller-chosen id. Used when copying blocks
    /// between files so embedded references stay valid.
    pub(crate) fn append_with_id(
        &mut self,
        id: BlockId,
        kind: BlockKind,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_writable()?;
        let offset = self.cursor;
        let frame_len = self.write_frame_at(offset, id, kind, payload)?;
        self.cursor = offset + frame_len;
        self.index.blocks.insert(id, offset);
        self.next_id = self.next_id.max(id + 1);
        debug!(id, ?kind, offset, len = payload.len(), "wrote block");
        Ok(())
    }

    /// Reads the verified frame for `id` without decoding it.
    pub(crate) fn read_raw(&mut self, id: BlockId) -> Result<(FrameHeader, Vec<u8>)> {
        let offset = self.ensure_known(id)?;
        let (header, payload) = read_frame(&mut self.file, offset)?;
        if header.id != id {
            return Err(StoreError::Corrupt {
                offset,
                reason: format!("index maps block {} to a frame holding block {}", id, header.id),
            });
        }
        Ok((header, payload))
    }

    pub(crate) fn read_block(&mut self, id: BlockId) -> Result<Arc<Block>> {
        if let Some(block) = self.cache.get(&id) {
            return Ok(Arc::clone(block));
        }
        let (header, payload) = self.read_raw(id)?;
        let block = Arc::new(Block::decode(header.kind, &payload)?);
        self.cache.put(id, Arc::clone(&block));
        Ok(block)
    }

    pub(crate) fn read_vector_chunk(&mut self, id: BlockId) -> Result<Arc<VectorChunk>> {
        match &*self.read_block(id)? {
            Block::VectorChunk(chunk) => Ok(Arc::clone(chunk)),
            other => Err(StoreError::UnexpectedBlockKind {
                id,
                expected: BlockKind::VectorChunk,
                actual: other.kind(),
            }),
        }
    }

    /// Reads only the link fields at the front of a chunk payload, so the
    /// chain can be walked without decoding items. Served from the cache
    /// when the chunk is already decoded.
    pub(crate) fn read_chunk_header(&mut self, id: BlockId) -> Result<ChunkHeader> {
        if let Some(block) = self.cache.get(&id) {
            if let Block::VectorChunk(chunk) = &**block {
                return Ok(chunk.header());
            }
        }
        let offset = self.ensure_known(id)?;
        let frame = read_frame_header(&mut self.file, offset)?;
        if frame.kind != BlockKind::VectorChunk {
            return Err(StoreError::UnexpectedBlockKind {
                id,
                expected: BlockKind::VectorChunk,
                actual: frame.kind,
            });
        }
        if frame.id != id || frame.len < CHUNK_HEADER_BYTES as u64 {
            return Err(StoreError::Corrupt {
                offset,
                reason: format!("block {} is not a well-formed vector chunk", id),
            });
        }
        let mut buf = [0u8; CHUNK_HEADER_BYTES];
        self.file.read_exact(&mut buf)?;
        let mut rdr = &buf[..];
        let prev = crate::block::read_opt_id(&mut rdr)?;
        let count_before = rdr.read_u64::<LittleEndian>()?;
        let count = u64::from(rdr.read_u32::<LittleEndian>()?);
        Ok(ChunkHeader {
            prev,
            count_before,
            count,
        })
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.writable {
            let _ = self.file.sync_all();
        }
    }
}
