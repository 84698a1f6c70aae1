//! Background writer for big vectors.
//!
//! Items are buffered into chunks on the caller's thread; a named worker
//! thread appends the chunks in order and runs an optional hook after each
//! one.

use std::mem;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};
use value::Value;

use super::VectorChunk;
use crate::block::BlockKind;
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::BlockId;

/// Called on the writer's worker thread after each chunk is written, with
/// the new chunk's id. An error stops the writer.
pub type ChunkHook = Box<dyn FnMut(&Handle, BlockId) -> Result<()> + Send>;

/// Streams items into a chain of vector chunks.
///
/// Items are buffered until a chunk is full; full chunks are handed to a
/// worker thread through a bounded queue, so `append` only blocks when the
/// worker falls `writer_queue_depth` chunks behind.
///
/// Call [`close`](VectorWriter::close) to flush the last partial chunk and
/// learn the vector's id. Dropping an unclosed writer closes it and logs any
/// error.
pub struct VectorWriter {
    chunk_size: usize,
    buffer: Vec<Value>,
    tx: Option<SyncSender<Vec<Value>>>,
    worker: Option<JoinHandle<Result<()>>>,
    latest: Arc<Mutex<Option<BlockId>>>,
    initial_prev: Option<BlockId>,
    sent_any: bool,
}

struct Worker {
    handle: Handle,
    prev: Option<BlockId>,
    count_before: u64,
    latest: Arc<Mutex<Option<BlockId>>>,
    hook: Option<ChunkHook>,
}

impl Worker {
    fn write_chunk(&mut self, items: &[Value]) -> Result<()> {
        let payload = VectorChunk::encode_payload(self.prev, self.count_before, items)?;
        let id = self
            .handle
            .lock()?
            .append_block(BlockKind::VectorChunk, &payload)?;
        self.prev = Some(id);
        self.count_before += items.len() as u64;
        *self
            .latest
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))? = Some(id);
        debug!(id, items = items.len(), total = self.count_before, "wrote vector chunk");

        if let Some(hook) = self.hook.as_mut() {
            hook(&self.handle, id)?;
        }
        Ok(())
    }
}

impl VectorWriter {
    pub(crate) fn new(
        handle: &Handle,
        initial_prev: Option<BlockId>,
        chunk_size: usize,
        hook: Option<ChunkHook>,
    ) -> Result<Self> {
        let count_before = match initial_prev {
            Some(id) => handle.lock()?.read_chunk_header(id)?.total(),
            None => 0,
        };
        let latest = Arc::new(Mutex::new(initial_prev));
        let (tx, rx) = sync_channel::<Vec<Value>>(handle.config().writer_queue_depth);

        let mut worker = Worker {
            handle: handle.clone(),
            prev: initial_prev,
            count_before,
            latest: Arc::clone(&latest),
            hook,
        };
        let join = thread::Builder::new()
            .name("big-vector-writer".to_string())
            .spawn(move || -> Result<()> {
                for items in rx {
                    worker.write_chunk(&items)?;
                }
                Ok(())
            })?;

        let chunk_size = chunk_size.max(1);
        Ok(Self {
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            tx: Some(tx),
            worker: Some(join),
            latest,
            initial_prev,
            sent_any: false,
        })
    }

    /// Adds one item. Hands a chunk to the worker every `chunk_size` items.
    ///
    /// # Errors
    ///
    /// The worker's error if it has failed, or [`StoreError::WriterFailed`]
    /// if the writer was already closed.
    pub fn append(&mut self, item: Value) -> Result<()> {
        self.buffer.push(item);
        if self.buffer.len() >= self.chunk_size {
            let full = mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.send(full)?;
        }
        Ok(())
    }

    /// Id of the last chunk the worker has written, or the initial `prev` if
    /// none has been written yet.
    pub fn latest(&self) -> Result<Option<BlockId>> {
        Ok(*self
            .latest
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))?)
    }

    /// Flushes buffered items, waits for the worker, and returns the id of
    /// the vector's last chunk. A writer that never saw an item and had no
    /// initial `prev` writes one empty chunk so the empty vector has an id.
    pub fn close(mut self) -> Result<BlockId> {
        self.finish()
    }

    fn send(&mut self, items: Vec<Value>) -> Result<()> {
        let sent = match self.tx.as_ref() {
            Some(tx) => tx.send(items).is_ok(),
            None => return Err(StoreError::WriterFailed("writer is closed".to_string())),
        };
        if sent {
            self.sent_any = true;
            Ok(())
        } else {
            // The worker hung up; its own error explains why.
            self.tx = None;
            self.join_worker()?;
            Err(StoreError::WriterFailed("worker stopped".to_string()))
        }
    }

    fn join_worker(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(join) => join
                .join()
                .map_err(|_| StoreError::WriterFailed("worker panicked".to_string()))?,
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<BlockId> {
        if self.tx.is_none() && self.worker.is_none() {
            return Err(StoreError::WriterFailed("writer is closed".to_string()));
        }
        if !self.buffer.is_empty() || (!self.sent_any && self.initial_prev.is_none()) {
            let rest = mem::take(&mut self.buffer);
            self.send(rest)?;
        }
        self.tx = None;
        self.join_worker()?;
        self.latest()?
            .ok_or_else(|| StoreError::WriterFailed("no chunk was written".to_string()))
    }
}

impl Drop for VectorWriter {
    fn drop(&mut self) {
        if self.tx.is_none() && self.worker.is_none() {
            return;
        }
        if let Err(e) = self.finish() {
            warn!(error = %e, "closing dropped vector writer failed");
        }
    }
}

impl Handle {
    /// Starts a vector writer. With `initial_prev` set, new chunks continue
    /// the vector ending at that chunk.
    pub fn vector_writer(
        &self,
        initial_prev: Option<BlockId>,
        chunk_size: usize,
    ) -> Result<VectorWriter> {
        VectorWriter::new(self, initial_prev, chunk_size, None)
    }

    /// Like [`vector_writer`](Handle::vector_writer), running `hook` after
    /// every chunk.
    pub fn vector_writer_with_hook(
        &self,
        initial_prev: Option<BlockId>,
        chunk_size: usize,
        hook: ChunkHook,
    ) -> Result<VectorWriter> {
        VectorWriter::new(self, initial_prev, chunk_size, Some(hook))
    }
}
