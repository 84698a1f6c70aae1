//! Lazy reader for big vectors.
//!
//! Opening a vector reads only its last chunk header. The chain is walked
//! on first positional access, and chunk payloads are decoded through the
//! handle's cache. Items can also be folded across chunks in parallel.

use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use value::Value;

use super::{ChunkHeader, VectorChunk};
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::BlockId;

/// Position of one non-empty chunk within the stored vector.
#[derive(Debug, Clone, Copy)]
struct Span {
    id: BlockId,
    start: usize,
    count: usize,
}

impl Span {
    fn end(&self) -> usize {
        self.start + self.count
    }
}

/// The on-disk part of a vector. Spans are built on first positional
/// access by walking chunk headers from the last chunk back to the first.
struct ChunkChain {
    handle: Handle,
    last: BlockId,
    len: usize,
    spans: OnceLock<Vec<Span>>,
}

impl ChunkChain {
    fn spans(&self) -> Result<&[Span]> {
        if let Some(spans) = self.spans.get() {
            return Ok(spans);
        }
        let built = self.walk()?;
        Ok(self.spans.get_or_init(|| built))
    }

    fn walk(&self) -> Result<Vec<Span>> {
        let mut inner = self.handle.lock()?;
        let mut spans = Vec::new();
        let mut expected_end = self.len as u64;
        let mut next = Some(self.last);

        while let Some(id) = next {
            let header = inner.read_chunk_header(id)?;
            if header.total() != expected_end {
                let what = format!(
                    "ends at {} but the next chunk starts at {}",
                    header.total(),
                    expected_end
                );
                return Err(chain_error(id, what));
            }
            if let Some(prev) = header.prev {
                // Chunks are written in order, so links always point at
                // smaller ids. This also rules out cycles.
                if prev >= id {
                    return Err(chain_error(id, format!("links forward to block {}", prev)));
                }
            } else if header.count_before != 0 {
                return Err(chain_error(
                    id,
                    format!("is first but claims {} earlier items", header.count_before),
                ));
            }
            if header.count > 0 {
                spans.push(Span {
                    id,
                    start: header.count_before as usize,
                    count: header.count as usize,
                });
            }
            expected_end = header.count_before;
            next = header.prev;
        }

        spans.reverse();
        Ok(spans)
    }

    fn chunk(&self, span: &Span) -> Result<Arc<VectorChunk>> {
        let chunk = self.handle.lock()?.read_vector_chunk(span.id)?;
        if chunk.items.len() != span.count {
            return Err(chain_error(
                span.id,
                format!("holds {} items, header said {}", chunk.items.len(), span.count),
            ));
        }
        Ok(chunk)
    }
}

fn chain_error(id: BlockId, what: String) -> StoreError {
    StoreError::Corrupt {
        offset: 0,
        reason: format!("vector chunk {} {}", id, what),
    }
}

/// The chunk most recently read by an iterator, so consecutive positions do
/// not go back to the handle.
type ChunkCursor = Option<(usize, Arc<VectorChunk>)>;

/// A persistent, lazily loaded vector of values.
///
/// A vector read from a store holds only the id of its last chunk; items
/// are fetched chunk by chunk through the handle's block cache. Updates
/// ([`push`](BigVector::push), [`with_set`](BigVector::with_set),
/// [`pop`](BigVector::pop), [`subvec`](BigVector::subvec)) return new
/// vectors that share the stored chunks and keep changed positions in
/// memory. Nothing is ever written back.
///
/// Equality and hashing agree with a `Vec<Value>` of the same items.
///
/// # Panics
///
/// `PartialEq` and `Hash` cannot report errors; they panic if a chunk
/// cannot be read. Use [`to_vec`](BigVector::to_vec) to compare fallibly.
#[derive(Clone)]
pub struct BigVector {
    base: Option<Arc<ChunkChain>>,
    /// Stored items in use; positions at or past this live in `tail`.
    base_len: usize,
    /// Overrides for stored positions.
    patches: Arc<BTreeMap<usize, Value>>,
    tail: Arc<Vec<Value>>,
    start: usize,
    end: usize,
}

impl BigVector {
    /// The empty vector.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// An in-memory vector.
    #[must_use]
    pub fn from_vec(items: Vec<Value>) -> Self {
        let end = items.len();
        Self {
            base: None,
            base_len: 0,
            patches: Arc::new(BTreeMap::new()),
            tail: Arc::new(items),
            start: 0,
            end,
        }
    }

    fn stored(handle: Handle, last: BlockId, header: ChunkHeader) -> Self {
        let len = header.total() as usize;
        Self {
            base: Some(Arc::new(ChunkChain {
                handle,
                last,
                len,
                spans: OnceLock::new(),
            })),
            base_len: len,
            patches: Arc::new(BTreeMap::new()),
            tail: Arc::new(Vec::new()),
            start: 0,
            end: len,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Id of the stored chunk this vector was read from, if any.
    #[must_use]
    pub fn last_chunk(&self) -> Option<BlockId> {
        self.base.as_ref().map(|c| c.last)
    }

    /// Whether `i` is a valid position. Negative positions never are.
    #[must_use]
    pub fn contains_index(&self, i: i64) -> bool {
        usize::try_from(i).is_ok_and(|i| i < self.len())
    }

    /// The item at `i`.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexOutOfBounds`] if `i >= len`.
    pub fn get(&self, i: usize) -> Result<Value> {
        if i >= self.len() {
            return Err(StoreError::IndexOutOfBounds {
                index: i,
                len: self.len(),
            });
        }
        self.item_at(self.start + i, &mut None)
    }

    /// The last item, or `None` when empty.
    pub fn last(&self) -> Result<Option<Value>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.item_at(self.end - 1, &mut None).map(Some)
    }

    /// A vector with `item` appended.
    #[must_use]
    pub fn push(&self, item: Value) -> Self {
        let mut next = self.clone();
        next.put(next.end, item);
        next.end += 1;
        next
    }

    /// A vector with position `i` replaced. `i == len` appends.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexOutOfBounds`] if `i > len`.
    pub fn with_set(&self, i: usize, item: Value) -> Result<Self> {
        match i.cmp(&self.len()) {
            std::cmp::Ordering::Less => {
                let mut next = self.clone();
                next.put(next.start + i, item);
                Ok(next)
            }
            std::cmp::Ordering::Equal => Ok(self.push(item)),
            std::cmp::Ordering::Greater => Err(StoreError::IndexOutOfBounds {
                index: i,
                len: self.len(),
            }),
        }
    }

    /// A vector without its last item.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexOutOfBounds`] if the vector is empty.
    pub fn pop(&self) -> Result<Self> {
        if self.is_empty() {
            return Err(StoreError::IndexOutOfBounds { index: 0, len: 0 });
        }
        let mut next = self.clone();
        next.end -= 1;
        Ok(next)
    }

    /// The items in `[start, end)` as a vector sharing this one's storage.
    ///
    /// # Errors
    ///
    /// [`StoreError::IndexOutOfBounds`] unless `start <= end <= len`.
    pub fn subvec(&self, start: usize, end: usize) -> Result<Self> {
        if end > self.len() || start > end {
            return Err(StoreError::IndexOutOfBounds {
                index: if end > self.len() { end } else { start },
                len: self.len(),
            });
        }
        let mut next = self.clone();
        next.start = self.start + start;
        next.end = self.start + end;
        Ok(next)
    }

    /// Iterates items in order. Each item is a `Result` since stored chunks
    /// are read as the iterator reaches them.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            vector: self,
            front: self.start,
            back: self.end,
            front_chunk: None,
            back_chunk: None,
        }
    }

    /// Reads every item into memory.
    pub fn to_vec(&self) -> Result<Vec<Value>> {
        self.iter().collect()
    }

    /// Folds the items in parallel. Work is split at chunk boundaries; each
    /// piece folds from `identity()` and the pieces are combined in order
    /// with `reduce`.
    pub fn par_fold<T, ID, F, R>(&self, identity: ID, fold: F, reduce: R) -> Result<T>
    where
        T: Send,
        ID: Fn() -> T + Sync + Send,
        F: Fn(T, Value) -> T + Sync + Send,
        R: Fn(T, T) -> T + Sync + Send,
    {
        let pieces = self.pieces()?;
        pieces
            .into_par_iter()
            .map(|(from, to)| -> Result<T> {
                let mut cursor = None;
                let mut acc = identity();
                for j in from..to {
                    acc = fold(acc, self.item_at(j, &mut cursor)?);
                }
                Ok(acc)
            })
            .try_reduce(&identity, |a, b| Ok(reduce(a, b)))
    }

    /// Splits the visible range into `[from, to)` pieces that each touch at
    /// most one stored chunk.
    fn pieces(&self) -> Result<Vec<(usize, usize)>> {
        let mut pieces = Vec::new();
        let stored_end = self.end.min(self.base_len);
        if let Some(chain) = &self.base {
            if self.start < stored_end {
                let spans = chain.spans()?;
                let first = spans.partition_point(|s| s.end() <= self.start);
                for span in &spans[first..] {
                    if span.start >= stored_end {
                        break;
                    }
                    pieces.push((span.start.max(self.start), span.end().min(stored_end)));
                }
            }
        }
        let from = self.start.max(self.base_len);
        if from < self.end {
            pieces.push((from, self.end));
        }
        Ok(pieces)
    }

    /// Writes `item` at absolute position `j`, which is at most one past the
    /// last stored or appended position.
    fn put(&mut self, j: usize, item: Value) {
        if j < self.base_len {
            Arc::make_mut(&mut self.patches).insert(j, item);
            return;
        }
        let tail = Arc::make_mut(&mut self.tail);
        let k = j - self.base_len;
        if k < tail.len() {
            tail[k] = item;
        } else {
            tail.push(item);
        }
    }

    /// The item at absolute position `j`.
    fn item_at(&self, j: usize, cursor: &mut ChunkCursor) -> Result<Value> {
        if j >= self.base_len {
            return self
                .tail
                .get(j - self.base_len)
                .cloned()
                .ok_or(StoreError::IndexOutOfBounds {
                    index: j - self.start,
                    len: self.len(),
                });
        }
        if let Some(v) = self.patches.get(&j) {
            return Ok(v.clone());
        }
        let chain = self.base.as_ref().ok_or(StoreError::IndexOutOfBounds {
            index: j - self.start,
            len: self.len(),
        })?;
        let spans = chain.spans()?;

        if let Some((s, chunk)) = cursor.as_ref() {
            let span = &spans[*s];
            if span.start <= j && j < span.end() {
                return Ok(chunk.items[j - span.start].clone());
            }
        }
        let s = spans.partition_point(|s| s.end() <= j);
        let span = spans.get(s).ok_or_else(|| {
            chain_error(chain.last, format!("chain does not cover position {}", j))
        })?;
        let chunk = chain.chunk(span)?;
        let item = chunk.items[j - span.start].clone();
        *cursor = Some((s, chunk));
        Ok(item)
    }
}

impl Default for BigVector {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Vec<Value>> for BigVector {
    fn from(items: Vec<Value>) -> Self {
        Self::from_vec(items)
    }
}

/// Ordered iterator over a [`BigVector`]; also iterates from the back.
pub struct Iter<'a> {
    vector: &'a BigVector,
    front: usize,
    back: usize,
    front_chunk: ChunkCursor,
    back_chunk: ChunkCursor,
}

impl Iterator for Iter<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let item = self.vector.item_at(self.front, &mut self.front_chunk);
        self.front += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.back - self.front;
        (n, Some(n))
    }
}

impl DoubleEndedIterator for Iter<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        Some(self.vector.item_at(self.back, &mut self.back_chunk))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a BigVector {
    type Item = Result<Value>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn expect_item(item: Result<Value>) -> Value {
    match item {
        Ok(v) => v,
        Err(e) => panic!("failed to read big vector item: {}", e),
    }
}

impl PartialEq for BigVector {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| expect_item(a) == expect_item(b))
    }
}

impl Eq for BigVector {}

impl PartialEq<Vec<Value>> for BigVector {
    fn eq(&self, other: &Vec<Value>) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .zip(other.iter())
                .all(|(a, b)| expect_item(a) == *b)
    }
}

impl PartialEq<BigVector> for Vec<Value> {
    fn eq(&self, other: &BigVector) -> bool {
        other == self
    }
}

impl Hash for BigVector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.len());
        for item in self.iter() {
            expect_item(item).hash(state);
        }
    }
}

impl fmt::Debug for BigVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigVector")
            .field("len", &self.len())
            .field("last_chunk", &self.last_chunk())
            .field("patched", &self.patches.len())
            .field("appended", &self.tail.len())
            .finish()
    }
}

impl Handle {
    /// Opens the vector whose last chunk is `id`. Only that chunk's header
    /// is read; the rest of the chain is walked on first positional access.
    pub fn read_big_vector(&self, id: BlockId) -> Result<BigVector> {
        let header = self.lock()?.read_chunk_header(id)?;
        Ok(BigVector::stored(self.clone(), id, header))
    }
}
