//! Error taxonomy for the store.

use std::io;

use thiserror::Error;
use value::ValueError;

use crate::block::BlockKind;
use crate::BlockId;

/// Errors surfaced by every store operation.
///
/// None of these are retried internally. A failed write leaves the last
/// committed block index (and everything reachable from it) intact.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("value codec error: {0}")]
    Value(#[from] ValueError),

    /// The file does not start with the expected magic. `actual` is `None`
    /// when the file ended before the magic was complete.
    #[error("magic mismatch: expected {expected:?}, found {}", found_or_eof(.actual))]
    MagicMismatch {
        expected: String,
        actual: Option<String>,
    },

    #[error("unsupported format version {actual} (expected {expected})")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Magic is present but the version bytes are truncated, typically a
    /// crash while the header was being written.
    #[error("file version is incomplete (truncated header)")]
    VersionIncomplete,

    #[error("file has no block index")]
    NoBlockIndex,

    #[error("block index has no root")]
    NoRoot,

    #[error("block {id} not found (known ids: {known_ids:?})")]
    BlockNotFound { id: BlockId, known_ids: Vec<BlockId> },

    #[error("test metadata has no history block id; write the history first")]
    NoHistoryIdInMeta,

    #[error("malformed test record: {0}")]
    MalformedTest(String),

    #[error("corrupt block at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("block {id} is a {actual:?} block, expected {expected:?}")]
    UnexpectedBlockKind {
        id: BlockId,
        expected: BlockKind,
        actual: BlockKind,
    },

    #[error("index {index} out of bounds for vector of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("handle is read-only")]
    ReadOnly,

    #[error("vector writer failed: {0}")]
    WriterFailed(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

fn found_or_eof(actual: &Option<String>) -> String {
    match actual {
        Some(a) => format!("{:?}", a),
        None => "EOF".to_string(),
    }
}
