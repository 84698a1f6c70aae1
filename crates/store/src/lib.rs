//! # Store - crash-safe test artifact files
//!
//! One file per test run holds the test's metadata, its (possibly very
//! long) operation history, and its analysis results. The file is
//! append-only: blocks are written once and never modified, and a small
//! block index names the live blocks and the root. Committing means writing
//! a new index and then pointing the header at it, so a crash at any point
//! leaves the last committed state readable.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ "JEPSEN" │ version u32 │ index pointer u64          │  header (18 bytes)
//! ├─────────────────────────────────────────────────────┤
//! │ block 1  │ block 2  │ ... │ index │ ... │ index     │  append-only
//! └─────────────────────────────────────────────────────┘
//!                                             ^
//!                       index pointer --------┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                  |
//! |-----------------|----------------------------------------------------------|
//! | [`format`]      | Header constants, magic/version/pointer I/O              |
//! | [`block`]       | Frame encoding, CRC checks, payload dispatch             |
//! | [`handle`]      | `Handle`: open/create, header checks, block reads/writes |
//! | [`index`]       | `BlockIndex`, commit, load with recovery scan            |
//! | [`partial_map`] | Layered maps and their resolution                        |
//! | [`big_vector`]  | Chunked vectors: background writer, lazy reader          |
//! | [`gc`]          | Copying collection of unreachable blocks                 |
//! | [`test_record`] | Test metadata/history/results lifecycle                  |
//!
//! ## Example
//!
//! ```no_run
//! use config::StoreConfig;
//! use store::{Handle, TestMeta};
//! use value::Value;
//!
//! # fn main() -> store::Result<()> {
//! let path = store::test_path("store", "etcd-append", "20240101T000000.000Z");
//! # std::fs::create_dir_all(path.parent().unwrap())?;
//! let h = Handle::create(&path, StoreConfig::default())?;
//! let meta = TestMeta::new("etcd-append", "20240101T000000.000Z", Value::Nil);
//! let mut test = h.write_initial_test(&meta)?;
//!
//! let mut history = h.test_history_writer(&test)?;
//! history.append(Value::map([("type", "invoke"), ("f", "read")]))?;
//! history.close()?;
//!
//! h.write_test_with_history(&mut test)?;
//! h.write_test_with_results(&test, &Value::map([("valid?", true)]))?;
//! h.close()?;
//!
//! let read = Handle::open_read(&path)?.read_test()?;
//! assert_eq!(read.name, "etcd-append");
//! # Ok(())
//! # }
//! ```

pub mod big_vector;
pub mod block;
pub mod error;
pub mod format;
pub mod gc;
pub mod handle;
pub mod index;
pub mod partial_map;
pub mod test_record;

/// Identifies a block within one file. Ids start at 1 and only grow.
pub type BlockId = u64;

pub use big_vector::{BigVector, ChunkHook, VectorWriter};
pub use block::{Block, BlockKind};
pub use error::{Result, StoreError};
pub use gc::{gc, gc_with, GcStats};
pub use handle::Handle;
pub use index::BlockIndex;
pub use partial_map::PartialMap;
pub use test_record::{test_path, Test, TestMeta, TestPhase, TestRef};

#[cfg(test)]
mod tests;
