//! # Config - store tuning knobs
//!
//! Settings shared by every handle opened on a test file. Defaults suit a
//! typical test run; each can be overridden through the environment:
//!
//! ```text
//! JEPSEN_STORE_CHUNK_SIZE    items per history chunk      (default: 16384)
//! JEPSEN_STORE_QUEUE_DEPTH   full chunks queued to writer (default: 16)
//! JEPSEN_STORE_CACHE_BLOCKS  decoded blocks cached/handle (default: 64)
//! JEPSEN_STORE_FSYNC         fsync on every commit        (default: "true")
//! ```
//!
//! Unparsable or zero values fall back to the default.

/// Default number of items per big-vector chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/// Default bound on full chunks waiting for the background writer.
pub const DEFAULT_WRITER_QUEUE_DEPTH: usize = 16;

/// Default number of decoded blocks each handle keeps in its LRU cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

pub const ENV_CHUNK_SIZE: &str = "JEPSEN_STORE_CHUNK_SIZE";
pub const ENV_QUEUE_DEPTH: &str = "JEPSEN_STORE_QUEUE_DEPTH";
pub const ENV_CACHE_BLOCKS: &str = "JEPSEN_STORE_CACHE_BLOCKS";
pub const ENV_FSYNC: &str = "JEPSEN_STORE_FSYNC";

/// Tuning for a store handle and the writers it spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Items buffered before a big-vector chunk is flushed.
    pub chunk_size: usize,
    /// Capacity of the bounded queue between `append` and the chunk worker.
    pub writer_queue_depth: usize,
    /// Decoded blocks kept per handle.
    pub cache_capacity: usize,
    /// If `true`, block data and the index pointer are synced to disk on
    /// every commit.
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            writer_queue_depth: DEFAULT_WRITER_QUEUE_DEPTH,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            fsync: true,
        }
    }
}

impl StoreConfig {
    /// Builds a config from the defaults, overridden by any `JEPSEN_STORE_*`
    /// environment variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](StoreConfig::from_env) but reads variables through
    /// `lookup`, so callers and tests can supply their own source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            chunk_size: positive_or(lookup(ENV_CHUNK_SIZE), d.chunk_size),
            writer_queue_depth: positive_or(lookup(ENV_QUEUE_DEPTH), d.writer_queue_depth),
            cache_capacity: positive_or(lookup(ENV_CACHE_BLOCKS), d.cache_capacity),
            fsync: lookup(ENV_FSYNC)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(d.fsync),
        }
    }

    /// Returns a copy with a different chunk size (zero is clamped to one).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Returns a copy with fsync turned on or off.
    #[must_use]
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }
}

fn positive_or(raw: Option<String>, default: usize) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}
