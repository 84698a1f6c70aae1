//! Garbage collection.
//!
//! Superseded test layers, abandoned results, and blocks written after the
//! last commit are never referenced again but still take space. [`gc`]
//! rewrites the file with only the blocks reachable from the root.
//!
//! Blocks are copied frame for frame with their ids unchanged, so every
//! reference inside them (partial-map parents, chunk links, `BlockRef`
//! values) stays valid without re-encoding. The copy goes to `<path>.tmp`,
//! is committed and synced, then renamed over the original.

use config::StoreConfig;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::BlockId;

/// Before/after sizes of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Blocks listed in the index before collection.
    pub blocks_before: usize,
    /// Blocks listed in the new index, including the index itself.
    pub blocks_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Rewrites the file at `path` keeping only blocks reachable from its root.
/// Configuration is taken from the environment.
///
/// No other handle may be writing to `path` while this runs. Readers that
/// already hold the old file open keep seeing the old contents.
///
/// # Errors
///
/// Fails like [`Handle::open_read`] on a bad file, and with
/// [`StoreError::NoRoot`] if nothing has been committed as the root.
pub fn gc<P: AsRef<Path>>(path: P) -> Result<GcStats> {
    gc_with(path, StoreConfig::from_env())
}

/// Like [`gc`] with an explicit config.
pub fn gc_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<GcStats> {
    let path = path.as_ref();
    let tmp_path = tmp_path_for(path);

    let stats = match copy_reachable(path, &tmp_path, config) {
        Ok(stats) => stats,
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
    };

    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    info!(
        path = %path.display(),
        blocks_before = stats.blocks_before,
        blocks_after = stats.blocks_after,
        bytes_before = stats.bytes_before,
        bytes_after = stats.bytes_after,
        "garbage collected store file"
    );
    Ok(stats)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn copy_reachable(path: &Path, tmp_path: &Path, config: StoreConfig) -> Result<GcStats> {
    let src = Handle::open_read_with(path, config)?;
    let root = src.root()?.ok_or(StoreError::NoRoot)?;
    let blocks_before = src.block_index()?.blocks.len();
    let bytes_before = src.file_len()?;

    let live = reachable(&src, root)?;
    debug!(live = live.len(), blocks_before, "computed reachable blocks");

    let dst = Handle::create(tmp_path, config)?;
    {
        let mut from = src.lock()?;
        let mut to = dst.lock()?;
        for &id in &live {
            let (header, payload) = from.read_raw(id)?;
            to.append_with_id(id, header.kind, &payload)?;
        }
    }
    dst.commit_root(root)?;

    let stats = GcStats {
        blocks_before,
        blocks_after: dst.block_index()?.blocks.len(),
        bytes_before,
        bytes_after: dst.file_len()?,
    };
    dst.close()?;
    Ok(stats)
}

/// Every block id reachable from `root`, ascending.
fn reachable(handle: &Handle, root: BlockId) -> Result<BTreeSet<BlockId>> {
    let mut live = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !live.insert(id) {
            continue;
        }
        let block = handle.read_block_by_id(id)?;
        stack.extend(block.block_refs().into_iter().filter(|r| !live.contains(r)));
    }
    Ok(live)
}
