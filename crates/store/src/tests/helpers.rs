use crate::Handle;
use anyhow::Result;
use config::StoreConfig;
use std::path::{Path, PathBuf};
use value::Value;

/// Small chunks and no fsync, so tests exercise chunk boundaries quickly.
pub fn test_config(chunk_size: usize) -> StoreConfig {
    StoreConfig::default()
        .with_chunk_size(chunk_size)
        .with_fsync(false)
}

pub fn store_path(dir: &Path) -> PathBuf {
    dir.join("test.jepsen")
}

/// A fresh file with its header written.
pub fn new_store(dir: &Path) -> Result<(PathBuf, Handle)> {
    let path = store_path(dir);
    let h = Handle::create(&path, test_config(5))?;
    Ok((path, h))
}

/// `n` history-shaped operations.
pub fn ops(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            Value::map([
                ("index", Value::from(i as i64)),
                ("type", Value::from(if i % 2 == 0 { "invoke" } else { "ok" })),
                ("f", Value::from("write")),
                ("value", Value::from(i as i64 * 10)),
            ])
        })
        .collect()
}
