use super::helpers::*;
use crate::block::{encode_frame, read_frame, BLOCK_HEADER_BYTES};
use crate::format::HEADER_BYTES;
use crate::*;
use anyhow::Result;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::tempdir;
use value::Value;

fn nested() -> Value {
    Value::map([
        ("foo", Value::from(2)),
        (
            "bar",
            Value::seq([Value::from("cat"), Value::set(["mew"])]),
        ),
    ])
}

// -------------------- Frames --------------------

#[test]
fn frame_roundtrip_in_memory() -> Result<()> {
    let frame = encode_frame(42, BlockKind::Value, b"payload")?;
    assert_eq!(frame.len() as u64, BLOCK_HEADER_BYTES + 7);

    let mut cur = Cursor::new(frame);
    let (header, payload) = read_frame(&mut cur, 0)?;
    assert_eq!(header.id, 42);
    assert_eq!(header.kind, BlockKind::Value);
    assert_eq!(header.len, 7);
    assert_eq!(payload, b"payload");
    Ok(())
}

#[test]
fn frame_with_flipped_byte_fails_crc() -> Result<()> {
    let mut frame = encode_frame(1, BlockKind::Value, b"abcdef")?;
    let last = frame.len() - 1;
    frame[last] ^= 0xff;
    let mut cur = Cursor::new(frame);
    assert!(matches!(
        read_frame(&mut cur, 0),
        Err(StoreError::Corrupt { offset: 0, .. })
    ));
    Ok(())
}

#[test]
fn frame_with_unknown_kind_is_corrupt() -> Result<()> {
    let mut frame = encode_frame(1, BlockKind::Value, b"x")?;
    frame[12] = 99;
    let mut cur = Cursor::new(frame);
    assert!(matches!(
        read_frame(&mut cur, 0),
        Err(StoreError::Corrupt { .. })
    ));
    Ok(())
}

// -------------------- Value blocks --------------------

#[test]
fn value_block_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let v = nested();
    let id = h.write_value_block(&v)?;
    assert_eq!(id, 1);

    match &*h.read_block_by_id(id)? {
        Block::Value(read) => assert_eq!(read, &v),
        other => panic!("expected value block, got {:?}", other),
    }
    assert_eq!(h.read_value(id)?, v);
    Ok(())
}

#[test]
fn first_block_lands_after_header() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let a = h.write_value_block(&Value::from(1))?;
    let b = h.write_value_block(&Value::from(2))?;
    assert_eq!((a, b), (1, 2));

    let index = h.block_index()?;
    assert_eq!(index.blocks.get(&a), Some(&HEADER_BYTES));
    assert!(index.blocks[&b] > HEADER_BYTES);
    Ok(())
}

#[test]
fn missing_block_lists_known_ids() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    h.write_value_block(&Value::Nil)?;
    h.write_value_block(&Value::Nil)?;
    match h.read_block_by_id(9) {
        Err(StoreError::BlockNotFound { id, known_ids }) => {
            assert_eq!(id, 9);
            assert_eq!(known_ids, vec![1, 2]);
        }
        other => panic!("expected block not found, got {:?}", other),
    }
    Ok(())
}

#[test]
fn repeated_reads_hit_the_cache() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let id = h.write_value_block(&nested())?;
    let first = h.read_block_by_id(id)?;
    let second = h.read_block_by_id(id)?;
    assert!(Arc::ptr_eq(&first, &second));
    Ok(())
}

#[test]
fn corrupted_block_is_detected_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let (path, h) = new_store(dir.path())?;
    let id = h.write_value_block(&Value::from("some payload"))?;
    h.commit_root(id)?;
    h.close()?;

    // Inside the string: tag (1) + length (4) + "some ".
    let offset = HEADER_BYTES + BLOCK_HEADER_BYTES + 10;
    let mut f = OpenOptions::new().write(true).open(&path)?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(b"#")?;
    f.sync_all()?;

    let r = Handle::open_read_with(&path, test_config(5))?;
    assert!(matches!(r.read_root(), Err(StoreError::Corrupt { .. })));
    Ok(())
}

#[test]
fn root_roundtrip_through_fresh_handle() -> Result<()> {
    let dir = tempdir()?;
    let (path, h) = new_store(dir.path())?;
    let v = nested();
    let id = h.write_value_block(&v)?;
    h.set_root(id)?;
    h.write_block_index()?;
    h.close()?;

    let r = Handle::open_read_with(&path, test_config(5))?;
    match &*r.read_root()? {
        Block::Value(read) => {
            assert_eq!(read, &v);
            assert_eq!(read.to_string(), r#"{"bar" ["cat" #{"mew"}], "foo" 2}"#);
        }
        other => panic!("expected value root, got {:?}", other),
    }
    assert!(fs::metadata(&path)?.len() > HEADER_BYTES);
    Ok(())
}

#[test]
fn block_refs_cover_embedded_references() -> Result<()> {
    let v = Value::map([
        ("a", Value::BlockRef(3)),
        ("b", Value::seq([Value::BlockRef(5), Value::from(1)])),
    ]);
    let refs: BTreeSet<BlockId> = Block::Value(v).block_refs().into_iter().collect();
    assert_eq!(refs, BTreeSet::from([3, 5]));
    Ok(())
}
