use super::helpers::*;
use crate::*;
use anyhow::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;
use value::Value;

const CHUNK: usize = 5;

fn hash_of<T: Hash>(t: &T) -> u64 {
    let mut h = DefaultHasher::new();
    t.hash(&mut h);
    h.finish()
}

fn write_vector(h: &Handle, items: &[Value]) -> Result<BlockId> {
    let mut w = h.vector_writer(None, CHUNK)?;
    for item in items {
        w.append(item.clone())?;
    }
    Ok(w.close()?)
}

/// Checks every read and persistent-update operation against a plain Vec.
fn check_against_vec(bv: &BigVector, items: &[Value]) -> Result<()> {
    let n = items.len();
    assert_eq!(bv.len(), n);
    assert_eq!(bv.is_empty(), n == 0);
    assert_eq!(bv.to_vec()?, items);
    assert_eq!(*bv, items.to_vec());
    assert_eq!(hash_of(bv), hash_of(&items.to_vec()));

    for (i, item) in items.iter().enumerate() {
        assert_eq!(&bv.get(i)?, item);
    }
    assert!(matches!(
        bv.get(n),
        Err(StoreError::IndexOutOfBounds { .. })
    ));

    // Iteration in both directions.
    let rev: Vec<Value> = bv.iter().rev().collect::<crate::Result<_>>()?;
    let mut expected_rev = items.to_vec();
    expected_rev.reverse();
    assert_eq!(rev, expected_rev);
    assert_eq!(bv.iter().len(), n);
    assert_eq!(bv.last()?, items.last().cloned());

    // Parallel fold preserves order and visits everything once.
    let count = bv.par_fold(|| 0usize, |acc, _| acc + 1, |a, b| a + b)?;
    assert_eq!(count, n);
    let gathered = bv.par_fold(
        Vec::new,
        |mut acc, v| {
            acc.push(v);
            acc
        },
        |mut a, mut b| {
            a.append(&mut b);
            a
        },
    )?;
    assert_eq!(gathered, items);

    assert!(!bv.contains_index(-1));
    assert_eq!(bv.contains_index(0), n > 0);
    assert_eq!(bv.contains_index(n as i64 - 1), n > 0);
    assert!(!bv.contains_index(n as i64));

    // Persistent updates leave the original alone.
    let marker = Value::from("marker");
    let pushed = bv.push(marker.clone());
    let mut expected = items.to_vec();
    expected.push(marker.clone());
    assert_eq!(pushed.to_vec()?, expected);
    assert_eq!(bv.len(), n);

    if n > 0 {
        let first = bv.with_set(0, marker.clone())?;
        assert_eq!(first.get(0)?, marker);
        assert_eq!(first.len(), n);
        assert_eq!(first.to_vec()?[1..], items[1..]);

        let last = bv.with_set(n - 1, marker.clone())?;
        assert_eq!(last.last()?, Some(marker.clone()));
        assert_eq!(last.to_vec()?[..n - 1], items[..n - 1]);

        let popped = bv.pop()?;
        assert_eq!(popped.to_vec()?, items[..n - 1]);
        assert_eq!(bv.get(n - 1)?, items[n - 1]);
    } else {
        assert!(bv.pop().is_err());
    }
    assert_eq!(bv.with_set(n, marker.clone())?.to_vec()?, expected);
    assert!(bv.with_set(n + 1, marker).is_err());

    // Views.
    let empty_view = bv.subvec(n, n)?;
    assert!(empty_view.is_empty());
    assert_eq!(empty_view, BigVector::empty());
    if n >= 2 {
        let mid = bv.subvec(1, n - 1)?;
        assert_eq!(mid.to_vec()?, items[1..n - 1]);
        assert_eq!(mid.get(0)?, items[1]);
        assert_eq!(mid.par_fold(|| 0usize, |a, _| a + 1, |a, b| a + b)?, n - 2);
    }
    assert!(bv.subvec(0, n + 1).is_err());
    Ok(())
}

#[test]
fn stored_vectors_match_plain_vectors() -> Result<()> {
    for n in [0usize, 1, 6, 128] {
        let dir = tempdir()?;
        let (path, h) = new_store(dir.path())?;
        let items = ops(n);
        let id = write_vector(&h, &items)?;

        check_against_vec(&h.read_big_vector(id)?, &items)?;

        // And through an independent reader.
        h.commit_root(id)?;
        h.close()?;
        let r = Handle::open_read_with(&path, test_config(CHUNK))?;
        let bv = r.read_big_vector(id)?;
        check_against_vec(&bv, &items)?;
        assert_eq!(bv, BigVector::from_vec(items.clone()));
        assert_eq!(r.read_value(id)?, Value::Seq(items));
    }
    Ok(())
}

#[test]
fn in_memory_vectors_match_plain_vectors() -> Result<()> {
    for n in [0usize, 1, 6, 128] {
        check_against_vec(&BigVector::from_vec(ops(n)), &ops(n))?;
    }
    Ok(())
}

#[test]
fn chunks_hold_at_most_chunk_size_items() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let id = write_vector(&h, &ops(12))?;

    let mut sizes = Vec::new();
    let mut next = Some(id);
    while let Some(id) = next {
        match &*h.read_block_by_id(id)? {
            Block::VectorChunk(chunk) => {
                sizes.push(chunk.items.len());
                next = chunk.prev;
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }
    sizes.reverse();
    assert_eq!(sizes, vec![5, 5, 2]);
    Ok(())
}

#[test]
fn empty_writer_still_produces_a_chunk() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let w = h.vector_writer(None, CHUNK)?;
    assert_eq!(w.latest()?, None);
    let id = w.close()?;
    let bv = h.read_big_vector(id)?;
    assert!(bv.is_empty());
    assert_eq!(bv.last()?, None);
    Ok(())
}

#[test]
fn writer_can_extend_an_existing_vector() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let items = ops(13);
    let first = write_vector(&h, &items[..7])?;

    let mut w = h.vector_writer(Some(first), CHUNK)?;
    assert_eq!(w.latest()?, Some(first));
    for item in &items[7..] {
        w.append(item.clone())?;
    }
    let id = w.close()?;

    assert_eq!(h.read_big_vector(id)?.to_vec()?, items);
    // The shorter vector is still intact.
    assert_eq!(h.read_big_vector(first)?.to_vec()?, items[..7]);
    Ok(())
}

#[test]
fn latest_tracks_flushed_chunks() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let mut w = h.vector_writer(None, CHUNK)?;
    for item in ops(CHUNK + 1) {
        w.append(item)?;
    }
    // The first chunk is written asynchronously.
    let mut latest = None;
    for _ in 0..200 {
        latest = w.latest()?;
        if latest.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let first = latest.expect("first chunk was never written");
    assert_eq!(h.read_big_vector(first)?.len(), CHUNK);

    let id = w.close()?;
    assert!(id > first);
    assert_eq!(h.read_big_vector(id)?.len(), CHUNK + 1);
    Ok(())
}

#[test]
fn dropped_writer_flushes_its_buffer() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let before = h.block_index()?.blocks.len();
    {
        let mut w = h.vector_writer(None, CHUNK)?;
        for item in ops(3) {
            w.append(item)?;
        }
    }
    let index = h.block_index()?;
    assert_eq!(index.blocks.len(), before + 1);
    let id = index.max_id();
    assert_eq!(h.read_big_vector(id)?.len(), 3);
    Ok(())
}

#[test]
fn hook_sees_every_chunk() -> Result<()> {
    use std::sync::{Arc, Mutex};

    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let hook: ChunkHook = Box::new(move |handle: &Handle, id: BlockId| -> crate::Result<()> {
        let len = handle.read_big_vector(id)?.len();
        sink.lock().map_err(|e| StoreError::LockPoisoned(e.to_string()))?.push(len);
        Ok(())
    });

    let mut w = h.vector_writer_with_hook(None, CHUNK, hook)?;
    for item in ops(11) {
        w.append(item)?;
    }
    w.close()?;
    assert_eq!(*seen.lock().unwrap(), vec![5, 10, 11]);
    Ok(())
}

#[test]
fn reading_a_non_chunk_fails() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let id = h.write_value_block(&Value::from("nope"))?;
    assert!(matches!(
        h.read_big_vector(id),
        Err(StoreError::UnexpectedBlockKind {
            expected: BlockKind::VectorChunk,
            ..
        })
    ));
    Ok(())
}

#[test]
fn updates_across_chunk_boundaries() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let items = ops(12);
    let id = write_vector(&h, &items)?;
    let bv = h.read_big_vector(id)?;

    // Pop into the stored part, then push over the vacated slot.
    let shrunk = bv.pop()?.pop()?.pop()?;
    assert_eq!(shrunk.len(), 9);
    let regrown = shrunk.push(Value::from("x"));
    assert_eq!(regrown.get(9)?, Value::from("x"));
    assert_eq!(regrown.len(), 10);
    assert_eq!(bv.get(9)?, items[9]);

    // A view over the middle chunk, then appended past the view.
    let view = bv.subvec(5, 10)?.push(Value::from("y"));
    assert_eq!(view.len(), 6);
    assert_eq!(view.get(5)?, Value::from("y"));
    assert_eq!(bv.get(10)?, items[10]);
    Ok(())
}
