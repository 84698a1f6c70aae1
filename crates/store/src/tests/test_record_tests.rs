use super::helpers::*;
use crate::test_record::{HISTORY_KEY, TEST_FILE_NAME};
use crate::*;
use anyhow::Result;
use std::path::Path;
use tempfile::tempdir;
use value::Value;

fn meta() -> TestMeta {
    TestMeta::new(
        "register",
        "20240102T030405.678Z",
        Value::map([
            ("concurrency", Value::from(5)),
            ("nodes", Value::seq(["n1", "n2", "n3"])),
        ]),
    )
}

// -------------------- Lifecycle --------------------

#[test]
fn initial_test_is_readable_immediately() -> Result<()> {
    let dir = tempdir()?;
    let (path, h) = new_store(dir.path())?;
    h.write_initial_test(&meta())?;

    let t = Handle::open_read_with(&path, test_config(5))?.read_test()?;
    assert_eq!(t.meta(), meta());
    assert_eq!(t.history, None);
    assert_eq!(t.results, None);
    assert_eq!(t.phase(), TestPhase::Base);
    Ok(())
}

#[test]
fn full_lifecycle_roundtrip() -> Result<()> {
    let dir = tempdir()?;
    let (path, h) = new_store(dir.path())?;
    let history = ops(17);
    let results = Value::map([
        ("valid?", Value::from(true)),
        ("anomalies", Value::set(Vec::<Value>::new())),
    ]);

    let mut test = h.write_initial_test(&meta())?;
    let mut w = h.test_history_writer(&test)?;
    for op in &history {
        w.append(op.clone())?;
    }
    let last_chunk = w.close()?;
    assert_eq!(test.history()?, Some(last_chunk));

    h.write_test_with_history(&mut test)?;
    let mid = h.read_test()?;
    assert_eq!(mid.phase(), TestPhase::Run);
    assert_eq!(mid.history.as_ref().map(BigVector::len), Some(17));

    h.write_test_with_results(&test, &results)?;
    h.close()?;

    let t = Handle::open_read_with(&path, test_config(5))?.read_test()?;
    assert_eq!(t.name, "register");
    assert_eq!(t.start_time, "20240102T030405.678Z");
    assert_eq!(t.options, meta().options);
    assert_eq!(t.phase(), TestPhase::Final);
    assert_eq!(t.results, Some(results));
    match &t.history {
        Some(bv) => assert_eq!(*bv, history),
        None => panic!("history missing"),
    }
    Ok(())
}

#[test]
fn results_before_history_fail() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let test = h.write_initial_test(&meta())?;
    assert!(matches!(
        h.write_test_with_results(&test, &Value::from("too early")),
        Err(StoreError::NoHistoryIdInMeta)
    ));

    // Streaming history is not enough; it must be committed into the base.
    let mut w = h.test_history_writer(&test)?;
    w.append(Value::from("op"))?;
    w.close()?;
    assert!(matches!(
        h.write_test_with_results(&test, &Value::from("still too early")),
        Err(StoreError::NoHistoryIdInMeta)
    ));
    Ok(())
}

#[test]
fn history_before_any_chunk_fails() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let mut test = h.write_initial_test(&meta())?;
    assert!(matches!(
        h.write_test_with_history(&mut test),
        Err(StoreError::NoHistoryIdInMeta)
    ));
    Ok(())
}

#[test]
fn results_can_be_replaced() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let test = h.write_test(&meta(), ops(3), Some(&Value::from("v1")))?;
    let size_after_first = h.file_len()?;

    h.write_test_with_results(&test, &Value::from("v2"))?;
    let t = h.read_test()?;
    assert_eq!(t.results, Some(Value::from("v2")));
    assert_eq!(t.history.as_ref().map(BigVector::len), Some(3));

    // Only the new value, a layer, and an index were appended.
    let growth = h.file_len()? - size_after_first;
    assert!(growth < 512, "results update grew the file by {} bytes", growth);
    Ok(())
}

#[test]
fn empty_history_is_still_a_history() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    h.write_test(&meta(), Vec::new(), None)?;
    let t = h.read_test()?;
    assert_eq!(t.phase(), TestPhase::Run);
    assert_eq!(t.history.map(|bv| bv.len()), Some(0));
    Ok(())
}

// -------------------- Incremental visibility --------------------

#[test]
fn each_chunk_is_committed_as_it_lands() -> Result<()> {
    let dir = tempdir()?;
    let (path, h) = new_store(dir.path())?;
    let mut test = h.write_initial_test(&meta())?;
    let mut w = h.test_history_writer(&test)?;
    for op in ops(12) {
        w.append(op)?;
    }
    w.close()?;

    // Without write_test_with_history the per-chunk layers already expose
    // the full history.
    let t = Handle::open_read_with(&path, test_config(5))?.read_test()?;
    assert_eq!(t.history.map(|bv| bv.len()), Some(12));
    h.write_test_with_history(&mut test)?;
    Ok(())
}

#[test]
fn late_chunk_keeps_committed_results() -> Result<()> {
    let dir = tempdir()?;
    let path = store_path(dir.path());
    let h = Handle::create(&path, test_config(2))?;

    let mut test = h.write_initial_test(&meta())?;
    let mut w = h.test_history_writer(&test)?;
    w.append(Value::from("op-0"))?;
    w.append(Value::from("op-1"))?;
    // Wait for the worker to commit the first chunk.
    for _ in 0..200 {
        if test.history()?.is_some() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    h.write_test_with_history(&mut test)?;
    h.write_test_with_results(&test, &Value::from("valid"))?;

    w.append(Value::from("op-2"))?;
    let last = w.close()?;
    assert_eq!(test.history()?, Some(last));

    let t = Handle::open_read_with(&path, test_config(2))?.read_test()?;
    assert_eq!(t.results, Some(Value::from("valid")));
    assert_eq!(t.history.as_ref().map(|bv| bv.len()), Some(3));
    assert_eq!(t.meta(), meta());
    Ok(())
}

#[test]
fn malformed_record_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let (_path, h) = new_store(dir.path())?;
    let mut layer = std::collections::BTreeMap::new();
    layer.insert(Value::from("name"), Value::from(12));
    let id = h.write_partial_map_block(&layer, None)?;
    h.commit_root(id)?;
    assert!(matches!(h.read_test(), Err(StoreError::MalformedTest(_))));

    layer.insert(Value::from("name"), Value::from("ok"));
    layer.insert(Value::from("start-time"), Value::from("t"));
    layer.insert(Value::from(HISTORY_KEY), Value::from("not a ref"));
    let id = h.write_partial_map_block(&layer, None)?;
    h.commit_root(id)?;
    assert!(matches!(h.read_test(), Err(StoreError::MalformedTest(_))));
    Ok(())
}

#[test]
fn test_path_layout() {
    let p = test_path("/store", "etcd", "20240101T000000.000Z");
    assert_eq!(
        p,
        Path::new("/store")
            .join("etcd")
            .join("20240101T000000.000Z")
            .join(TEST_FILE_NAME)
    );
}
