//! Test records: metadata, history, and results of one test run.
//!
//! A record is a chain of partial-map layers. The first layer holds the
//! metadata and is committed before the test starts, so even a run that
//! crashes immediately leaves a readable file. The history is streamed
//! into a big vector while the test runs; each finished chunk commits a
//! small layer pointing at it. Results arrive last, in their own value
//! block, and can be replaced without touching the history. Each commit
//! repeats the latest history and results refs, so chunks and results may
//! land in either order.
//!
//! ```text
//! layer {name, start-time, options}          <- write_initial_test
//!   ^-- layer {history: ref}                 <- write_test_with_history
//!         ^-- layer {history, results: ref}  <- write_test_with_results
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use value::Value;

use crate::big_vector::{BigVector, VectorWriter};
use crate::error::{Result, StoreError};
use crate::handle::Handle;
use crate::BlockId;

pub const NAME_KEY: &str = "name";
pub const START_TIME_KEY: &str = "start-time";
pub const OPTIONS_KEY: &str = "options";
pub const HISTORY_KEY: &str = "history";
pub const RESULTS_KEY: &str = "results";

/// File name of a test record inside its run directory.
pub const TEST_FILE_NAME: &str = "test.jepsen";

/// What is known about a test before it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TestMeta {
    pub name: String,
    /// Start time as it appears in the run directory name.
    pub start_time: String,
    pub options: Value,
}

impl TestMeta {
    pub fn new(name: impl Into<String>, start_time: impl Into<String>, options: Value) -> Self {
        Self {
            name: name.into(),
            start_time: start_time.into(),
            options,
        }
    }

    fn to_layer(&self) -> BTreeMap<Value, Value> {
        let mut layer = BTreeMap::new();
        layer.insert(Value::from(NAME_KEY), Value::from(self.name.as_str()));
        layer.insert(
            Value::from(START_TIME_KEY),
            Value::from(self.start_time.as_str()),
        );
        layer.insert(Value::from(OPTIONS_KEY), self.options.clone());
        layer
    }
}

/// How far a stored test got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    /// Metadata only.
    Base,
    /// History present, no results yet.
    Run,
    /// Results written.
    Final,
}

/// A test read back from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct Test {
    pub name: String,
    pub start_time: String,
    pub options: Value,
    pub history: Option<BigVector>,
    pub results: Option<Value>,
}

impl Test {
    #[must_use]
    pub fn phase(&self) -> TestPhase {
        match (&self.history, &self.results) {
            (_, Some(_)) => TestPhase::Final,
            (Some(_), None) => TestPhase::Run,
            (None, None) => TestPhase::Base,
        }
    }

    #[must_use]
    pub fn meta(&self) -> TestMeta {
        TestMeta::new(self.name.clone(), self.start_time.clone(), self.options.clone())
    }
}

/// Where a written test's layers stand.
///
/// `base` is the layer later layers are written over. The state is shared
/// with the history writer's worker, which advances `history` as chunks
/// land. Every commit for the test, from the worker or the caller, holds the
/// lock and writes the current history and results over the current base,
/// so a late chunk cannot roll back results committed before it.
#[derive(Debug, Clone)]
pub struct TestRef {
    state: Arc<Mutex<TestState>>,
}

#[derive(Debug)]
struct TestState {
    base: BlockId,
    history: Option<BlockId>,
    results: Option<BlockId>,
}

impl TestRef {
    fn lock(&self) -> Result<MutexGuard<'_, TestState>> {
        self.state
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// The layer new layers are written over.
    pub fn base(&self) -> Result<BlockId> {
        Ok(self.lock()?.base)
    }

    /// The most recent history chunk, if any has been written.
    pub fn history(&self) -> Result<Option<BlockId>> {
        Ok(self.lock()?.history)
    }
}

impl Handle {
    /// Writes `{history, results}` (whichever are known) over the state's
    /// base and makes it the root.
    fn commit_test_layer(&self, state: &TestState) -> Result<BlockId> {
        let mut layer = BTreeMap::new();
        if let Some(chunk) = state.history {
            layer.insert(Value::from(HISTORY_KEY), Value::BlockRef(chunk));
        }
        if let Some(results) = state.results {
            layer.insert(Value::from(RESULTS_KEY), Value::BlockRef(results));
        }
        let id = self.write_partial_map_block(&layer, Some(state.base))?;
        self.commit_root(id)?;
        Ok(id)
    }

    /// Commits the metadata layer. Name and options are readable as soon as
    /// this returns.
    pub fn write_initial_test(&self, meta: &TestMeta) -> Result<TestRef> {
        let base = self.write_partial_map_block(&meta.to_layer(), None)?;
        self.commit_root(base)?;
        info!(name = %meta.name, start_time = %meta.start_time, base, "committed initial test");
        Ok(TestRef {
            state: Arc::new(Mutex::new(TestState {
                base,
                history: None,
                results: None,
            })),
        })
    }

    /// A writer for the test's history. Every chunk it writes is committed
    /// at once as a `{history: chunk}` layer over the test's current base,
    /// keeping any results already written, so readers that reload the
    /// index see the history grow a chunk at a time.
    pub fn test_history_writer(&self, test: &TestRef) -> Result<VectorWriter> {
        let test = test.clone();
        let hook = move |handle: &Handle, chunk: BlockId| -> Result<()> {
            let mut state = test.lock()?;
            state.history = Some(chunk);
            handle.commit_test_layer(&state)?;
            Ok(())
        };
        self.vector_writer_with_hook(None, self.config().chunk_size, Box::new(hook))
    }

    /// Commits a layer pointing at the latest history chunk and makes it the
    /// base for results. History bytes are not rewritten.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoHistoryIdInMeta`] if no history chunk has been
    /// written for this test.
    pub fn write_test_with_history(&self, test: &mut TestRef) -> Result<BlockId> {
        let mut state = test.lock()?;
        let chunk = state.history.ok_or(StoreError::NoHistoryIdInMeta)?;
        let layer = self.commit_test_layer(&state)?;
        state.base = layer;
        info!(layer, history = chunk, "committed test history");
        Ok(layer)
    }

    /// Writes `results` and commits a layer pointing at them over the base
    /// layer. Calling again replaces the results; the old layer and value
    /// block become garbage.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoHistoryIdInMeta`] if the base layer has no history.
    pub fn write_test_with_results(&self, test: &TestRef, results: &Value) -> Result<BlockId> {
        let mut state = test.lock()?;
        let base = self.resolve_partial_map(Some(state.base))?;
        if !base.contains_key(&Value::from(HISTORY_KEY)) {
            return Err(StoreError::NoHistoryIdInMeta);
        }
        let results_id = self.write_value_block(results)?;
        state.results = Some(results_id);
        let layer = self.commit_test_layer(&state)?;
        info!(layer, results = results_id, "committed test results");
        Ok(layer)
    }

    /// Reads the test the root points at, with every layer applied. The
    /// history is returned lazily; only its last chunk header is read here.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoRoot`] if nothing is committed;
    /// [`StoreError::MalformedTest`] if a required field is missing or has
    /// the wrong type.
    pub fn read_test(&self) -> Result<Test> {
        let root = self.root()?.ok_or(StoreError::NoRoot)?;
        let fields = self.resolve_partial_map(Some(root))?;
        let field = |key: &str| fields.get(&Value::from(key));
        let text = |key: &str| -> Result<String> {
            field(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StoreError::MalformedTest(format!("missing string field {:?}", key)))
        };
        let block_ref = |key: &str| -> Result<Option<BlockId>> {
            match field(key) {
                None | Some(Value::Nil) => Ok(None),
                Some(Value::BlockRef(id)) => Ok(Some(*id)),
                Some(other) => Err(StoreError::MalformedTest(format!(
                    "field {:?} should reference a block, found {}",
                    key, other
                ))),
            }
        };

        let name = text(NAME_KEY)?;
        let start_time = text(START_TIME_KEY)?;
        let options = field(OPTIONS_KEY).cloned().unwrap_or(Value::Nil);
        let history = block_ref(HISTORY_KEY)?
            .map(|id| self.read_big_vector(id))
            .transpose()?;
        let results = block_ref(RESULTS_KEY)?
            .map(|id| self.read_value(id))
            .transpose()?;

        Ok(Test {
            name,
            start_time,
            options,
            history,
            results,
        })
    }

    /// Writes a whole test in one go: metadata, `history`, and optionally
    /// `results`.
    pub fn write_test<I>(
        &self,
        meta: &TestMeta,
        history: I,
        results: Option<&Value>,
    ) -> Result<TestRef>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut test = self.write_initial_test(meta)?;
        let mut writer = self.test_history_writer(&test)?;
        for op in history {
            writer.append(op)?;
        }
        writer.close()?;
        self.write_test_with_history(&mut test)?;
        if let Some(results) = results {
            self.write_test_with_results(&test, results)?;
        }
        Ok(test)
    }
}

/// Conventional location of a test's file: `<store>/<name>/<start-time>/test.jepsen`.
#[must_use]
pub fn test_path<P: AsRef<Path>>(store_dir: P, name: &str, start_time: &str) -> PathBuf {
    store_dir
        .as_ref()
        .join(name)
        .join(start_time)
        .join(TEST_FILE_NAME)
}
