//! In-memory fakes for the external collaborators in `env.rs`, used by
//! this crate's own tests and available to downstream crates under the
//! `testing` feature, the way the wider codebase ships `testing` feature
//! fakes alongside its real storage/search backends.

use std::{
    collections::HashMap,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    env::{
        DataSegment,
        DeepStorage,
        IndexIo,
        MutableIndex,
        QueryableIndex,
        SegmentAnnouncer,
    },
    identifier::{
        Interval,
        SegmentIdentifier,
        ShardSpec,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeRow(pub i64);

pub fn test_identifier(version: &str) -> SegmentIdentifier {
    SegmentIdentifier::new(
        "events",
        Interval::new(0, 60_000).unwrap(),
        version,
        ShardSpec(serde_json::json!({"type": "numbered", "shard": 0})),
    )
}

#[derive(Serialize, Deserialize, Default)]
struct FakeIndexFile {
    rows: Vec<FakeRow>,
}

pub struct FakeMutableIndex {
    rows: Vec<FakeRow>,
    capacity: Option<usize>,
    bytes_per_row: usize,
}

impl MutableIndex<FakeRow> for FakeMutableIndex {
    fn add(&mut self, row: &FakeRow) -> anyhow::Result<()> {
        anyhow::ensure!(self.can_append_row(), "fake index is full");
        self.rows.push(*row);
        Ok(())
    }

    fn num_rows(&self) -> usize {
        self.rows.len()
    }

    fn bytes_in_memory(&self) -> usize {
        self.rows.len() * self.bytes_per_row
    }

    fn can_append_row(&self) -> bool {
        self.capacity.map(|cap| self.rows.len() < cap).unwrap_or(true)
    }
}

pub struct FakeQueryableIndex {
    rows: Vec<FakeRow>,
}

impl QueryableIndex for FakeQueryableIndex {
    fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// An `IndexIo` that spills JSON files of `FakeRow`s to disk. `capacity`
/// bounds how many rows a fresh mutable index will accept before
/// `can_append_row` turns false; `None` means unbounded.
pub struct FakeIo {
    capacity: Option<usize>,
    bytes_per_row: usize,
}

impl FakeIo {
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            bytes_per_row: 8,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            bytes_per_row: 8,
        }
    }
}

#[async_trait]
impl IndexIo for FakeIo {
    type Row = FakeRow;
    type Mutable = FakeMutableIndex;
    type Queryable = FakeQueryableIndex;

    fn new_mutable_index(&self) -> Self::Mutable {
        FakeMutableIndex {
            rows: Vec::new(),
            capacity: self.capacity,
            bytes_per_row: self.bytes_per_row,
        }
    }

    async fn persist(&self, index: &Self::Mutable, dir: &Path) -> anyhow::Result<(usize, Self::Queryable)> {
        tokio::fs::create_dir_all(dir).await?;
        let file = FakeIndexFile {
            rows: index.rows.clone(),
        };
        let bytes = serde_json::to_vec(&file)?;
        tokio::fs::write(dir.join("data.json"), bytes).await?;
        let num_rows = file.rows.len();
        Ok((num_rows, FakeQueryableIndex { rows: file.rows }))
    }

    fn open_queryable(&self, dir: &Path) -> anyhow::Result<Self::Queryable> {
        let bytes = std::fs::read(dir.join("data.json"))?;
        let file: FakeIndexFile = serde_json::from_slice(&bytes)?;
        Ok(FakeQueryableIndex { rows: file.rows })
    }

    async fn merge(&self, indexes: &[Arc<Self::Queryable>], out_dir: &Path) -> anyhow::Result<Self::Queryable> {
        tokio::fs::create_dir_all(out_dir).await?;
        let mut rows = Vec::new();
        for index in indexes {
            rows.extend(index.rows.iter().copied());
        }
        let file = FakeIndexFile { rows: rows.clone() };
        let bytes = serde_json::to_vec(&file)?;
        tokio::fs::write(out_dir.join("data.json"), bytes).await?;
        Ok(FakeQueryableIndex { rows })
    }
}

/// A deep-storage fake that records every accepted push and can be told to
/// fail the first `fail_count` attempts, for exercising the merge engine's
/// retry loop.
#[derive(Clone)]
pub struct FakeDeepStorage {
    pushed: Arc<Mutex<HashMap<String, DataSegment>>>,
    remaining_failures: Arc<AtomicUsize>,
}

impl FakeDeepStorage {
    pub fn new() -> Self {
        Self {
            pushed: Arc::new(Mutex::new(HashMap::new())),
            remaining_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(times: usize) -> Self {
        let storage = Self::new();
        storage.remaining_failures.store(times, Ordering::SeqCst);
        storage
    }

    pub fn pushed_segments(&self) -> Vec<DataSegment> {
        self.pushed.lock().values().cloned().collect()
    }
}

impl Default for FakeDeepStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeepStorage for FakeDeepStorage {
    async fn push(&self, _file: &Path, descriptor: DataSegment, _use_unique_path: bool) -> anyhow::Result<DataSegment> {
        if self.remaining_failures.load(Ordering::SeqCst) > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            anyhow::bail!("simulated transient deep storage failure");
        }
        self.pushed
            .lock()
            .insert(descriptor.identifier.to_string(), descriptor.clone());
        Ok(descriptor)
    }
}

pub struct FakeAnnouncer {
    pub announced: Mutex<Vec<SegmentIdentifier>>,
}

impl FakeAnnouncer {
    pub fn new() -> Self {
        Self {
            announced: Mutex::new(Vec::new()),
        }
    }
}

impl Default for FakeAnnouncer {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentAnnouncer for FakeAnnouncer {
    fn announce(&self, identifier: &SegmentIdentifier) -> anyhow::Result<()> {
        self.announced.lock().push(identifier.clone());
        Ok(())
    }

    fn unannounce(&self, identifier: &SegmentIdentifier) -> anyhow::Result<()> {
        self.announced.lock().retain(|id| id != identifier);
        Ok(())
    }
}

pub fn temp_base_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().to_path_buf();
    (dir, path)
}

/// Installs a best-effort `tracing` subscriber so a failing test prints
/// the `tracing::{info,warn,error}` calls this crate makes along the way
/// (persist triggers, backpressure warnings, latched errors). Safe to call
/// from more than one test in the same process; only the first call wins.
pub fn init_tracing_for_tests() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
