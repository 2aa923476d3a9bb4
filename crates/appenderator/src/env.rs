//! External collaborators the appenderator is built against.
//!
//! Out of scope for this crate: the row parser and input
//! source, the in-memory columnar index (`add`/`size`/`bytesInMemory`/
//! `canAppendRow`/`persist`/`merge`), the deep-storage uploader, the
//! segment announcer, and query runners. We express each as a trait so the
//! core is generic over whatever storage engine a caller plugs in, the way
//! `database::committer::Committer<RT: Runtime>` is generic over a single
//! bundling `Runtime` trait rather than over half a dozen individual ones.

use std::{
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{
    Deserialize,
    Serialize,
};

use crate::identifier::SegmentIdentifier;

/// The receipt a successful push produces and, if `descriptor.json` already
/// exists, the value an idempotent re-push returns unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSegment {
    pub identifier: SegmentIdentifier,
    pub num_rows: usize,
    pub size_bytes: u64,
    /// Opaque location in deep storage; interpreted only by the `DeepStorage`
    /// implementation that produced it.
    pub location: String,
}

/// The in-memory, appendable index backing one FireHydrant. Supplies
/// exactly the operations `add`, `size`, `bytesInMemory`, `canAppendRow`.
pub trait MutableIndex<Row>: Send + Sync {
    fn add(&mut self, row: &Row) -> anyhow::Result<()>;
    /// Row count currently held.
    fn num_rows(&self) -> usize;
    fn bytes_in_memory(&self) -> usize;
    /// False once the index judges itself full (e.g. a fixed-capacity
    /// dictionary or column buffer has no room for another row).
    fn can_append_row(&self) -> bool;
}

/// A handle to an on-disk queryable index: either one hydrant's spill or a
/// merged segment. Opaque to the core beyond its row count.
pub trait QueryableIndex: Send + Sync {
    fn num_rows(&self) -> usize;
}

/// Bundles the per-deployment pieces the appenderator core is generic over:
/// how to create a fresh mutable index, how to persist one to disk, how to
/// reopen a persisted index, and how to merge several into one.
#[async_trait]
pub trait IndexIo: Send + Sync + 'static {
    type Row: Send + Sync + 'static;
    type Mutable: MutableIndex<Self::Row> + 'static;
    type Queryable: QueryableIndex + 'static;

    fn new_mutable_index(&self) -> Self::Mutable;

    /// `persist(index → file)` from 
    /// into `dir` and return a queryable handle plus the row count written.
    async fn persist(&self, index: &Self::Mutable, dir: &Path) -> anyhow::Result<(usize, Self::Queryable)>;

    /// Reopen a previously-persisted spill or merged directory, e.g. at
    /// push time when a sink is reconstructed from disk.
    fn open_queryable(&self, dir: &Path) -> anyhow::Result<Self::Queryable>;

    /// `merge(files → file)` from 
    async fn merge(&self, indexes: &[Arc<Self::Queryable>], out_dir: &Path) -> anyhow::Result<Self::Queryable>;
}

/// `push(file, descriptor, unique) → descriptor` from 
#[async_trait]
pub trait DeepStorage: Send + Sync + 'static {
    async fn push(&self, file: &Path, descriptor: DataSegment, use_unique_path: bool) -> anyhow::Result<DataSegment>;
}

/// The segment announcer. Failures are logged but non-fatal.
pub trait SegmentAnnouncer: Send + Sync + 'static {
    fn announce(&self, identifier: &SegmentIdentifier) -> anyhow::Result<()>;
    fn unannounce(&self, identifier: &SegmentIdentifier) -> anyhow::Result<()>;
}

/// An externally supplied query runner. If unset, query
/// requests fail rather than silently returning nothing.
#[async_trait]
pub trait QueryWalker<Row>: Send + Sync + 'static {
    async fn run_for_intervals(
        &self,
        query: serde_json::Value,
        identifiers: &[SegmentIdentifier],
    ) -> anyhow::Result<serde_json::Value>;

    async fn run_for_segments(
        &self,
        query: serde_json::Value,
        identifiers: &[SegmentIdentifier],
    ) -> anyhow::Result<serde_json::Value>;
}
