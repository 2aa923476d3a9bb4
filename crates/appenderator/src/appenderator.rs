//! Lifecycle Controller: the public `Appenderator` surface, tying
//! together the sink registry, memory accountant, persistence engine, merge
//! and push engine, executor orchestrator, directory lock, and query
//! forwarder. Mirrors `database::committer::Committer`'s role as the single
//! owning facade a caller drives through `start`/work/`close`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    accountant::MemoryAccountant,
    config::AppenderatorConfig,
    env::{
        DataSegment,
        DeepStorage,
        IndexIo,
        QueryWalker,
        SegmentAnnouncer,
    },
    errors::ErrorMetadata,
    executor::ExecutorOrchestrator,
    identifier::SegmentIdentifier,
    layout::{
        self,
        DirectoryLock,
    },
    merge::MergePushEngine,
    metrics,
    persist::PersistenceEngine,
    query::QueryForwarder,
    registry::SinkRegistry,
};

/// A single ingestion request: the identifier to append to
/// and the row itself. Batch appenderators forbid a caller-supplied
/// committer; there is nothing here to acknowledge beyond the return value.
pub struct AddResult {
    pub identifier: SegmentIdentifier,
    pub num_rows_in_segment: usize,
    /// Always `false`: a batch appenderator never asks its caller to drive
    /// an out-of-band persist.
    pub is_persist_required: bool,
}

/// Ties the pieces in this crate together into the object a batch ingestion
/// job actually drives. Generic over `IO` (the storage engine plugged in)
/// and over the row type it carries end to end.
pub struct Appenderator<IO: IndexIo> {
    data_source: String,
    io: Arc<IO>,
    announcer: Arc<dyn SegmentAnnouncer>,
    registry: Arc<SinkRegistry<IO>>,
    accountant: Arc<MemoryAccountant>,
    executors: Arc<ExecutorOrchestrator>,
    persist_engine: PersistenceEngine<IO>,
    merge_engine: MergePushEngine<IO>,
    query: QueryForwarder<IO::Row>,
    lock: Mutex<Option<DirectoryLock>>,
    /// Latched on the first fatal error: every producer
    /// facing operation checks this before doing any work, and a populated
    /// latch makes every subsequent call fail with the same error.
    first_error: Mutex<Option<Arc<anyhow::Error>>>,
    closed: Mutex<bool>,
}

impl<IO: IndexIo> Appenderator<IO> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data_source: impl Into<String>,
        config: AppenderatorConfig,
        io: Arc<IO>,
        deep_storage: Arc<dyn DeepStorage>,
        announcer: Arc<dyn SegmentAnnouncer>,
        query_walker: Option<Arc<dyn QueryWalker<IO::Row>>>,
    ) -> anyhow::Result<Self> {
        let lock = DirectoryLock::acquire(&config.base_persist_directory)?;
        let base_dir = config.base_persist_directory.clone();
        let max_push_attempts = config.max_push_attempts;
        let max_pending_persists = config.max_pending_persists;

        let registry = Arc::new(SinkRegistry::new());
        let accountant = Arc::new(MemoryAccountant::new(config));
        let executors = Arc::new(ExecutorOrchestrator::new(max_pending_persists));

        let persist_engine = PersistenceEngine::new(io.clone(), base_dir.clone(), registry.clone(), accountant.clone(), executors.clone());
        let merge_engine = MergePushEngine::new(
            io.clone(),
            deep_storage,
            base_dir,
            registry.clone(),
            executors.clone(),
            max_push_attempts,
        );

        Ok(Self {
            data_source: data_source.into(),
            io,
            announcer,
            registry,
            accountant,
            executors,
            persist_engine,
            merge_engine,
            query: QueryForwarder::new(query_walker),
            lock: Mutex::new(Some(lock)),
            first_error: Mutex::new(None),
            closed: Mutex::new(false),
        })
    }

    fn check_first_error(&self) -> anyhow::Result<()> {
        if let Some(err) = self.first_error.lock().clone() {
            return Err(anyhow::anyhow!("{err}"));
        }
        Ok(())
    }

    fn latch_first_error(&self, err: anyhow::Error) -> anyhow::Error {
        let shared = Arc::new(err);
        let mut latch = self.first_error.lock();
        if latch.is_none() {
            *latch = Some(shared.clone());
        }
        anyhow::anyhow!("{shared}")
    }

    /// `add(identifier, row)`: validates the request, routes
    /// the row to the identifier's sink, records memory usage, and triggers
    /// a background persist if the accountant says one is due.
    pub async fn add(&self, identifier: &SegmentIdentifier, row: &IO::Row, committer_supplied: bool) -> anyhow::Result<AddResult> {
        self.check_first_error()?;
        anyhow::ensure!(
            identifier.data_source == self.data_source,
            ErrorMetadata::invalid_argument(
                "DataSourceMismatch",
                format!("identifier's dataSource {} does not match this appenderator's {}", identifier.data_source, self.data_source),
            )
        );
        anyhow::ensure!(
            !committer_supplied,
            ErrorMetadata::invalid_argument("CommitterNotAllowed", "a batch appenderator does not accept a committer")
        );

        let sink = self.registry.get_or_create(identifier, &self.io, self.announcer.as_ref(), &self.accountant);
        anyhow::ensure!(
            sink.is_writable(),
            ErrorMetadata::segment_not_writable(format!("{identifier} is no longer writable"))
        );

        let row_bytes = {
            let hydrant = sink.current_hydrant().await;
            let bytes_before = hydrant.bytes_in_memory().await;
            hydrant
                .with_mutable(|index| index.add(row))
                .await
                .map_err(|err| self.latch_first_error(err.context(ErrorMetadata::index_size_exceeded(format!("failed to add a row to {identifier}")))))?;
            hydrant.bytes_in_memory().await.saturating_sub(bytes_before)
        };
        self.accountant.record_row_added(row_bytes);
        metrics::set_rows_in_memory(self.accountant.rows_in_memory());
        metrics::set_bytes_in_memory(self.accountant.bytes_in_memory());
        metrics::set_total_rows(self.accountant.total_rows());

        let metadata = self.registry.metadata_for(identifier);
        metadata.add_rows(1);

        let can_append = sink.can_append_row().await;
        if let Some(trigger) = self.accountant.check_triggers(can_append) {
            tracing::info!(identifier = %identifier, reason = trigger.reason(), "persist triggered");
            let (bytes_to_be_persisted, sink_count, hydrant_count) = self.bytes_to_be_persisted().await;
            self.accountant
                .assert_heap_limit_not_exceeded(bytes_to_be_persisted, sink_count, hydrant_count)
                .map_err(|err| self.latch_first_error(err.context(ErrorMetadata::heap_usage_limit_exceeded(format!("{identifier} triggered a persist that would leave the appenderator over its heap usage limit")))))?;
            self.persist_all().await?;
        }

        Ok(AddResult {
            identifier: identifier.clone(),
            num_rows_in_segment: metadata.num_rows_in_segment(),
            is_persist_required: false,
        })
    }

    /// `bytesToBePersisted`: the sum of in-memory bytes
    /// across every live sink, plus the current hydrant's overhead for
    /// every swappable sink (it stays memory-mapped after the persist
    /// that's about to run). Also returns the live sink count and total
    /// hydrant count, for the heap-limit-exceeded error's diagnostics.
    async fn bytes_to_be_persisted(&self) -> (usize, usize, usize) {
        let live_sinks = self.registry.live_sinks();
        let mut bytes = 0usize;
        let mut hydrant_count = 0usize;
        for (_, sink) in &live_sinks {
            bytes += sink.bytes_in_memory().await;
            hydrant_count += sink.hydrant_count().await;
            if sink.is_swappable().await {
                bytes += self.accountant.config().hydrant_overhead_bytes();
            }
        }
        (bytes, live_sinks.len(), hydrant_count)
    }

    pub fn get_segments(&self) -> Vec<SegmentIdentifier> {
        self.registry.ids()
    }

    pub async fn get_row_count(&self, identifier: &SegmentIdentifier) -> Option<usize> {
        match self.registry.get(identifier) {
            Some(sink) => Some(sink.rows_in_memory().await),
            None => None,
        }
    }

    pub fn get_total_row_count(&self) -> usize {
        self.accountant.total_rows()
    }

    /// `persistAll()`.
    pub async fn persist_all(&self) -> anyhow::Result<usize> {
        self.check_first_error()?;
        self.persist_engine
            .persist_all()
            .await
            .map_err(|err| self.latch_first_error(err))
    }

    /// `push(identifiers, useUniquePath)`. An empty
    /// `identifiers` list pushes every persisted sink.
    pub async fn push(&self, identifiers: &[SegmentIdentifier], use_unique_path: bool) -> anyhow::Result<Vec<DataSegment>> {
        self.check_first_error()?;
        self.persist_all().await?;
        let pushed = self
            .merge_engine
            .push(identifiers, use_unique_path)
            .await
            .map_err(|err| self.latch_first_error(err))?;
        for segment in &pushed {
            self.drop(&segment.identifier).await?;
        }
        Ok(pushed)
    }

    /// `drop(identifier)` ("removeSink"): evicts both the live sink and its
    /// metadata without touching on-disk state, subtracts its rows back out
    /// of `totalRows`, and un-announces it. Goes through `pushBarrier` and
    /// then runs the eviction itself on the persist executor, so it cannot
    /// race with an in-flight `mergeAndPush` or `persistHydrant`.
    pub async fn drop(&self, identifier: &SegmentIdentifier) -> anyhow::Result<()> {
        self.executors.push_barrier().await.map_err(|err| self.latch_first_error(err))?;

        let registry = self.registry.clone();
        let accountant = self.accountant.clone();
        let announcer = self.announcer.clone();
        let identifier = identifier.clone();
        self.executors
            .persist
            .submit(move || async move {
                let Some(sink) = registry.get(&identifier) else {
                    registry.remove_metadata(&identifier);
                    return Ok(());
                };
                let rows = registry.metadata_for(&identifier).num_rows_in_segment();
                if registry.remove(&identifier, &sink) {
                    registry.remove_metadata(&identifier);
                    accountant.record_rows_dropped(rows);
                    accountant.uncharge_sink();
                    if let Err(err) = announcer.unannounce(&identifier) {
                        tracing::warn!(identifier = %identifier, error = %err, "segment unannounce failed");
                    }
                }
                anyhow::Ok(())
            })
            .await
            .map_err(|err| self.latch_first_error(err))??;
        Ok(())
    }

    /// `clear()`: drops every live sink.
    pub async fn clear(&self) -> anyhow::Result<()> {
        for identifier in self.registry.ids() {
            self.drop(&identifier).await?;
        }
        Ok(())
    }

    pub async fn run_query_for_intervals(&self, query: serde_json::Value, identifiers: &[SegmentIdentifier]) -> anyhow::Result<serde_json::Value> {
        self.query.run_for_intervals(query, identifiers).await
    }

    pub async fn run_query_for_segments(&self, query: serde_json::Value, identifiers: &[SegmentIdentifier]) -> anyhow::Result<serde_json::Value> {
        self.query.run_for_segments(query, identifiers).await
    }

    /// `close()`: idempotent. Drops every live sink without
    /// removing its on-disk state, waits for every executor to drain, then
    /// releases the directory lock and removes every persist directory left
    /// under the base directory (nothing should remain undelivered once a
    /// clean close has run `push` first).
    pub async fn close(&self) -> anyhow::Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        drop(closed);

        self.clear().await?;
        self.executors.close().await?;

        let base_dir = {
            let Some(lock) = self.lock.lock().take() else {
                return Ok(());
            };
            let base = lock.base().to_path_buf();
            lock.release()?;
            base
        };
        for sink_dir in layout::list_sink_dirs(&base_dir)? {
            tokio::fs::remove_dir_all(&sink_dir).await.ok();
        }
        Ok(())
    }

    /// `closeNow()`: un-announces every live sink and
    /// waits only the persist and abandon executors; the push executor's
    /// in-flight work is abandoned, and the directory lock is deliberately
    /// left held for the process to release on exit.
    pub async fn close_now(&self) -> anyhow::Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        drop(closed);

        for identifier in self.registry.ids() {
            if let Err(err) = self.announcer.unannounce(&identifier) {
                tracing::warn!(identifier = %identifier, error = %err, "segment unannounce failed during closeNow");
            }
        }
        self.executors.close_now().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        test_identifier,
        temp_base_dir,
        FakeAnnouncer,
        FakeDeepStorage,
        FakeIo,
        FakeRow,
    };

    fn new_appenderator(base_dir: std::path::PathBuf, max_rows_in_memory: usize) -> Appenderator<FakeIo> {
        let mut config = AppenderatorConfig::default();
        config.base_persist_directory = base_dir;
        config.max_rows_in_memory = max_rows_in_memory;
        config.intermediate_persist_period = std::time::Duration::from_secs(3600);
        Appenderator::new(
            "events",
            config,
            Arc::new(FakeIo::unbounded()),
            Arc::new(FakeDeepStorage::new()),
            Arc::new(FakeAnnouncer::new()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_rejects_mismatched_data_source() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 1_000_000);
        let mut identifier = test_identifier("v1");
        identifier.data_source = "other".to_string();
        let result = appenderator.add(&identifier, &FakeRow(1), false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn add_rejects_a_supplied_committer() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 1_000_000);
        let identifier = test_identifier("v1");
        let result = appenderator.add(&identifier, &FakeRow(1), true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn row_trigger_persists_automatically() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 2);
        let identifier = test_identifier("v1");

        for i in 0..5 {
            let result = appenderator.add(&identifier, &FakeRow(i), false).await.unwrap();
            assert!(!result.is_persist_required);
        }
        assert_eq!(appenderator.get_total_row_count(), 5);
    }

    #[tokio::test]
    async fn single_segment_round_trips_through_push() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 1_000_000);
        let identifier = test_identifier("v1");
        for i in 0..3 {
            appenderator.add(&identifier, &FakeRow(i), false).await.unwrap();
        }

        let pushed = appenderator.push(&[], false).await.unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].num_rows, 3);
        assert!(appenderator.get_segments().is_empty(), "push drops delivered sinks");
    }

    #[tokio::test]
    async fn repeated_push_after_drop_is_idempotent() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 1_000_000);
        let identifier = test_identifier("v1");
        appenderator.add(&identifier, &FakeRow(1), false).await.unwrap();

        let first = appenderator.push(&[], false).await.unwrap();
        let second = appenderator.push(&[identifier.clone()], false).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn drop_before_push_removes_from_total_row_count() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 1_000_000);
        let identifier = test_identifier("v1");
        appenderator.add(&identifier, &FakeRow(1), false).await.unwrap();
        appenderator.add(&identifier, &FakeRow(2), false).await.unwrap();
        assert_eq!(appenderator.get_total_row_count(), 2);

        appenderator.drop(&identifier).await.unwrap();
        assert_eq!(appenderator.get_total_row_count(), 0);
        assert!(appenderator.get_segments().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_dir, path) = temp_base_dir();
        let appenderator = new_appenderator(path, 1_000_000);
        appenderator.close().await.unwrap();
        appenderator.close().await.unwrap();
    }
}
