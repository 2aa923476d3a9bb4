//! Merge & Push Engine: reloads persisted sinks from disk, merges each
//! sink's hydrants into one on-disk index, and pushes the result to deep
//! storage with retry.

use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};

use crate::{
    env::{
        DataSegment,
        DeepStorage,
        IndexIo,
    },
    errors::ErrorMetadata,
    executor::ExecutorOrchestrator,
    hydrant::FireHydrant,
    identifier::SegmentIdentifier,
    layout,
    registry::SinkRegistry,
    sink::Sink,
};

/// Rebuilds the non-writable `Sink` persisted under `sink_dir`, in numeric
/// hydrant order. Every returned hydrant is already
/// `Swapped`, since nothing but a spill directory's contents ever lands on
/// disk.
async fn load_persisted_sink<IO: IndexIo>(io: &IO, sink_dir: &Path) -> anyhow::Result<(SegmentIdentifier, Sink<IO>)> {
    let bytes = tokio::fs::read(layout::identifier_file(sink_dir))
        .await
        .map_err(|err| anyhow::Error::from(err).context(ErrorMetadata::handoff_failed("could not read identifier.json")))?;
    let identifier: SegmentIdentifier = serde_json::from_slice(&bytes)?;

    let entries = layout::numbered_hydrant_dirs(sink_dir)?;
    layout::assert_contiguous(&entries)?;

    let mut hydrants = Vec::with_capacity(entries.len());
    for (sequence, dir) in entries {
        let queryable = io
            .open_queryable(&dir)
            .map_err(|err| err.context(ErrorMetadata::handoff_failed(format!("could not reopen spill {sequence} for {identifier}"))))?;
        hydrants.push(Arc::new(FireHydrant::new_swapped(sequence, queryable)));
    }
    let sink = Sink::from_hydrants(identifier.clone(), hydrants);
    Ok((identifier, sink))
}

/// `mergeAndPush`. Sanity-checks the reconstructed sink,
/// reuses a prior push's `descriptor.json` when present and a unique path
/// wasn't demanded, otherwise merges every hydrant and pushes the result
/// with retry. Returns `None` only when `identifiers` named a sink that
/// doesn't exist on disk (handled by the caller, not here).
async fn merge_and_push<IO: IndexIo>(
    io: &IO,
    deep_storage: &dyn DeepStorage,
    sink_dir: &Path,
    identifier: &SegmentIdentifier,
    sink: &Sink<IO>,
    use_unique_path: bool,
    max_push_attempts: usize,
) -> anyhow::Result<DataSegment> {
    anyhow::ensure!(
        !sink.is_writable(),
        "{identifier} is still writable; mergeAndPush requires a finished sink"
    );
    for hydrant in sink.hydrants().await {
        anyhow::ensure!(
            hydrant.has_swapped().await,
            "{identifier} has an unpersisted hydrant; persistAll must run before push"
        );
    }

    let descriptor_path = layout::descriptor_file(sink_dir);
    if !use_unique_path {
        if let Ok(bytes) = tokio::fs::read(&descriptor_path).await {
            let cached: DataSegment = serde_json::from_slice(&bytes)?;
            return Ok(cached);
        }
    }

    let merged_dir = layout::merged_dir(sink_dir);
    if merged_dir.is_dir() {
        tokio::fs::remove_dir_all(&merged_dir)
            .await
            .map_err(|err| anyhow::Error::from(err).context(ErrorMetadata::handoff_failed("could not clear a stale merged directory")))?;
    }

    let mut queryables = Vec::new();
    for hydrant in sink.hydrants().await {
        let queryable = hydrant
            .queryable()
            .await
            .expect("checked swapped above");
        queryables.push(queryable);
    }
    let merged = io
        .merge(&queryables, &merged_dir)
        .await
        .map_err(|err| err.context(ErrorMetadata::handoff_failed(format!("merge failed for {identifier}"))))?;
    let num_rows = merged.num_rows();

    let descriptor = DataSegment {
        identifier: identifier.clone(),
        num_rows,
        size_bytes: directory_size(&merged_dir).unwrap_or(0),
        location: String::new(),
    };

    let mut last_err = None;
    let mut pushed = None;
    for attempt in 1..=max_push_attempts.max(1) {
        match deep_storage.push(&merged_dir, descriptor.clone(), use_unique_path).await {
            Ok(result) => {
                pushed = Some(result);
                break;
            },
            Err(err) => {
                tracing::warn!(identifier = %identifier, attempt, max_push_attempts, error = %err, "deep storage push failed");
                last_err = Some(err);
            },
        }
    }
    let Some(pushed) = pushed else {
        crate::metrics::FAILED_HANDOFFS_TOTAL.inc();
        return Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("push failed"))
            .context(ErrorMetadata::handoff_failed(format!(
                "exhausted {max_push_attempts} push attempts for {identifier}"
            ))));
    };

    let json = serde_json::to_vec_pretty(&pushed)?;
    tokio::fs::write(&descriptor_path, json)
        .await
        .map_err(|err| anyhow::Error::from(err).context(ErrorMetadata::handoff_failed("could not write descriptor.json")))?;

    // The spill directories and the merged working copy are no longer
    // needed once the push has landed; identifier.json and descriptor.json
    // stay behind so a repeated push for this identifier is a cheap
    // idempotent read rather than a re-merge.
    for (_, dir) in layout::numbered_hydrant_dirs(sink_dir)? {
        let _ = tokio::fs::remove_dir_all(dir).await;
    }
    let _ = tokio::fs::remove_dir_all(&merged_dir).await;

    Ok(pushed)
}

fn directory_size(dir: &Path) -> anyhow::Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

pub struct MergePushEngine<IO: IndexIo> {
    io: Arc<IO>,
    deep_storage: Arc<dyn DeepStorage>,
    base_dir: PathBuf,
    registry: Arc<SinkRegistry<IO>>,
    executors: Arc<ExecutorOrchestrator>,
    max_push_attempts: usize,
}

impl<IO: IndexIo> MergePushEngine<IO> {
    pub fn new(
        io: Arc<IO>,
        deep_storage: Arc<dyn DeepStorage>,
        base_dir: PathBuf,
        registry: Arc<SinkRegistry<IO>>,
        executors: Arc<ExecutorOrchestrator>,
        max_push_attempts: usize,
    ) -> Self {
        Self {
            io,
            deep_storage,
            base_dir,
            registry,
            executors,
            max_push_attempts,
        }
    }

    /// `push(identifiers, useUniquePath)`. An empty
    /// `identifiers` pushes every sink persisted under the base directory.
    /// Reconstructs each sink fresh from disk, so it pushes even sinks this
    /// process has already evicted from its in-memory registry.
    pub async fn push(&self, identifiers: &[SegmentIdentifier], use_unique_path: bool) -> anyhow::Result<Vec<DataSegment>> {
        let sink_dirs = layout::list_sink_dirs(&self.base_dir)?;
        let io = self.io.clone();
        let deep_storage = self.deep_storage.clone();
        let max_push_attempts = self.max_push_attempts;
        let wanted = identifiers.to_vec();
        let registry = self.registry.clone();

        self.executors
            .push
            .submit(move || async move {
                let mut pushed = Vec::new();
                for sink_dir in sink_dirs {
                    let (identifier, sink) = load_persisted_sink(io.as_ref(), &sink_dir).await?;
                    if !wanted.is_empty() && !wanted.contains(&identifier) {
                        continue;
                    }
                    if registry.metadata_ids().contains(&identifier) {
                        let metadata = registry.metadata_for(&identifier);
                        let on_disk = sink.hydrant_count().await;
                        if metadata.num_hydrants() > 0 {
                            anyhow::ensure!(
                                metadata.num_hydrants() == on_disk,
                                anyhow::anyhow!("hydrant count mismatch for {identifier}: metadata says {}, disk has {on_disk}", metadata.num_hydrants())
                                    .context(ErrorMetadata::sanity_violation("on-disk hydrant count disagrees with in-memory metadata"))
                            );
                        }
                    }
                    let segment = merge_and_push(
                        io.as_ref(),
                        deep_storage.as_ref(),
                        &sink_dir,
                        &identifier,
                        &sink,
                        use_unique_path,
                        max_push_attempts,
                    )
                    .await?;
                    pushed.push(segment);
                }
                Ok(pushed)
            })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        accountant::MemoryAccountant,
        config::AppenderatorConfig,
        testing::{
            test_identifier,
            FakeAnnouncer,
            FakeDeepStorage,
            FakeIo,
            FakeRow,
        },
    };

    async fn write_one_sink(base_dir: &Path, io: &FakeIo, identifier: &SegmentIdentifier, rows: &[FakeRow]) {
        let registry = SinkRegistry::<FakeIo>::new();
        let announcer = FakeAnnouncer::new();
        let accountant = MemoryAccountant::new(AppenderatorConfig::default());
        let sink = registry.get_or_create(identifier, io, &announcer, &accountant);
        for row in rows {
            sink.current_hydrant().await.with_mutable(|index| index.add(row)).await.unwrap();
        }
        let frozen = sink.swap(io).await;
        let sink_dir = layout::sink_dir(base_dir, identifier);
        tokio::fs::create_dir_all(&sink_dir).await.unwrap();
        let json = serde_json::to_vec_pretty(identifier).unwrap();
        tokio::fs::write(layout::identifier_file(&sink_dir), json).await.unwrap();
        frozen
            .persist(io, || layout::hydrant_dir(&sink_dir, 0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn push_merges_and_uploads_a_persisted_sink() {
        let dir = tempfile::tempdir().unwrap();
        let io = Arc::new(FakeIo::unbounded());
        let identifier = test_identifier("v1");
        write_one_sink(dir.path(), &io, &identifier, &[FakeRow(1), FakeRow(2), FakeRow(3)]).await;

        let deep_storage = Arc::new(FakeDeepStorage::new());
        let engine = MergePushEngine::new(
            io.clone(),
            deep_storage.clone(),
            dir.path().to_path_buf(),
            Arc::new(SinkRegistry::new()),
            Arc::new(ExecutorOrchestrator::new(1)),
            5,
        );

        let pushed = engine.push(&[], false).await.unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].num_rows, 3);
        assert_eq!(deep_storage.pushed_segments().len(), 1);

        let sink_dir = layout::sink_dir(dir.path(), &identifier);
        assert!(layout::descriptor_file(&sink_dir).is_file());
        assert!(!layout::hydrant_dir(&sink_dir, 0).exists());
    }

    #[tokio::test]
    async fn repeated_push_is_idempotent_and_does_not_reupload() {
        let dir = tempfile::tempdir().unwrap();
        let io = Arc::new(FakeIo::unbounded());
        let identifier = test_identifier("v1");
        write_one_sink(dir.path(), &io, &identifier, &[FakeRow(1)]).await;

        let deep_storage = Arc::new(FakeDeepStorage::new());
        let engine = MergePushEngine::new(
            io.clone(),
            deep_storage.clone(),
            dir.path().to_path_buf(),
            Arc::new(SinkRegistry::new()),
            Arc::new(ExecutorOrchestrator::new(1)),
            5,
        );

        let first = engine.push(&[], false).await.unwrap();
        let second = engine.push(&[], false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(deep_storage.pushed_segments().len(), 1, "second push must not re-upload");
    }

    #[tokio::test]
    async fn push_retries_transient_deep_storage_failures() {
        let dir = tempfile::tempdir().unwrap();
        let io = Arc::new(FakeIo::unbounded());
        let identifier = test_identifier("v1");
        write_one_sink(dir.path(), &io, &identifier, &[FakeRow(1)]).await;

        let deep_storage = Arc::new(FakeDeepStorage::failing(2));
        let engine = MergePushEngine::new(
            io.clone(),
            deep_storage.clone(),
            dir.path().to_path_buf(),
            Arc::new(SinkRegistry::new()),
            Arc::new(ExecutorOrchestrator::new(1)),
            5,
        );

        let pushed = engine.push(&[], false).await.unwrap();
        assert_eq!(pushed.len(), 1);
    }

    #[tokio::test]
    async fn push_fails_after_exhausting_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let io = Arc::new(FakeIo::unbounded());
        let identifier = test_identifier("v1");
        write_one_sink(dir.path(), &io, &identifier, &[FakeRow(1)]).await;

        let deep_storage = Arc::new(FakeDeepStorage::failing(10));
        let engine = MergePushEngine::new(
            io.clone(),
            deep_storage.clone(),
            dir.path().to_path_buf(),
            Arc::new(SinkRegistry::new()),
            Arc::new(ExecutorOrchestrator::new(1)),
            3,
        );

        assert!(engine.push(&[], false).await.is_err());
    }
}
