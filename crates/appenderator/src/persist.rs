//! Persistence Engine: spills hydrants to per-sink spill directories,
//! numbers them monotonically, and records per-sink metadata.

use std::sync::Arc;

use crate::{
    accountant::MemoryAccountant,
    env::IndexIo,
    errors::ErrorMetadata,
    executor::ExecutorOrchestrator,
    hydrant::FireHydrant,
    identifier::SegmentIdentifier,
    layout,
    registry::SinkRegistry,
    sink::SinkMetadata,
};

/// `persistHydrant`: idempotent; writes the sink's
/// `identifier.json` on first use, persists into the spill directory named
/// by the sink's monotonic hydrant counter, and bumps that counter only if
/// a persist genuinely happened. Free function (rather than a method) so
/// it needs nothing but the pieces it actually touches, callable from
/// inside a job already running on the persist executor.
async fn persist_hydrant<IO: IndexIo>(
    io: &IO,
    base_dir: &std::path::Path,
    identifier: &SegmentIdentifier,
    metadata: &SinkMetadata,
    hydrant: &FireHydrant<IO>,
) -> anyhow::Result<usize> {
    let sink_dir = layout::sink_dir(base_dir, identifier);
    tokio::fs::create_dir_all(&sink_dir)
        .await
        .map_err(|err| anyhow::Error::from(err).context(ErrorMetadata::persist_failed("could not create sink persist directory")))?;

    let identifier_path = layout::identifier_file(&sink_dir);
    if tokio::fs::metadata(&identifier_path).await.is_err() {
        let json = serde_json::to_vec_pretty(identifier)?;
        tokio::fs::write(&identifier_path, json)
            .await
            .map_err(|err| anyhow::Error::from(err).context(ErrorMetadata::persist_failed("could not write identifier.json")))?;
    }

    let rows = hydrant
        .persist(io, || {
            let number = metadata.next_hydrant_number();
            layout::hydrant_dir(&sink_dir, number)
        })
        .await
        .map_err(|err| err.context(ErrorMetadata::persist_failed(format!("failed to persist a hydrant for {identifier}"))))?;
    Ok(rows)
}

pub struct PersistenceEngine<IO: IndexIo> {
    io: Arc<IO>,
    base_dir: std::path::PathBuf,
    registry: Arc<SinkRegistry<IO>>,
    accountant: Arc<MemoryAccountant>,
    executors: Arc<ExecutorOrchestrator>,
}

impl<IO: IndexIo> PersistenceEngine<IO> {
    pub fn new(
        io: Arc<IO>,
        base_dir: std::path::PathBuf,
        registry: Arc<SinkRegistry<IO>>,
        accountant: Arc<MemoryAccountant>,
        executors: Arc<ExecutorOrchestrator>,
    ) -> Self {
        Self {
            io,
            base_dir,
            registry,
            accountant,
            executors,
        }
    }

    /// `persistAll()`: enumerates live sinks, freezes every swappable
    /// sink's current hydrant, and submits one task to the persist
    /// executor that spills every not-yet-swapped hydrant in insertion
    /// order. Returns the number of rows persisted.
    pub async fn persist_all(&self) -> anyhow::Result<usize> {
        let mut pairs: Vec<(SegmentIdentifier, Arc<SinkMetadata>, Arc<FireHydrant<IO>>)> = Vec::new();

        for (identifier, sink) in self.registry.live_sinks() {
            let metadata = self.registry.metadata_for(&identifier);
            let mut added = 0usize;
            for hydrant in sink.hydrants().await {
                if !hydrant.has_swapped().await {
                    pairs.push((identifier.clone(), metadata.clone(), hydrant));
                    added += 1;
                }
            }
            if sink.is_swappable().await {
                let frozen = sink.swap(&self.io).await;
                pairs.push((identifier.clone(), metadata.clone(), frozen));
                added += 1;
            }
            metadata.add_hydrants(added);
        }

        if pairs.is_empty() {
            return Ok(0);
        }

        let io = self.io.clone();
        let base_dir = self.base_dir.clone();

        let ((rows, bytes), elapsed) = self
            .executors
            .persist
            .submit_timed(move || async move {
                let mut total_rows = 0usize;
                let mut total_bytes = 0usize;
                for (identifier, metadata, hydrant) in pairs {
                    let bytes_before = hydrant.bytes_in_memory().await;
                    match persist_hydrant(&io, &base_dir, &identifier, &metadata, &hydrant).await {
                        Ok(rows) => {
                            total_rows += rows;
                            total_bytes += bytes_before;
                        },
                        Err(err) => {
                            crate::metrics::FAILED_PERSISTS_TOTAL.inc();
                            tracing::error!(identifier = %identifier, error = %err, "persist failed");
                            return Err(err);
                        },
                    }
                }
                Ok((total_rows, total_bytes))
            })
            .await?;
        let (rows, bytes) = (rows?, bytes);
        self.accountant.record_persisted(rows, bytes);
        self.accountant.reset_next_flush();
        if elapsed > self.accountant.config().persist_backpressure_warn_threshold {
            crate::metrics::PERSIST_BACKPRESSURE_TOTAL.inc();
            tracing::warn!(?elapsed, "persist executor backpressure: scheduling delay exceeded threshold");
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        test_identifier,
        FakeAnnouncer,
        FakeIo,
    };

    fn new_engine() -> (
        PersistenceEngine<FakeIo>,
        Arc<SinkRegistry<FakeIo>>,
        Arc<FakeIo>,
        Arc<MemoryAccountant>,
        tempfile::TempDir,
    ) {
        let io = Arc::new(FakeIo::unbounded());
        let registry = Arc::new(SinkRegistry::new());
        let accountant = Arc::new(MemoryAccountant::new(Default::default()));
        let executors = Arc::new(ExecutorOrchestrator::new(4));
        let dir = tempfile::tempdir().unwrap();
        let engine = PersistenceEngine::new(io.clone(), dir.path().to_path_buf(), registry.clone(), accountant.clone(), executors);
        (engine, registry, io, accountant, dir)
    }

    #[tokio::test]
    async fn persist_all_spills_every_sink_and_bumps_metadata() {
        let (engine, registry, io, _accountant, dir) = new_engine();
        let announcer = FakeAnnouncer::new();
        let accountant = Arc::new(MemoryAccountant::new(Default::default()));
        let id = test_identifier("v1");
        let sink = registry.get_or_create(&id, &io, &announcer, &accountant);
        sink.current_hydrant()
            .await
            .with_mutable(|index| index.add(&crate::testing::FakeRow(1)))
            .await
            .unwrap();
        sink.current_hydrant()
            .await
            .with_mutable(|index| index.add(&crate::testing::FakeRow(2)))
            .await
            .unwrap();

        let rows = engine.persist_all().await.unwrap();
        assert_eq!(rows, 2);

        let metadata = registry.metadata_for(&id);
        assert_eq!(metadata.num_hydrants(), 1);
        assert_eq!(metadata.previous_hydrant_count(), 1);

        let sink_dir = layout::sink_dir(dir.path(), &id);
        assert!(layout::identifier_file(&sink_dir).is_file());
        assert!(layout::hydrant_dir(&sink_dir, 0).is_dir());
    }

    #[tokio::test]
    async fn persist_all_on_empty_registry_is_a_no_op() {
        let (engine, _registry, _io, _accountant, _dir) = new_engine();
        let rows = engine.persist_all().await.unwrap();
        assert_eq!(rows, 0);
    }
}
