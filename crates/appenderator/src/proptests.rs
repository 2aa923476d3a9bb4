//! Property tests for the appenderator's core invariants, run against the
//! in-memory `testing` fakes. Each case spins its own single-threaded
//! scenario inside a fresh `tokio::runtime::Runtime::block_on`, the way
//! `transaction-fuzzer`'s gas-data proptests drive an async harness from a
//! synchronous `proptest!` body.

use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use proptest::prelude::*;
use tokio::runtime::Runtime;

use crate::{
    appenderator::Appenderator,
    config::AppenderatorConfig,
    identifier::SegmentIdentifier,
    testing::{
        test_identifier,
        FakeAnnouncer,
        FakeDeepStorage,
        FakeIo,
        FakeRow,
    },
};

fn new_appenderator(base_dir: std::path::PathBuf, max_rows_in_memory: usize) -> Appenderator<FakeIo> {
    let config = AppenderatorConfig {
        base_persist_directory: base_dir,
        max_rows_in_memory,
        intermediate_persist_period: Duration::from_secs(3600),
        ..AppenderatorConfig::default()
    };
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

async fn run_add_sequence(appenderator: &Appenderator<FakeIo>, ids: &[SegmentIdentifier], ops: &[(usize, i64)]) -> usize {
    for &(which, value) in ops {
        let id = &ids[which % ids.len()];
        appenderator.add(id, &FakeRow(value), false).await.unwrap();
    }
    ops.len()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The sum over returned `DataSegment`s' row counts equals the number
    /// of rows added, with no duplicate segments, regardless of how adds
    /// interleave across two identifiers or where the row-count persist
    /// threshold lands.
    #[test]
    fn push_delivers_every_added_row_exactly_once(
        ops in proptest::collection::vec((0usize..2, any::<i64>()), 0..60),
        max_rows_in_memory in 1usize..25,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let appenderator = new_appenderator(dir.path().to_path_buf(), max_rows_in_memory);
            let ids = [test_identifier("a"), test_identifier("b")];

            let added = run_add_sequence(&appenderator, &ids, &ops).await;
            let pushed = appenderator.push(&[], false).await.unwrap();

            let delivered: usize = pushed.iter().map(|segment| segment.num_rows).sum();
            prop_assert_eq!(delivered, added);

            let mut seen = HashSet::new();
            for segment in &pushed {
                prop_assert!(seen.insert(segment.identifier.clone()), "duplicate segment for {}", segment.identifier);
            }
            Ok(())
        })?;
    }

    /// Dropping an identifier and then adding to it again starts its row
    /// count from zero.
    #[test]
    fn drop_then_add_restarts_row_count_from_zero(
        before in 1usize..20,
        after in 1usize..20,
    ) {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let appenderator = new_appenderator(dir.path().to_path_buf(), 1_000_000);
            let id = test_identifier("a");

            for i in 0..before {
                appenderator.add(&id, &FakeRow(i as i64), false).await.unwrap();
            }
            appenderator.drop(&id).await.unwrap();
            prop_assert_eq!(appenderator.get_total_row_count(), 0);

            for i in 0..after {
                appenderator.add(&id, &FakeRow(i as i64), false).await.unwrap();
            }
            prop_assert_eq!(appenderator.get_total_row_count(), after);
            Ok(())
        })?;
    }
}
