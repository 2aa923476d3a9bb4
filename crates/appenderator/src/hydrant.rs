//! FireHydrant: one generation of a sink's index.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::env::{
    IndexIo,
    QueryableIndex,
};

enum HydrantState<IO: IndexIo> {
    /// Still in RAM and (if it is the sink's current hydrant) appendable.
    Mutable(IO::Mutable),
    /// `persistHydrant` has run; the in-memory index has been dropped and
    /// replaced by a handle to its on-disk spill.
    Swapped(Arc<IO::Queryable>),
}

/// One mutable in-memory index or one on-disk queryable index, plus the
/// hydrant's sequence number within its sink. `persist` is synchronized on
/// `state` (held for the whole operation, including the I/O) so concurrent
/// callers are idempotent: the second caller blocks until the first
/// finishes and then observes `Swapped`, returning `0` rows without
/// touching disk again.
pub struct FireHydrant<IO: IndexIo> {
    sequence: usize,
    state: Mutex<HydrantState<IO>>,
}

impl<IO: IndexIo> FireHydrant<IO> {
    pub fn new_mutable(sequence: usize, index: IO::Mutable) -> Self {
        Self {
            sequence,
            state: Mutex::new(HydrantState::Mutable(index)),
        }
    }

    pub fn new_swapped(sequence: usize, queryable: IO::Queryable) -> Self {
        Self {
            sequence,
            state: Mutex::new(HydrantState::Swapped(Arc::new(queryable))),
        }
    }

    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub async fn has_swapped(&self) -> bool {
        matches!(&*self.state.lock().await, HydrantState::Swapped(_))
    }

    pub async fn num_rows(&self) -> usize {
        match &*self.state.lock().await {
            HydrantState::Mutable(index) => index.num_rows(),
            HydrantState::Swapped(queryable) => queryable.num_rows(),
        }
    }

    pub async fn bytes_in_memory(&self) -> usize {
        match &*self.state.lock().await {
            HydrantState::Mutable(index) => index.bytes_in_memory(),
            HydrantState::Swapped(_) => 0,
        }
    }

    pub async fn can_append_row(&self) -> bool {
        match &*self.state.lock().await {
            HydrantState::Mutable(index) => index.can_append_row(),
            HydrantState::Swapped(_) => false,
        }
    }

    /// Mutates the hydrant's in-memory index. Panics (programmer error) if
    /// called on an already-swapped hydrant; callers must only route rows
    /// to the sink's current hydrant, which is never swapped while writable.
    pub async fn with_mutable<R>(&self, f: impl FnOnce(&mut IO::Mutable) -> R) -> R {
        match &mut *self.state.lock().await {
            HydrantState::Mutable(index) => f(index),
            HydrantState::Swapped(_) => panic!("with_mutable called on a swapped hydrant"),
        }
    }

    /// Returns the queryable handle once swapped.
    pub async fn queryable(&self) -> Option<Arc<IO::Queryable>> {
        match &*self.state.lock().await {
            HydrantState::Swapped(queryable) => Some(queryable.clone()),
            HydrantState::Mutable(_) => None,
        }
    }

    /// Idempotent: persists the in-memory index via `io` and swaps in the
    /// resulting on-disk handle. Returns `0` and does no work if already
    /// swapped.
    ///
    /// `dir_for` computes the target spill directory and is only invoked
    /// once we've confirmed under the hydrant's own lock that a persist is
    /// actually going to happen — callers that allocate the spill
    /// directory's number from a monotonic counter (as `SinkMetadata`
    /// does) must do so inside this closure, never before calling
    /// `persist`, or a redundant call on an already-swapped hydrant would
    /// burn a number and violate the contiguous-numbering invariant.
    pub async fn persist(&self, io: &IO, dir_for: impl FnOnce() -> std::path::PathBuf) -> anyhow::Result<usize> {
        let mut guard = self.state.lock().await;
        let index = match &*guard {
            HydrantState::Swapped(_) => return Ok(0),
            HydrantState::Mutable(index) => index,
        };
        let dir = dir_for();
        let (rows, queryable) = io.persist(index, &dir).await?;
        *guard = HydrantState::Swapped(Arc::new(queryable));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct FakeMutable {
        rows: Vec<u64>,
        capacity: usize,
    }

    impl crate::env::MutableIndex<u64> for FakeMutable {
        fn add(&mut self, row: &u64) -> anyhow::Result<()> {
            self.rows.push(*row);
            Ok(())
        }

        fn num_rows(&self) -> usize {
            self.rows.len()
        }

        fn bytes_in_memory(&self) -> usize {
            self.rows.len() * 8
        }

        fn can_append_row(&self) -> bool {
            self.capacity == 0 || self.rows.len() < self.capacity
        }
    }

    struct FakeQueryable {
        rows: usize,
    }

    impl QueryableIndex for FakeQueryable {
        fn num_rows(&self) -> usize {
            self.rows
        }
    }

    struct FakeIo;

    #[async_trait]
    impl IndexIo for FakeIo {
        type Row = u64;
        type Mutable = FakeMutable;
        type Queryable = FakeQueryable;

        fn new_mutable_index(&self) -> Self::Mutable {
            FakeMutable::default()
        }

        async fn persist(&self, index: &Self::Mutable, _dir: &Path) -> anyhow::Result<(usize, Self::Queryable)> {
            let rows = index.num_rows();
            Ok((rows, FakeQueryable { rows }))
        }

        fn open_queryable(&self, _dir: &Path) -> anyhow::Result<Self::Queryable> {
            Ok(FakeQueryable { rows: 0 })
        }

        async fn merge(&self, indexes: &[Arc<Self::Queryable>], _out_dir: &Path) -> anyhow::Result<Self::Queryable> {
            Ok(FakeQueryable {
                rows: indexes.iter().map(|i| i.num_rows()).sum(),
            })
        }
    }

    #[tokio::test]
    async fn persist_is_idempotent() {
        let io = FakeIo;
        let mut mutable = io.new_mutable_index();
        mutable.add(&1).unwrap();
        mutable.add(&2).unwrap();
        let hydrant = FireHydrant::<FakeIo>::new_mutable(0, mutable);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let first = hydrant.persist(&io, || path.clone()).await.unwrap();
        assert_eq!(first, 2);
        assert!(hydrant.has_swapped().await);

        let path = dir.path().to_path_buf();
        let second = hydrant.persist(&io, || path.clone()).await.unwrap();
        assert_eq!(second, 0, "second persist must be a no-op");
        assert_eq!(hydrant.num_rows().await, 2);
    }

    #[tokio::test]
    async fn swapped_hydrant_reports_zero_bytes_in_memory() {
        let hydrant = FireHydrant::<FakeIo>::new_swapped(0, FakeQueryable { rows: 5 });
        assert_eq!(hydrant.bytes_in_memory().await, 0);
        assert_eq!(hydrant.num_rows().await, 5);
        assert!(!hydrant.can_append_row().await);
    }
}
