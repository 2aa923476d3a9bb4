//! Sink: the in-memory representation of one in-flight segment, and its
//! persistent metadata twin.

use std::sync::{
    atomic::{
        AtomicBool,
        AtomicUsize,
        Ordering,
    },
    Arc,
};

use tokio::sync::RwLock;

use crate::{
    env::IndexIo,
    hydrant::FireHydrant,
    identifier::{
        Interval,
        SegmentIdentifier,
    },
};

/// Retained even after a sink is evicted from RAM.
#[derive(Default)]
pub struct SinkMetadata {
    /// Cumulative rows ever added to this segment.
    num_rows_in_segment: AtomicUsize,
    /// Count of hydrants expected on disk.
    num_hydrants: AtomicUsize,
    /// Monotonically increasing counter naming the next spill subdirectory,
    /// surviving sink eviction/reincarnation. Never inferred from a
    /// directory listing at persist time.
    previous_hydrant_count: AtomicUsize,
}

impl SinkMetadata {
    pub fn num_rows_in_segment(&self) -> usize {
        self.num_rows_in_segment.load(Ordering::SeqCst)
    }

    pub fn add_rows(&self, rows: usize) {
        self.num_rows_in_segment.fetch_add(rows, Ordering::SeqCst);
    }

    pub fn num_hydrants(&self) -> usize {
        self.num_hydrants.load(Ordering::SeqCst)
    }

    pub fn add_hydrants(&self, count: usize) {
        self.num_hydrants.fetch_add(count, Ordering::SeqCst);
    }

    /// Allocates and returns the next spill subdirectory number.
    pub fn next_hydrant_number(&self) -> usize {
        self.previous_hydrant_count.fetch_add(1, Ordering::SeqCst)
    }

    pub fn previous_hydrant_count(&self) -> usize {
        self.previous_hydrant_count.load(Ordering::SeqCst)
    }

    /// Used when reconstructing metadata for a reincarnated sink from disk,
    /// so the next spill subdirectory number continues past what's there.
    pub fn set_previous_hydrant_count(&self, value: usize) {
        self.previous_hydrant_count.store(value, Ordering::SeqCst);
    }

    pub fn set_num_hydrants(&self, value: usize) {
        self.num_hydrants.store(value, Ordering::SeqCst);
    }
}

/// A (possibly empty) ordered sequence of FireHydrants; exactly the last
/// hydrant, if the sink is writable, accepts rows.
pub struct Sink<IO: IndexIo> {
    pub identifier: SegmentIdentifier,
    pub interval: Interval,
    writable: AtomicBool,
    hydrants: RwLock<Vec<Arc<FireHydrant<IO>>>>,
}

impl<IO: IndexIo> Sink<IO> {
    pub fn new_writable(identifier: SegmentIdentifier, io: &IO) -> Self {
        let interval = identifier.interval;
        let current = FireHydrant::new_mutable(0, io.new_mutable_index());
        Self {
            identifier,
            interval,
            writable: AtomicBool::new(true),
            hydrants: RwLock::new(vec![Arc::new(current)]),
        }
    }

    /// Reconstructs a non-writable sink from the on-disk hydrants of a
    /// previously-persisted identifier, in numeric order.
    pub fn from_hydrants(identifier: SegmentIdentifier, hydrants: Vec<Arc<FireHydrant<IO>>>) -> Self {
        let interval = identifier.interval;
        Self {
            identifier,
            interval,
            writable: AtomicBool::new(false),
            hydrants: RwLock::new(hydrants),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub async fn hydrant_count(&self) -> usize {
        self.hydrants.read().await.len()
    }

    pub async fn hydrants(&self) -> Vec<Arc<FireHydrant<IO>>> {
        self.hydrants.read().await.clone()
    }

    /// The tail hydrant, which accepts rows only while the sink is
    /// writable.
    pub async fn current_hydrant(&self) -> Arc<FireHydrant<IO>> {
        self.hydrants
            .read()
            .await
            .last()
            .expect("a sink always has at least one hydrant")
            .clone()
    }

    pub async fn can_append_row(&self) -> bool {
        self.is_writable() && self.current_hydrant().await.can_append_row().await
    }

    /// A sink is swappable when its current hydrant holds at least one row
    /// and persisting would free memory.
    pub async fn is_swappable(&self) -> bool {
        self.is_writable() && self.current_hydrant().await.num_rows().await > 0
    }

    /// Freezes the current hydrant and creates a new empty one, returning
    /// the newly-frozen hydrant. Panics if the sink is not writable
    /// (programmer error: only the persistence engine calls this, and only
    /// on swappable sinks).
    pub async fn swap(&self, io: &IO) -> Arc<FireHydrant<IO>> {
        assert!(self.is_writable(), "swap called on a non-writable sink");
        let mut hydrants = self.hydrants.write().await;
        let frozen = hydrants.last().expect("non-empty").clone();
        let next_sequence = hydrants.len();
        hydrants.push(Arc::new(FireHydrant::new_mutable(next_sequence, io.new_mutable_index())));
        frozen
    }

    /// Marks the sink finished: no further hydrants will be appended and
    /// the current hydrant is eligible to be treated as frozen by the
    /// persistence engine.
    pub fn mark_not_writable(&self) {
        self.writable.store(false, Ordering::SeqCst);
    }

    /// Sum of in-memory bytes across all hydrants (the current hydrant
    /// plus any not-yet-swapped frozen ones).
    pub async fn bytes_in_memory(&self) -> usize {
        let hydrants = self.hydrants.read().await;
        let mut total = 0;
        for hydrant in hydrants.iter() {
            total += hydrant.bytes_in_memory().await;
        }
        total
    }

    pub async fn rows_in_memory(&self) -> usize {
        if !self.is_writable() {
            return 0;
        }
        self.current_hydrant().await.num_rows().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeIo,
        FakeRow,
    };

    #[tokio::test]
    async fn swap_freezes_current_and_creates_new() {
        let io = FakeIo::unbounded();
        let id = crate::testing::test_identifier("v1");
        let sink = Sink::new_writable(id, &io);

        sink.current_hydrant()
            .await
            .with_mutable(|index| index.add(&FakeRow(1)))
            .await
            .unwrap();
        assert_eq!(sink.hydrant_count().await, 1);

        let frozen = sink.swap(&io).await;
        assert_eq!(frozen.sequence(), 0);
        assert_eq!(sink.hydrant_count().await, 2);
        assert_eq!(sink.current_hydrant().await.sequence(), 1);
    }

    #[tokio::test]
    async fn not_swappable_when_current_hydrant_is_empty() {
        let io = FakeIo::unbounded();
        let id = crate::testing::test_identifier("v1");
        let sink = Sink::new_writable(id, &io);
        assert!(!sink.is_swappable().await);
    }
}
