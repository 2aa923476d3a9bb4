//! Sink Registry: the mapping from identifier to live Sink and to
//! persistent SinkMetadata.

use std::{
    collections::HashMap,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    accountant::MemoryAccountant,
    env::{
        IndexIo,
        SegmentAnnouncer,
    },
    identifier::SegmentIdentifier,
    sink::{
        Sink,
        SinkMetadata,
    },
};

pub struct SinkRegistry<IO: IndexIo> {
    sinks: RwLock<HashMap<SegmentIdentifier, Arc<Sink<IO>>>>,
    metadata: RwLock<HashMap<SegmentIdentifier, Arc<SinkMetadata>>>,
}

impl<IO: IndexIo> Default for SinkRegistry<IO> {
    fn default() -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
        }
    }
}

impl<IO: IndexIo> SinkRegistry<IO> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live sink for `identifier`, creating one (and an empty
    /// metadata record, and charging the empty sink's overhead to the
    /// accountant) if this is the first reference. Announce failures are
    /// logged but non-fatal: the sink is still registered.
    pub fn get_or_create(
        &self,
        identifier: &SegmentIdentifier,
        io: &IO,
        announcer: &dyn SegmentAnnouncer,
        accountant: &MemoryAccountant,
    ) -> Arc<Sink<IO>> {
        if let Some(existing) = self.sinks.read().get(identifier).cloned() {
            return existing;
        }
        let mut sinks = self.sinks.write();
        if let Some(existing) = sinks.get(identifier).cloned() {
            return existing;
        }
        if let Err(err) = announcer.announce(identifier) {
            tracing::warn!(
                identifier = %identifier,
                error = %err,
                "segment announce failed; continuing with an unannounced sink"
            );
        }
        let sink = Arc::new(Sink::new_writable(identifier.clone(), io));
        sinks.insert(identifier.clone(), sink.clone());
        self.metadata_for(identifier);
        accountant.charge_new_sink();
        sink
    }

    pub fn get(&self, identifier: &SegmentIdentifier) -> Option<Arc<Sink<IO>>> {
        self.sinks.read().get(identifier).cloned()
    }

    /// Atomic compare-and-remove: only removes if the currently-registered
    /// sink is `sink` (prevents racing with a concurrent reincarnation).
    pub fn remove(&self, identifier: &SegmentIdentifier, sink: &Arc<Sink<IO>>) -> bool {
        let mut sinks = self.sinks.write();
        match sinks.get(identifier) {
            Some(current) if Arc::ptr_eq(current, sink) => {
                sinks.remove(identifier);
                true
            },
            _ => false,
        }
    }

    pub fn ids(&self) -> Vec<SegmentIdentifier> {
        self.sinks.read().keys().cloned().collect()
    }

    pub fn live_sinks(&self) -> Vec<(SegmentIdentifier, Arc<Sink<IO>>)> {
        self.sinks.read().iter().map(|(id, sink)| (id.clone(), sink.clone())).collect()
    }

    /// Returns the metadata for `identifier`, creating an empty record on
    /// first reference. Metadata outlives the sink it describes.
    pub fn metadata_for(&self, identifier: &SegmentIdentifier) -> Arc<SinkMetadata> {
        if let Some(existing) = self.metadata.read().get(identifier).cloned() {
            return existing;
        }
        self.metadata
            .write()
            .entry(identifier.clone())
            .or_insert_with(|| Arc::new(SinkMetadata::default()))
            .clone()
    }

    pub fn metadata_ids(&self) -> Vec<SegmentIdentifier> {
        self.metadata.read().keys().cloned().collect()
    }

    pub fn remove_metadata(&self, identifier: &SegmentIdentifier) {
        self.metadata.write().remove(identifier);
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

    #[test]
    fn get_or_create_is_idempotent_and_announces_once() {
        let io = FakeIo::unbounded();
        let announcer = FakeAnnouncer::new();
        let accountant = MemoryAccountant::new(Default::default());
        let registry = SinkRegistry::<FakeIo>::new();
        let id = test_identifier("v1");

        let first = registry.get_or_create(&id, &io, &announcer, &accountant);
        let second = registry.get_or_create(&id, &io, &announcer, &accountant);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(announcer.announced.lock().len(), 1);
    }

    #[test]
    fn invariant_every_sink_has_metadata() {
        let io = FakeIo::unbounded();
        let announcer = FakeAnnouncer::new();
        let accountant = MemoryAccountant::new(Default::default());
        let registry = SinkRegistry::<FakeIo>::new();
        let id = test_identifier("v1");
        registry.get_or_create(&id, &io, &announcer, &accountant);

        assert!(registry.metadata_ids().contains(&id));
    }

    #[test]
    fn remove_is_compare_and_swap() {
        let io = FakeIo::unbounded();
        let announcer = FakeAnnouncer::new();
        let accountant = MemoryAccountant::new(Default::default());
        let registry = SinkRegistry::<FakeIo>::new();
        let id = test_identifier("v1");
        let sink = registry.get_or_create(&id, &io, &announcer, &accountant);

        let stale = Arc::new(Sink::new_writable(id.clone(), &io));
        assert!(!registry.remove(&id, &stale));
        assert!(registry.remove(&id, &sink));
        assert!(registry.get(&id).is_none());
    }
}
