//! Memory Accountant: tracks `rowsInMemory`, `bytesInMemory`, and
//! `totalRows`, and decides when a persist trigger has fired.

use std::{
    sync::atomic::{
        AtomicI64,
        AtomicUsize,
        Ordering,
    },
    time::{
        Duration,
        Instant,
    },
};

use bytesize::ByteSize;
use parking_lot::Mutex;

use crate::config::AppenderatorConfig;

/// Why a persist was triggered; kept for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistTrigger {
    IndexCannotAcceptRow,
    IntermediatePersistPeriodElapsed,
    MaxRowsInMemoryExceeded,
    MaxBytesInMemoryExceeded,
}

impl PersistTrigger {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::IndexCannotAcceptRow => "current hydrant refused another row",
            Self::IntermediatePersistPeriodElapsed => "intermediatePersistPeriod elapsed",
            Self::MaxRowsInMemoryExceeded => "rowsInMemory >= maxRowsInMemory",
            Self::MaxBytesInMemoryExceeded => "bytesInMemory >= maxBytesInMemory",
        }
    }
}

pub struct MemoryAccountant {
    rows_in_memory: AtomicUsize,
    bytes_in_memory: AtomicI64,
    total_rows: AtomicUsize,
    next_flush: Mutex<Instant>,
    config: AppenderatorConfig,
}

impl MemoryAccountant {
    pub fn new(config: AppenderatorConfig) -> Self {
        let period = config.intermediate_persist_period;
        Self {
            rows_in_memory: AtomicUsize::new(0),
            bytes_in_memory: AtomicI64::new(0),
            total_rows: AtomicUsize::new(0),
            next_flush: Mutex::new(Instant::now() + period),
            config,
        }
    }

    pub fn config(&self) -> &AppenderatorConfig {
        &self.config
    }

    pub fn rows_in_memory(&self) -> usize {
        self.rows_in_memory.load(Ordering::SeqCst)
    }

    pub fn bytes_in_memory(&self) -> usize {
        self.bytes_in_memory.load(Ordering::SeqCst).max(0) as usize
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows.load(Ordering::SeqCst)
    }

    pub fn charge_new_sink(&self) {
        self.bytes_in_memory
            .fetch_add(self.config.sink_overhead_bytes() as i64, Ordering::SeqCst);
    }

    pub fn uncharge_sink(&self) {
        self.bytes_in_memory
            .fetch_sub(self.config.sink_overhead_bytes() as i64, Ordering::SeqCst);
    }

    /// Called after each row is added to a sink's current hydrant.
    pub fn record_row_added(&self, row_bytes: usize) {
        self.rows_in_memory.fetch_add(1, Ordering::SeqCst);
        self.bytes_in_memory.fetch_add(row_bytes as i64, Ordering::SeqCst);
        self.total_rows.fetch_add(1, Ordering::SeqCst);
    }

    /// Subtracts rows from `totalRows` when an identifier is dropped.
    pub fn record_rows_dropped(&self, rows: usize) {
        self.total_rows.fetch_sub(rows, Ordering::SeqCst);
    }

    /// Subtracts persisted rows/bytes from the live counters after a
    /// persist completes. Does not touch `totalRows`,
    /// which tracks cumulative rows ever added.
    pub fn record_persisted(&self, rows: usize, bytes: usize) {
        self.rows_in_memory.fetch_sub(rows, Ordering::SeqCst);
        self.bytes_in_memory.fetch_sub(bytes as i64, Ordering::SeqCst);
    }

    pub fn reset_next_flush(&self) {
        *self.next_flush.lock() = Instant::now() + self.config.intermediate_persist_period;
    }

    /// Checks the four persist triggers from 2, in order.
    /// `current_hydrant_can_append` reflects the sink that just received a
    /// row; this accountant has no sink references of its own.
    pub fn check_triggers(&self, current_hydrant_can_append: bool) -> Option<PersistTrigger> {
        if !current_hydrant_can_append {
            return Some(PersistTrigger::IndexCannotAcceptRow);
        }
        if Instant::now() >= *self.next_flush.lock() {
            return Some(PersistTrigger::IntermediatePersistPeriodElapsed);
        }
        if self.rows_in_memory() >= self.config.max_rows_in_memory {
            return Some(PersistTrigger::MaxRowsInMemoryExceeded);
        }
        if self.bytes_in_memory() >= self.config.max_bytes_in_memory {
            return Some(PersistTrigger::MaxBytesInMemoryExceeded);
        }
        None
    }

    /// The heap-usage-limit assertion from 2: `bytes_to_be_persisted`
    /// is the sum of in-memory bytes across every live sink plus, for each
    /// swappable sink, its current hydrant's post-persist overhead (it stays
    /// memory-mapped after the persist that's about to happen). If overhead
    /// checking is enabled and `bytesInMemory - bytesToBePersisted` would
    /// still exceed `maxBytesInMemory`, ingestion must fail outright rather
    /// than silently thrash. The message lists sink/hydrant/row counts and
    /// all three byte figures, per 
    pub fn assert_heap_limit_not_exceeded(&self, bytes_to_be_persisted: usize, sink_count: usize, hydrant_count: usize) -> anyhow::Result<()> {
        if self.config.skip_bytes_in_memory_overhead_check {
            return Ok(());
        }
        let bytes_in_memory = self.bytes_in_memory();
        let remaining = bytes_in_memory.saturating_sub(bytes_to_be_persisted);
        anyhow::ensure!(
            remaining <= self.config.max_bytes_in_memory,
            "heap usage limit exceeded ({sink_count} sinks, {hydrant_count} hydrants, {rows} rows): \
             persisting {to_persist} would still leave {remaining} resident, over the {max} limit; \
             raise maxBytesInMemory or set skipBytesInMemoryOverheadCheck",
            rows = self.total_rows(),
            to_persist = ByteSize(bytes_to_be_persisted as u64),
            remaining = ByteSize(remaining as u64),
            max = ByteSize(self.config.max_bytes_in_memory as u64),
        );
        Ok(())
    }

    pub fn time_until_next_flush(&self) -> Duration {
        self.next_flush.lock().saturating_duration_since(Instant::now())
    }
}
