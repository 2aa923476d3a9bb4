//! Flat configuration record. Loading it from a file/env is
//! an external collaborator's job; this crate only defines the typed shape.

use std::{
    path::PathBuf,
    time::Duration,
};

/// Rough, constant per-sink overhead charged by the memory accountant when
/// `skip_bytes_in_memory_overhead_check` is false.
pub const ROUGH_OVERHEAD_PER_SINK: usize = 5_000;
/// Rough per-hydrant overhead for a memory-mapped (already persisted)
/// hydrant, plus a small fixed per-hydrant header.
pub const ROUGH_OVERHEAD_PER_HYDRANT: usize = 1_000;
pub const ROUGH_OVERHEAD_PER_HYDRANT_HEADER: usize = 16;

#[derive(Debug, Clone)]
pub struct AppenderatorConfig {
    /// Root of all on-disk state.
    pub base_persist_directory: PathBuf,
    /// Row-count persist trigger.
    pub max_rows_in_memory: usize,
    /// Byte-count persist trigger.
    pub max_bytes_in_memory: usize,
    /// If true, per-sink/per-hydrant overhead constants return 0 and the
    /// heap-limit assertion never fires.
    pub skip_bytes_in_memory_overhead_check: bool,
    /// Wall-clock persist trigger.
    pub intermediate_persist_period: Duration,
    /// Persist-executor queue capacity (backpressure).
    pub max_pending_persists: usize,
    /// Logged as a warning if a persist's scheduling delay exceeds this.
    pub persist_backpressure_warn_threshold: Duration,
    /// Deep-storage push retry attempts.
    pub max_push_attempts: usize,
}

impl Default for AppenderatorConfig {
    fn default() -> Self {
        Self {
            base_persist_directory: PathBuf::from("./var/appenderator"),
            max_rows_in_memory: 1_000_000,
            max_bytes_in_memory: usize::MAX,
            skip_bytes_in_memory_overhead_check: false,
            intermediate_persist_period: Duration::from_secs(10 * 60),
            max_pending_persists: 1,
            persist_backpressure_warn_threshold: Duration::from_millis(1_000),
            max_push_attempts: 5,
        }
    }
}

impl AppenderatorConfig {
    pub fn sink_overhead_bytes(&self) -> usize {
        if self.skip_bytes_in_memory_overhead_check {
            0
        } else {
            ROUGH_OVERHEAD_PER_SINK
        }
    }

    pub fn hydrant_overhead_bytes(&self) -> usize {
        if self.skip_bytes_in_memory_overhead_check {
            0
        } else {
            ROUGH_OVERHEAD_PER_HYDRANT + ROUGH_OVERHEAD_PER_HYDRANT_HEADER
        }
    }
}
