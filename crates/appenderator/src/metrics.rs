//! Process-global counters and gauges for the appenderator.
//!
//! Registration follows the same "lazily-initialized static, registered
//! once with the default registry" shape used throughout the wider
//! codebase's `metrics` crate, trimmed down to plain `prometheus` (the
//! scrape/push endpoint that actually ships these numbers somewhere is an
//! external collaborator, out of scope for this crate).

use std::sync::LazyLock;

use prometheus::{
    register_gauge,
    register_int_counter,
    Gauge,
    IntCounter,
};

macro_rules! appenderator_counter {
    ($NAME:ident, $METRIC:literal, $HELP:literal) => {
        pub static $NAME: LazyLock<IntCounter> =
            LazyLock::new(|| register_int_counter!($METRIC, $HELP).expect("metric registration failed"));
    };
}

macro_rules! appenderator_gauge {
    ($NAME:ident, $METRIC:literal, $HELP:literal) => {
        pub static $NAME: LazyLock<Gauge> =
            LazyLock::new(|| register_gauge!($METRIC, $HELP).expect("metric registration failed"));
    };
}

appenderator_counter!(
    FAILED_PERSISTS_TOTAL,
    "appenderator_failed_persists_total",
    "Number of persist operations that threw and were latched into persistError"
);
appenderator_counter!(
    FAILED_HANDOFFS_TOTAL,
    "appenderator_failed_handoffs_total",
    "Number of mergeAndPush operations that failed after exhausting retries"
);
appenderator_counter!(
    PERSIST_BACKPRESSURE_TOTAL,
    "appenderator_persist_backpressure_total",
    "Number of persist submissions whose scheduling delay exceeded the backpressure threshold"
);
appenderator_gauge!(
    ROWS_IN_MEMORY,
    "appenderator_rows_in_memory",
    "Current count of rows held in live sinks' current hydrants"
);
appenderator_gauge!(
    BYTES_IN_MEMORY,
    "appenderator_bytes_in_memory",
    "Current estimate of bytes held in memory across live sinks and their overhead"
);
appenderator_gauge!(
    TOTAL_ROWS,
    "appenderator_total_rows",
    "Cumulative rows added across all identifiers not yet dropped"
);

pub fn set_rows_in_memory(value: usize) {
    ROWS_IN_MEMORY.set(value as f64);
}

pub fn set_bytes_in_memory(value: usize) {
    BYTES_IN_MEMORY.set(value as f64);
}

pub fn set_total_rows(value: usize) {
    TOTAL_ROWS.set(value as f64);
}
