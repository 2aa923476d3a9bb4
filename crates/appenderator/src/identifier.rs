//! Segment identity and the half-open time interval a segment covers.

use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// A half-open millisecond timestamp range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start_millis: i64,
    pub end_millis: i64,
}

impl Interval {
    pub fn new(start_millis: i64, end_millis: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            start_millis < end_millis,
            "interval [{start_millis}, {end_millis}) is not half-open forward"
        );
        Ok(Self {
            start_millis,
            end_millis,
        })
    }

    pub fn contains(&self, timestamp_millis: i64) -> bool {
        timestamp_millis >= self.start_millis && timestamp_millis < self.end_millis
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_millis, self.end_millis)
    }
}

/// Opaque shard spec: callers encode their own partitioning scheme (hash
/// bucket, numbered shard, single "no partitioning") as JSON. The core
/// never interprets it beyond identity and filesystem-safe formatting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec(pub serde_json::Value);

impl fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// {dataSource, interval, version, shardSpec}. Immutable, JSON-serializable,
/// and the map key for every live structure in the appenderator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentIdentifier {
    pub data_source: String,
    pub interval: Interval,
    /// Opaque lexicographic version string; compared only for equality.
    pub version: String,
    pub shard_spec: ShardSpec,
}

impl SegmentIdentifier {
    pub fn new(
        data_source: impl Into<String>,
        interval: Interval,
        version: impl Into<String>,
        shard_spec: ShardSpec,
    ) -> Self {
        Self {
            data_source: data_source.into(),
            interval,
            version: version.into(),
            shard_spec,
        }
    }

    /// A filesystem-safe, unique-per-tuple string used to name the sink's
    /// persist subdirectory (see `layout::sink_dir`).
    pub fn as_dir_name(&self) -> String {
        let raw = format!(
            "{}_{}_{}_{}",
            self.data_source, self.interval, self.version, self.shard_spec
        );
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for SegmentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.data_source, self.interval, self.version, self.shard_spec
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(version: &str) -> SegmentIdentifier {
        SegmentIdentifier::new(
            "events",
            Interval::new(0, 1000).unwrap(),
            version,
            ShardSpec(serde_json::json!({"type": "numbered", "shard": 0})),
        )
    }

    #[test]
    fn equality_is_over_all_four_fields() {
        assert_eq!(id("v1"), id("v1"));
        assert_ne!(id("v1"), id("v2"));
    }

    #[test]
    fn dir_name_is_filesystem_safe() {
        let name = id("2024-01-01T00:00:00.000Z").as_dir_name();
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_'));
    }

    #[test]
    fn round_trips_through_json() {
        let original = id("v7");
        let json = serde_json::to_string(&original).unwrap();
        let restored: SegmentIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(original, restored);
    }

    #[test]
    fn interval_rejects_backwards_range() {
        assert!(Interval::new(100, 50).is_err());
    }
}
