//! Error classification for the appenderator.
//!
//! Mirrors the `ErrorMetadata` pattern used across the wider codebase: a
//! small, cheaply-cloned struct attached to an [`anyhow::Error`] chain via
//! `.context(..)` so that callers can classify a failure by [`ErrorCode`]
//! without parsing message strings.

use std::borrow::Cow;

use thiserror::Error;

/// Coarse classification for an appenderator failure. Downstream code
/// should match on this rather than on the formatted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Caller passed invalid arguments (wrong dataSource, a committer where
    /// batch forbids one, allowIncrementalPersists=false, etc).
    InvalidArgument,
    /// The current hydrant refused another row (`canAppendRow` was false).
    IndexSizeExceeded,
    /// A write was attempted against a non-writable sink.
    SegmentNotWritable,
    /// Post-persist byte estimate is still over `maxBytesInMemory`.
    HeapUsageLimitExceeded,
    /// A persist of one or more hydrants failed and was latched.
    PersistFailed,
    /// A merge or deep-storage push failed.
    HandoffFailed,
    /// The base persist directory lock could not be acquired.
    LockAcquisitionFailed,
    /// An on-disk or in-memory invariant was violated; indicates programmer
    /// error or on-disk corruption, never a transient condition.
    SanityViolation,
}

/// Attachable error context. Construct with one of the classifying
/// constructors and attach via `anyhow::Context::context`.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short, ScreamingCamelCase tag, stable across message wording changes.
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing message.
    pub msg: Cow<'static, str>,
}

impl ErrorMetadata {
    fn new(
        code: ErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn invalid_argument(short_msg: impl Into<Cow<'static, str>>, msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidArgument, short_msg, msg)
    }

    pub fn index_size_exceeded(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::IndexSizeExceeded, "IndexSizeExceeded", msg)
    }

    pub fn segment_not_writable(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::SegmentNotWritable, "SegmentNotWritable", msg)
    }

    pub fn heap_usage_limit_exceeded(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            ErrorCode::HeapUsageLimitExceeded,
            "HeapUsageLimitExceeded",
            msg,
        )
    }

    pub fn persist_failed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PersistFailed, "PersistFailed", msg)
    }

    pub fn handoff_failed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::HandoffFailed, "HandoffFailed", msg)
    }

    pub fn lock_acquisition_failed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            ErrorCode::LockAcquisitionFailed,
            "LockAcquisitionFailed",
            msg,
        )
    }

    pub fn sanity_violation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::SanityViolation, "SanityViolation", msg)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

/// Returns the [`ErrorMetadata`] attached to `err`'s context chain, if any.
pub fn metadata_for(err: &anyhow::Error) -> Option<&ErrorMetadata> {
    err.chain().find_map(|cause| cause.downcast_ref::<ErrorMetadata>())
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn metadata_roundtrips_through_anyhow_chain() {
        let base = anyhow::anyhow!("disk full");
        let wrapped = base.context(ErrorMetadata::persist_failed("could not write spill file"));
        let found = metadata_for(&wrapped).expect("metadata attached");
        assert_eq!(found.code(), ErrorCode::PersistFailed);
        assert_eq!(found.short_msg, "PersistFailed");
    }

    #[test]
    fn metadata_absent_when_not_attached() {
        let err = anyhow::anyhow!("plain error");
        assert!(metadata_for(&err).is_none());
    }
}
