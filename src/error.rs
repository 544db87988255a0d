//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns [`CrError`]. There are no
//! retries anywhere in this core: a single failure aborts the whole dump or
//! restore, so callers should treat any `Err` as fatal to the current
//! operation rather than something to recover from inline.

use crate::model::ObjectKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrError {
    #[error("I/O failure on {what}: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("decode mismatch: {0}")]
    DecodeMismatch(String),

    #[error("kernel verbs call {call} failed: {reason}")]
    KernelVerbsFail { call: &'static str, reason: String },

    #[error("catalog clash for {kind:?} handle {handle}: {reason}")]
    CatalogClash {
        kind: ObjectKind,
        handle: u32,
        reason: &'static str,
    },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("identity mismatch for {what}: expected {expected}, got {actual}")]
    IdentityMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },
}

pub type CrResult<T> = Result<T, CrError>;

impl CrError {
    pub fn io(what: &'static str, source: std::io::Error) -> Self {
        CrError::Io { what, source }
    }

    pub fn kernel(call: &'static str, reason: impl Into<String>) -> Self {
        CrError::KernelVerbsFail {
            call,
            reason: reason.into(),
        }
    }
}
