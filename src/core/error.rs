//! Core capability errors (record parsing, runtime consistency).
//!
//! These are bounded and stable: core errors represent domain/refusal
//! states, not library implementation details. Duplicate index keys and
//! unresolved deferred references are NOT errors; they go to the defect
//! log and the `deferred_objects()` surface respectively.

use thiserror::Error;

use crate::error::{Effect, Transience};

/// A raw attribute record could not be turned into an entity.
///
/// Always record-local: the record is skipped and a counter incremented.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ParseError {
    #[error("objectGUID is invalid: {reason}")]
    Guid { reason: String },
    #[error("objectSid value is invalid: {reason}")]
    Sid { reason: String },
    #[error("distinguished name `{raw}` is invalid: {reason}")]
    Dn { raw: String, reason: String },
    #[error("attribute `{attr}` is invalid: {reason}")]
    Attribute { attr: String, reason: String },
    #[error("timestamp attribute `{attr}` is invalid: {reason}")]
    Timestamp { attr: &'static str, reason: String },
}

/// An invariant violation observed at runtime (tag misplacement, dangling
/// backlink). Fatal: the process should be restarted.
#[derive(Debug, Error, Clone)]
#[error("store consistency violation: {reason}")]
pub struct ConsistencyError {
    pub reason: String,
}

/// Canonical error enum for the core capability.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CoreError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
}

impl CoreError {
    pub fn transience(&self) -> Transience {
        // Both variants are input/state failures; retrying the same record
        // against the same store cannot succeed.
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        match self {
            CoreError::Parse(_) => Effect::None,
            // A consistency violation means some prior mutation went wrong.
            CoreError::Consistency(_) => Effect::Unknown,
        }
    }
}
