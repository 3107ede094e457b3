//! Error taxonomy of the compilation pipeline.
//!
//! Record-level errors ([`NormalizationError`], [`UnresolvedMapping`]) are
//! values collected into the run summary. Slice-level errors
//! ([`GraphWriteFailure`], source failures) fail one slice. Only
//! [`CompileError`] aborts a run.

use termgraph_model::{InvalidTransition, RunId, RunStatus, SliceKey, Vocabulary};
use termgraph_storage::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    #[error("missing required field `{field}`")]
    MissingField { field: String },

    #[error("field `{field}` has unexpected shape: {detail}")]
    UnexpectedShape { field: String, detail: String },

    #[error("relation type `{relation}` is not declared for {vocabulary}")]
    UndeclaredRelation {
        vocabulary: Vocabulary,
        relation: String,
    },

    #[error("relationship target `{target}` is not in this release")]
    DanglingTarget { target: String },

    #[error("unreadable source record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Target,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Source => f.write_str("source"),
            Endpoint::Target => f.write_str("target"),
        }
    }
}

/// A cross-map endpoint that does not resolve to a known concept.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{endpoint} `{value}` unresolved in {vocabulary}: {reason}")]
pub struct UnresolvedMapping {
    pub endpoint: Endpoint,
    pub vocabulary: Vocabulary,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("graph write failed for {slice}: {reason}")]
pub struct GraphWriteFailure {
    pub slice: SliceKey,
    pub reason: String,
}

/// Run-level failures: the run is aborted and the current pointer untouched.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("coordination cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("unknown run {0}")]
    UnknownRun(RunId),

    #[error("{run_id} is {status}; only failed or partially committed runs can be resumed")]
    NotResumable { run_id: RunId, status: RunStatus },

    #[error("nothing to compile")]
    EmptyRequest,

    #[error("{0} is listed more than once")]
    DuplicateJob(SliceKey),

    #[error("invalid schema for {vocabulary}: {reason}")]
    InvalidSchema {
        vocabulary: Vocabulary,
        reason: String,
    },

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl From<StoreError> for CompileError {
    fn from(value: StoreError) -> Self {
        CompileError::CacheUnavailable(value.to_string())
    }
}
