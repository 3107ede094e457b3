//! Run events for observability.
//!
//! Handlers are called synchronously from the coordinator task, in order.

use termgraph_model::{RunId, RunStatus, SliceKey, SliceStats, Vocabulary};

#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        slices: Vec<SliceKey>,
    },
    StageEntered {
        run_id: RunId,
        status: RunStatus,
    },
    VocabularyFetched {
        vocabulary: Vocabulary,
        version: String,
        bytes: usize,
    },
    VocabularyNormalized {
        vocabulary: Vocabulary,
        concepts: usize,
        quarantined: usize,
    },
    CrossMapLinked {
        source: String,
        crossmaps: usize,
        unresolved: usize,
    },
    SliceCommitted {
        key: SliceKey,
        stats: SliceStats,
        unchanged: bool,
    },
    SliceFailed {
        key: SliceKey,
        reason: String,
    },
    Published {
        run_id: RunId,
        slices: usize,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
}

/// Callback for run events.
pub type RunEventHandler = Box<dyn Fn(RunEvent) + Send + Sync>;
