//! Compilation run lifecycle and run summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::ids::{RunId, SliceKey, Vocabulary};

/// Stage of a compilation run.
///
/// Pipeline stages only move forward. `Failed` is reachable from every
/// non-terminal stage; `PartiallyCommitted` only once slices have been
/// written (compiling or later).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Fetching,
    Normalizing,
    Linking,
    Compiling,
    Embedding,
    Committed,
    PartiallyCommitted,
    Failed,
}

impl RunStatus {
    fn stage_index(self) -> Option<u8> {
        match self {
            RunStatus::Pending => Some(0),
            RunStatus::Fetching => Some(1),
            RunStatus::Normalizing => Some(2),
            RunStatus::Linking => Some(3),
            RunStatus::Compiling => Some(4),
            RunStatus::Embedding => Some(5),
            RunStatus::Committed => Some(6),
            RunStatus::PartiallyCommitted | RunStatus::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Committed | RunStatus::PartiallyCommitted | RunStatus::Failed
        )
    }

    /// Whether a run may move from `self` to `next`.
    ///
    /// Forward skips are allowed (e.g. `Compiling -> Committed` when the
    /// embedding stage is disabled); re-entering an earlier stage is not.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunStatus::Failed => true,
            RunStatus::PartiallyCommitted => {
                matches!(self, RunStatus::Compiling | RunStatus::Embedding)
            }
            _ => match (self.stage_index(), next.stage_index()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Fetching => "fetching",
            RunStatus::Normalizing => "normalizing",
            RunStatus::Linking => "linking",
            RunStatus::Compiling => "compiling",
            RunStatus::Embedding => "embedding",
            RunStatus::Committed => "committed",
            RunStatus::PartiallyCommitted => "partially_committed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("run {run_id}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub run_id: RunId,
    pub from: RunStatus,
    pub to: RunStatus,
}

/// One execution of the compilation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationRun {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Source release version (or payload digest when unversioned) per vocabulary.
    #[serde(default)]
    pub per_vocabulary_version: BTreeMap<Vocabulary, String>,
    pub status: RunStatus,
    #[serde(default)]
    pub failed_vocabularies: BTreeSet<Vocabulary>,
    /// Run whose failed vocabularies this run re-processes.
    #[serde(default)]
    pub resumed_from: Option<RunId>,
}

impl CompilationRun {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            per_vocabulary_version: BTreeMap::new(),
            status: RunStatus::Pending,
            failed_vocabularies: BTreeSet::new(),
            resumed_from: None,
        }
    }

    pub fn advance(&mut self, next: RunStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                run_id: self.run_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Count plus a bounded sample of per-record problems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIssues {
    pub count: usize,
    /// `(native code or locator, reason)`, capped at [`RecordIssues::SAMPLE_LIMIT`].
    #[serde(default)]
    pub samples: Vec<(String, String)>,
}

impl RecordIssues {
    pub const SAMPLE_LIMIT: usize = 10;

    pub fn record(&mut self, locator: impl Into<String>, reason: impl Into<String>) {
        self.count += 1;
        if self.samples.len() < Self::SAMPLE_LIMIT {
            self.samples.push((locator.into(), reason.into()));
        }
    }

    pub fn merge(&mut self, other: RecordIssues) {
        self.count += other.count;
        for sample in other.samples {
            if self.samples.len() >= Self::SAMPLE_LIMIT {
                break;
            }
            self.samples.push(sample);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Per-slice change counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub retired: usize,
    pub relationships: usize,
    pub crossmaps: usize,
}

/// Operator-visible outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    #[serde(default)]
    pub committed: BTreeMap<SliceKey, SliceStats>,
    /// Committed slices whose content digest equals the previous commit.
    #[serde(default)]
    pub unchanged: BTreeSet<SliceKey>,
    /// Failed slices with the reason.
    #[serde(default)]
    pub failed: BTreeMap<SliceKey, String>,
    /// Quarantined records per vocabulary (normalization errors, dangling relationships).
    #[serde(default)]
    pub quarantined: BTreeMap<Vocabulary, RecordIssues>,
    /// Unresolved cross-map records per cross-map source.
    #[serde(default)]
    pub unresolved_mappings: BTreeMap<String, RecordIssues>,
    #[serde(default)]
    pub embedding: Option<EmbeddingOutcome>,
}

impl RunSummary {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            committed: BTreeMap::new(),
            unchanged: BTreeSet::new(),
            failed: BTreeMap::new(),
            quarantined: BTreeMap::new(),
            unresolved_mappings: BTreeMap::new(),
            embedding: None,
        }
    }

    pub fn failed_vocabularies(&self) -> BTreeSet<Vocabulary> {
        self.failed
            .keys()
            .filter_map(|k| k.vocabulary().cloned())
            .collect()
    }
}

/// Result of the (optional) embedding stage. Never affects commit status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EmbeddingOutcome {
    Skipped,
    Completed {
        model_version: String,
        embedded: usize,
        superseded: usize,
    },
    Failed {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_only_move_forward() {
        let mut run = CompilationRun::new(RunId::new(1));
        run.advance(RunStatus::Fetching).unwrap();
        run.advance(RunStatus::Normalizing).unwrap();
        assert!(run.advance(RunStatus::Fetching).is_err());
        run.advance(RunStatus::Linking).unwrap();
        run.advance(RunStatus::Compiling).unwrap();
        run.advance(RunStatus::Committed).unwrap();
        assert!(run.finished_at.is_some());
        assert!(run.advance(RunStatus::Failed).is_err());
    }

    #[test]
    fn failed_is_reachable_from_any_open_stage() {
        for from in [
            RunStatus::Pending,
            RunStatus::Fetching,
            RunStatus::Normalizing,
            RunStatus::Linking,
            RunStatus::Compiling,
            RunStatus::Embedding,
        ] {
            assert!(from.can_transition_to(RunStatus::Failed), "{from}");
        }
    }

    #[test]
    fn partial_commit_requires_compilation() {
        assert!(!RunStatus::Linking.can_transition_to(RunStatus::PartiallyCommitted));
        assert!(RunStatus::Compiling.can_transition_to(RunStatus::PartiallyCommitted));
        assert!(RunStatus::Embedding.can_transition_to(RunStatus::PartiallyCommitted));
    }

    #[test]
    fn record_issues_cap_samples() {
        let mut issues = RecordIssues::default();
        for i in 0..25 {
            issues.record(format!("code-{i}"), "bad");
        }
        assert_eq!(issues.count, 25);
        assert_eq!(issues.samples.len(), RecordIssues::SAMPLE_LIMIT);
    }
}
