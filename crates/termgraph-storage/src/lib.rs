//! Termgraph storage layer
//!
//! Four stores plus a run log, each behind a trait with an in-memory and a
//! file-backed implementation:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         TERMGRAPH STORES                             │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │   Graph Compiler ──► GraphStore      slices keyed by (slice, run)    │
//! │                 └──► DocumentStore   concept text per (vocab, run)   │
//! │                                                                      │
//! │   Embedding     ──► VectorStore      (concept_id, model_version)     │
//! │                                                                      │
//! │   Coordinator   ──► CoordinationCache                                │
//! │                       - current-run pointer (GraphManifest)          │
//! │                       - run id sequence                              │
//! │                       - per-slice run locks                          │
//! │                 └──► RunLog          runs + summaries                │
//! │                                                                      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Slices written under a run are invisible until the coordinator publishes
//! a manifest pointing at them. Publishing is a read-modify-write of the
//! *latest* manifest under the cache's own lock, so two runs over disjoint
//! vocabularies never drop each other's updates.

pub mod file;
pub mod memory;
pub mod snapshot;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use termgraph_model::{
    CompilationRun, ConceptId, ConceptRecord, EmbeddingVector, GraphManifest, GraphSlice, RunId,
    RunSummary, SliceKey, SliceRef, Vocabulary,
};

pub use file::{FileCoordinationCache, FileDocumentStore, FileGraphStore, FileRunLog, FileVectorStore};
pub use memory::{
    MemoryCoordinationCache, MemoryDocumentStore, MemoryGraphStore, MemoryRunLog,
    MemoryVectorStore,
};
pub use snapshot::GraphSnapshot;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode/decode {what}: {reason}")]
    Codec { what: String, reason: String },

    #[error("{key} is locked by {held_by}")]
    Locked { key: SliceKey, held_by: RunId },

    #[error("coordination cache unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn codec(what: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Codec {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Documents
// ============================================================================

/// Text view of a concept, as served to readers and the embedding stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptDocument {
    pub concept_id: ConceptId,
    pub vocabulary: Vocabulary,
    pub native_code: String,
    pub preferred_term: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub definition: Option<String>,
    /// Deterministic embedding input.
    pub text: String,
    pub retired: bool,
    pub revision_run: RunId,
}

impl ConceptDocument {
    pub fn from_record(record: &ConceptRecord) -> Self {
        let c = &record.concept;
        Self {
            concept_id: c.concept_id.clone(),
            vocabulary: c.vocabulary.clone(),
            native_code: c.native_code.clone(),
            preferred_term: c.preferred_term.clone(),
            synonyms: c.synonyms.clone(),
            definition: c.definition.clone(),
            text: c.canonical_text(),
            retired: record.lifecycle.is_retired(),
            revision_run: record.revision_run,
        }
    }
}

// ============================================================================
// Store contracts
// ============================================================================

/// Concepts as nodes, relationships / cross-maps as edges, grouped in slices.
pub trait GraphStore: Send + Sync {
    /// Write one slice under its run. A `(slice, run)` pair is written once.
    fn put_slice(&self, slice: &GraphSlice) -> StoreResult<()>;

    fn get_slice(&self, key: &SliceKey, run_id: RunId) -> StoreResult<Option<GraphSlice>>;

    /// Remove an unpublished slice (rollback).
    fn discard_slice(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()>;

    /// Runs that have a stored version of this slice, ascending.
    fn slice_history(&self, key: &SliceKey) -> StoreResult<Vec<RunId>>;
}

pub trait DocumentStore: Send + Sync {
    fn put_documents(
        &self,
        vocabulary: &Vocabulary,
        run_id: RunId,
        documents: &[ConceptDocument],
    ) -> StoreResult<()>;

    fn documents(&self, vocabulary: &Vocabulary, run_id: RunId) -> StoreResult<Vec<ConceptDocument>>;

    fn discard(&self, vocabulary: &Vocabulary, run_id: RunId) -> StoreResult<()>;
}

pub trait VectorStore: Send + Sync {
    /// Insert or replace vectors keyed by `(concept_id, model_version)`.
    fn upsert(&self, vectors: &[EmbeddingVector]) -> StoreResult<usize>;

    fn get(&self, concept_id: &ConceptId, model_version: &str) -> StoreResult<Option<EmbeddingVector>>;

    fn vectors(&self, model_version: &str) -> StoreResult<Vec<EmbeddingVector>>;

    fn model_versions(&self) -> StoreResult<Vec<String>>;

    /// Drop every vector of a model version; returns how many were removed.
    fn purge_model(&self, model_version: &str) -> StoreResult<usize>;
}

/// Inter-process coordination: current-run pointer, run ids, run locks.
pub trait CoordinationCache: Send + Sync {
    fn allocate_run_id(&self) -> StoreResult<RunId>;

    fn current(&self) -> StoreResult<Option<GraphManifest>>;

    /// Atomically point the given slices at their new versions, carrying
    /// every other slice of the latest manifest forward.
    fn publish(
        &self,
        run_id: RunId,
        updates: BTreeMap<SliceKey, SliceRef>,
    ) -> StoreResult<GraphManifest>;

    /// Claim a slice for a run; fails with [`StoreError::Locked`] when another
    /// run holds it.
    fn try_lock(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()>;

    /// Release a claim. No-op unless `run_id` holds it.
    fn unlock(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()>;

    fn locks(&self) -> StoreResult<BTreeMap<SliceKey, RunId>>;
}

pub trait RunLog: Send + Sync {
    fn save_run(&self, run: &CompilationRun) -> StoreResult<()>;
    fn load_run(&self, run_id: RunId) -> StoreResult<Option<CompilationRun>>;
    fn save_summary(&self, summary: &RunSummary) -> StoreResult<()>;
    fn load_summary(&self, run_id: RunId) -> StoreResult<Option<RunSummary>>;
    fn list_runs(&self) -> StoreResult<Vec<CompilationRun>>;
}

// ============================================================================
// Configuration / bundle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    File,
}

/// Configuration for the store bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory of the file backend.
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            data_dir: PathBuf::from("./termgraph-data"),
        }
    }
}

/// All stores a compilation run touches.
#[derive(Clone)]
pub struct Stores {
    pub graph: Arc<dyn GraphStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub cache: Arc<dyn CoordinationCache>,
    pub runs: Arc<dyn RunLog>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            graph: Arc::new(MemoryGraphStore::default()),
            documents: Arc::new(MemoryDocumentStore::default()),
            vectors: Arc::new(MemoryVectorStore::default()),
            cache: Arc::new(MemoryCoordinationCache::default()),
            runs: Arc::new(MemoryRunLog::default()),
        }
    }

    pub fn open_dir(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        Ok(Self {
            graph: Arc::new(FileGraphStore::open(root.join("graph"))?),
            documents: Arc::new(FileDocumentStore::open(root.join("documents"))?),
            vectors: Arc::new(FileVectorStore::open(root.join("vectors"))?),
            cache: Arc::new(FileCoordinationCache::open(root.join("cache"))?),
            runs: Arc::new(FileRunLog::open(root.join("runs"))?),
        })
    }

    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::in_memory()),
            StorageBackend::File => Self::open_dir(&config.data_dir),
        }
    }

    /// Load the committed graph the current pointer refers to.
    pub fn snapshot(&self) -> StoreResult<Option<GraphSnapshot>> {
        match self.cache.current()? {
            Some(manifest) => GraphSnapshot::load(self.graph.as_ref(), manifest).map(Some),
            None => Ok(None),
        }
    }
}
