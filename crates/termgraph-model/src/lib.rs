//! Termgraph canonical model
//!
//! Shared types for every stage of vocabulary compilation:
//!
//! ```text
//!   RawRecord ──► Concept / Relationship ──► VocabularySlice ─┐
//!                                                             ├─► GraphManifest
//!   RawRecord ──► CrossMap ─────────────────► CrossMapSlice ──┘   ("current run")
//! ```
//!
//! Concepts are addressed by [`ConceptId`], derived deterministically from
//! `(vocabulary, native_code)`; edges refer to concepts by id only.

pub mod concept;
pub mod digest;
pub mod ids;
pub mod run;
pub mod slice;

pub use concept::{
    dedup_synonyms, Concept, ConceptRecord, CrossMap, Lifecycle, MappingType, MetadataValue,
    RelationKind, RelationType, Relationship, SOURCE_STATUS_KEY,
};
pub use ids::{ConceptId, IdParseError, RunId, SliceKey, Vocabulary};
pub use run::{
    CompilationRun, EmbeddingOutcome, InvalidTransition, RecordIssues, RunStatus, RunSummary,
    SliceStats,
};
pub use slice::{
    CrossMapSlice, EmbeddingVector, GraphManifest, GraphSlice, SliceRef, VocabularySlice,
};
