//! Termgraph compilation pipeline
//!
//! ```text
//! ┌────────────────┐   RawRecord   ┌────────────┐  Concept +   ┌──────────────────┐
//! │ SourceAdapter  │ ────────────► │ Normalizer │ ───────────► │ IdentityResolver │
//! │ (per vocab)    │               └────────────┘  relations   │ (lookup + merge) │
//! └────────────────┘                                           └────────┬─────────┘
//!                                                                       │
//! ┌────────────────┐   RawRecord   ┌────────────┐   CrossMap            │
//! │ SourceAdapter  │ ────────────► │   Linker   │ ◄─────────────────────┘
//! │ (annotations)  │               └─────┬──────┘   resolve endpoints
//! └────────────────┘                     │
//!                                        ▼
//!                              ┌──────────────────┐  slices   ┌─────────────┐
//!                              │  GraphCompiler   │ ────────► │   Stores    │
//!                              └──────────────────┘           └──────┬──────┘
//!                                                                    │ publish
//!                                                             current-run pointer
//! ```
//!
//! The [`Coordinator`] owns the run state machine and schedules the stages.

pub mod compiler;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod identity;
pub mod linker;
pub mod normalize;
pub mod schema;

pub use compiler::{build_crossmap_slice, build_vocabulary_slice, BuiltSlice, GraphCompiler, ReleaseInfo};
pub use coordinator::{
    CancelHandle, CompileRequest, Coordinator, CoordinatorConfig, CrossMapJob, EmbeddingStage,
    VocabularyJob,
};
pub use error::{CompileError, Endpoint, GraphWriteFailure, NormalizationError, UnresolvedMapping};
pub use events::{RunEvent, RunEventHandler};
pub use identity::{reconcile, IdentityResolver, Reconciled, Release};
pub use linker::{
    CrossMapSchema, EndpointRule, LinkError, LinkOutcome, Linker, MappingRule, PropertyRule,
    ResolveBy, RowFilter,
};
pub use normalize::{NormalizedRecord, Normalizer, PendingRelation};
pub use schema::{CodeRule, RelationRule, StatusRule, VocabularySchema};
