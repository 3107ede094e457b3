//! Termgraph embedding pipeline
//!
//! Runs after a graph commit and never gates it:
//!
//! ```text
//!   committed snapshot ──► input text ──► Embedder (batched) ──► refine ──► VectorStore
//!        (changed +          (document     token-hash / HTTP      graph       (concept_id,
//!         unembedded)         store)                              edges       model_version)
//! ```
//!
//! Vectors of superseded model versions are purged unless pinned. Retired
//! concepts are never re-embedded; their existing vectors stay.

pub mod embedder;
pub mod pipeline;
pub mod refine;

use termgraph_model::ConceptId;
use termgraph_storage::StoreError;

pub use embedder::{Embedder, HttpEmbedder, TokenHashEmbedder};
pub use pipeline::{EmbedReport, EmbeddingBackend, EmbeddingConfig, EmbeddingPipeline};
pub use refine::{refine, Neighbourhood, RefineConfig};

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingFailure {
    #[error("embedding backend `{model_version}` failed: {reason}")]
    Backend { model_version: String, reason: String },

    #[error("backend returned {actual} vectors for {expected} inputs")]
    Count { expected: usize, actual: usize },

    #[error("vector for {concept_id} has dimension {actual}, expected {expected}")]
    Dimension {
        concept_id: ConceptId,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
