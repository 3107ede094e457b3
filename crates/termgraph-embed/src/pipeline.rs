//! Embedding stage driver.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use termgraph_compile::EmbeddingStage;
use termgraph_model::{ConceptId, EmbeddingOutcome, EmbeddingVector, Vocabulary};
use termgraph_storage::{DocumentStore, GraphSnapshot, Stores, VectorStore};
use tracing::{debug, info, warn};

use crate::embedder::{normalize_in_place, Embedder, HttpEmbedder, TokenHashEmbedder};
use crate::refine::{refine, Neighbourhood, RefineConfig};
use crate::EmbeddingFailure;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingBackend {
    TokenHash,
    Http { url: String, model: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub enabled: bool,
    pub backend: EmbeddingBackend,
    /// Version recorded with vectors; defaults to the backend's own.
    pub model_version: Option<String>,
    pub dimension: usize,
    pub batch_size: usize,
    pub timeout_secs: u64,
    pub refine: RefineConfig,
    /// Model versions whose vectors survive supersession.
    pub pinned_versions: Vec<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: EmbeddingBackend::TokenHash,
            model_version: None,
            dimension: TokenHashEmbedder::DEFAULT_DIMENSION,
            batch_size: 64,
            timeout_secs: 60,
            refine: RefineConfig::default(),
            pinned_versions: Vec::new(),
        }
    }
}

impl EmbeddingConfig {
    pub fn build_embedder(&self) -> Result<Arc<dyn Embedder>, EmbeddingFailure> {
        match &self.backend {
            EmbeddingBackend::TokenHash => {
                let mut embedder = TokenHashEmbedder::new(self.dimension);
                if let Some(version) = &self.model_version {
                    embedder = embedder.with_model_version(version);
                }
                Ok(Arc::new(embedder))
            }
            EmbeddingBackend::Http { url, model } => {
                let mut embedder = HttpEmbedder::new(
                    url,
                    model,
                    self.dimension,
                    Some(Duration::from_secs(self.timeout_secs.max(1))),
                )?;
                if let Some(version) = &self.model_version {
                    embedder = embedder.with_model_version(version);
                }
                Ok(Arc::new(embedder))
            }
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub model_version: String,
    pub embedded: usize,
    /// Active concepts embedded because this model version had no vector
    /// for them yet.
    pub backfilled: usize,
    pub skipped_retired: usize,
    pub superseded: usize,
}

impl EmbedReport {
    pub fn outcome(&self) -> EmbeddingOutcome {
        EmbeddingOutcome::Completed {
            model_version: self.model_version.clone(),
            embedded: self.embedded,
            superseded: self.superseded,
        }
    }
}

pub struct EmbeddingPipeline {
    embedder: Arc<dyn Embedder>,
    documents: Arc<dyn DocumentStore>,
    vectors: Arc<dyn VectorStore>,
    batch_size: usize,
    refine: RefineConfig,
    pinned: BTreeSet<String>,
}

impl EmbeddingPipeline {
    pub fn new(stores: &Stores, embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            documents: stores.documents.clone(),
            vectors: stores.vectors.clone(),
            batch_size: config.batch_size.max(1),
            refine: config.refine.clone(),
            pinned: config.pinned_versions.iter().cloned().collect(),
        }
    }

    pub fn from_config(stores: &Stores, config: &EmbeddingConfig) -> Result<Self, EmbeddingFailure> {
        Ok(Self::new(stores, config.build_embedder()?, config))
    }

    pub fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    /// Embed `changed` plus every active concept the current model version
    /// has no vector for, then supersede unpinned older versions.
    pub async fn run(
        &self,
        snapshot: &GraphSnapshot,
        changed: &BTreeSet<ConceptId>,
    ) -> Result<EmbedReport, EmbeddingFailure> {
        let version = self.embedder.model_version().to_string();
        let mut vectors: HashMap<ConceptId, Vec<f32>> = self
            .vectors
            .vectors(&version)?
            .into_iter()
            .map(|v| (v.concept_id, v.vector))
            .collect();

        let mut report = EmbedReport {
            model_version: version.clone(),
            ..EmbedReport::default()
        };
        let mut targets = BTreeSet::new();
        for id in changed {
            match snapshot.concept(id) {
                Some(record) if record.lifecycle.is_retired() => report.skipped_retired += 1,
                Some(_) => {
                    targets.insert(id.clone());
                }
                None => debug!(concept = %id, "changed concept not in snapshot"),
            }
        }
        for record in snapshot.active_concepts() {
            let id = &record.concept.concept_id;
            if !vectors.contains_key(id) && targets.insert(id.clone()) {
                report.backfilled += 1;
            }
        }

        let texts = self.input_texts(snapshot, &targets)?;
        let ordered: Vec<(&ConceptId, &String)> = texts.iter().collect();
        for batch in ordered.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, t)| (*t).clone()).collect();
            let out = self.embedder.embed_batch(&inputs).await?;
            if out.len() != batch.len() {
                return Err(EmbeddingFailure::Count {
                    expected: batch.len(),
                    actual: out.len(),
                });
            }
            for ((id, _), mut vector) in batch.iter().zip(out) {
                if vector.len() != self.embedder.dimension() {
                    return Err(EmbeddingFailure::Dimension {
                        concept_id: (*id).clone(),
                        expected: self.embedder.dimension(),
                        actual: vector.len(),
                    });
                }
                normalize_in_place(&mut vector);
                vectors.insert((*id).clone(), vector);
            }
            debug!(model_version = %version, batch = batch.len(), "embedded batch");
        }

        if self.refine.enabled && !targets.is_empty() {
            let graph = Neighbourhood::from_snapshot(snapshot);
            refine(&mut vectors, &targets, &graph, &self.refine);
        }

        let rows: Vec<EmbeddingVector> = targets
            .iter()
            .filter_map(|id| {
                vectors.get(id).map(|v| EmbeddingVector {
                    concept_id: id.clone(),
                    model_version: version.clone(),
                    vector: v.clone(),
                })
            })
            .collect();
        report.embedded = self.vectors.upsert(&rows)?;
        report.superseded = self.supersede(&version)?;

        info!(
            model_version = %version,
            embedded = report.embedded,
            backfilled = report.backfilled,
            skipped_retired = report.skipped_retired,
            superseded = report.superseded,
            "embedding stage finished"
        );
        Ok(report)
    }

    /// Re-embed every active concept.
    pub async fn run_all(&self, snapshot: &GraphSnapshot) -> Result<EmbedReport, EmbeddingFailure> {
        let all: BTreeSet<ConceptId> = snapshot
            .active_concepts()
            .map(|r| r.concept.concept_id.clone())
            .collect();
        self.run(snapshot, &all).await
    }

    /// Drop every vector of other, unpinned model versions.
    fn supersede(&self, current: &str) -> Result<usize, EmbeddingFailure> {
        let mut removed = 0;
        for version in self.vectors.model_versions()? {
            if version == current || self.pinned.contains(&version) {
                continue;
            }
            let n = self.vectors.purge_model(&version)?;
            info!(model_version = %version, vectors = n, "superseded embedding model version");
            removed += n;
        }
        Ok(removed)
    }

    /// Explicit purge, pinned or not.
    pub fn purge(&self, model_version: &str) -> Result<usize, EmbeddingFailure> {
        Ok(self.vectors.purge_model(model_version)?)
    }

    /// Input text per target, from the committed document store. Falls back
    /// to the concept's canonical text when a document is missing.
    fn input_texts(
        &self,
        snapshot: &GraphSnapshot,
        targets: &BTreeSet<ConceptId>,
    ) -> Result<BTreeMap<ConceptId, String>, EmbeddingFailure> {
        let mut by_vocabulary: BTreeMap<Vocabulary, Vec<&ConceptId>> = BTreeMap::new();
        for id in targets {
            if let Some(record) = snapshot.concept(id) {
                by_vocabulary
                    .entry(record.concept.vocabulary.clone())
                    .or_default()
                    .push(id);
            }
        }

        let mut texts = BTreeMap::new();
        for (vocabulary, ids) in by_vocabulary {
            let documents: HashMap<ConceptId, String> = match snapshot.manifest.vocabulary(&vocabulary) {
                Some(slice_ref) => self
                    .documents
                    .documents(&vocabulary, slice_ref.run_id)?
                    .into_iter()
                    .map(|d| (d.concept_id, d.text))
                    .collect(),
                None => HashMap::new(),
            };
            for id in ids {
                let text = match documents.get(id) {
                    Some(text) => text.clone(),
                    None => {
                        warn!(vocabulary = %vocabulary, concept = %id, "no document; using canonical text");
                        snapshot
                            .concept(id)
                            .map(|r| r.concept.canonical_text())
                            .unwrap_or_default()
                    }
                };
                texts.insert(id.clone(), text);
            }
        }
        Ok(texts)
    }
}

#[async_trait]
impl EmbeddingStage for EmbeddingPipeline {
    async fn embed(
        &self,
        snapshot: &GraphSnapshot,
        changed: &BTreeSet<ConceptId>,
    ) -> Result<EmbeddingOutcome, Box<dyn std::error::Error + Send + Sync>> {
        let report = self.run(snapshot, changed).await?;
        Ok(report.outcome())
    }
}
