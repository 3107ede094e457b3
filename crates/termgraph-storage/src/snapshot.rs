//! Read view over the committed graph.
//!
//! A snapshot is built from exactly one [`GraphManifest`], so every
//! vocabulary it exposes comes from a single run.

use std::collections::{BTreeMap, HashMap};
use termgraph_model::{
    ConceptId, ConceptRecord, CrossMap, CrossMapSlice, GraphManifest, GraphSlice, Relationship,
    SliceKey, Vocabulary, VocabularySlice,
};

use crate::{GraphStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    pub manifest: GraphManifest,
    pub vocabularies: BTreeMap<Vocabulary, VocabularySlice>,
    pub crossmaps: BTreeMap<String, CrossMapSlice>,
    by_id: HashMap<ConceptId, Vocabulary>,
}

impl GraphSnapshot {
    pub fn load(graph: &dyn GraphStore, manifest: GraphManifest) -> StoreResult<Self> {
        let mut vocabularies = BTreeMap::new();
        let mut crossmaps = BTreeMap::new();
        for (key, slice_ref) in &manifest.slices {
            let slice = graph.get_slice(key, slice_ref.run_id)?.ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "manifest {} points at missing slice {key} @ {}",
                    manifest.run_id, slice_ref.run_id
                ))
            })?;
            match slice {
                GraphSlice::Vocabulary(s) => {
                    vocabularies.insert(s.vocabulary.clone(), s);
                }
                GraphSlice::CrossMap(s) => {
                    crossmaps.insert(s.source.clone(), s);
                }
            }
        }
        Ok(Self::from_parts(manifest, vocabularies, crossmaps))
    }

    pub fn from_parts(
        manifest: GraphManifest,
        vocabularies: BTreeMap<Vocabulary, VocabularySlice>,
        crossmaps: BTreeMap<String, CrossMapSlice>,
    ) -> Self {
        let by_id = vocabularies
            .values()
            .flat_map(|s| s.concepts.keys().map(|id| (id.clone(), s.vocabulary.clone())))
            .collect();
        Self {
            manifest,
            vocabularies,
            crossmaps,
            by_id,
        }
    }

    /// Resolve a concept, retired ones included.
    pub fn concept(&self, id: &ConceptId) -> Option<&ConceptRecord> {
        let vocab = self.by_id.get(id)?;
        self.vocabularies.get(vocab)?.concepts.get(id)
    }

    /// Resolve a concept for default queries (retired concepts excluded).
    pub fn active_concept(&self, id: &ConceptId) -> Option<&ConceptRecord> {
        self.concept(id).filter(|r| !r.lifecycle.is_retired())
    }

    pub fn concept_by_code(&self, vocabulary: &Vocabulary, native_code: &str) -> Option<&ConceptRecord> {
        self.concept(&ConceptId::derive(vocabulary, native_code))
    }

    pub fn contains(&self, id: &ConceptId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn concepts(&self) -> impl Iterator<Item = &ConceptRecord> {
        self.vocabularies.values().flat_map(|s| s.concepts.values())
    }

    pub fn active_concepts(&self) -> impl Iterator<Item = &ConceptRecord> {
        self.concepts().filter(|r| !r.lifecycle.is_retired())
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.vocabularies.values().flat_map(|s| s.relationships.iter())
    }

    pub fn crossmaps(&self) -> impl Iterator<Item = &CrossMap> {
        self.crossmaps.values().flat_map(|s| s.crossmaps.iter())
    }

    pub fn slice_keys(&self) -> impl Iterator<Item = &SliceKey> {
        self.manifest.slices.keys()
    }
}
