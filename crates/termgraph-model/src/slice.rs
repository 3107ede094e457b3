//! Compiled graph slices and the committed-graph manifest.
//!
//! A slice is the unit of all-or-nothing writes. Slices are stored under the
//! run that produced them; readers only see the slices the current
//! [`GraphManifest`] points at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::concept::{ConceptRecord, CrossMap, Lifecycle, Relationship};
use crate::digest::fnv1a64_digest_bytes;
use crate::ids::{ConceptId, RunId, SliceKey, Vocabulary};

/// Concepts and native relationships of one vocabulary for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularySlice {
    pub vocabulary: Vocabulary,
    pub run_id: RunId,
    #[serde(default)]
    pub source_version: Option<String>,
    /// Digest of the fetched release payload.
    #[serde(default)]
    pub payload_digest: Option<String>,
    pub concepts: BTreeMap<ConceptId, ConceptRecord>,
    pub relationships: BTreeSet<Relationship>,
}

impl VocabularySlice {
    pub fn new(vocabulary: Vocabulary, run_id: RunId) -> Self {
        Self {
            vocabulary,
            run_id,
            source_version: None,
            payload_digest: None,
            concepts: BTreeMap::new(),
            relationships: BTreeSet::new(),
        }
    }

    /// Digest over the graph content only (concepts + relationships).
    ///
    /// Independent of `run_id`, so recompiling an unchanged release yields
    /// the same digest.
    pub fn content_digest(&self) -> String {
        let body = serde_json::to_vec(&(&self.concepts, &self.relationships)).unwrap_or_default();
        fnv1a64_digest_bytes(&body)
    }

    pub fn active_count(&self) -> usize {
        self.concepts
            .values()
            .filter(|r| r.lifecycle == Lifecycle::Active)
            .count()
    }

    pub fn retired_count(&self) -> usize {
        self.concepts.len() - self.active_count()
    }
}

/// Cross-maps of one annotation / mapping source for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossMapSlice {
    pub source: String,
    pub run_id: RunId,
    /// Vocabularies whose concepts this source links.
    pub links: (Vocabulary, Vocabulary),
    /// Sorted by `(source, target, mapping_type)`, no duplicate keys.
    pub crossmaps: Vec<CrossMap>,
}

impl CrossMapSlice {
    /// Build a slice, applying set semantics on the cross-map key.
    /// When a key repeats, the last record wins.
    pub fn new(
        source: &str,
        run_id: RunId,
        links: (Vocabulary, Vocabulary),
        crossmaps: impl IntoIterator<Item = CrossMap>,
    ) -> Self {
        let mut by_key: BTreeMap<(ConceptId, ConceptId, crate::concept::MappingType), CrossMap> =
            BTreeMap::new();
        for m in crossmaps {
            let key = (
                m.source_concept_id.clone(),
                m.target_concept_id.clone(),
                m.mapping_type.clone(),
            );
            by_key.insert(key, m);
        }
        Self {
            source: source.to_string(),
            run_id,
            links,
            crossmaps: by_key.into_values().collect(),
        }
    }

    pub fn content_digest(&self) -> String {
        let body = serde_json::to_vec(&(&self.links, &self.crossmaps)).unwrap_or_default();
        fnv1a64_digest_bytes(&body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphSlice {
    Vocabulary(VocabularySlice),
    CrossMap(CrossMapSlice),
}

impl GraphSlice {
    pub fn key(&self) -> SliceKey {
        match self {
            GraphSlice::Vocabulary(s) => SliceKey::Vocabulary(s.vocabulary.clone()),
            GraphSlice::CrossMap(s) => SliceKey::CrossMap(s.source.clone()),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            GraphSlice::Vocabulary(s) => s.run_id,
            GraphSlice::CrossMap(s) => s.run_id,
        }
    }

    pub fn content_digest(&self) -> String {
        match self {
            GraphSlice::Vocabulary(s) => s.content_digest(),
            GraphSlice::CrossMap(s) => s.content_digest(),
        }
    }
}

/// Where the current version of one slice lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceRef {
    pub run_id: RunId,
    pub content_digest: String,
    #[serde(default)]
    pub payload_digest: Option<String>,
    #[serde(default)]
    pub source_version: Option<String>,
}

/// The "current run" pointer: one consistent view of the committed graph.
///
/// Readers resolve every slice through a single manifest, so they never see
/// a vocabulary mixed from two runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphManifest {
    /// Run that published this manifest.
    pub run_id: RunId,
    pub committed_at: DateTime<Utc>,
    #[serde(default)]
    pub slices: BTreeMap<SliceKey, SliceRef>,
}

impl GraphManifest {
    pub fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            committed_at: Utc::now(),
            slices: BTreeMap::new(),
        }
    }

    pub fn vocabulary(&self, vocabulary: &Vocabulary) -> Option<&SliceRef> {
        self.slices.get(&SliceKey::Vocabulary(vocabulary.clone()))
    }

    pub fn vocabularies(&self) -> impl Iterator<Item = &Vocabulary> {
        self.slices.keys().filter_map(SliceKey::vocabulary)
    }

    /// Derive the successor manifest: carry every slice forward, then point
    /// the given keys at their new versions.
    pub fn successor(
        &self,
        run_id: RunId,
        updated: impl IntoIterator<Item = (SliceKey, SliceRef)>,
    ) -> Self {
        let mut slices = self.slices.clone();
        slices.extend(updated);
        Self {
            run_id,
            committed_at: Utc::now(),
            slices,
        }
    }
}

/// One embedding vector, keyed by `(concept_id, model_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub concept_id: ConceptId,
    pub model_version: String,
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concept::{Concept, MappingType, RelationType};

    fn record(v: &Vocabulary, code: &str, term: &str, run: RunId) -> ConceptRecord {
        ConceptRecord {
            concept: Concept::new(v.clone(), code, term),
            lifecycle: Lifecycle::Active,
            revision_run: run,
        }
    }

    #[test]
    fn content_digest_ignores_run_id() {
        let v = Vocabulary::new("HPO").unwrap();
        let mut a = VocabularySlice::new(v.clone(), RunId::new(1));
        let mut b = VocabularySlice::new(v.clone(), RunId::new(2));
        for s in [&mut a, &mut b] {
            let r = record(&v, "0000118", "Phenotypic abnormality", RunId::new(1));
            s.concepts.insert(r.concept.concept_id.clone(), r);
        }
        assert_eq!(a.content_digest(), b.content_digest());

        let r = record(&v, "0000001", "All", RunId::new(1));
        b.concepts.insert(r.concept.concept_id.clone(), r);
        assert_ne!(a.content_digest(), b.content_digest());
    }

    #[test]
    fn crossmap_slice_applies_set_semantics() {
        let hgnc = Vocabulary::new("HGNC").unwrap();
        let hpo = Vocabulary::new("HPO").unwrap();
        let m = |conf: Option<f64>| CrossMap {
            source_concept_id: ConceptId::derive(&hgnc, "HGNC:1100"),
            target_concept_id: ConceptId::derive(&hpo, "0003002"),
            mapping_type: MappingType::Annotates,
            confidence: conf,
            properties: BTreeMap::new(),
        };
        let slice = CrossMapSlice::new(
            "gene_hpo",
            RunId::new(1),
            (hgnc.clone(), hpo.clone()),
            [m(None), m(Some(0.4))],
        );
        assert_eq!(slice.crossmaps.len(), 1);
        assert_eq!(slice.crossmaps[0].confidence, Some(0.4));
    }

    #[test]
    fn manifest_successor_carries_untouched_slices() {
        let hgnc = Vocabulary::new("HGNC").unwrap();
        let hpo = Vocabulary::new("HPO").unwrap();
        let r = |run: u64| SliceRef {
            run_id: RunId::new(run),
            content_digest: format!("d{run}"),
            payload_digest: None,
            source_version: None,
        };
        let first = GraphManifest::empty(RunId::new(1)).successor(
            RunId::new(1),
            [
                (SliceKey::Vocabulary(hgnc.clone()), r(1)),
                (SliceKey::Vocabulary(hpo.clone()), r(1)),
            ],
        );
        let second = first.successor(RunId::new(2), [(SliceKey::Vocabulary(hpo.clone()), r(2))]);
        assert_eq!(second.vocabulary(&hgnc).unwrap().run_id, RunId::new(1));
        assert_eq!(second.vocabulary(&hpo).unwrap().run_id, RunId::new(2));
        assert_eq!(second.vocabularies().count(), 2);
    }

    #[test]
    fn relationships_have_set_semantics() {
        let v = Vocabulary::new("HPO").unwrap();
        let mut slice = VocabularySlice::new(v.clone(), RunId::new(1));
        let rel = |t| Relationship {
            source_concept_id: ConceptId::derive(&v, "2"),
            target_concept_id: ConceptId::derive(&v, "1"),
            relation_type: t,
            vocabulary_provenance: v.clone(),
        };
        slice.relationships.insert(rel(RelationType::IsA));
        slice.relationships.insert(rel(RelationType::IsA));
        slice.relationships.insert(rel(RelationType::PartOf));
        assert_eq!(slice.relationships.len(), 2);
    }
}
