//! Graph compiler.
//!
//! Builds one slice per vocabulary / cross-map source and writes it under
//! the run id. A slice is all-or-nothing: a failed write removes whatever
//! part of it reached the stores.

use std::collections::BTreeSet;
use termgraph_model::{
    ConceptId, CrossMap, CrossMapSlice, GraphSlice, RecordIssues, Relationship, RunId, SliceKey,
    SliceRef, SliceStats, Vocabulary, VocabularySlice,
};
use termgraph_storage::{ConceptDocument, Stores};
use tracing::{debug, info, warn};

use crate::error::{GraphWriteFailure, NormalizationError};
use crate::identity::{reconcile, Release};
use crate::linker::retain_resolvable;

// ============================================================================
// Slice builders
// ============================================================================

#[derive(Debug, Clone)]
pub struct BuiltSlice {
    pub slice: GraphSlice,
    pub stats: SliceStats,
    /// Records dropped while building (dangling relationship targets,
    /// unresolvable cross-map endpoints).
    pub dropped: RecordIssues,
}

impl BuiltSlice {
    pub fn key(&self) -> SliceKey {
        self.slice.key()
    }

    /// Concepts created or updated by this run, active only.
    pub fn changed_concepts(&self) -> BTreeSet<ConceptId> {
        match &self.slice {
            GraphSlice::Vocabulary(s) => s
                .concepts
                .iter()
                .filter(|(_, r)| r.revision_run == s.run_id && !r.lifecycle.is_retired())
                .map(|(id, _)| id.clone())
                .collect(),
            GraphSlice::CrossMap(_) => BTreeSet::new(),
        }
    }
}

/// Release metadata carried onto the slice.
#[derive(Debug, Clone, Default)]
pub struct ReleaseInfo {
    pub source_version: Option<String>,
    pub payload_digest: Option<String>,
}

/// Build a vocabulary slice from a merged release and the prior committed
/// slice.
///
/// Relationship targets must exist in the resulting slice (active or
/// retired); others are quarantined. Prior relationships touching a concept
/// retired by this release are carried forward so they stay resolvable.
pub fn build_vocabulary_slice(
    run_id: RunId,
    vocabulary: &Vocabulary,
    prior: Option<&VocabularySlice>,
    release: &Release,
    info: ReleaseInfo,
) -> BuiltSlice {
    let reconciled = reconcile(run_id, prior, &release.concepts);
    let mut stats = reconciled.stats;
    let mut dropped = RecordIssues::default();

    let mut slice = VocabularySlice::new(vocabulary.clone(), run_id);
    slice.source_version = info.source_version;
    slice.payload_digest = info.payload_digest;
    slice.concepts = reconciled.concepts;

    for (source_id, pending) in &release.relations {
        let source_code = release
            .concepts
            .get(source_id)
            .map(|c| c.native_code.as_str())
            .unwrap_or_default();
        for p in pending {
            let target_id = ConceptId::derive(vocabulary, &p.target_code);
            if !slice.concepts.contains_key(&target_id) {
                let err = NormalizationError::DanglingTarget {
                    target: p.target_code.clone(),
                };
                debug!(vocabulary = %vocabulary, code = source_code, reason = %err, "quarantined relationship");
                dropped.record(source_code, err.to_string());
                continue;
            }
            slice.relationships.insert(Relationship {
                source_concept_id: source_id.clone(),
                target_concept_id: target_id,
                relation_type: p.relation_type,
                vocabulary_provenance: vocabulary.clone(),
            });
        }
    }

    if let Some(prior) = prior {
        let touches_retired = |id: &ConceptId| {
            slice
                .concepts
                .get(id)
                .map(|r| r.lifecycle.is_retired())
                .unwrap_or(false)
        };
        let carried: Vec<Relationship> = prior
            .relationships
            .iter()
            .filter(|r| {
                slice.concepts.contains_key(&r.source_concept_id)
                    && slice.concepts.contains_key(&r.target_concept_id)
                    && (touches_retired(&r.source_concept_id) || touches_retired(&r.target_concept_id))
            })
            .cloned()
            .collect();
        slice.relationships.extend(carried);
    }

    stats.relationships = slice.relationships.len();
    BuiltSlice {
        slice: GraphSlice::Vocabulary(slice),
        stats,
        dropped,
    }
}

/// Build a cross-map slice, keeping only edges whose endpoints are in the
/// graph about to be published.
pub fn build_crossmap_slice(
    run_id: RunId,
    source: &str,
    links: (Vocabulary, Vocabulary),
    crossmaps: Vec<CrossMap>,
    known: impl Fn(&ConceptId) -> bool,
) -> BuiltSlice {
    let (kept, dropped) = retain_resolvable(crossmaps, known);
    let slice = CrossMapSlice::new(source, run_id, links, kept);
    let stats = SliceStats {
        crossmaps: slice.crossmaps.len(),
        ..SliceStats::default()
    };
    BuiltSlice {
        slice: GraphSlice::CrossMap(slice),
        stats,
        dropped,
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writes slices into the graph and document stores.
#[derive(Clone)]
pub struct GraphCompiler {
    stores: Stores,
}

impl GraphCompiler {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Write a slice and its documents. On any failure the partial write is
    /// rolled back before the error is returned.
    pub fn write(&self, slice: &GraphSlice) -> Result<SliceRef, GraphWriteFailure> {
        let key = slice.key();
        let run_id = slice.run_id();
        let fail = |reason: String| GraphWriteFailure {
            slice: key.clone(),
            reason,
        };

        self.stores.graph.put_slice(slice).map_err(|e| {
            self.rollback(&key, run_id);
            fail(e.to_string())
        })?;

        let slice_ref = match slice {
            GraphSlice::Vocabulary(s) => {
                let documents: Vec<ConceptDocument> =
                    s.concepts.values().map(ConceptDocument::from_record).collect();
                self.stores
                    .documents
                    .put_documents(&s.vocabulary, run_id, &documents)
                    .map_err(|e| {
                        self.rollback(&key, run_id);
                        fail(e.to_string())
                    })?;
                SliceRef {
                    run_id,
                    content_digest: s.content_digest(),
                    payload_digest: s.payload_digest.clone(),
                    source_version: s.source_version.clone(),
                }
            }
            GraphSlice::CrossMap(s) => SliceRef {
                run_id,
                content_digest: s.content_digest(),
                payload_digest: None,
                source_version: None,
            },
        };
        info!(slice = %key, run_id = %run_id, "slice written");
        Ok(slice_ref)
    }

    /// Remove a slice written by `run_id`. Best effort; failures are logged.
    pub fn rollback(&self, key: &SliceKey, run_id: RunId) {
        if let Err(err) = self.stores.graph.discard_slice(key, run_id) {
            warn!(slice = %key, run_id = %run_id, error = %err, "rollback: failed to discard slice");
        }
        if let Some(vocabulary) = key.vocabulary() {
            if let Err(err) = self.stores.documents.discard(vocabulary, run_id) {
                warn!(slice = %key, run_id = %run_id, error = %err, "rollback: failed to discard documents");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{NormalizedRecord, PendingRelation};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use termgraph_model::{Concept, Lifecycle, MappingType, RelationType};
    use termgraph_storage::{DocumentStore, StoreError, StoreResult};

    fn hpo() -> Vocabulary {
        Vocabulary::new("HPO").unwrap()
    }

    fn term(code: &str, label: &str, parents: &[&str]) -> NormalizedRecord {
        NormalizedRecord {
            concept: Concept::new(hpo(), code, label),
            relations: parents
                .iter()
                .map(|p| PendingRelation {
                    target_code: p.to_string(),
                    relation_type: RelationType::IsA,
                })
                .collect(),
        }
    }

    fn id(code: &str) -> ConceptId {
        ConceptId::derive(&hpo(), code)
    }

    fn vocab_slice(built: &BuiltSlice) -> &VocabularySlice {
        match &built.slice {
            GraphSlice::Vocabulary(s) => s,
            GraphSlice::CrossMap(_) => panic!("expected a vocabulary slice"),
        }
    }

    #[test]
    fn dangling_relationships_are_quarantined() {
        let release = Release::from_records([
            term("HP:0000001", "All", &[]),
            term("HP:0000118", "Phenotypic abnormality", &["HP:0000001", "HP:9999999"]),
        ]);
        let built = build_vocabulary_slice(RunId::new(1), &hpo(), None, &release, ReleaseInfo::default());
        let slice = vocab_slice(&built);
        assert_eq!(slice.relationships.len(), 1);
        assert_eq!(built.dropped.count, 1);
        assert_eq!(built.dropped.samples[0].0, "HP:0000118");
        assert_eq!(built.stats.created, 2);
        assert_eq!(built.stats.relationships, 1);
    }

    #[test]
    fn unchanged_release_has_identical_digest() {
        let records = || {
            [
                term("HP:0000001", "All", &[]),
                term("HP:0000118", "Phenotypic abnormality", &["HP:0000001"]),
            ]
        };
        let first = build_vocabulary_slice(
            RunId::new(1),
            &hpo(),
            None,
            &Release::from_records(records()),
            ReleaseInfo::default(),
        );
        let prior = vocab_slice(&first).clone();
        let second = build_vocabulary_slice(
            RunId::new(2),
            &hpo(),
            Some(&prior),
            &Release::from_records(records()),
            ReleaseInfo::default(),
        );
        assert_eq!(first.slice.content_digest(), second.slice.content_digest());
        assert_eq!(second.stats.unchanged, 2);
        assert!(second.changed_concepts().is_empty());
    }

    #[test]
    fn retired_concepts_keep_their_relationships() {
        let first = build_vocabulary_slice(
            RunId::new(1),
            &hpo(),
            None,
            &Release::from_records([
                term("HP:0000001", "All", &[]),
                term("HP:0000118", "Phenotypic abnormality", &["HP:0000001"]),
                term("HP:0001250", "Seizure", &["HP:0000118"]),
            ]),
            ReleaseInfo::default(),
        );
        let prior = vocab_slice(&first).clone();
        let second = build_vocabulary_slice(
            RunId::new(2),
            &hpo(),
            Some(&prior),
            &Release::from_records([
                term("HP:0000001", "All", &[]),
                term("HP:0000118", "Phenotypic abnormality", &["HP:0000001"]),
            ]),
            ReleaseInfo::default(),
        );
        let slice = vocab_slice(&second);
        assert_eq!(second.stats.retired, 1);
        let seizure = &slice.concepts[&id("HP:0001250")];
        assert_eq!(
            seizure.lifecycle,
            Lifecycle::Retired {
                since: RunId::new(2)
            }
        );
        assert!(slice
            .relationships
            .iter()
            .any(|r| r.source_concept_id == id("HP:0001250") && r.target_concept_id == id("HP:0000118")));
        for r in &slice.relationships {
            assert!(slice.concepts.contains_key(&r.source_concept_id));
            assert!(slice.concepts.contains_key(&r.target_concept_id));
        }
    }

    #[test]
    fn crossmap_slice_drops_unknown_endpoints() {
        let a = id("HP:0000001");
        let missing = id("HP:0000002");
        let map = |t: &ConceptId| CrossMap {
            source_concept_id: a.clone(),
            target_concept_id: t.clone(),
            mapping_type: MappingType::ExactMatch,
            confidence: None,
            properties: BTreeMap::new(),
        };
        let built = build_crossmap_slice(
            RunId::new(1),
            "sssom",
            (hpo(), hpo()),
            vec![map(&a), map(&missing)],
            |x| *x == a,
        );
        assert_eq!(built.stats.crossmaps, 1);
        assert_eq!(built.dropped.count, 1);
    }

    struct FailingDocuments;

    impl DocumentStore for FailingDocuments {
        fn put_documents(&self, _: &Vocabulary, _: RunId, _: &[ConceptDocument]) -> StoreResult<()> {
            Err(StoreError::Rejected("disk full".into()))
        }

        fn documents(&self, _: &Vocabulary, _: RunId) -> StoreResult<Vec<ConceptDocument>> {
            Ok(Vec::new())
        }

        fn discard(&self, _: &Vocabulary, _: RunId) -> StoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_document_write_rolls_back_slice() {
        let mut stores = Stores::in_memory();
        stores.documents = Arc::new(FailingDocuments);
        let compiler = GraphCompiler::new(stores.clone());
        let built = build_vocabulary_slice(
            RunId::new(1),
            &hpo(),
            None,
            &Release::from_records([term("HP:0000001", "All", &[])]),
            ReleaseInfo::default(),
        );
        let err = compiler.write(&built.slice).unwrap_err();
        assert_eq!(err.slice, SliceKey::Vocabulary(hpo()));
        assert!(stores
            .graph
            .get_slice(&SliceKey::Vocabulary(hpo()), RunId::new(1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn write_produces_slice_ref_and_documents() {
        let stores = Stores::in_memory();
        let compiler = GraphCompiler::new(stores.clone());
        let built = build_vocabulary_slice(
            RunId::new(4),
            &hpo(),
            None,
            &Release::from_records([term("HP:0000001", "All", &[])]),
            ReleaseInfo {
                source_version: Some("2024-04-26".into()),
                payload_digest: Some("sha256:00".into()),
            },
        );
        let r = compiler.write(&built.slice).unwrap();
        assert_eq!(r.run_id, RunId::new(4));
        assert_eq!(r.source_version.as_deref(), Some("2024-04-26"));
        assert_eq!(stores.documents.documents(&hpo(), RunId::new(4)).unwrap().len(), 1);
        assert_eq!(
            stores.graph.slice_history(&SliceKey::Vocabulary(hpo())).unwrap(),
            vec![RunId::new(4)]
        );
    }
}
