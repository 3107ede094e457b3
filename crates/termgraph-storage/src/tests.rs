//! Behavioural tests run against both backends.

use super::*;
use tempfile::tempdir;
use termgraph_model::{
    Concept, ConceptRecord, CrossMapSlice, Lifecycle, RunStatus, VocabularySlice,
};

fn vocab(name: &str) -> Vocabulary {
    Vocabulary::new(name).unwrap()
}

fn slice_with(v: &Vocabulary, run: RunId, codes: &[(&str, &str)]) -> VocabularySlice {
    let mut slice = VocabularySlice::new(v.clone(), run);
    for (code, term) in codes {
        let record = ConceptRecord {
            concept: Concept::new(v.clone(), code, term),
            lifecycle: Lifecycle::Active,
            revision_run: run,
        };
        slice.concepts.insert(record.concept.concept_id.clone(), record);
    }
    slice
}

fn slice_ref(slice: &VocabularySlice) -> SliceRef {
    SliceRef {
        run_id: slice.run_id,
        content_digest: slice.content_digest(),
        payload_digest: None,
        source_version: None,
    }
}

fn backends() -> Vec<(Stores, Option<tempfile::TempDir>)> {
    let dir = tempdir().unwrap();
    let file = Stores::open_dir(dir.path()).unwrap();
    vec![(Stores::in_memory(), None), (file, Some(dir))]
}

#[test]
fn test_unpublished_slices_are_invisible() {
    for (stores, _dir) in backends() {
        let hgnc = vocab("HGNC");
        let run1 = stores.cache.allocate_run_id().unwrap();
        let s1 = slice_with(&hgnc, run1, &[("HGNC:1100", "BRCA1")]);
        stores.graph.put_slice(&GraphSlice::Vocabulary(s1.clone())).unwrap();

        assert!(stores.snapshot().unwrap().is_none(), "nothing published yet");

        stores
            .cache
            .publish(run1, BTreeMap::from([(SliceKey::Vocabulary(hgnc.clone()), slice_ref(&s1))]))
            .unwrap();

        // A second run writes but never publishes.
        let run2 = stores.cache.allocate_run_id().unwrap();
        assert!(run2 > run1);
        let s2 = slice_with(&hgnc, run2, &[("HGNC:1100", "BRCA1-renamed")]);
        stores.graph.put_slice(&GraphSlice::Vocabulary(s2)).unwrap();

        let snap = stores.snapshot().unwrap().unwrap();
        let c = snap.concept_by_code(&hgnc, "HGNC:1100").unwrap();
        assert_eq!(c.concept.preferred_term, "BRCA1");

        stores
            .graph
            .discard_slice(&SliceKey::Vocabulary(hgnc.clone()), run2)
            .unwrap();
        assert_eq!(
            stores.graph.slice_history(&SliceKey::Vocabulary(hgnc)).unwrap(),
            vec![run1]
        );
    }
}

#[test]
fn test_slice_is_written_once_per_run() {
    for (stores, _dir) in backends() {
        let hpo = vocab("HPO");
        let s = GraphSlice::Vocabulary(slice_with(&hpo, RunId::new(1), &[("HP:1", "All")]));
        stores.graph.put_slice(&s).unwrap();
        assert!(matches!(
            stores.graph.put_slice(&s),
            Err(StoreError::Rejected(_))
        ));
    }
}

#[test]
fn test_publish_merges_with_latest_manifest() {
    for (stores, _dir) in backends() {
        let hgnc = vocab("HGNC");
        let hpo = vocab("HPO");
        let a = slice_with(&hgnc, RunId::new(1), &[("HGNC:5", "A1BG")]);
        let b = slice_with(&hpo, RunId::new(2), &[("HP:1", "All")]);
        stores.graph.put_slice(&GraphSlice::Vocabulary(a.clone())).unwrap();
        stores.graph.put_slice(&GraphSlice::Vocabulary(b.clone())).unwrap();

        stores
            .cache
            .publish(RunId::new(1), BTreeMap::from([(SliceKey::Vocabulary(hgnc.clone()), slice_ref(&a))]))
            .unwrap();
        let m = stores
            .cache
            .publish(RunId::new(2), BTreeMap::from([(SliceKey::Vocabulary(hpo.clone()), slice_ref(&b))]))
            .unwrap();
        assert_eq!(m.vocabularies().count(), 2);

        let snap = stores.snapshot().unwrap().unwrap();
        assert!(snap.concept_by_code(&hgnc, "HGNC:5").is_some());
        assert!(snap.concept_by_code(&hpo, "HP:1").is_some());
    }
}

#[test]
fn test_locks_are_exclusive_per_slice() {
    for (stores, _dir) in backends() {
        let key = SliceKey::Vocabulary(vocab("HGNC"));
        let other = SliceKey::Vocabulary(vocab("HPO"));
        stores.cache.try_lock(&key, RunId::new(1)).unwrap();
        stores.cache.try_lock(&key, RunId::new(1)).unwrap();
        match stores.cache.try_lock(&key, RunId::new(2)) {
            Err(StoreError::Locked { held_by, .. }) => assert_eq!(held_by, RunId::new(1)),
            other => panic!("expected Locked, got {other:?}"),
        }
        stores.cache.try_lock(&other, RunId::new(2)).unwrap();
        assert_eq!(stores.cache.locks().unwrap().len(), 2);

        // Only the holder can release.
        stores.cache.unlock(&key, RunId::new(2)).unwrap();
        assert!(stores.cache.try_lock(&key, RunId::new(2)).is_err());
        stores.cache.unlock(&key, RunId::new(1)).unwrap();
        stores.cache.try_lock(&key, RunId::new(2)).unwrap();
    }
}

#[test]
fn test_vectors_keyed_by_model_version() {
    for (stores, _dir) in backends() {
        let id = ConceptId::derive(&vocab("HGNC"), "HGNC:1100");
        let v = |model: &str, x: f32| EmbeddingVector {
            concept_id: id.clone(),
            model_version: model.to_string(),
            vector: vec![x, 0.0],
        };
        stores.vectors.upsert(&[v("hash-v1", 1.0), v("hash-v2", 2.0)]).unwrap();
        stores.vectors.upsert(&[v("hash-v2", 3.0)]).unwrap();

        assert_eq!(stores.vectors.model_versions().unwrap(), vec!["hash-v1", "hash-v2"]);
        assert_eq!(stores.vectors.get(&id, "hash-v2").unwrap().unwrap().vector[0], 3.0);
        assert_eq!(stores.vectors.purge_model("hash-v1").unwrap(), 1);
        assert!(stores.vectors.get(&id, "hash-v1").unwrap().is_none());
        assert_eq!(stores.vectors.vectors("hash-v2").unwrap().len(), 1);
    }
}

#[test]
fn test_documents_and_run_log_roundtrip() {
    for (stores, _dir) in backends() {
        let hgnc = vocab("HGNC");
        let slice = slice_with(&hgnc, RunId::new(3), &[("HGNC:1100", "BRCA1")]);
        let docs: Vec<ConceptDocument> = slice.concepts.values().map(ConceptDocument::from_record).collect();
        stores.documents.put_documents(&hgnc, RunId::new(3), &docs).unwrap();
        assert_eq!(stores.documents.documents(&hgnc, RunId::new(3)).unwrap(), docs);
        stores.documents.discard(&hgnc, RunId::new(3)).unwrap();
        assert!(stores.documents.documents(&hgnc, RunId::new(3)).unwrap().is_empty());

        let mut run = CompilationRun::new(RunId::new(3));
        run.advance(RunStatus::Fetching).unwrap();
        stores.runs.save_run(&run).unwrap();
        let mut summary = RunSummary::new(RunId::new(3));
        summary.failed.insert(SliceKey::Vocabulary(hgnc.clone()), "boom".into());
        stores.runs.save_summary(&summary).unwrap();

        assert_eq!(stores.runs.load_run(RunId::new(3)).unwrap().unwrap().status, RunStatus::Fetching);
        assert_eq!(
            stores.runs.load_summary(RunId::new(3)).unwrap().unwrap().failed_vocabularies(),
            [hgnc].into_iter().collect()
        );
        assert_eq!(stores.runs.list_runs().unwrap().len(), 1);
    }
}

#[test]
fn test_crossmap_slices_appear_in_snapshot() {
    let stores = Stores::in_memory();
    let hgnc = vocab("HGNC");
    let hpo = vocab("HPO");
    let genes = slice_with(&hgnc, RunId::new(1), &[("HGNC:1100", "BRCA1")]);
    let xmap = CrossMapSlice::new("gene_hpo", RunId::new(1), (hgnc.clone(), hpo), []);
    stores.graph.put_slice(&GraphSlice::Vocabulary(genes.clone())).unwrap();
    stores.graph.put_slice(&GraphSlice::CrossMap(xmap.clone())).unwrap();
    stores
        .cache
        .publish(
            RunId::new(1),
            BTreeMap::from([
                (SliceKey::Vocabulary(hgnc), slice_ref(&genes)),
                (
                    SliceKey::CrossMap("gene_hpo".into()),
                    SliceRef {
                        run_id: RunId::new(1),
                        content_digest: xmap.content_digest(),
                        payload_digest: None,
                        source_version: None,
                    },
                ),
            ]),
        )
        .unwrap();
    let snap = stores.snapshot().unwrap().unwrap();
    assert!(snap.crossmaps.contains_key("gene_hpo"));
    assert_eq!(snap.slice_keys().count(), 2);
}
