//! In-memory store implementations (tests, dry runs).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use termgraph_model::{
    CompilationRun, ConceptId, EmbeddingVector, GraphManifest, GraphSlice, RunId, RunSummary,
    SliceKey, SliceRef, Vocabulary,
};

use crate::{
    ConceptDocument, CoordinationCache, DocumentStore, GraphStore, RunLog, StoreError,
    StoreResult, VectorStore,
};

#[derive(Default)]
pub struct MemoryGraphStore {
    slices: RwLock<BTreeMap<(SliceKey, RunId), GraphSlice>>,
}

impl GraphStore for MemoryGraphStore {
    fn put_slice(&self, slice: &GraphSlice) -> StoreResult<()> {
        let key = (slice.key(), slice.run_id());
        let mut slices = self.slices.write();
        if slices.contains_key(&key) {
            return Err(StoreError::Rejected(format!(
                "{} already written for {}",
                key.0, key.1
            )));
        }
        slices.insert(key, slice.clone());
        Ok(())
    }

    fn get_slice(&self, key: &SliceKey, run_id: RunId) -> StoreResult<Option<GraphSlice>> {
        Ok(self.slices.read().get(&(key.clone(), run_id)).cloned())
    }

    fn discard_slice(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()> {
        self.slices.write().remove(&(key.clone(), run_id));
        Ok(())
    }

    fn slice_history(&self, key: &SliceKey) -> StoreResult<Vec<RunId>> {
        Ok(self
            .slices
            .read()
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, run)| *run)
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: RwLock<HashMap<(Vocabulary, RunId), Vec<ConceptDocument>>>,
}

impl DocumentStore for MemoryDocumentStore {
    fn put_documents(
        &self,
        vocabulary: &Vocabulary,
        run_id: RunId,
        documents: &[ConceptDocument],
    ) -> StoreResult<()> {
        self.docs
            .write()
            .insert((vocabulary.clone(), run_id), documents.to_vec());
        Ok(())
    }

    fn documents(&self, vocabulary: &Vocabulary, run_id: RunId) -> StoreResult<Vec<ConceptDocument>> {
        Ok(self
            .docs
            .read()
            .get(&(vocabulary.clone(), run_id))
            .cloned()
            .unwrap_or_default())
    }

    fn discard(&self, vocabulary: &Vocabulary, run_id: RunId) -> StoreResult<()> {
        self.docs.write().remove(&(vocabulary.clone(), run_id));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryVectorStore {
    /// model_version -> concept_id -> vector
    models: RwLock<BTreeMap<String, BTreeMap<ConceptId, Vec<f32>>>>,
}

impl VectorStore for MemoryVectorStore {
    fn upsert(&self, vectors: &[EmbeddingVector]) -> StoreResult<usize> {
        let mut models = self.models.write();
        for v in vectors {
            models
                .entry(v.model_version.clone())
                .or_default()
                .insert(v.concept_id.clone(), v.vector.clone());
        }
        Ok(vectors.len())
    }

    fn get(&self, concept_id: &ConceptId, model_version: &str) -> StoreResult<Option<EmbeddingVector>> {
        Ok(self
            .models
            .read()
            .get(model_version)
            .and_then(|m| m.get(concept_id))
            .map(|vector| EmbeddingVector {
                concept_id: concept_id.clone(),
                model_version: model_version.to_string(),
                vector: vector.clone(),
            }))
    }

    fn vectors(&self, model_version: &str) -> StoreResult<Vec<EmbeddingVector>> {
        Ok(self
            .models
            .read()
            .get(model_version)
            .map(|m| {
                m.iter()
                    .map(|(id, vector)| EmbeddingVector {
                        concept_id: id.clone(),
                        model_version: model_version.to_string(),
                        vector: vector.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn model_versions(&self) -> StoreResult<Vec<String>> {
        Ok(self.models.read().keys().cloned().collect())
    }

    fn purge_model(&self, model_version: &str) -> StoreResult<usize> {
        Ok(self
            .models
            .write()
            .remove(model_version)
            .map(|m| m.len())
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryCoordinationCache {
    next_run: Mutex<u64>,
    current: Mutex<Option<GraphManifest>>,
    locks: DashMap<SliceKey, RunId>,
}

impl CoordinationCache for MemoryCoordinationCache {
    fn allocate_run_id(&self) -> StoreResult<RunId> {
        let mut next = self.next_run.lock();
        *next += 1;
        Ok(RunId::new(*next))
    }

    fn current(&self) -> StoreResult<Option<GraphManifest>> {
        Ok(self.current.lock().clone())
    }

    fn publish(
        &self,
        run_id: RunId,
        updates: BTreeMap<SliceKey, SliceRef>,
    ) -> StoreResult<GraphManifest> {
        let mut current = self.current.lock();
        let next = match current.as_ref() {
            Some(m) => m.successor(run_id, updates),
            None => GraphManifest::empty(run_id).successor(run_id, updates),
        };
        *current = Some(next.clone());
        Ok(next)
    }

    fn try_lock(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()> {
        match self.locks.entry(key.clone()) {
            Entry::Occupied(e) if *e.get() != run_id => Err(StoreError::Locked {
                key: key.clone(),
                held_by: *e.get(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(run_id);
                Ok(())
            }
        }
    }

    fn unlock(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()> {
        self.locks.remove_if(key, |_, held| *held == run_id);
        Ok(())
    }

    fn locks(&self) -> StoreResult<BTreeMap<SliceKey, RunId>> {
        Ok(self
            .locks
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryRunLog {
    runs: RwLock<BTreeMap<RunId, CompilationRun>>,
    summaries: RwLock<BTreeMap<RunId, RunSummary>>,
}

impl RunLog for MemoryRunLog {
    fn save_run(&self, run: &CompilationRun) -> StoreResult<()> {
        self.runs.write().insert(run.run_id, run.clone());
        Ok(())
    }

    fn load_run(&self, run_id: RunId) -> StoreResult<Option<CompilationRun>> {
        Ok(self.runs.read().get(&run_id).cloned())
    }

    fn save_summary(&self, summary: &RunSummary) -> StoreResult<()> {
        self.summaries.write().insert(summary.run_id, summary.clone());
        Ok(())
    }

    fn load_summary(&self, run_id: RunId) -> StoreResult<Option<RunSummary>> {
        Ok(self.summaries.read().get(&run_id).cloned())
    }

    fn list_runs(&self) -> StoreResult<Vec<CompilationRun>> {
        Ok(self.runs.read().values().cloned().collect())
    }
}
