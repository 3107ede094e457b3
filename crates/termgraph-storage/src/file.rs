//! File-backed store implementations.
//!
//! Layout under the data directory:
//!
//! ```text
//! graph/<slice>/<run>.cbor        compiled slices (CBOR)
//! documents/<vocab>/<run>.cbor    concept documents (CBOR)
//! vectors/<model>.cbor            embedding vectors per model version (CBOR)
//! cache/current.json              current-run pointer (GraphManifest)
//! cache/run_seq                   last allocated run id
//! cache/locks/<slice>.lock        per-slice run locks
//! runs/<run>.run.json             CompilationRun
//! runs/<run>.summary.json         RunSummary
//! ```
//!
//! Every file is replaced with write-to-temp + rename, so readers never see a
//! half-written manifest or slice.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termgraph_model::{
    CompilationRun, ConceptId, EmbeddingVector, GraphManifest, GraphSlice, RunId, RunSummary,
    SliceKey, SliceRef, Vocabulary,
};

use crate::{
    ConceptDocument, CoordinationCache, DocumentStore, GraphStore, RunLog, StoreError,
    StoreResult, VectorStore,
};

// ============================================================================
// Helpers
// ============================================================================

fn sanitize_path_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "_".to_string()
    } else {
        out
    }
}

fn ensure_dir(dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

/// Replace `path` atomically.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    let write = || -> std::io::Result<()> {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::io(path, e)
    })
}

fn read_optional(path: &Path) -> StoreResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn write_cbor<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StoreError::codec(path.display().to_string(), e))?;
    write_atomic(path, &bytes)
}

fn read_cbor<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match read_optional(path)? {
        Some(bytes) => ciborium::from_reader(bytes.as_slice())
            .map(Some)
            .map_err(|e| StoreError::codec(path.display().to_string(), e)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::codec(path.display().to_string(), e))?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    match read_optional(path)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::codec(path.display().to_string(), e)),
        None => Ok(None),
    }
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Run ids of `<run>.<ext>` files in a directory, ascending.
fn runs_in_dir(dir: &Path, suffix: &str) -> StoreResult<Vec<RunId>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(suffix)) else {
            continue;
        };
        if let Ok(run) = stem.parse::<RunId>() {
            out.push(run);
        }
    }
    out.sort();
    Ok(out)
}

/// Exclusive lock file, removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    const ATTEMPTS: u32 = 500;
    const WAIT: Duration = Duration::from_millis(10);

    fn acquire(path: PathBuf) -> StoreResult<Self> {
        for _ in 0..Self::ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => std::thread::sleep(Self::WAIT),
                Err(e) => return Err(StoreError::Unavailable(format!("{}: {e}", path.display()))),
            }
        }
        Err(StoreError::Unavailable(format!(
            "timed out waiting for {}",
            path.display()
        )))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ============================================================================
// Graph store
// ============================================================================

pub struct FileGraphStore {
    root: PathBuf,
}

impl FileGraphStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    fn slice_dir(&self, key: &SliceKey) -> PathBuf {
        self.root.join(sanitize_path_component(&key.to_string()))
    }

    fn slice_path(&self, key: &SliceKey, run_id: RunId) -> PathBuf {
        self.slice_dir(key).join(format!("{run_id}.cbor"))
    }
}

impl GraphStore for FileGraphStore {
    fn put_slice(&self, slice: &GraphSlice) -> StoreResult<()> {
        let path = self.slice_path(&slice.key(), slice.run_id());
        if path.exists() {
            return Err(StoreError::Rejected(format!(
                "{} already written for {}",
                slice.key(),
                slice.run_id()
            )));
        }
        write_cbor(&path, slice)
    }

    fn get_slice(&self, key: &SliceKey, run_id: RunId) -> StoreResult<Option<GraphSlice>> {
        read_cbor(&self.slice_path(key, run_id))
    }

    fn discard_slice(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()> {
        remove_if_exists(&self.slice_path(key, run_id))
    }

    fn slice_history(&self, key: &SliceKey) -> StoreResult<Vec<RunId>> {
        runs_in_dir(&self.slice_dir(key), ".cbor")
    }
}

// ============================================================================
// Document store
// ============================================================================

pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    fn path(&self, vocabulary: &Vocabulary, run_id: RunId) -> PathBuf {
        self.root
            .join(sanitize_path_component(vocabulary.as_str()))
            .join(format!("{run_id}.cbor"))
    }
}

impl DocumentStore for FileDocumentStore {
    fn put_documents(
        &self,
        vocabulary: &Vocabulary,
        run_id: RunId,
        documents: &[ConceptDocument],
    ) -> StoreResult<()> {
        write_cbor(&self.path(vocabulary, run_id), &documents)
    }

    fn documents(&self, vocabulary: &Vocabulary, run_id: RunId) -> StoreResult<Vec<ConceptDocument>> {
        Ok(read_cbor(&self.path(vocabulary, run_id))?.unwrap_or_default())
    }

    fn discard(&self, vocabulary: &Vocabulary, run_id: RunId) -> StoreResult<()> {
        remove_if_exists(&self.path(vocabulary, run_id))
    }
}

// ============================================================================
// Vector store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct VectorFile {
    model_version: String,
    vectors: BTreeMap<ConceptId, Vec<f32>>,
}

pub struct FileVectorStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileVectorStore {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, model_version: &str) -> PathBuf {
        self.root
            .join(format!("{}.cbor", sanitize_path_component(model_version)))
    }

    fn load(&self, model_version: &str) -> StoreResult<VectorFile> {
        Ok(read_cbor(&self.path(model_version))?.unwrap_or_else(|| VectorFile {
            model_version: model_version.to_string(),
            vectors: BTreeMap::new(),
        }))
    }
}

impl VectorStore for FileVectorStore {
    fn upsert(&self, vectors: &[EmbeddingVector]) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        let mut by_model: BTreeMap<&str, Vec<&EmbeddingVector>> = BTreeMap::new();
        for v in vectors {
            by_model.entry(v.model_version.as_str()).or_default().push(v);
        }
        for (model, batch) in by_model {
            let mut file = self.load(model)?;
            for v in batch {
                file.vectors.insert(v.concept_id.clone(), v.vector.clone());
            }
            write_cbor(&self.path(model), &file)?;
        }
        Ok(vectors.len())
    }

    fn get(&self, concept_id: &ConceptId, model_version: &str) -> StoreResult<Option<EmbeddingVector>> {
        let file = self.load(model_version)?;
        Ok(file.vectors.get(concept_id).map(|vector| EmbeddingVector {
            concept_id: concept_id.clone(),
            model_version: model_version.to_string(),
            vector: vector.clone(),
        }))
    }

    fn vectors(&self, model_version: &str) -> StoreResult<Vec<EmbeddingVector>> {
        let file = self.load(model_version)?;
        Ok(file
            .vectors
            .into_iter()
            .map(|(concept_id, vector)| EmbeddingVector {
                concept_id,
                model_version: model_version.to_string(),
                vector,
            })
            .collect())
    }

    fn model_versions(&self) -> StoreResult<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cbor") {
                continue;
            }
            if let Some(file) = read_cbor::<VectorFile>(&path)? {
                out.push(file.model_version);
            }
        }
        out.sort();
        Ok(out)
    }

    fn purge_model(&self, model_version: &str) -> StoreResult<usize> {
        let _guard = self.write_lock.lock();
        let removed = self.load(model_version)?.vectors.len();
        remove_if_exists(&self.path(model_version))?;
        Ok(removed)
    }
}

// ============================================================================
// Coordination cache
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    key: SliceKey,
    run_id: RunId,
}

pub struct FileCoordinationCache {
    root: PathBuf,
}

impl FileCoordinationCache {
    const CURRENT_FILE: &'static str = "current.json";
    const RUN_SEQ_FILE: &'static str = "run_seq";
    const MUTEX_FILE: &'static str = ".cache.lock";

    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        ensure_dir(&root.join("locks"))?;
        Ok(Self { root })
    }

    fn mutex(&self) -> StoreResult<LockFile> {
        LockFile::acquire(self.root.join(Self::MUTEX_FILE))
    }

    fn lock_path(&self, key: &SliceKey) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}.lock", sanitize_path_component(&key.to_string())))
    }

    fn read_current(&self) -> StoreResult<Option<GraphManifest>> {
        read_json(&self.root.join(Self::CURRENT_FILE))
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl CoordinationCache for FileCoordinationCache {
    fn allocate_run_id(&self) -> StoreResult<RunId> {
        let _guard = self.mutex()?;
        let path = self.root.join(Self::RUN_SEQ_FILE);
        let last = match read_optional(&path)? {
            Some(bytes) => String::from_utf8_lossy(&bytes)
                .trim()
                .parse::<u64>()
                .map_err(|e| StoreError::codec(path.display().to_string(), e))?,
            None => 0,
        };
        let next = RunId::new(last + 1);
        write_atomic(&path, format!("{}\n", next.seq()).as_bytes())?;
        Ok(next)
    }

    fn current(&self) -> StoreResult<Option<GraphManifest>> {
        self.read_current()
    }

    fn publish(
        &self,
        run_id: RunId,
        updates: BTreeMap<SliceKey, SliceRef>,
    ) -> StoreResult<GraphManifest> {
        let _guard = self.mutex()?;
        let next = match self.read_current()? {
            Some(m) => m.successor(run_id, updates),
            None => GraphManifest::empty(run_id).successor(run_id, updates),
        };
        write_json(&self.root.join(Self::CURRENT_FILE), &next)?;
        tracing::info!(run_id = %run_id, slices = next.slices.len(), "published current-run pointer");
        Ok(next)
    }

    fn try_lock(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()> {
        let _guard = self.mutex()?;
        let path = self.lock_path(key);
        if let Some(held) = read_json::<LockRecord>(&path)? {
            if held.run_id == run_id {
                return Ok(());
            }
            return Err(StoreError::Locked {
                key: key.clone(),
                held_by: held.run_id,
            });
        }
        write_json(
            &path,
            &LockRecord {
                key: key.clone(),
                run_id,
            },
        )
    }

    fn unlock(&self, key: &SliceKey, run_id: RunId) -> StoreResult<()> {
        let _guard = self.mutex()?;
        let path = self.lock_path(key);
        match read_json::<LockRecord>(&path)? {
            Some(held) if held.run_id == run_id => remove_if_exists(&path),
            _ => Ok(()),
        }
    }

    fn locks(&self) -> StoreResult<BTreeMap<SliceKey, RunId>> {
        let dir = self.root.join("locks");
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut out = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            if let Some(held) = read_json::<LockRecord>(&path)? {
                out.insert(held.key, held.run_id);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Run log
// ============================================================================

pub struct FileRunLog {
    root: PathBuf,
}

impl FileRunLog {
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        Ok(Self { root })
    }

    fn run_path(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("{run_id}.run.json"))
    }

    fn summary_path(&self, run_id: RunId) -> PathBuf {
        self.root.join(format!("{run_id}.summary.json"))
    }
}

impl RunLog for FileRunLog {
    fn save_run(&self, run: &CompilationRun) -> StoreResult<()> {
        write_json(&self.run_path(run.run_id), run)
    }

    fn load_run(&self, run_id: RunId) -> StoreResult<Option<CompilationRun>> {
        read_json(&self.run_path(run_id))
    }

    fn save_summary(&self, summary: &RunSummary) -> StoreResult<()> {
        write_json(&self.summary_path(summary.run_id), summary)
    }

    fn load_summary(&self, run_id: RunId) -> StoreResult<Option<RunSummary>> {
        read_json(&self.summary_path(run_id))
    }

    fn list_runs(&self) -> StoreResult<Vec<CompilationRun>> {
        let mut out = Vec::new();
        for run_id in runs_in_dir(&self.root, ".run.json")? {
            if let Some(run) = self.load_run(run_id)? {
                out.push(run);
            }
        }
        Ok(out)
    }
}
