//! Compilation coordinator.
//!
//! Drives one [`CompilationRun`] through its stages:
//!
//! ```text
//!  Pending ─► Fetching ─► Normalizing ─► Linking ─► Compiling ─► Embedding ─► Committed
//!     │          │            │             │           │            │
//!     └──────────┴────────────┴─────────────┴───────────┴────────────┴──► Failed
//!                                                       └────────────┴──► PartiallyCommitted
//! ```
//!
//! Vocabularies are fetched and normalized concurrently (bounded by
//! `workers`). Each cross-map source waits on a barrier until every
//! vocabulary it links has finished normalizing. Slices are then written one
//! by one, and a single manifest publish makes all of them visible at once.
//! The status is the most advanced stage any worker has reached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use termgraph_model::{
    CompilationRun, ConceptId, EmbeddingOutcome, GraphManifest, GraphSlice, RecordIssues, RunId,
    RunStatus, RunSummary, SliceKey, SliceRef, Vocabulary,
};
use termgraph_source::{Payload, SourceAdapter, SourceError};
use termgraph_storage::{GraphSnapshot, StoreError, Stores};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::compiler::{build_crossmap_slice, build_vocabulary_slice, BuiltSlice, GraphCompiler, ReleaseInfo};
use crate::error::{CompileError, GraphWriteFailure};
use crate::events::{RunEvent, RunEventHandler};
use crate::identity::{IdentityResolver, Release};
use crate::linker::{CrossMapSchema, LinkOutcome, Linker};
use crate::normalize::Normalizer;
use crate::schema::VocabularySchema;

// ============================================================================
// Requests
// ============================================================================

#[derive(Clone)]
pub struct VocabularyJob {
    pub adapter: Arc<dyn SourceAdapter>,
    pub schema: VocabularySchema,
}

#[derive(Clone)]
pub struct CrossMapJob {
    pub adapter: Arc<dyn SourceAdapter>,
    pub schema: CrossMapSchema,
}

/// What one run compiles.
#[derive(Clone, Default)]
pub struct CompileRequest {
    pub vocabularies: Vec<VocabularyJob>,
    pub crossmaps: Vec<CrossMapJob>,
}

impl CompileRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vocabulary(mut self, adapter: Arc<dyn SourceAdapter>, schema: VocabularySchema) -> Self {
        self.vocabularies.push(VocabularyJob { adapter, schema });
        self
    }

    pub fn crossmap(mut self, adapter: Arc<dyn SourceAdapter>, schema: CrossMapSchema) -> Self {
        self.crossmaps.push(CrossMapJob { adapter, schema });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.vocabularies.is_empty() && self.crossmaps.is_empty()
    }

    pub fn keys(&self) -> Vec<SliceKey> {
        self.vocabularies
            .iter()
            .map(|j| SliceKey::Vocabulary(j.schema.vocabulary.clone()))
            .chain(
                self.crossmaps
                    .iter()
                    .map(|j| SliceKey::CrossMap(j.schema.name.clone())),
            )
            .collect()
    }

    /// Keep the jobs a resumed run must redo: failed slices, plus cross-maps
    /// that link a failed vocabulary.
    pub fn retain_failed(mut self, failed: &BTreeSet<SliceKey>) -> Self {
        let vocabularies: BTreeSet<&Vocabulary> = failed.iter().filter_map(SliceKey::vocabulary).collect();
        self.vocabularies
            .retain(|j| vocabularies.contains(&j.schema.vocabulary));
        self.crossmaps.retain(|j| {
            failed.contains(&SliceKey::CrossMap(j.schema.name.clone()))
                || j.schema.dependencies().iter().any(|v| vocabularies.contains(v))
        });
        self
    }

    fn without(mut self, skipped: &BTreeSet<SliceKey>) -> Self {
        self.vocabularies
            .retain(|j| !skipped.contains(&SliceKey::Vocabulary(j.schema.vocabulary.clone())));
        self.crossmaps
            .retain(|j| !skipped.contains(&SliceKey::CrossMap(j.schema.name.clone())));
        self
    }

    fn validate(&self) -> Result<(), CompileError> {
        if self.is_empty() {
            return Err(CompileError::EmptyRequest);
        }
        for job in &self.vocabularies {
            job.schema.validate()?;
        }
        let mut seen = BTreeSet::new();
        for key in self.keys() {
            if !seen.insert(key.clone()) {
                return Err(CompileError::DuplicateJob(key));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Vocabularies / cross-map sources processed concurrently.
    pub workers: usize,
    /// Times a record stream is reopened after a transient read error.
    pub parse_restarts: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            parse_restarts: 2,
        }
    }
}

/// Post-commit embedding hook. Its outcome never changes the commit status.
#[async_trait]
pub trait EmbeddingStage: Send + Sync {
    async fn embed(
        &self,
        snapshot: &GraphSnapshot,
        changed: &BTreeSet<ConceptId>,
    ) -> Result<EmbeddingOutcome, Box<dyn std::error::Error + Send + Sync>>;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cloneable handle that aborts a running compilation.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Worker results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed,
}

enum Progress {
    Fetched {
        vocabulary: Vocabulary,
        version: String,
        bytes: usize,
    },
    Linking {
        source: String,
    },
}

struct NormalizedVocabulary {
    release: Release,
    quarantined: RecordIssues,
    info: ReleaseInfo,
    version: String,
}

enum TaskOutcome {
    Vocabulary {
        vocabulary: Vocabulary,
        result: Result<NormalizedVocabulary, String>,
    },
    CrossMap {
        source: String,
        links: (Vocabulary, Vocabulary),
        result: Result<LinkOutcome, String>,
    },
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct Coordinator {
    stores: Stores,
    config: CoordinatorConfig,
    compiler: GraphCompiler,
    embedding: Option<Arc<dyn EmbeddingStage>>,
    handlers: Vec<RunEventHandler>,
}

impl Coordinator {
    pub fn new(stores: Stores, config: CoordinatorConfig) -> Self {
        Self {
            compiler: GraphCompiler::new(stores.clone()),
            stores,
            config,
            embedding: None,
            handlers: Vec::new(),
        }
    }

    pub fn with_embedding(mut self, stage: Arc<dyn EmbeddingStage>) -> Self {
        self.embedding = Some(stage);
        self
    }

    pub fn on_event(&mut self, handler: RunEventHandler) {
        self.handlers.push(handler);
    }

    fn emit(&self, event: RunEvent) {
        for handler in &self.handlers {
            handler(event.clone());
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn compile(&self, request: CompileRequest) -> Result<RunSummary, CompileError> {
        self.execute(request, None, CancelHandle::new()).await
    }

    pub async fn compile_with(
        &self,
        request: CompileRequest,
        cancel: CancelHandle,
    ) -> Result<RunSummary, CompileError> {
        self.execute(request, None, cancel).await
    }

    /// Start a new run over the slices that failed in `run_id`. Slices that
    /// committed there are reused through the current manifest.
    pub async fn resume(
        &self,
        run_id: RunId,
        request: CompileRequest,
        cancel: CancelHandle,
    ) -> Result<RunSummary, CompileError> {
        let previous = self
            .stores
            .runs
            .load_run(run_id)?
            .ok_or(CompileError::UnknownRun(run_id))?;
        if !matches!(previous.status, RunStatus::Failed | RunStatus::PartiallyCommitted) {
            return Err(CompileError::NotResumable {
                run_id,
                status: previous.status,
            });
        }
        let mut failed: BTreeSet<SliceKey> = previous
            .failed_vocabularies
            .iter()
            .cloned()
            .map(SliceKey::Vocabulary)
            .collect();
        if let Some(summary) = self.stores.runs.load_summary(run_id)? {
            failed.extend(summary.failed.into_keys());
        }
        let request = request.retain_failed(&failed);
        info!(resumed_from = %run_id, slices = request.keys().len(), "resuming failed slices");
        self.execute(request, Some(run_id), cancel).await
    }

    async fn execute(
        &self,
        request: CompileRequest,
        resumed_from: Option<RunId>,
        cancel: CancelHandle,
    ) -> Result<RunSummary, CompileError> {
        request.validate()?;
        let run_id = self.stores.cache.allocate_run_id()?;
        let mut run = CompilationRun::new(run_id);
        run.resumed_from = resumed_from;
        let keys = request.keys();
        let vocabularies: BTreeSet<Vocabulary> = keys.iter().filter_map(|k| k.vocabulary().cloned()).collect();

        // A slice held by another run fails on its own; only an unreachable
        // cache aborts the run.
        let mut held = Vec::new();
        let mut skipped: Vec<(SliceKey, String)> = Vec::new();
        let mut locked: BTreeSet<Vocabulary> = BTreeSet::new();
        for key in &keys {
            match self.stores.cache.try_lock(key, run_id) {
                Ok(()) => held.push(key.clone()),
                Err(err @ StoreError::Locked { .. }) => {
                    warn!(run_id = %run_id, slice = %key, error = %err, "slice held by another run");
                    if let Some(vocabulary) = key.vocabulary() {
                        locked.insert(vocabulary.clone());
                    }
                    skipped.push((key.clone(), err.to_string()));
                }
                Err(err) => {
                    self.release(&held, run_id);
                    warn!(run_id = %run_id, slice = %key, error = %err, "cannot claim slice");
                    run.failed_vocabularies = vocabularies;
                    let _ = run.advance(RunStatus::Failed);
                    self.persist(&run);
                    return Err(err.into());
                }
            }
        }
        for job in &request.crossmaps {
            let key = SliceKey::CrossMap(job.schema.name.clone());
            if !held.contains(&key) {
                continue;
            }
            if let Some(dep) = job.schema.dependencies().into_iter().find(|v| locked.contains(v)) {
                self.release(std::slice::from_ref(&key), run_id);
                held.retain(|k| k != &key);
                skipped.push((key, format!("links {dep}, which is locked by another run")));
            }
        }
        let skipped_keys: BTreeSet<SliceKey> = skipped.iter().map(|(k, _)| k.clone()).collect();
        let request = request.without(&skipped_keys);

        info!(run_id = %run_id, slices = keys.len(), "compilation run started");
        self.persist(&run);
        self.emit(RunEvent::RunStarted {
            run_id,
            slices: keys.clone(),
        });

        let outcome = self.run_locked(&mut run, request, skipped, &cancel).await;
        self.release(&held, run_id);

        match outcome {
            Ok(summary) => {
                if let Err(err) = self.stores.runs.save_summary(&summary) {
                    warn!(run_id = %run_id, error = %err, "failed to record run summary");
                }
                self.persist(&run);
                info!(
                    run_id = %run_id,
                    status = %summary.status,
                    committed = summary.committed.len(),
                    failed = summary.failed.len(),
                    "compilation run finished"
                );
                self.emit(RunEvent::RunFinished {
                    run_id,
                    status: summary.status,
                });
                Ok(summary)
            }
            Err(err) => {
                error!(run_id = %run_id, error = %err, "compilation run aborted");
                let _ = run.advance(RunStatus::Failed);
                run.failed_vocabularies = vocabularies;
                self.persist(&run);
                self.emit(RunEvent::RunFinished {
                    run_id,
                    status: RunStatus::Failed,
                });
                Err(err)
            }
        }
    }

    async fn run_locked(
        &self,
        run: &mut CompilationRun,
        request: CompileRequest,
        skipped: Vec<(SliceKey, String)>,
        cancel: &CancelHandle,
    ) -> Result<RunSummary, CompileError> {
        let run_id = run.run_id;
        let keys = request.keys();
        let mut summary = RunSummary::new(run_id);
        for (key, reason) in skipped {
            self.fail_slice(&mut summary, key, reason);
        }

        let prior = self
            .stores
            .snapshot()
            .map_err(|e| CompileError::CacheUnavailable(e.to_string()))?;
        let resolver = Arc::new(
            prior
                .as_ref()
                .map(IdentityResolver::from_snapshot)
                .unwrap_or_default(),
        );

        self.enter(run, RunStatus::Fetching);
        let Some(outcomes) = self.gather(run, request, resolver, cancel).await else {
            return Ok(self.cancelled(run, summary, &keys, &[]));
        };

        self.enter(run, RunStatus::Compiling);
        let mut vocab_results = BTreeMap::new();
        let mut crossmap_results = BTreeMap::new();
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Vocabulary { vocabulary, result } => {
                    vocab_results.insert(vocabulary, result);
                }
                TaskOutcome::CrossMap {
                    source,
                    links,
                    result,
                } => {
                    crossmap_results.insert(source, (links, result));
                }
            }
        }
        for key in &keys {
            let reported = match key {
                SliceKey::Vocabulary(v) => vocab_results.contains_key(v),
                SliceKey::CrossMap(s) => crossmap_results.contains_key(s),
            };
            if !reported {
                self.fail_slice(&mut summary, key.clone(), "worker task aborted".to_string());
            }
        }

        let manifest = prior.as_ref().map(|s| &s.manifest);
        let mut known: HashSet<ConceptId> = prior
            .iter()
            .flat_map(|s| s.concepts().map(|r| r.concept.concept_id.clone()))
            .collect();
        let mut updates: BTreeMap<SliceKey, SliceRef> = BTreeMap::new();
        let mut written: Vec<SliceKey> = Vec::new();
        let mut changed: BTreeSet<ConceptId> = BTreeSet::new();

        // Vocabulary slices first: cross-maps are validated against them.
        for (vocabulary, result) in vocab_results {
            let key = SliceKey::Vocabulary(vocabulary.clone());
            let normalized = match result {
                Ok(normalized) => normalized,
                Err(reason) => {
                    self.fail_slice(&mut summary, key, reason);
                    continue;
                }
            };
            if cancel.is_cancelled() {
                return Ok(self.cancelled(run, summary, &keys, &written));
            }

            let prior_slice = prior.as_ref().and_then(|s| s.vocabularies.get(&vocabulary));
            let built = build_vocabulary_slice(
                run_id,
                &vocabulary,
                prior_slice,
                &normalized.release,
                normalized.info,
            );
            let mut quarantined = normalized.quarantined;
            quarantined.merge(built.dropped.clone());
            if !quarantined.is_empty() {
                warn!(vocabulary = %vocabulary, count = quarantined.count, "records quarantined");
                summary.quarantined.insert(vocabulary.clone(), quarantined);
            }
            run.per_vocabulary_version
                .insert(vocabulary.clone(), normalized.version);

            match self.commit_slice(&built, manifest).await {
                Ok(Some(slice_ref)) => {
                    if let GraphSlice::Vocabulary(s) = &built.slice {
                        known.extend(s.concepts.keys().cloned());
                    }
                    changed.extend(built.changed_concepts());
                    updates.insert(key.clone(), slice_ref);
                    written.push(key.clone());
                    self.committed(&mut summary, key, &built, false);
                }
                Ok(None) => self.committed(&mut summary, key, &built, true),
                Err(failure) => self.fail_slice(&mut summary, key, failure.to_string()),
            }
        }

        for (source, (links, result)) in crossmap_results {
            let key = SliceKey::CrossMap(source.clone());
            let linked = match result {
                Ok(linked) => linked,
                Err(reason) => {
                    self.fail_slice(&mut summary, key, reason);
                    continue;
                }
            };
            if cancel.is_cancelled() {
                return Ok(self.cancelled(run, summary, &keys, &written));
            }

            let built = build_crossmap_slice(run_id, &source, links, linked.crossmaps, |id| {
                known.contains(id)
            });
            let mut unresolved = linked.unresolved;
            unresolved.merge(built.dropped.clone());
            if !unresolved.is_empty() {
                warn!(source = %source, count = unresolved.count, "unresolved mappings excluded");
                summary.unresolved_mappings.insert(source.clone(), unresolved);
            }

            match self.commit_slice(&built, manifest).await {
                Ok(Some(slice_ref)) => {
                    updates.insert(key.clone(), slice_ref);
                    written.push(key.clone());
                    self.committed(&mut summary, key, &built, false);
                }
                Ok(None) => self.committed(&mut summary, key, &built, true),
                Err(failure) => self.fail_slice(&mut summary, key, failure.to_string()),
            }
        }

        if cancel.is_cancelled() {
            return Ok(self.cancelled(run, summary, &keys, &written));
        }

        if !updates.is_empty() {
            let count = updates.len();
            if let Err(err) = self.stores.cache.publish(run_id, updates) {
                for key in &written {
                    self.compiler.rollback(key, run_id);
                }
                return Err(CompileError::CacheUnavailable(err.to_string()));
            }
            info!(run_id = %run_id, slices = count, "current run pointer published");
            self.emit(RunEvent::Published {
                run_id,
                slices: count,
            });
        }

        let committed_any = !summary.committed.is_empty();
        summary.embedding = Some(if committed_any {
            self.run_embedding(run, &changed).await
        } else {
            EmbeddingOutcome::Skipped
        });

        let status = if !committed_any {
            RunStatus::Failed
        } else if summary.failed.is_empty() {
            RunStatus::Committed
        } else {
            RunStatus::PartiallyCommitted
        };
        run.failed_vocabularies = summary.failed_vocabularies();
        run.advance(status)?;
        summary.status = status;
        Ok(summary)
    }

    /// Spawn every worker and collect their results. `None` when cancelled.
    async fn gather(
        &self,
        run: &mut CompilationRun,
        request: CompileRequest,
        resolver: Arc<IdentityResolver>,
        cancel: &CancelHandle,
    ) -> Option<Vec<TaskOutcome>> {
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut barriers: HashMap<Vocabulary, watch::Receiver<Readiness>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for job in request.vocabularies {
            let (ready_tx, ready_rx) = watch::channel(Readiness::Pending);
            barriers.insert(job.schema.vocabulary.clone(), ready_rx);
            tasks.spawn(vocabulary_task(
                job,
                ready_tx,
                permits.clone(),
                resolver.clone(),
                progress_tx.clone(),
                self.config.parse_restarts,
            ));
        }
        for job in request.crossmaps {
            let deps: Vec<(Vocabulary, watch::Receiver<Readiness>)> = job
                .schema
                .dependencies()
                .into_iter()
                .filter_map(|v| barriers.get(&v).map(|rx| (v, rx.clone())))
                .collect();
            tasks.spawn(crossmap_task(
                job,
                deps,
                permits.clone(),
                resolver.clone(),
                progress_tx.clone(),
            ));
        }
        drop(progress_tx);

        let mut outcomes = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(run_id = %run.run_id, "cancellation requested; aborting workers");
                    tasks.shutdown().await;
                    return None;
                }
                Some(progress) = progress_rx.recv() => self.on_progress(run, progress),
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => {
                        self.on_outcome(&outcome);
                        outcomes.push(outcome);
                    }
                    Some(Err(err)) => error!(run_id = %run.run_id, error = %err, "worker task failed"),
                },
            }
        }
        while let Ok(progress) = progress_rx.try_recv() {
            self.on_progress(run, progress);
        }
        Some(outcomes)
    }

    /// Write a slice unless its content equals the committed version.
    /// `Ok(None)` means unchanged.
    async fn commit_slice(
        &self,
        built: &BuiltSlice,
        current: Option<&GraphManifest>,
    ) -> Result<Option<SliceRef>, GraphWriteFailure> {
        let key = built.key();
        let digest = built.slice.content_digest();
        let unchanged = current
            .and_then(|m| m.slices.get(&key))
            .map(|r| r.content_digest == digest)
            .unwrap_or(false);
        if unchanged {
            debug!(slice = %key, "content unchanged; keeping committed slice");
            return Ok(None);
        }
        let compiler = self.compiler.clone();
        let slice = built.slice.clone();
        tokio::task::spawn_blocking(move || compiler.write(&slice))
            .await
            .map_err(|e| GraphWriteFailure {
                slice: key,
                reason: format!("writer task failed: {e}"),
            })?
            .map(Some)
    }

    async fn run_embedding(&self, run: &mut CompilationRun, changed: &BTreeSet<ConceptId>) -> EmbeddingOutcome {
        let Some(stage) = &self.embedding else {
            return EmbeddingOutcome::Skipped;
        };
        self.enter(run, RunStatus::Embedding);
        let snapshot = match self.stores.snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return EmbeddingOutcome::Skipped,
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "embedding skipped: snapshot unavailable");
                return EmbeddingOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };
        match stage.embed(&snapshot, changed).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(run_id = %run.run_id, error = %err, "embedding failed; graph commit unaffected");
                EmbeddingOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn cancelled(
        &self,
        run: &mut CompilationRun,
        mut summary: RunSummary,
        keys: &[SliceKey],
        written: &[SliceKey],
    ) -> RunSummary {
        for key in written {
            self.compiler.rollback(key, run.run_id);
        }
        summary.committed.clear();
        summary.unchanged.clear();
        for key in keys {
            summary
                .failed
                .entry(key.clone())
                .or_insert_with(|| "run cancelled".to_string());
        }
        let _ = run.advance(RunStatus::Failed);
        run.failed_vocabularies = summary.failed_vocabularies();
        summary.status = RunStatus::Failed;
        warn!(run_id = %run.run_id, rolled_back = written.len(), "compilation run cancelled");
        summary
    }

    fn committed(&self, summary: &mut RunSummary, key: SliceKey, built: &BuiltSlice, unchanged: bool) {
        info!(slice = %key, unchanged, created = built.stats.created, updated = built.stats.updated, retired = built.stats.retired, "slice committed");
        summary.committed.insert(key.clone(), built.stats);
        if unchanged {
            summary.unchanged.insert(key.clone());
        }
        self.emit(RunEvent::SliceCommitted {
            key,
            stats: built.stats,
            unchanged,
        });
    }

    fn fail_slice(&self, summary: &mut RunSummary, key: SliceKey, reason: String) {
        warn!(slice = %key, reason = %reason, "slice failed");
        summary.failed.insert(key.clone(), reason.clone());
        self.emit(RunEvent::SliceFailed { key, reason });
    }

    fn on_progress(&self, run: &mut CompilationRun, progress: Progress) {
        match progress {
            Progress::Fetched {
                vocabulary,
                version,
                bytes,
            } => {
                info!(vocabulary = %vocabulary, version = %version, bytes, "release fetched");
                self.enter(run, RunStatus::Normalizing);
                self.emit(RunEvent::VocabularyFetched {
                    vocabulary,
                    version,
                    bytes,
                });
            }
            Progress::Linking { source } => {
                debug!(source = %source, "dependencies normalized; linking");
                self.enter(run, RunStatus::Linking);
            }
        }
    }

    fn on_outcome(&self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Vocabulary {
                vocabulary,
                result: Ok(n),
            } => self.emit(RunEvent::VocabularyNormalized {
                vocabulary: vocabulary.clone(),
                concepts: n.release.concepts.len(),
                quarantined: n.quarantined.count,
            }),
            TaskOutcome::CrossMap {
                source,
                result: Ok(linked),
                ..
            } => self.emit(RunEvent::CrossMapLinked {
                source: source.clone(),
                crossmaps: linked.crossmaps.len(),
                unresolved: linked.unresolved.count,
            }),
            _ => {}
        }
    }

    /// Move forward to `next` if that is an advance; otherwise no-op.
    fn enter(&self, run: &mut CompilationRun, next: RunStatus) {
        if run.status.can_transition_to(next) && run.advance(next).is_ok() {
            debug!(run_id = %run.run_id, status = %next, "stage entered");
            self.persist(run);
            self.emit(RunEvent::StageEntered {
                run_id: run.run_id,
                status: next,
            });
        }
    }

    fn persist(&self, run: &CompilationRun) {
        if let Err(err) = self.stores.runs.save_run(run) {
            warn!(run_id = %run.run_id, error = %err, "failed to record run state");
        }
    }

    fn release(&self, keys: &[SliceKey], run_id: RunId) {
        for key in keys {
            if let Err(err) = self.stores.cache.unlock(key, run_id) {
                warn!(slice = %key, run_id = %run_id, error = %err, "failed to release slice lock");
            }
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn vocabulary_task(
    job: VocabularyJob,
    ready: watch::Sender<Readiness>,
    permits: Arc<Semaphore>,
    resolver: Arc<IdentityResolver>,
    progress: mpsc::UnboundedSender<Progress>,
    restarts: usize,
) -> TaskOutcome {
    let vocabulary = job.schema.vocabulary.clone();
    let result = prepare_vocabulary(job, &permits, &resolver, &progress, restarts).await;
    let state = match &result {
        Ok(_) => Readiness::Ready,
        Err(reason) => {
            warn!(vocabulary = %vocabulary, reason = %reason, "vocabulary failed before compilation");
            Readiness::Failed
        }
    };
    ready.send_replace(state);
    TaskOutcome::Vocabulary { vocabulary, result }
}

async fn prepare_vocabulary(
    job: VocabularyJob,
    permits: &Semaphore,
    resolver: &IdentityResolver,
    progress: &mpsc::UnboundedSender<Progress>,
    restarts: usize,
) -> Result<NormalizedVocabulary, String> {
    let _permit = permits.acquire().await.map_err(|e| e.to_string())?;
    let vocabulary = job.schema.vocabulary.clone();

    let payload = job.adapter.fetch().await.map_err(|e| e.to_string())?;
    let version = payload.version_or_digest().to_string();
    let _ = progress.send(Progress::Fetched {
        vocabulary: vocabulary.clone(),
        version: version.clone(),
        bytes: payload.bytes.len(),
    });
    let info = ReleaseInfo {
        source_version: payload.version.clone(),
        payload_digest: Some(payload.digest.clone()),
    };

    let adapter = job.adapter.clone();
    let normalizer = Normalizer::new(job.schema);
    let (release, quarantined) = tokio::task::spawn_blocking(move || {
        normalize_payload(adapter.as_ref(), &payload, &normalizer, restarts)
    })
    .await
    .map_err(|e| format!("normalizer task failed: {e}"))?
    .map_err(|e| e.to_string())?;

    if release.merged_duplicates > 0 {
        debug!(vocabulary = %vocabulary, count = release.merged_duplicates, "merged duplicate codes");
    }
    resolver.stage(&vocabulary, release.concepts.values());
    info!(
        vocabulary = %vocabulary,
        concepts = release.concepts.len(),
        quarantined = quarantined.count,
        "vocabulary normalized"
    );
    Ok(NormalizedVocabulary {
        release,
        quarantined,
        info,
        version,
    })
}

/// Drain a record stream through the normalizer. Record-level problems are
/// quarantined; a transient stream error reopens the stream after the
/// records already consumed.
fn normalize_payload(
    adapter: &dyn SourceAdapter,
    payload: &Payload,
    normalizer: &Normalizer,
    max_restarts: usize,
) -> Result<(Release, RecordIssues), SourceError> {
    let vocabulary = &normalizer.schema().vocabulary;
    let mut records = Vec::new();
    let mut issues = RecordIssues::default();
    let mut consumed = 0usize;
    let mut restarts = 0usize;
    let mut stream = adapter.parse(payload)?;

    while let Some(item) = stream.next() {
        match item {
            Ok(raw) => {
                consumed += 1;
                match normalizer.normalize(&raw) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        debug!(vocabulary = %vocabulary, code = %raw.native_code, reason = %err, "quarantined record");
                        issues.record(raw.native_code.clone(), err.to_string());
                    }
                }
            }
            Err(SourceError::MalformedRecord { locator, reason }) => {
                consumed += 1;
                debug!(vocabulary = %vocabulary, locator = %locator, reason = %reason, "quarantined record");
                issues.record(locator, reason);
            }
            Err(err) if err.is_retryable() && restarts < max_restarts => {
                restarts += 1;
                warn!(vocabulary = %vocabulary, consumed, error = %err, "record stream interrupted; reopening");
                stream = adapter.parse_from(payload, consumed)?;
            }
            Err(err) => return Err(err),
        }
    }

    if records.is_empty() {
        let reason = if issues.is_empty() {
            "release contains no records"
        } else {
            "no record passed normalization"
        };
        return Err(SourceError::format_changed(adapter.name(), reason));
    }
    Ok((Release::from_records(records), issues))
}

async fn crossmap_task(
    job: CrossMapJob,
    deps: Vec<(Vocabulary, watch::Receiver<Readiness>)>,
    permits: Arc<Semaphore>,
    resolver: Arc<IdentityResolver>,
    progress: mpsc::UnboundedSender<Progress>,
) -> TaskOutcome {
    let source = job.schema.name.clone();
    let links = job.schema.links();
    let result = link_crossmap(job, deps, &permits, resolver, &progress).await;
    if let Err(reason) = &result {
        warn!(source = %source, reason = %reason, "cross-map source failed");
    }
    TaskOutcome::CrossMap {
        source,
        links,
        result,
    }
}

async fn link_crossmap(
    job: CrossMapJob,
    deps: Vec<(Vocabulary, watch::Receiver<Readiness>)>,
    permits: &Semaphore,
    resolver: Arc<IdentityResolver>,
    progress: &mpsc::UnboundedSender<Progress>,
) -> Result<LinkOutcome, String> {
    let payload = {
        let _permit = permits.acquire().await.map_err(|e| e.to_string())?;
        job.adapter.fetch().await.map_err(|e| e.to_string())?
    };

    // Barrier: every linked vocabulary in this run has finished normalizing.
    for (vocabulary, mut ready) in deps {
        let state = ready
            .wait_for(|s| *s != Readiness::Pending)
            .await
            .map(|s| *s)
            .unwrap_or(Readiness::Failed);
        if state == Readiness::Failed {
            debug!(source = %job.schema.name, vocabulary = %vocabulary, "dependency failed; linking against committed version");
        }
    }
    let _ = progress.send(Progress::Linking {
        source: job.schema.name.clone(),
    });

    let _permit = permits.acquire().await.map_err(|e| e.to_string())?;
    let CrossMapJob { adapter, schema } = job;
    tokio::task::spawn_blocking(move || {
        let records = adapter.parse(&payload)?;
        Linker::new(&schema, &resolver).link(records)
    })
    .await
    .map_err(|e| format!("linker task failed: {e}"))?
    .map_err(|e| e.to_string())
}
