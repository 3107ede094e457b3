//! Identity resolver.
//!
//! Two jobs:
//!
//! * a lookup table `(vocabulary, code | term) -> ConceptId` shared by the
//!   linker and the compiler. Each vocabulary namespace sits behind its own
//!   `RwLock`, so readers never block each other and a writer only blocks
//!   its own namespace;
//! * cross-run merge: [`reconcile`] decides create / update / unchanged /
//!   retire for every concept of a release against the prior committed
//!   slice.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use termgraph_model::{
    dedup_synonyms, Concept, ConceptId, ConceptRecord, Lifecycle, RunId, SliceStats, Vocabulary,
    VocabularySlice,
};
use termgraph_storage::GraphSnapshot;

use crate::normalize::{NormalizedRecord, PendingRelation};

// ============================================================================
// Lookup table
// ============================================================================

#[derive(Debug, Clone)]
struct Entry {
    id: ConceptId,
    term: String,
    active: bool,
}

#[derive(Debug, Default)]
struct Namespace {
    by_code: HashMap<String, Entry>,
    by_term: HashMap<String, Vec<String>>,
}

impl Namespace {
    fn insert(&mut self, code: &str, term: &str, id: ConceptId, active: bool) {
        let entry = Entry {
            id,
            term: term.to_string(),
            active,
        };
        if let Some(previous) = self.by_code.insert(code.to_string(), entry) {
            if let Some(codes) = self.by_term.get_mut(&previous.term) {
                codes.retain(|c| c != code);
            }
        }
        self.by_term
            .entry(term.to_string())
            .or_default()
            .push(code.to_string());
    }
}

#[derive(Debug, Default)]
pub struct IdentityResolver {
    namespaces: DashMap<Vocabulary, Arc<RwLock<Namespace>>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table with every committed vocabulary.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let resolver = Self::new();
        for slice in snapshot.vocabularies.values() {
            resolver.load_slice(slice);
        }
        resolver
    }

    /// Replace a namespace with the contents of a committed slice.
    pub fn load_slice(&self, slice: &VocabularySlice) {
        let mut ns = Namespace::default();
        for record in slice.concepts.values() {
            ns.insert(
                &record.concept.native_code,
                &record.concept.preferred_term,
                record.concept.concept_id.clone(),
                !record.lifecycle.is_retired(),
            );
        }
        self.namespaces
            .insert(slice.vocabulary.clone(), Arc::new(RwLock::new(ns)));
    }

    /// Install this run's release for a vocabulary.
    ///
    /// Codes already known but missing from the release stay resolvable as
    /// retired entries.
    pub fn stage<'a>(&self, vocabulary: &Vocabulary, release: impl IntoIterator<Item = &'a Concept>) {
        let ns = self.namespace(vocabulary);
        let mut guard = ns.write();
        let mut staged = Namespace::default();
        let mut known: Vec<(&String, &Entry)> = guard.by_code.iter().collect();
        known.sort_by(|a, b| a.0.cmp(b.0));
        for concept in release {
            staged.insert(
                &concept.native_code,
                &concept.preferred_term,
                concept.concept_id.clone(),
                true,
            );
        }
        for (code, entry) in known {
            if !staged.by_code.contains_key(code) {
                staged.insert(code, &entry.term, entry.id.clone(), false);
            }
        }
        *guard = staged;
    }

    fn namespace(&self, vocabulary: &Vocabulary) -> Arc<RwLock<Namespace>> {
        self.namespaces
            .entry(vocabulary.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Namespace::default())))
            .clone()
    }

    fn existing(&self, vocabulary: &Vocabulary) -> Option<Arc<RwLock<Namespace>>> {
        self.namespaces.get(vocabulary).map(|ns| ns.clone())
    }

    pub fn knows(&self, vocabulary: &Vocabulary) -> bool {
        self.existing(vocabulary)
            .map(|ns| !ns.read().by_code.is_empty())
            .unwrap_or(false)
    }

    pub fn len(&self, vocabulary: &Vocabulary) -> usize {
        self.existing(vocabulary)
            .map(|ns| ns.read().by_code.len())
            .unwrap_or(0)
    }

    /// Resolve a native code. Retired concepts resolve too.
    pub fn resolve_code(&self, vocabulary: &Vocabulary, code: &str) -> Result<ConceptId, String> {
        let ns = self
            .existing(vocabulary)
            .ok_or_else(|| format!("{vocabulary} has not been compiled"))?;
        let guard = ns.read();
        if guard.by_code.is_empty() {
            return Err(format!("{vocabulary} has not been compiled"));
        }
        guard
            .by_code
            .get(code)
            .map(|e| e.id.clone())
            .ok_or_else(|| format!("unknown code `{code}`"))
    }

    /// Resolve an exact preferred term. Active concepts win over retired ones;
    /// more than one candidate is ambiguous.
    pub fn resolve_term(&self, vocabulary: &Vocabulary, term: &str) -> Result<ConceptId, String> {
        let ns = self
            .existing(vocabulary)
            .ok_or_else(|| format!("{vocabulary} has not been compiled"))?;
        let guard = ns.read();
        if guard.by_code.is_empty() {
            return Err(format!("{vocabulary} has not been compiled"));
        }
        let candidates: Vec<&Entry> = guard
            .by_term
            .get(term.trim())
            .into_iter()
            .flatten()
            .filter_map(|code| guard.by_code.get(code))
            .collect();
        let active: Vec<&&Entry> = candidates.iter().filter(|e| e.active).collect();
        let pick: Vec<&Entry> = if active.is_empty() {
            candidates.clone()
        } else {
            active.into_iter().copied().collect()
        };
        match pick.as_slice() {
            [] => Err(format!("unknown term `{term}`")),
            [one] => Ok(one.id.clone()),
            many => Err(format!("ambiguous term `{term}` matches {} concepts", many.len())),
        }
    }
}

// ============================================================================
// Release merge and cross-run reconciliation
// ============================================================================

/// One vocabulary release after duplicate codes have been merged.
#[derive(Debug, Clone, Default)]
pub struct Release {
    pub concepts: BTreeMap<ConceptId, Concept>,
    pub relations: BTreeMap<ConceptId, Vec<PendingRelation>>,
    /// Records folded into an earlier record with the same native code.
    pub merged_duplicates: usize,
}

impl Release {
    /// Fold normalized records into a release. A repeated native code keeps
    /// the first record's term and definition and unions the rest.
    pub fn from_records(records: impl IntoIterator<Item = NormalizedRecord>) -> Self {
        let mut release = Release::default();
        for NormalizedRecord { concept, relations } in records {
            let id = concept.concept_id.clone();
            match release.concepts.get_mut(&id) {
                Some(existing) => {
                    merge_into(existing, concept);
                    release.merged_duplicates += 1;
                }
                None => {
                    release.concepts.insert(id.clone(), concept);
                }
            }
            let pending = release.relations.entry(id).or_default();
            pending.extend(relations);
            pending.sort();
            pending.dedup();
        }
        release
    }
}

fn merge_into(existing: &mut Concept, duplicate: Concept) {
    let mut synonyms = std::mem::take(&mut existing.synonyms);
    if duplicate.preferred_term != existing.preferred_term {
        synonyms.push(duplicate.preferred_term);
    }
    synonyms.extend(duplicate.synonyms);
    existing.synonyms = dedup_synonyms(synonyms);
    if existing.definition.is_none() {
        existing.definition = duplicate.definition;
    }
    for (key, value) in duplicate.metadata {
        existing.metadata.entry(key).or_insert(value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub concepts: BTreeMap<ConceptId, ConceptRecord>,
    pub stats: SliceStats,
}

/// Merge a release with the prior committed slice of the same vocabulary.
///
/// * new code: created in `run_id`;
/// * same code, same attributes, active: the prior record is kept as is;
/// * same code, different attributes (or previously retired): updated;
/// * code missing from the release: retired, never deleted.
pub fn reconcile(
    run_id: RunId,
    prior: Option<&VocabularySlice>,
    release: &BTreeMap<ConceptId, Concept>,
) -> Reconciled {
    let mut stats = SliceStats::default();
    let mut concepts = BTreeMap::new();

    for (id, concept) in release {
        let prior_record = prior.and_then(|p| p.concepts.get(id));
        let record = match prior_record {
            Some(old) if old.lifecycle == Lifecycle::Active && old.concept == *concept => {
                stats.unchanged += 1;
                old.clone()
            }
            Some(_) => {
                stats.updated += 1;
                ConceptRecord {
                    concept: concept.clone(),
                    lifecycle: Lifecycle::Active,
                    revision_run: run_id,
                }
            }
            None => {
                stats.created += 1;
                ConceptRecord {
                    concept: concept.clone(),
                    lifecycle: Lifecycle::Active,
                    revision_run: run_id,
                }
            }
        };
        concepts.insert(id.clone(), record);
    }

    if let Some(prior) = prior {
        for (id, old) in &prior.concepts {
            if release.contains_key(id) {
                continue;
            }
            let record = match old.lifecycle {
                Lifecycle::Retired { .. } => old.clone(),
                Lifecycle::Active => {
                    stats.retired += 1;
                    ConceptRecord {
                        concept: old.concept.clone(),
                        lifecycle: Lifecycle::Retired { since: run_id },
                        revision_run: run_id,
                    }
                }
            };
            concepts.insert(id.clone(), record);
        }
    }

    Reconciled { concepts, stats }
}
