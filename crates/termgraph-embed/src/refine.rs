//! Graph-aware refinement of concept vectors.
//!
//! Each refined vector is pulled toward the mean of its graph neighbours
//! (relationships and cross-maps, both directions):
//!
//! ```text
//!   v' = normalize((1 - alpha) * v + alpha * mean(neighbours(v)))
//! ```
//!
//! Updates are computed from the previous iteration's vectors only, so the
//! result does not depend on visiting order.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use termgraph_model::ConceptId;
use termgraph_storage::GraphSnapshot;

use crate::embedder::normalize_in_place;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineConfig {
    pub enabled: bool,
    pub iterations: usize,
    /// Weight of the neighbourhood mean, in `[0, 1]`.
    pub alpha: f32,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            iterations: 1,
            alpha: 0.2,
        }
    }
}

/// Undirected adjacency over active concepts.
#[derive(Debug, Clone, Default)]
pub struct Neighbourhood {
    edges: HashMap<ConceptId, BTreeSet<ConceptId>>,
}

impl Neighbourhood {
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Self {
        let mut n = Self::default();
        let active = |id: &ConceptId| snapshot.active_concept(id).is_some();
        let pairs = snapshot
            .relationships()
            .map(|r| (&r.source_concept_id, &r.target_concept_id))
            .chain(
                snapshot
                    .crossmaps()
                    .map(|m| (&m.source_concept_id, &m.target_concept_id)),
            );
        for (a, b) in pairs {
            if a != b && active(a) && active(b) {
                n.link(a.clone(), b.clone());
            }
        }
        n
    }

    pub fn link(&mut self, a: ConceptId, b: ConceptId) {
        self.edges.entry(a.clone()).or_default().insert(b.clone());
        self.edges.entry(b).or_default().insert(a);
    }

    pub fn neighbours(&self, id: &ConceptId) -> impl Iterator<Item = &ConceptId> {
        self.edges.get(id).into_iter().flatten()
    }
}

/// Refine `targets` in place against the vectors in `vectors`.
///
/// Neighbours without a vector are ignored; a target with no embedded
/// neighbour keeps its vector.
pub fn refine(
    vectors: &mut HashMap<ConceptId, Vec<f32>>,
    targets: &BTreeSet<ConceptId>,
    graph: &Neighbourhood,
    config: &RefineConfig,
) {
    let alpha = config.alpha.clamp(0.0, 1.0);
    if alpha == 0.0 {
        return;
    }
    for _ in 0..config.iterations {
        let mut next: Vec<(ConceptId, Vec<f32>)> = Vec::new();
        for id in targets {
            let Some(current) = vectors.get(id) else {
                continue;
            };
            let mut mean = vec![0.0f32; current.len()];
            let mut count = 0usize;
            for neighbour in graph.neighbours(id) {
                let Some(v) = vectors.get(neighbour) else {
                    continue;
                };
                if v.len() != mean.len() {
                    continue;
                }
                for (m, x) in mean.iter_mut().zip(v) {
                    *m += x;
                }
                count += 1;
            }
            if count == 0 {
                continue;
            }
            let mut refined: Vec<f32> = current
                .iter()
                .zip(&mean)
                .map(|(v, m)| (1.0 - alpha) * v + alpha * (m / count as f32))
                .collect();
            normalize_in_place(&mut refined);
            next.push((id.clone(), refined));
        }
        vectors.extend(next);
    }
}
