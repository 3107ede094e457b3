//! Canonical concept graph model.
//!
//! Concepts are nodes addressed by [`ConceptId`]; relationships and
//! cross-maps are plain edge records that refer to nodes by id. Cycles and
//! cross-vocabulary links are therefore ordinary data.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ids::{ConceptId, RunId, Vocabulary};

/// Scalar metadata value attached to a concept or mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{b}"),
            MetadataValue::Integer(i) => write!(f, "{i}"),
            MetadataValue::Float(x) => write!(f, "{x}"),
            MetadataValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

/// Metadata key carrying the source's own active/deprecated flag.
pub const SOURCE_STATUS_KEY: &str = "status";

/// One canonical term/entry of a vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: ConceptId,
    pub vocabulary: Vocabulary,
    pub native_code: String,
    pub preferred_term: String,
    /// Ordered, case-sensitively deduplicated.
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl Concept {
    pub fn new(vocabulary: Vocabulary, native_code: &str, preferred_term: &str) -> Self {
        Self {
            concept_id: ConceptId::derive(&vocabulary, native_code),
            vocabulary,
            native_code: native_code.to_string(),
            preferred_term: preferred_term.to_string(),
            synonyms: Vec::new(),
            definition: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Replace the synonym list, keeping first occurrences in source order.
    ///
    /// Deduplication is case-sensitive: `BRCA1` and `brca1` are both kept.
    pub fn with_synonyms<I, S>(mut self, synonyms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms = dedup_synonyms(synonyms);
        self
    }

    pub fn with_definition(mut self, definition: Option<String>) -> Self {
        self.definition = definition;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: MetadataValue) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Deterministic text used as embedding input: preferred term, then
    /// synonyms, then definition.
    pub fn canonical_text(&self) -> String {
        let mut out = self.preferred_term.trim().to_string();
        if !self.synonyms.is_empty() {
            out.push_str(" (");
            out.push_str(&self.synonyms.join("; "));
            out.push(')');
        }
        if let Some(def) = self.definition.as_deref().map(str::trim) {
            if !def.is_empty() {
                out.push_str(": ");
                out.push_str(def);
            }
        }
        out
    }
}

/// Drop empty and repeated synonyms, preserving first-seen order and exact casing.
pub fn dedup_synonyms<I, S>(synonyms: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for s in synonyms {
        let s: String = s.into();
        let s = s.trim().to_string();
        if s.is_empty() {
            continue;
        }
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

/// Lifecycle of a concept inside the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    /// Native code vanished from the source release in `since`.
    Retired { since: RunId },
}

impl Lifecycle {
    pub fn is_retired(self) -> bool {
        matches!(self, Lifecycle::Retired { .. })
    }
}

/// A concept together with its compilation bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptRecord {
    pub concept: Concept,
    pub lifecycle: Lifecycle,
    /// Run in which this exact attribute snapshot first appeared.
    pub revision_run: RunId,
}

/// Broad class of a relation, used for query defaults and embedding refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Hierarchical,
    Associative,
    Equivalence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    IsA,
    PartOf,
    ReplacedBy,
    RelatedTo,
    EquivalentTo,
}

impl RelationType {
    pub const ALL: [RelationType; 5] = [
        RelationType::IsA,
        RelationType::PartOf,
        RelationType::ReplacedBy,
        RelationType::RelatedTo,
        RelationType::EquivalentTo,
    ];

    pub fn kind(self) -> RelationKind {
        match self {
            RelationType::IsA | RelationType::PartOf => RelationKind::Hierarchical,
            RelationType::ReplacedBy | RelationType::RelatedTo => RelationKind::Associative,
            RelationType::EquivalentTo => RelationKind::Equivalence,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RelationType::IsA => "is_a",
            RelationType::PartOf => "part_of",
            RelationType::ReplacedBy => "replaced_by",
            RelationType::RelatedTo => "related_to",
            RelationType::EquivalentTo => "equivalent_to",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown relation type `{s}`"))
    }
}

/// Directed within-vocabulary edge. Set semantics apply to the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relationship {
    pub source_concept_id: ConceptId,
    pub target_concept_id: ConceptId,
    pub relation_type: RelationType,
    pub vocabulary_provenance: Vocabulary,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Annotation edge (e.g. gene → phenotype).
    Annotates,
    ExactMatch,
    CloseMatch,
    BroadMatch,
    NarrowMatch,
    RelatedMatch,
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingType::Annotates => "annotates",
            MappingType::ExactMatch => "exact_match",
            MappingType::CloseMatch => "close_match",
            MappingType::BroadMatch => "broad_match",
            MappingType::NarrowMatch => "narrow_match",
            MappingType::RelatedMatch => "related_match",
        }
    }
}

impl FromStr for MappingType {
    type Err = String;

    /// Accepts plain names as well as SKOS predicate CURIEs (`skos:exactMatch`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let local = s.trim().rsplit([':', '#', '/']).next().unwrap_or("");
        let norm: String = local
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "annotates" => Ok(MappingType::Annotates),
            "exactmatch" => Ok(MappingType::ExactMatch),
            "closematch" => Ok(MappingType::CloseMatch),
            "broadmatch" => Ok(MappingType::BroadMatch),
            "narrowmatch" => Ok(MappingType::NarrowMatch),
            "relatedmatch" => Ok(MappingType::RelatedMatch),
            _ => Err(format!("unknown mapping type `{s}`")),
        }
    }
}

impl fmt::Display for MappingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cross-vocabulary edge, produced only by the linker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossMap {
    pub source_concept_id: ConceptId,
    pub target_concept_id: ConceptId,
    pub mapping_type: MappingType,
    /// Passed through from source data; `None` when the source has none.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CrossMap {
    /// Identity of a cross-map for set semantics.
    pub fn key(&self) -> (&ConceptId, &ConceptId, &MappingType) {
        (
            &self.source_concept_id,
            &self.target_concept_id,
            &self.mapping_type,
        )
    }

    /// Explicit opt-in for consumers that need a number.
    pub fn confidence_or(&self, default: f64) -> f64 {
        self.confidence.unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hgnc() -> Vocabulary {
        Vocabulary::new("HGNC").unwrap()
    }

    #[test]
    fn synonyms_dedup_is_case_sensitive() {
        let c = Concept::new(hgnc(), "HGNC:1100", "BRCA1").with_synonyms([
            "RNF53", "brca1", "RNF53", "BRCA1", " ", "BRCC1",
        ]);
        assert_eq!(c.synonyms, vec!["RNF53", "brca1", "BRCA1", "BRCC1"]);
    }

    #[test]
    fn canonical_text_is_deterministic() {
        let c = Concept::new(hgnc(), "HGNC:1100", "BRCA1")
            .with_synonyms(["RNF53", "BRCC1"])
            .with_definition(Some("BRCA1 DNA repair associated".to_string()));
        assert_eq!(
            c.canonical_text(),
            "BRCA1 (RNF53; BRCC1): BRCA1 DNA repair associated"
        );
        let bare = Concept::new(hgnc(), "HGNC:1", "A1BG");
        assert_eq!(bare.canonical_text(), "A1BG");
    }

    #[test]
    fn relation_types_parse_and_classify() {
        assert_eq!("IS_A".parse::<RelationType>().unwrap(), RelationType::IsA);
        assert_eq!(RelationType::ReplacedBy.kind(), RelationKind::Associative);
        assert!("sibling_of".parse::<RelationType>().is_err());
    }

    #[test]
    fn mapping_types_accept_skos_curies() {
        assert_eq!(
            "skos:exactMatch".parse::<MappingType>().unwrap(),
            MappingType::ExactMatch
        );
        assert_eq!(
            "broad_match".parse::<MappingType>().unwrap(),
            MappingType::BroadMatch
        );
    }

    #[test]
    fn metadata_serializes_untagged() {
        let c = Concept::new(hgnc(), "HGNC:1100", "BRCA1")
            .with_metadata("status", "active".into())
            .with_metadata("locus_group", MetadataValue::Integer(3));
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["metadata"]["status"], "active");
        assert_eq!(json["metadata"]["locus_group"], 3);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn dedup_is_idempotent_and_order_preserving(items in proptest::collection::vec("[ a-cA-C]{0,4}", 0..12)) {
                let once = dedup_synonyms(items.clone());
                prop_assert_eq!(dedup_synonyms(once.clone()), once.clone());
                prop_assert!(once.iter().all(|s| !s.is_empty() && s.trim() == s));

                let mut expected: Vec<String> = Vec::new();
                for s in items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
                    if !expected.iter().any(|e| e == s) {
                        expected.push(s.to_string());
                    }
                }
                prop_assert_eq!(once, expected);
            }
        }
    }
}
