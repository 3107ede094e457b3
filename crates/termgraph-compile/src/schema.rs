//! Declarative per-vocabulary schemas.
//!
//! A schema says which raw fields carry the preferred term, synonyms,
//! definition, metadata, source status and relationships. The normalizer is
//! total over the declared schema; anything outside it is either ignored
//! (undeclared fields) or a per-record error.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use termgraph_model::{RelationType, Vocabulary};

use crate::error::CompileError;

/// How native codes are cleaned before identity derivation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRule {
    /// Removed when present (`ORPHA:` in annotation files).
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Prepended when missing (`OMIM:` for bare MIM numbers).
    #[serde(default)]
    pub add_prefix: Option<String>,
}

impl CodeRule {
    pub fn strip(prefix: &str) -> Self {
        Self {
            strip_prefix: Some(prefix.to_string()),
            add_prefix: None,
        }
    }

    pub fn add(prefix: &str) -> Self {
        Self {
            strip_prefix: None,
            add_prefix: Some(prefix.to_string()),
        }
    }

    pub fn rewrite(from: &str, to: &str) -> Self {
        Self {
            strip_prefix: Some(from.to_string()),
            add_prefix: Some(to.to_string()),
        }
    }

    /// Apply the rule. Returns `None` for codes that are blank after cleaning.
    pub fn apply(&self, raw: &str) -> Option<String> {
        let mut code = raw.trim();
        if let Some(prefix) = &self.strip_prefix {
            code = code.strip_prefix(prefix.as_str()).unwrap_or(code).trim();
        }
        if code.is_empty() {
            return None;
        }
        match &self.add_prefix {
            Some(prefix) if !code.starts_with(prefix.as_str()) => Some(format!("{prefix}{code}")),
            _ => Some(code.to_string()),
        }
    }
}

/// Derives `metadata["status"]` from a source field.
///
/// A record is `deprecated` when any value matches `deprecated_values`, or
/// when `active_values` is non-empty and no value matches it. Records
/// without the field are `active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRule {
    pub field: String,
    #[serde(default)]
    pub active_values: Vec<String>,
    #[serde(default)]
    pub deprecated_values: Vec<String>,
}

impl StatusRule {
    pub fn active_when(field: &str, values: &[&str]) -> Self {
        Self {
            field: field.to_string(),
            active_values: values.iter().map(|v| v.to_string()).collect(),
            deprecated_values: Vec::new(),
        }
    }

    pub fn deprecated_when(field: &str, values: &[&str]) -> Self {
        Self {
            field: field.to_string(),
            active_values: Vec::new(),
            deprecated_values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn is_deprecated<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> bool {
        let values: Vec<&str> = values.into_iter().map(str::trim).collect();
        if values.is_empty() {
            return false;
        }
        let matches = |set: &[String]| {
            values
                .iter()
                .any(|v| set.iter().any(|s| s.eq_ignore_ascii_case(v)))
        };
        if matches(&self.deprecated_values) {
            return true;
        }
        !self.active_values.is_empty() && !matches(&self.active_values)
    }
}

/// Field whose values are target codes of one relation type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRule {
    pub field: String,
    pub relation: RelationType,
    /// Applied to target codes; defaults to the schema's own code rule.
    #[serde(default)]
    pub code: Option<CodeRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabularySchema {
    pub vocabulary: Vocabulary,
    #[serde(default)]
    pub code: CodeRule,
    /// Candidate fields, first non-empty wins.
    pub preferred_term: Vec<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub definition: Vec<String>,
    /// metadata key -> raw field
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub status: Option<StatusRule>,
    #[serde(default)]
    pub relations: Vec<RelationRule>,
    /// Relation types this vocabulary may emit.
    #[serde(default)]
    pub allowed_relations: BTreeSet<RelationType>,
}

impl VocabularySchema {
    pub fn new(vocabulary: Vocabulary, preferred_term: &[&str]) -> Self {
        Self {
            vocabulary,
            code: CodeRule::default(),
            preferred_term: preferred_term.iter().map(|f| f.to_string()).collect(),
            synonyms: Vec::new(),
            definition: Vec::new(),
            metadata: BTreeMap::new(),
            status: None,
            relations: Vec::new(),
            allowed_relations: BTreeSet::new(),
        }
    }

    pub fn with_code(mut self, code: CodeRule) -> Self {
        self.code = code;
        self
    }

    pub fn with_synonyms(mut self, fields: &[&str]) -> Self {
        self.synonyms = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_definition(mut self, fields: &[&str]) -> Self {
        self.definition = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_metadata(mut self, key: &str, field: &str) -> Self {
        self.metadata.insert(key.to_string(), field.to_string());
        self
    }

    pub fn with_status(mut self, rule: StatusRule) -> Self {
        self.status = Some(rule);
        self
    }

    /// Declare a relation field. The relation type becomes allowed.
    pub fn with_relation(mut self, field: &str, relation: RelationType) -> Self {
        self.relations.push(RelationRule {
            field: field.to_string(),
            relation,
            code: None,
        });
        self.allowed_relations.insert(relation);
        self
    }

    pub fn with_relation_codes(mut self, field: &str, relation: RelationType, code: CodeRule) -> Self {
        self.relations.push(RelationRule {
            field: field.to_string(),
            relation,
            code: Some(code),
        });
        self.allowed_relations.insert(relation);
        self
    }

    pub fn allowing(mut self, relations: &[RelationType]) -> Self {
        self.allowed_relations = relations.iter().copied().collect();
        self
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        if self.preferred_term.is_empty() {
            return Err(CompileError::InvalidSchema {
                vocabulary: self.vocabulary.clone(),
                reason: "no preferred term field declared".to_string(),
            });
        }
        if self.metadata.contains_key(termgraph_model::SOURCE_STATUS_KEY) {
            return Err(CompileError::InvalidSchema {
                vocabulary: self.vocabulary.clone(),
                reason: format!(
                    "metadata key `{}` is reserved for the status rule",
                    termgraph_model::SOURCE_STATUS_KEY
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_rule_rewrites_prefix() {
        let rule = CodeRule::rewrite("ORPHA:", "Orphanet:");
        assert_eq!(rule.apply("ORPHA:558").as_deref(), Some("Orphanet:558"));
        assert_eq!(rule.apply("Orphanet:558").as_deref(), Some("Orphanet:558"));
        assert_eq!(rule.apply("ORPHA: "), None);
        assert_eq!(CodeRule::add("OMIM:").apply(" 113705 ").as_deref(), Some("OMIM:113705"));
    }

    #[test]
    fn status_rule_variants() {
        let hgnc = StatusRule::active_when("status", &["Approved"]);
        assert!(!hgnc.is_deprecated(["Approved"]));
        assert!(hgnc.is_deprecated(["Entry Withdrawn"]));
        assert!(!hgnc.is_deprecated(std::iter::empty()));

        let ncit = StatusRule::deprecated_when("concept_status", &["Obsolete_Concept"]);
        assert!(ncit.is_deprecated(["Retired_Concept", "obsolete_concept"]));
        assert!(!ncit.is_deprecated(["Provisional_Concept"]));
    }

    #[test]
    fn relations_declare_allowed_types() {
        let hpo = VocabularySchema::new(Vocabulary::new("HPO").unwrap(), &["label"])
            .with_relation("subClassOf", RelationType::IsA);
        assert!(hpo.allowed_relations.contains(&RelationType::IsA));
        assert!(hpo.validate().is_ok());

        let bad = VocabularySchema::new(Vocabulary::new("HPO").unwrap(), &["label"])
            .with_metadata("status", "deprecated");
        assert!(bad.validate().is_err());
    }
}
