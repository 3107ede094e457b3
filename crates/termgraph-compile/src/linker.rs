//! Cross-vocabulary linker.
//!
//! Turns annotation / mapping records into [`CrossMap`] edges by resolving
//! both endpoints through the [`IdentityResolver`]. Unresolvable records are
//! reported, never fatal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use termgraph_model::{ConceptId, CrossMap, MappingType, RecordIssues, Vocabulary};
use termgraph_source::{RawRecord, RawValue, SourceError};
use tracing::debug;

use crate::error::{Endpoint, UnresolvedMapping};
use crate::identity::IdentityResolver;
use crate::schema::CodeRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveBy {
    Code,
    /// Exact preferred term (e.g. a gene symbol).
    Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRule {
    pub vocabulary: Vocabulary,
    pub field: String,
    pub by: ResolveBy,
    #[serde(default)]
    pub code: CodeRule,
}

impl EndpointRule {
    pub fn code(vocabulary: Vocabulary, field: &str) -> Self {
        Self {
            vocabulary,
            field: field.to_string(),
            by: ResolveBy::Code,
            code: CodeRule::default(),
        }
    }

    pub fn term(vocabulary: Vocabulary, field: &str) -> Self {
        Self {
            vocabulary,
            field: field.to_string(),
            by: ResolveBy::Term,
            code: CodeRule::default(),
        }
    }

    pub fn with_code_rule(mut self, code: CodeRule) -> Self {
        self.code = code;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum MappingRule {
    Fixed { mapping_type: MappingType },
    Field {
        field: String,
        #[serde(default)]
        default: Option<MappingType>,
    },
}

/// Copies a raw field into `CrossMap::properties`, optionally through a
/// value table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRule {
    pub field: String,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Keep only rows whose field starts with the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub field: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossMapSchema {
    pub name: String,
    pub source: EndpointRule,
    pub target: EndpointRule,
    pub mapping: MappingRule,
    #[serde(default)]
    pub confidence_field: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyRule>,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
}

impl CrossMapSchema {
    pub fn new(name: &str, source: EndpointRule, target: EndpointRule, mapping_type: MappingType) -> Self {
        Self {
            name: name.to_string(),
            source,
            target,
            mapping: MappingRule::Fixed { mapping_type },
            confidence_field: None,
            properties: BTreeMap::new(),
            filters: Vec::new(),
        }
    }

    pub fn with_mapping_field(mut self, field: &str, default: Option<MappingType>) -> Self {
        self.mapping = MappingRule::Field {
            field: field.to_string(),
            default,
        };
        self
    }

    pub fn with_confidence(mut self, field: &str) -> Self {
        self.confidence_field = Some(field.to_string());
        self
    }

    pub fn with_property(mut self, key: &str, rule: PropertyRule) -> Self {
        self.properties.insert(key.to_string(), rule);
        self
    }

    pub fn keep_rows(mut self, field: &str, prefix: &str) -> Self {
        self.filters.push(RowFilter {
            field: field.to_string(),
            prefix: prefix.to_string(),
        });
        self
    }

    pub fn links(&self) -> (Vocabulary, Vocabulary) {
        (self.source.vocabulary.clone(), self.target.vocabulary.clone())
    }

    /// Vocabularies that must be normalized before this source can link.
    pub fn dependencies(&self) -> Vec<Vocabulary> {
        let mut deps = vec![self.source.vocabulary.clone(), self.target.vocabulary.clone()];
        deps.dedup();
        deps
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Unresolved(#[from] UnresolvedMapping),

    #[error("field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkOutcome {
    pub crossmaps: Vec<CrossMap>,
    pub unresolved: RecordIssues,
    /// Rows excluded by filters.
    pub skipped: usize,
}

pub struct Linker<'a> {
    schema: &'a CrossMapSchema,
    resolver: &'a IdentityResolver,
}

impl<'a> Linker<'a> {
    pub fn new(schema: &'a CrossMapSchema, resolver: &'a IdentityResolver) -> Self {
        Self { schema, resolver }
    }

    /// Link a whole record stream. Only a stream-level source error fails.
    pub fn link<I>(&self, records: I) -> Result<LinkOutcome, SourceError>
    where
        I: IntoIterator<Item = Result<RawRecord, SourceError>>,
    {
        let mut outcome = LinkOutcome::default();
        for item in records {
            let record = match item {
                Ok(record) => record,
                Err(err) if err.is_record_level() => {
                    outcome.unresolved.record("record", err.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            };
            for record in self.fan_out(record) {
                match self.link_record(&record) {
                    Ok(Some(crossmap)) => outcome.crossmaps.push(crossmap),
                    Ok(None) => outcome.skipped += 1,
                    Err(err) => {
                        debug!(source = %self.schema.name, record = %record.native_code, reason = %err, "unresolved mapping");
                        outcome.unresolved.record(record.native_code.clone(), err.to_string());
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// One row per value of a multi-valued endpoint field (`BRCA1|BRCA2`),
    /// so each pair resolves or fails on its own.
    fn fan_out(&self, record: RawRecord) -> Vec<RawRecord> {
        let mut rows = vec![record];
        for rule in [&self.schema.source, &self.schema.target] {
            rows = rows
                .into_iter()
                .flat_map(|row| {
                    let values: Vec<String> = row.texts(&rule.field).into_iter().map(str::to_string).collect();
                    if values.len() < 2 {
                        return vec![row];
                    }
                    values
                        .into_iter()
                        .map(|value| {
                            let mut split = row.clone();
                            split.raw_fields.insert(rule.field.clone(), RawValue::Text(value));
                            split
                        })
                        .collect()
                })
                .collect();
        }
        rows
    }

    /// `Ok(None)` for rows excluded by the schema's filters.
    pub fn link_record(&self, record: &RawRecord) -> Result<Option<CrossMap>, LinkError> {
        let schema = self.schema;
        for filter in &schema.filters {
            let keep = record
                .texts(&filter.field)
                .iter()
                .any(|v| v.trim().starts_with(filter.prefix.as_str()));
            if !keep {
                return Ok(None);
            }
        }

        let source_concept_id = self.resolve(&schema.source, Endpoint::Source, record)?;
        let target_concept_id = self.resolve(&schema.target, Endpoint::Target, record)?;
        let mapping_type = self.mapping_type(record)?;
        let confidence = self.confidence(record)?;

        let mut properties = BTreeMap::new();
        for (key, rule) in &schema.properties {
            let raw = record.text(&rule.field).map(str::trim);
            let value = match raw {
                Some(raw) if rule.values.is_empty() => Some(raw.to_string()),
                Some(raw) => rule.values.get(raw).cloned().or_else(|| rule.default.clone()),
                None => rule.default.clone(),
            };
            if let Some(value) = value {
                properties.insert(key.clone(), value);
            }
        }

        Ok(Some(CrossMap {
            source_concept_id,
            target_concept_id,
            mapping_type,
            confidence,
            properties,
        }))
    }

    fn resolve(&self, rule: &EndpointRule, endpoint: Endpoint, record: &RawRecord) -> Result<ConceptId, LinkError> {
        let unresolved = |value: &str, reason: String| UnresolvedMapping {
            endpoint,
            vocabulary: rule.vocabulary.clone(),
            value: value.to_string(),
            reason,
        };
        let raw = record.text(&rule.field).ok_or_else(|| LinkError::InvalidField {
            field: rule.field.clone(),
            reason: "missing endpoint value".to_string(),
        })?;
        let resolved = match rule.by {
            ResolveBy::Code => {
                let code = rule
                    .code
                    .apply(raw)
                    .ok_or_else(|| unresolved(raw, "blank code".to_string()))?;
                self.resolver.resolve_code(&rule.vocabulary, &code)
            }
            ResolveBy::Term => self.resolver.resolve_term(&rule.vocabulary, raw),
        };
        resolved.map_err(|reason| unresolved(raw, reason).into())
    }

    fn mapping_type(&self, record: &RawRecord) -> Result<MappingType, LinkError> {
        match &self.schema.mapping {
            MappingRule::Fixed { mapping_type } => Ok(mapping_type.clone()),
            MappingRule::Field { field, default } => match record.text(field) {
                Some(raw) => raw
                    .parse()
                    .map_err(|reason| LinkError::InvalidField { field: field.clone(), reason }),
                None => default.clone().ok_or_else(|| LinkError::InvalidField {
                    field: field.clone(),
                    reason: "missing mapping type".to_string(),
                }),
            },
        }
    }

    /// Passed through as found; absent stays `None`.
    fn confidence(&self, record: &RawRecord) -> Result<Option<f64>, LinkError> {
        let Some(field) = &self.schema.confidence_field else {
            return Ok(None);
        };
        let value = match record.field(field) {
            None => return Ok(None),
            Some(termgraph_source::RawValue::Number(n)) => *n,
            Some(other) => {
                let text = other.as_text().unwrap_or_default().trim();
                text.parse::<f64>().map_err(|_| LinkError::InvalidField {
                    field: field.clone(),
                    reason: format!("confidence `{text}` is not a number"),
                })?
            }
        };
        if !(0.0..=1.0).contains(&value) {
            return Err(LinkError::InvalidField {
                field: field.clone(),
                reason: format!("confidence {value} outside [0, 1]"),
            });
        }
        Ok(Some(value))
    }
}

/// Drop cross-maps whose endpoints are not in the graph about to be
/// published.
pub fn retain_resolvable(
    crossmaps: Vec<CrossMap>,
    known: impl Fn(&ConceptId) -> bool,
) -> (Vec<CrossMap>, RecordIssues) {
    let mut issues = RecordIssues::default();
    let kept = crossmaps
        .into_iter()
        .filter(|m| {
            let missing = [&m.source_concept_id, &m.target_concept_id]
                .into_iter()
                .find(|id| !known(id));
            match missing {
                Some(id) => {
                    issues.record(id.to_string(), "endpoint not present in committed graph");
                    false
                }
                None => true,
            }
        })
        .collect();
    (kept, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgraph_model::Concept;

    fn v(name: &str) -> Vocabulary {
        Vocabulary::new(name).unwrap()
    }

    fn resolver() -> IdentityResolver {
        let r = IdentityResolver::new();
        let brca1 = Concept::new(v("HGNC"), "HGNC:1100", "BRCA1");
        r.stage(&v("HGNC"), [&brca1]);
        let hpo = [
            Concept::new(v("HPO"), "HP:0003002", "Breast carcinoma"),
            Concept::new(v("HPO"), "HP:0100615", "Ovarian neoplasm"),
        ];
        r.stage(&v("HPO"), hpo.iter());
        r
    }

    fn frequency() -> PropertyRule {
        PropertyRule {
            field: "frequency".into(),
            values: BTreeMap::from([
                ("HP:0040280".to_string(), "O".to_string()),
                ("HP:0040281".to_string(), "VF".to_string()),
            ]),
            default: Some("UN".into()),
        }
    }

    fn gene_hpo() -> CrossMapSchema {
        CrossMapSchema::new(
            "gene_hpo",
            EndpointRule::term(v("HGNC"), "gene_symbol"),
            EndpointRule::code(v("HPO"), "hpo_id"),
            MappingType::Annotates,
        )
        .with_property("frequency", frequency())
    }

    fn row(symbol: &str, hpo: &str, freq: &str) -> RawRecord {
        RawRecord::new("row:1")
            .with_field("gene_symbol", symbol)
            .with_field("hpo_id", hpo)
            .with_field("frequency", freq)
    }

    #[test]
    fn links_gene_symbol_to_phenotype() {
        let r = resolver();
        let schema = gene_hpo();
        let linker = Linker::new(&schema, &r);
        let m = linker
            .link_record(&row("BRCA1", "HP:0003002", "HP:0040281"))
            .unwrap()
            .unwrap();
        assert_eq!(m.source_concept_id, ConceptId::derive(&v("HGNC"), "HGNC:1100"));
        assert_eq!(m.target_concept_id, ConceptId::derive(&v("HPO"), "HP:0003002"));
        assert_eq!(m.properties["frequency"], "VF");
        assert_eq!(m.confidence, None);

        let unknown_freq = linker.link_record(&row("BRCA1", "HP:0100615", "-")).unwrap().unwrap();
        assert_eq!(unknown_freq.properties["frequency"], "UN");
    }

    #[test]
    fn unresolved_records_are_reported_not_fatal() {
        let r = resolver();
        let schema = gene_hpo();
        let outcome = Linker::new(&schema, &r)
            .link(vec![
                Ok(row("BRCA1", "HP:0003002", "-")),
                Ok(row("NOPE", "HP:0003002", "-")),
                Ok(row("BRCA1", "HP:9999999", "-")),
                Err(SourceError::malformed("line 4", "ragged row")),
            ])
            .unwrap();
        assert_eq!(outcome.crossmaps.len(), 1);
        assert_eq!(outcome.unresolved.count, 3);
        assert!(outcome.unresolved.samples[0].1.contains("unknown term"));
    }

    #[test]
    fn multi_valued_endpoints_link_each_value() {
        let r = resolver();
        let schema = gene_hpo();
        let row = RawRecord::new("row:1")
            .with_field("gene_symbol", RawValue::Many(vec!["BRCA1".into(), "NOPE".into()]))
            .with_field("hpo_id", RawValue::Many(vec!["HP:0003002".into(), "HP:0100615".into()]));
        let outcome = Linker::new(&schema, &r).link(vec![Ok(row)]).unwrap();

        assert_eq!(outcome.crossmaps.len(), 2);
        assert!(outcome
            .crossmaps
            .iter()
            .all(|m| m.source_concept_id == ConceptId::derive(&v("HGNC"), "HGNC:1100")));
        assert_eq!(outcome.unresolved.count, 2);
    }

    #[test]
    fn uncompiled_vocabulary_is_unresolved() {
        let r = resolver();
        let schema = CrossMapSchema::new(
            "hpo_ordo",
            EndpointRule::code(v("ORDO"), "database_id").with_code_rule(CodeRule::rewrite("ORPHA:", "Orphanet:")),
            EndpointRule::code(v("HPO"), "hpo_id"),
            MappingType::Annotates,
        )
        .keep_rows("database_id", "ORPHA:");
        let linker = Linker::new(&schema, &r);

        let omim_row = RawRecord::new("row:1")
            .with_field("database_id", "OMIM:604370")
            .with_field("hpo_id", "HP:0003002");
        assert_eq!(linker.link_record(&omim_row).unwrap(), None);

        let orpha_row = RawRecord::new("row:2")
            .with_field("database_id", "ORPHA:145")
            .with_field("hpo_id", "HP:0003002");
        match linker.link_record(&orpha_row) {
            Err(LinkError::Unresolved(u)) => {
                assert_eq!(u.endpoint, Endpoint::Source);
                assert!(u.reason.contains("not been compiled"));
            }
            other => panic!("expected unresolved, got {other:?}"),
        }
    }

    #[test]
    fn confidence_passes_through_and_stays_unset_when_absent() {
        let r = resolver();
        let schema = CrossMapSchema::new(
            "sssom",
            EndpointRule::code(v("HPO"), "subject_id"),
            EndpointRule::code(v("HPO"), "object_id"),
            MappingType::RelatedMatch,
        )
        .with_mapping_field("predicate_id", None)
        .with_confidence("confidence");
        let linker = Linker::new(&schema, &r);
        let base = RawRecord::new("row:1")
            .with_field("subject_id", "HP:0003002")
            .with_field("object_id", "HP:0100615")
            .with_field("predicate_id", "skos:closeMatch");

        let with = linker
            .link_record(&base.clone().with_field("confidence", "0.73"))
            .unwrap()
            .unwrap();
        assert_eq!(with.confidence, Some(0.73));
        assert_eq!(with.mapping_type, MappingType::CloseMatch);

        let without = linker.link_record(&base).unwrap().unwrap();
        assert_eq!(without.confidence, None);

        assert!(matches!(
            linker.link_record(&base.with_field("confidence", "1.7")),
            Err(LinkError::InvalidField { .. })
        ));
    }

    #[test]
    fn retain_resolvable_drops_dangling_endpoints() {
        let a = ConceptId::derive(&v("HGNC"), "HGNC:1100");
        let b = ConceptId::derive(&v("HPO"), "HP:0003002");
        let gone = ConceptId::derive(&v("HPO"), "HP:0000000");
        let maps = vec![
            CrossMap {
                source_concept_id: a.clone(),
                target_concept_id: b.clone(),
                mapping_type: MappingType::Annotates,
                confidence: None,
                properties: BTreeMap::new(),
            },
            CrossMap {
                source_concept_id: a.clone(),
                target_concept_id: gone.clone(),
                mapping_type: MappingType::Annotates,
                confidence: None,
                properties: BTreeMap::new(),
            },
        ];
        let (kept, issues) = retain_resolvable(maps, |id| *id == a || *id == b);
        assert_eq!(kept.len(), 1);
        assert_eq!(issues.count, 1);
        assert_eq!(issues.samples[0].0, gone.to_string());
    }
}
