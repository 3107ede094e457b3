//! Canonical normalizer: `RawRecord -> Concept + pending relationships`.
//!
//! Pure per record. Relationship targets stay as native codes here; they are
//! turned into ids (and checked for existence) when the slice is built.

use termgraph_model::{Concept, MetadataValue, RelationType, SOURCE_STATUS_KEY};
use termgraph_source::{RawRecord, RawValue};

use crate::error::NormalizationError;
use crate::schema::VocabularySchema;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingRelation {
    pub target_code: String,
    pub relation_type: RelationType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub concept: Concept,
    pub relations: Vec<PendingRelation>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    schema: VocabularySchema,
}

impl Normalizer {
    pub fn new(schema: VocabularySchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &VocabularySchema {
        &self.schema
    }

    pub fn normalize(&self, record: &RawRecord) -> Result<NormalizedRecord, NormalizationError> {
        let schema = &self.schema;
        let code = schema
            .code
            .apply(&record.native_code)
            .ok_or_else(|| NormalizationError::MissingField {
                field: "native_code".to_string(),
            })?;

        let preferred = self.first_text(record, &schema.preferred_term)?.ok_or_else(|| {
            NormalizationError::MissingField {
                field: schema.preferred_term.join("|"),
            }
        })?;
        let definition = self.first_text(record, &schema.definition)?;

        let synonyms: Vec<String> = schema
            .synonyms
            .iter()
            .flat_map(|f| record.texts(f))
            .map(str::to_string)
            .collect();

        let mut concept = Concept::new(schema.vocabulary.clone(), &code, &preferred)
            .with_synonyms(synonyms)
            .with_definition(definition);

        for (key, field) in &schema.metadata {
            if let Some(value) = record.field(field) {
                concept.metadata.insert(key.clone(), metadata_value(value));
            }
        }

        if let Some(rule) = &schema.status {
            let values = field_strings(record, &rule.field);
            let status = if rule.is_deprecated(values.iter().map(String::as_str)) {
                "deprecated"
            } else {
                "active"
            };
            concept
                .metadata
                .insert(SOURCE_STATUS_KEY.to_string(), MetadataValue::from(status));
        }

        let mut relations = Vec::new();
        for rule in &schema.relations {
            if !schema.allowed_relations.contains(&rule.relation) {
                return Err(NormalizationError::UndeclaredRelation {
                    vocabulary: schema.vocabulary.clone(),
                    relation: rule.relation.to_string(),
                });
            }
            let Some(value) = record.field(&rule.field) else {
                continue;
            };
            if let RawValue::Bool(_) = value {
                return Err(NormalizationError::UnexpectedShape {
                    field: rule.field.clone(),
                    detail: "boolean where target codes were expected".to_string(),
                });
            }
            let code_rule = rule.code.as_ref().unwrap_or(&schema.code);
            for raw in field_strings(record, &rule.field) {
                if let Some(target_code) = code_rule.apply(&raw) {
                    relations.push(PendingRelation {
                        target_code,
                        relation_type: rule.relation,
                    });
                }
            }
        }
        relations.sort();
        relations.dedup();

        Ok(NormalizedRecord { concept, relations })
    }

    /// First non-empty value among candidate fields. Multi-valued fields
    /// contribute their first element; scalars are a shape error.
    fn first_text(&self, record: &RawRecord, fields: &[String]) -> Result<Option<String>, NormalizationError> {
        for field in fields {
            match record.field(field) {
                None => continue,
                Some(RawValue::Text(s)) => return Ok(Some(s.trim().to_string())),
                Some(RawValue::Many(values)) => {
                    if let Some(first) = values.iter().map(|v| v.trim()).find(|v| !v.is_empty()) {
                        return Ok(Some(first.to_string()));
                    }
                }
                Some(other) => {
                    return Err(NormalizationError::UnexpectedShape {
                        field: field.clone(),
                        detail: format!("expected text, found {other:?}"),
                    })
                }
            }
        }
        Ok(None)
    }
}

/// Every value of a field as text, scalars included.
fn field_strings(record: &RawRecord, field: &str) -> Vec<String> {
    match record.field(field) {
        None | Some(RawValue::Null) => Vec::new(),
        Some(RawValue::Bool(b)) => vec![b.to_string()],
        Some(RawValue::Number(n)) => vec![number_text(*n)],
        Some(value) => value.texts().into_iter().map(str::to_string).collect(),
    }
}

fn number_text(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn metadata_value(value: &RawValue) -> MetadataValue {
    match value {
        RawValue::Bool(b) => MetadataValue::Bool(*b),
        RawValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => MetadataValue::Integer(*n as i64),
        RawValue::Number(n) => MetadataValue::Float(*n),
        RawValue::Text(s) => MetadataValue::Text(s.trim().to_string()),
        RawValue::Many(values) => MetadataValue::Text(values.join("|")),
        RawValue::Null => MetadataValue::Text(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CodeRule, StatusRule};
    use proptest::prelude::*;
    use termgraph_model::{ConceptId, Vocabulary};

    fn hgnc_schema() -> VocabularySchema {
        VocabularySchema::new(Vocabulary::new("HGNC").unwrap(), &["symbol"])
            .with_synonyms(&["alias_symbol", "prev_symbol"])
            .with_definition(&["name"])
            .with_metadata("locus_group", "locus_group")
            .with_status(StatusRule::active_when("status", &["Approved"]))
    }

    fn brca1() -> RawRecord {
        let mut r = RawRecord::new("HGNC:1100")
            .with_field("symbol", "BRCA1")
            .with_field("name", "BRCA1 DNA repair associated")
            .with_field("status", "Approved")
            .with_field("locus_group", "protein-coding gene")
            .with_field("prev_symbol", "RNF53");
        r.push_text("alias_symbol", "BRCC1".into());
        r.push_text("alias_symbol", "PPP1R53".into());
        r.push_text("alias_symbol", "brcc1".into());
        r.push_text("alias_symbol", "BRCC1".into());
        r
    }

    #[test]
    fn normalizes_hgnc_gene() {
        let n = Normalizer::new(hgnc_schema());
        let out = n.normalize(&brca1()).unwrap();
        let c = out.concept;
        assert_eq!(c.concept_id, ConceptId::derive(&Vocabulary::new("HGNC").unwrap(), "HGNC:1100"));
        assert_eq!(c.preferred_term, "BRCA1");
        assert_eq!(c.synonyms, vec!["BRCC1", "PPP1R53", "brcc1", "RNF53"]);
        assert_eq!(c.definition.as_deref(), Some("BRCA1 DNA repair associated"));
        assert_eq!(c.metadata["status"], MetadataValue::from("active"));
        assert_eq!(c.metadata["locus_group"], MetadataValue::from("protein-coding gene"));
        assert!(out.relations.is_empty());
    }

    #[test]
    fn missing_preferred_term_is_a_record_error() {
        let n = Normalizer::new(hgnc_schema());
        let err = n.normalize(&RawRecord::new("HGNC:5").with_field("name", "x")).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingField { .. }));

        let err = n.normalize(&RawRecord::new("  ").with_field("symbol", "X")).unwrap_err();
        assert_eq!(
            err,
            NormalizationError::MissingField {
                field: "native_code".into()
            }
        );
    }

    #[test]
    fn scalar_preferred_term_is_unexpected_shape() {
        let n = Normalizer::new(hgnc_schema());
        let rec = RawRecord::new("HGNC:5").with_field("symbol", RawValue::Number(5.0));
        assert!(matches!(
            n.normalize(&rec),
            Err(NormalizationError::UnexpectedShape { .. })
        ));
    }

    #[test]
    fn relations_and_status_from_owl_fields() {
        let schema = VocabularySchema::new(Vocabulary::new("HPO").unwrap(), &["label"])
            .with_relation("subClassOf", RelationType::IsA)
            .with_relation("BFO_0000050", RelationType::PartOf)
            .with_status(StatusRule::deprecated_when("deprecated", &["true"]));
        let mut rec = RawRecord::new("HP:0001250")
            .with_field("label", "Seizure")
            .with_field("deprecated", RawValue::Bool(true))
            .with_field("BFO_0000050", "HP:0000707");
        rec.push_text("subClassOf", "HP:0012638".into());
        rec.push_text("subClassOf", "HP:0012638".into());

        let out = Normalizer::new(schema).normalize(&rec).unwrap();
        assert_eq!(out.concept.metadata["status"], MetadataValue::from("deprecated"));
        assert_eq!(
            out.relations,
            vec![
                PendingRelation {
                    target_code: "HP:0000707".into(),
                    relation_type: RelationType::PartOf
                },
                PendingRelation {
                    target_code: "HP:0012638".into(),
                    relation_type: RelationType::IsA
                },
            ]
        );
    }

    #[test]
    fn undeclared_relation_is_rejected() {
        let schema = VocabularySchema::new(Vocabulary::new("NCIT").unwrap(), &["display_name"])
            .with_relation("parents", RelationType::IsA)
            .allowing(&[RelationType::PartOf]);
        let rec = RawRecord::new("C3262")
            .with_field("display_name", "Neoplasm")
            .with_field("parents", "C7062");
        assert!(matches!(
            Normalizer::new(schema).normalize(&rec),
            Err(NormalizationError::UndeclaredRelation { .. })
        ));
    }

    #[test]
    fn numeric_codes_and_prefix_rules() {
        let schema = VocabularySchema::new(Vocabulary::new("OMIM").unwrap(), &["Preferred Label"])
            .with_code(CodeRule::add("OMIM:"))
            .with_relation("Parents", RelationType::IsA);
        let rec = RawRecord::new("113705")
            .with_field("Preferred Label", "BREAST-OVARIAN CANCER, FAMILIAL, 1")
            .with_field("Parents", RawValue::Number(604370.0));
        let out = Normalizer::new(schema).normalize(&rec).unwrap();
        assert_eq!(out.concept.native_code, "OMIM:113705");
        assert_eq!(out.relations[0].target_code, "OMIM:604370");
    }

    proptest! {
        #[test]
        fn identity_is_stable_across_normalizations(code in "[A-Z]{2,5}:[0-9]{1,7}", term in "[A-Za-z0-9 ]{1,30}") {
            prop_assume!(!term.trim().is_empty());
            let n = Normalizer::new(hgnc_schema());
            let rec = RawRecord::new(code.clone()).with_field("symbol", term.as_str());
            let a = n.normalize(&rec).unwrap();
            let b = n.normalize(&rec).unwrap();
            prop_assert_eq!(&a.concept.concept_id, &b.concept.concept_id);
            prop_assert_eq!(a.concept.concept_id, ConceptId::derive(&Vocabulary::new("HGNC").unwrap(), &code));
        }
    }
}
