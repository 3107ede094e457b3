//! Ontology-dump source adapter (OWL as RDF/XML, Turtle, N-Triples).
//!
//! Parses the whole document with Sophia, then groups statements by subject:
//! every IRI subject inside one of the declared namespaces becomes a
//! [`RawRecord`]. Field names are predicate local names (`label`,
//! `subClassOf`, `hasExactSynonym`, `IAO_0000115`, `deprecated`, ...).
//!
//! IRI-valued objects inside the declared namespaces are rewritten to codes,
//! so `subClassOf` carries `HP:0000118` rather than the full IRI. Existential
//! restrictions are flattened:
//!
//! ```text
//!   X subClassOf [ owl:onProperty BFO_0000050 ; owl:someValuesFrom Y ]
//!     ==>  X.BFO_0000050 += Y
//! ```

mod terms;

pub use terms::RdfFormat;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use termgraph_source::{
    Fetcher, Payload, RawRecord, RecordStream, SourceAdapter, SourceDescriptor, SourceError,
};

use terms::{local_name, parse_statements, RdfNode, RdfObject, RdfStatement};

const RDFS_SUBCLASS_OF: &str = "http://www.w3.org/2000/01/rdf-schema#subClassOf";
const OWL_ON_PROPERTY: &str = "http://www.w3.org/2002/07/owl#onProperty";
const OWL_SOME_VALUES_FROM: &str = "http://www.w3.org/2002/07/owl#someValuesFrom";

// ============================================================================
// Layout
// ============================================================================

/// How entity IRIs turn into native codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeStyle {
    /// `.../obo/HP_0000118` -> `HP:0000118`
    Curie,
    /// `.../obo/HP_0000118` -> `HP_0000118`
    LocalName,
    /// Full IRI.
    Iri,
}

impl CodeStyle {
    pub fn code_for(self, iri: &str) -> String {
        match self {
            CodeStyle::Curie => local_name(iri).replacen('_', ":", 1),
            CodeStyle::LocalName => local_name(iri).to_string(),
            CodeStyle::Iri => iri.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwlLayout {
    /// Detected from the location extension when unset.
    pub format: Option<RdfFormat>,
    /// IRI prefixes owned by the vocabulary; empty accepts every IRI subject.
    pub namespaces: Vec<String>,
    pub code_style: CodeStyle,
}

impl Default for OwlLayout {
    fn default() -> Self {
        Self {
            format: None,
            namespaces: Vec::new(),
            code_style: CodeStyle::Curie,
        }
    }
}

impl OwlLayout {
    pub fn obo(prefix: &str) -> Self {
        Self {
            namespaces: vec![format!("http://purl.obolibrary.org/obo/{prefix}_")],
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespaces.push(namespace.to_string());
        self
    }

    pub fn with_format(mut self, format: RdfFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_code_style(mut self, style: CodeStyle) -> Self {
        self.code_style = style;
        self
    }

    fn owns(&self, iri: &str) -> bool {
        self.namespaces.is_empty() || self.namespaces.iter().any(|ns| iri.starts_with(ns))
    }

    fn object_text(&self, node: &RdfNode) -> Option<String> {
        match node {
            RdfNode::Iri(iri) if self.owns(iri) => Some(self.code_style.code_for(iri)),
            RdfNode::Iri(iri) => Some(iri.clone()),
            RdfNode::BlankNode(_) => None,
        }
    }
}

// ============================================================================
// Record grouping
// ============================================================================

fn group_records(layout: &OwlLayout, statements: Vec<RdfStatement>) -> Vec<RawRecord> {
    // Blank-node restriction bodies: (onProperty, someValuesFrom).
    let mut restrictions: HashMap<String, (Option<String>, Option<RdfNode>)> = HashMap::new();
    for stmt in &statements {
        let RdfNode::BlankNode(b) = &stmt.subject else {
            continue;
        };
        let RdfObject::Node(obj) = &stmt.object else {
            continue;
        };
        let entry = restrictions.entry(b.clone()).or_default();
        match (stmt.predicate_iri.as_str(), obj) {
            (OWL_ON_PROPERTY, RdfNode::Iri(p)) => entry.0 = Some(p.clone()),
            (OWL_SOME_VALUES_FROM, node) => entry.1 = Some(node.clone()),
            _ => {}
        }
    }

    let mut by_subject: BTreeMap<String, RawRecord> = BTreeMap::new();
    for stmt in statements {
        let RdfNode::Iri(subject) = &stmt.subject else {
            continue;
        };
        if !layout.owns(subject) {
            continue;
        }
        let code = layout.code_style.code_for(subject);
        let record = by_subject
            .entry(code.clone())
            .or_insert_with(|| RawRecord::new(code).with_field("iri", subject.as_str()));

        match &stmt.object {
            RdfObject::Literal(lit) => {
                record.push_text(local_name(&stmt.predicate_iri), lit.lexical.clone());
            }
            RdfObject::Node(RdfNode::BlankNode(b)) if stmt.predicate_iri == RDFS_SUBCLASS_OF => {
                if let Some((Some(prop), Some(target))) = restrictions.get(b) {
                    if let Some(text) = layout.object_text(target) {
                        record.push_text(local_name(prop), text);
                    }
                }
            }
            RdfObject::Node(node) => {
                if let Some(text) = layout.object_text(node) {
                    record.push_text(local_name(&stmt.predicate_iri), text);
                }
            }
        }
    }
    by_subject.into_values().collect()
}

// ============================================================================
// Adapter
// ============================================================================

pub struct OwlAdapter {
    descriptor: SourceDescriptor,
    fetcher: Arc<Fetcher>,
    layout: OwlLayout,
}

impl OwlAdapter {
    pub fn new(descriptor: SourceDescriptor, fetcher: Arc<Fetcher>, layout: OwlLayout) -> Self {
        Self {
            descriptor,
            fetcher,
            layout,
        }
    }

    fn format_for(&self, payload: &Payload) -> Result<RdfFormat, SourceError> {
        self.layout
            .format
            .or_else(|| RdfFormat::from_locator(&payload.locator))
            .ok_or_else(|| {
                SourceError::format_changed(
                    self.name(),
                    format!("cannot infer RDF serialization of {}", payload.locator),
                )
            })
    }
}

#[async_trait]
impl SourceAdapter for OwlAdapter {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    async fn fetch(&self) -> Result<Payload, SourceError> {
        self.fetcher.fetch(&self.descriptor).await
    }

    fn parse<'a>(&'a self, payload: &'a Payload) -> Result<RecordStream<'a>, SourceError> {
        let format = self.format_for(payload)?;
        let statements = parse_statements(&payload.bytes, format)
            .map_err(|reason| SourceError::format_changed(self.name(), reason))?;
        let records = group_records(&self.layout, statements);
        tracing::debug!(source = %self.name(), records = records.len(), "grouped ontology subjects");
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HPO_TTL: &str = r#"
@prefix obo: <http://purl.obolibrary.org/obo/> .
@prefix owl: <http://www.w3.org/2002/07/owl#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
@prefix oboInOwl: <http://www.geneontology.org/formats/oboInOwl#> .

<http://purl.obolibrary.org/obo/hp.owl> a owl:Ontology .

obo:HP_0000118 a owl:Class ;
    rdfs:label "Phenotypic abnormality" ;
    obo:IAO_0000115 "A phenotypic abnormality." .

obo:HP_0001627 a owl:Class ;
    rdfs:label "Abnormal heart morphology" ;
    oboInOwl:hasExactSynonym "Abnormality of cardiac morphology" , "Cardiac abnormality" ;
    rdfs:subClassOf obo:HP_0000118 ;
    rdfs:subClassOf [ a owl:Restriction ;
                      owl:onProperty obo:BFO_0000050 ;
                      owl:someValuesFrom obo:HP_0000118 ] .

obo:HP_0000001 a owl:Class ;
    owl:deprecated true ;
    obo:IAO_0100001 obo:HP_0000118 .
"#;

    async fn parse(ttl: &str, layout: OwlLayout) -> Vec<RawRecord> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hp.ttl");
        std::fs::write(&path, ttl).unwrap();
        let adapter = OwlAdapter::new(
            SourceDescriptor::new("HPO", path.to_str().unwrap()),
            Arc::new(Fetcher::default()),
            layout,
        );
        let payload = adapter.fetch().await.unwrap();
        let records: Result<Vec<_>, _> = adapter.parse(&payload).unwrap().collect();
        records.unwrap()
    }

    #[tokio::test]
    async fn one_record_per_owned_subject() {
        let records = parse(HPO_TTL, OwlLayout::obo("HP")).await;
        let codes: Vec<&str> = records.iter().map(|r| r.native_code.as_str()).collect();
        assert_eq!(codes, vec!["HP:0000001", "HP:0000118", "HP:0001627"]);

        let heart = &records[2];
        assert_eq!(heart.text("label"), Some("Abnormal heart morphology"));
        assert_eq!(heart.text("subClassOf"), Some("HP:0000118"));
        assert_eq!(heart.texts("hasExactSynonym").len(), 2);
        assert_eq!(heart.text("BFO_0000050"), Some("HP:0000118"));

        let obsolete = &records[0];
        assert_eq!(obsolete.text("deprecated"), Some("true"));
        assert_eq!(obsolete.text("IAO_0100001"), Some("HP:0000118"));
    }

    #[tokio::test]
    async fn broken_document_is_a_format_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ttl");
        std::fs::write(&path, "@prefix obo: <http://x/> .\nobo:a obo:b \"unterminated .\n").unwrap();
        let adapter = OwlAdapter::new(
            SourceDescriptor::new("HPO", path.to_str().unwrap()),
            Arc::new(Fetcher::default()),
            OwlLayout::default(),
        );
        let payload = adapter.fetch().await.unwrap();
        assert!(matches!(
            adapter.parse(&payload).err(),
            Some(SourceError::FormatChanged { .. })
        ));
    }

    #[test]
    fn code_styles() {
        let iri = "http://www.orpha.net/ORDO/Orphanet_558";
        assert_eq!(CodeStyle::Curie.code_for(iri), "Orphanet:558");
        assert_eq!(CodeStyle::LocalName.code_for(iri), "Orphanet_558");
        assert_eq!(CodeStyle::Iri.code_for(iri), iri);
    }
}
