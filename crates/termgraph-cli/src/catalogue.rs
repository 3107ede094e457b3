//! Built-in vocabularies and cross-map sources.
//!
//! | name       | release file                         | adapter  |
//! |------------|--------------------------------------|----------|
//! | HGNC       | `hgnc_complete_set.txt`              | tabular  |
//! | NCIT       | `Thesaurus.txt` (headerless)         | tabular  |
//! | HPO        | `hp.owl`                             | owl      |
//! | ORDO       | `ORDO_en_*.owl`                      | owl      |
//! | OMIM       | BioPortal class CSV                  | tabular  |
//! | gene_hpo   | `genes_to_phenotype.txt`             | tabular  |
//! | hpo_ordo   | `phenotype.hpoa` (ORPHA rows)        | tabular  |
//! | gene_ncit  | `NCIt-HGNC_Mapping.txt`              | tabular  |
//! | gene_omim  | BioPortal class CSV (`Gene Symbol`)  | tabular  |
//! | sssom      | SSSOM TSV                            | tabular  |
//!
//! Entries in the config pick a built-in by name (or `kind`) and may replace
//! its schema or layout.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use termgraph_compile::{
    CodeRule, CompileRequest, CrossMapJob, CrossMapSchema, EndpointRule, PropertyRule, StatusRule,
    VocabularyJob, VocabularySchema,
};
use termgraph_ingest_json::{JsonApiAdapter, JsonLayout};
use termgraph_ingest_rdfowl::{OwlAdapter, OwlLayout};
use termgraph_ingest_tabular::{TabularAdapter, TabularLayout};
use termgraph_model::{MappingType, RelationType, Vocabulary};
use termgraph_source::{Fetcher, SourceAdapter};

use crate::config::{AppConfig, CrossMapEntry, CrossMapKind, VocabularyEntry, VocabularyKind};

const OMIM_IRI: &str = "http://purl.bioontology.org/ontology/OMIM/";
const ORDO_NS: &str = "http://www.orpha.net/ORDO/Orphanet_";

fn vocab(name: &str) -> Result<Vocabulary> {
    Vocabulary::new(name).with_context(|| format!("invalid vocabulary name `{name}`"))
}

// ============================================================================
// Vocabulary schemas
// ============================================================================

pub fn hgnc_layout() -> TabularLayout {
    // Multi-valued cells are quoted: "BRCC1|RNF53".
    let mut layout = TabularLayout::tsv()
        .with_code_column("hgnc_id")
        .with_required(&["symbol", "name", "status"])
        .with_multi_valued("alias_symbol", '|')
        .with_multi_valued("prev_symbol", '|')
        .with_multi_valued("alias_name", '|');
    layout.quoting = true;
    layout
}

pub fn hgnc_schema(vocabulary: Vocabulary) -> VocabularySchema {
    VocabularySchema::new(vocabulary, &["symbol"])
        .with_synonyms(&["alias_symbol", "prev_symbol", "alias_name"])
        .with_definition(&["name"])
        .with_metadata("locus_group", "locus_group")
        .with_metadata("location", "location")
        .with_metadata("entrez_id", "entrez_id")
        .with_metadata("ensembl_gene_id", "ensembl_gene_id")
        .with_status(StatusRule::active_when("status", &["Approved"]))
}

pub fn ncit_layout() -> TabularLayout {
    TabularLayout::tsv()
        .headerless()
        .with_columns(&[
            "code",
            "concept_iri",
            "parents",
            "synonyms",
            "definition",
            "display_name",
            "concept_status",
            "semantic_type",
            "concept_in_subset",
        ])
        .with_code_column("code")
        .with_multi_valued("parents", '|')
        .with_multi_valued("synonyms", '|')
        .with_multi_valued("concept_status", '|')
        .with_multi_valued("semantic_type", '|')
        .flexible()
}

pub fn ncit_schema(vocabulary: Vocabulary) -> VocabularySchema {
    VocabularySchema::new(vocabulary, &["display_name", "synonyms"])
        .with_synonyms(&["synonyms"])
        .with_definition(&["definition"])
        .with_metadata("semantic_type", "semantic_type")
        .with_status(StatusRule::deprecated_when(
            "concept_status",
            &["Obsolete_Concept", "Retired_Concept"],
        ))
        .with_relation("parents", RelationType::IsA)
}

/// Shared by the OBO-style OWL dumps.
fn owl_schema(vocabulary: Vocabulary, synonyms: &[&str], definition: &[&str]) -> VocabularySchema {
    VocabularySchema::new(vocabulary, &["label"])
        .with_synonyms(synonyms)
        .with_definition(definition)
        .with_status(StatusRule::deprecated_when("deprecated", &["true"]))
        .with_relation("subClassOf", RelationType::IsA)
}

pub fn hpo_layout() -> OwlLayout {
    OwlLayout::obo("HP")
}

pub fn hpo_schema(vocabulary: Vocabulary) -> VocabularySchema {
    owl_schema(
        vocabulary,
        &[
            "hasExactSynonym",
            "hasRelatedSynonym",
            "hasBroadSynonym",
            "hasNarrowSynonym",
        ],
        &["IAO_0000115"],
    )
    .with_metadata("comment", "comment")
    .with_relation("BFO_0000050", RelationType::PartOf)
    .with_relation("IAO_0100001", RelationType::ReplacedBy)
}

pub fn ordo_layout() -> OwlLayout {
    OwlLayout::default().with_namespace(ORDO_NS)
}

pub fn ordo_schema(vocabulary: Vocabulary) -> VocabularySchema {
    owl_schema(vocabulary, &["alternative_term"], &["definition"])
        .with_relation("BFO_0000050", RelationType::PartOf)
}

pub fn omim_layout() -> TabularLayout {
    TabularLayout::csv()
        .with_code_column("Class ID")
        .with_required(&["Preferred Label"])
        .with_multi_valued("Synonyms", '|')
        .with_multi_valued("Parents", '|')
}

pub fn omim_schema(vocabulary: Vocabulary) -> VocabularySchema {
    VocabularySchema::new(vocabulary, &["Preferred Label"])
        .with_code(CodeRule::rewrite(OMIM_IRI, "OMIM:"))
        .with_synonyms(&["Synonyms"])
        .with_definition(&["Definitions"])
        .with_status(StatusRule::deprecated_when("Obsolete", &["true"]))
        .with_relation("Parents", RelationType::IsA)
}

/// Schema for a built-in kind; `None` for generic kinds.
pub fn builtin_schema(kind: VocabularyKind, vocabulary: Vocabulary) -> Option<VocabularySchema> {
    match kind {
        VocabularyKind::Hgnc => Some(hgnc_schema(vocabulary)),
        VocabularyKind::Ncit => Some(ncit_schema(vocabulary)),
        VocabularyKind::Hpo => Some(hpo_schema(vocabulary)),
        VocabularyKind::Ordo => Some(ordo_schema(vocabulary)),
        VocabularyKind::Omim => Some(omim_schema(vocabulary)),
        VocabularyKind::Tabular | VocabularyKind::Owl | VocabularyKind::JsonApi => None,
    }
}

// ============================================================================
// Cross-map schemas
// ============================================================================

/// HPO frequency terms to the annotation frequency classes.
fn frequency_property() -> PropertyRule {
    let values = [
        ("HP:0040280", "O"),
        ("HP:0040281", "VF"),
        ("HP:0040282", "F"),
        ("HP:0040283", "OC"),
        ("HP:0040284", "VR"),
        ("HP:0040285", "E"),
    ];
    PropertyRule {
        field: "frequency".to_string(),
        values: values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        default: Some("UN".to_string()),
    }
}

pub fn gene_hpo_layout() -> TabularLayout {
    TabularLayout::tsv().with_required(&["gene_symbol", "hpo_id"])
}

pub fn gene_hpo_schema(name: &str) -> Result<CrossMapSchema> {
    Ok(CrossMapSchema::new(
        name,
        EndpointRule::term(vocab("HGNC")?, "gene_symbol"),
        EndpointRule::code(vocab("HPO")?, "hpo_id"),
        MappingType::Annotates,
    )
    .with_property("frequency", frequency_property()))
}

pub fn hpo_ordo_layout() -> TabularLayout {
    TabularLayout::tsv()
        .with_comment('#')
        .with_required(&["database_id", "hpo_id"])
}

pub fn hpo_ordo_schema(name: &str) -> Result<CrossMapSchema> {
    Ok(CrossMapSchema::new(
        name,
        EndpointRule::code(vocab("HPO")?, "hpo_id"),
        EndpointRule::code(vocab("ORDO")?, "database_id")
            .with_code_rule(CodeRule::rewrite("ORPHA:", "Orphanet:")),
        MappingType::Annotates,
    )
    .keep_rows("database_id", "ORPHA:")
    .with_property("frequency", frequency_property())
    .with_property(
        "qualifier",
        PropertyRule {
            field: "qualifier".to_string(),
            values: BTreeMap::new(),
            default: None,
        },
    ))
}

/// EVS `NCIt-HGNC_Mapping.txt`: two headerless columns.
pub fn gene_ncit_layout() -> TabularLayout {
    TabularLayout::tsv()
        .headerless()
        .with_columns(&["ncit_code", "hgnc_id"])
}

pub fn gene_ncit_schema(name: &str) -> Result<CrossMapSchema> {
    Ok(CrossMapSchema::new(
        name,
        EndpointRule::code(vocab("NCIT")?, "ncit_code"),
        EndpointRule::code(vocab("HGNC")?, "hgnc_id"),
        MappingType::ExactMatch,
    ))
}

/// The BioPortal OMIM class CSV again, read for its gene symbol column.
pub fn gene_omim_layout() -> TabularLayout {
    TabularLayout::csv()
        .with_required(&["Class ID"])
        .with_multi_valued("Gene Symbol", '|')
}

pub fn gene_omim_schema(name: &str) -> Result<CrossMapSchema> {
    Ok(CrossMapSchema::new(
        name,
        EndpointRule::code(vocab("OMIM")?, "Class ID").with_code_rule(CodeRule::rewrite(OMIM_IRI, "OMIM:")),
        EndpointRule::term(vocab("HGNC")?, "Gene Symbol"),
        MappingType::Annotates,
    )
    // Classes without a gene symbol are not mappings.
    .keep_rows("Gene Symbol", ""))
}

pub fn sssom_layout() -> TabularLayout {
    TabularLayout::tsv()
        .with_comment('#')
        .with_required(&["subject_id", "predicate_id", "object_id"])
}

pub fn sssom_schema(name: &str, subject: Vocabulary, object: Vocabulary) -> CrossMapSchema {
    CrossMapSchema::new(
        name,
        EndpointRule::code(subject, "subject_id"),
        EndpointRule::code(object, "object_id"),
        MappingType::RelatedMatch,
    )
    .with_mapping_field("predicate_id", Some(MappingType::RelatedMatch))
    .with_confidence("confidence")
    .with_property(
        "justification",
        PropertyRule {
            field: "mapping_justification".to_string(),
            values: BTreeMap::new(),
            default: None,
        },
    )
}

// ============================================================================
// Jobs
// ============================================================================

pub fn vocabulary_job(entry: &VocabularyEntry, fetcher: &Arc<Fetcher>) -> Result<VocabularyJob> {
    let vocabulary = vocab(&entry.name)?;
    let kind = entry.resolved_kind()?;
    let schema = match (&entry.schema, builtin_schema(kind, vocabulary.clone())) {
        (Some(schema), _) => schema.clone(),
        (None, Some(schema)) => schema,
        (None, None) => bail!("vocabulary `{}` of kind {kind:?} needs a `schema`", entry.name),
    };
    if schema.vocabulary != vocabulary {
        bail!(
            "schema of `{}` declares vocabulary {}",
            entry.name,
            schema.vocabulary
        );
    }
    schema
        .validate()
        .with_context(|| format!("invalid schema for `{}`", entry.name))?;

    let descriptor = entry.source.descriptor(vocabulary.as_str());
    let fetcher = fetcher.clone();
    let adapter: Arc<dyn SourceAdapter> = match kind {
        VocabularyKind::Hgnc | VocabularyKind::Ncit | VocabularyKind::Omim | VocabularyKind::Tabular => {
            let layout = entry.tabular.clone().unwrap_or_else(|| match kind {
                VocabularyKind::Hgnc => hgnc_layout(),
                VocabularyKind::Ncit => ncit_layout(),
                VocabularyKind::Omim => omim_layout(),
                _ => TabularLayout::default(),
            });
            Arc::new(TabularAdapter::new(descriptor, fetcher, layout))
        }
        VocabularyKind::Hpo | VocabularyKind::Ordo | VocabularyKind::Owl => {
            let layout = entry.owl.clone().unwrap_or_else(|| match kind {
                VocabularyKind::Hpo => hpo_layout(),
                VocabularyKind::Ordo => ordo_layout(),
                _ => OwlLayout::default(),
            });
            Arc::new(OwlAdapter::new(descriptor, fetcher, layout))
        }
        VocabularyKind::JsonApi => {
            let layout = entry.json.clone().unwrap_or_else(JsonLayout::bioportal);
            Arc::new(JsonApiAdapter::new(descriptor, fetcher, layout))
        }
    };
    Ok(VocabularyJob { adapter, schema })
}

pub fn crossmap_job(entry: &CrossMapEntry, fetcher: &Arc<Fetcher>) -> Result<CrossMapJob> {
    let kind = entry.resolved_kind()?;
    let builtin = match kind {
        CrossMapKind::GeneHpo => Some((gene_hpo_schema(&entry.name)?, gene_hpo_layout())),
        CrossMapKind::HpoOrdo => Some((hpo_ordo_schema(&entry.name)?, hpo_ordo_layout())),
        CrossMapKind::GeneNcit => Some((gene_ncit_schema(&entry.name)?, gene_ncit_layout())),
        CrossMapKind::GeneOmim => Some((gene_omim_schema(&entry.name)?, gene_omim_layout())),
        CrossMapKind::Sssom => {
            let (Some(subject), Some(object)) = (&entry.subject_vocabulary, &entry.object_vocabulary) else {
                bail!(
                    "SSSOM cross-map `{}` needs subject_vocabulary and object_vocabulary",
                    entry.name
                );
            };
            Some((sssom_schema(&entry.name, vocab(subject)?, vocab(object)?), sssom_layout()))
        }
        CrossMapKind::Table => None,
    };
    let (schema, layout) = match (entry.schema.clone(), builtin) {
        (Some(schema), Some((_, layout))) => (schema, layout),
        (Some(schema), None) => (schema, TabularLayout::default()),
        (None, Some(pair)) => pair,
        (None, None) => bail!("cross-map `{}` of kind table needs a `schema`", entry.name),
    };
    if schema.name != entry.name {
        bail!("schema of cross-map `{}` is named `{}`", entry.name, schema.name);
    }
    let layout = entry.tabular.clone().unwrap_or(layout);
    let adapter = TabularAdapter::new(entry.source.descriptor(&entry.name), fetcher.clone(), layout);
    Ok(CrossMapJob {
        adapter: Arc::new(adapter),
        schema,
    })
}

/// Build the request for every configured source, or for `only` (vocabulary
/// and cross-map names, case-insensitive) when non-empty.
pub fn build_request(config: &AppConfig, fetcher: &Arc<Fetcher>, only: &[String]) -> Result<CompileRequest> {
    let wanted: BTreeSet<String> = only.iter().map(|n| n.to_ascii_lowercase()).collect();
    let selected = |name: &str| wanted.is_empty() || wanted.contains(&name.to_ascii_lowercase());

    let mut request = CompileRequest::new();
    for entry in config.vocabularies.iter().filter(|e| selected(&e.name)) {
        let job = vocabulary_job(entry, fetcher)?;
        request = request.vocabulary(job.adapter, job.schema);
    }
    for entry in config.crossmaps.iter().filter(|e| selected(&e.name)) {
        let job = crossmap_job(entry, fetcher)?;
        request = request.crossmap(job.adapter, job.schema);
    }

    let known: BTreeSet<String> = config
        .vocabularies
        .iter()
        .map(|e| e.name.to_ascii_lowercase())
        .chain(config.crossmaps.iter().map(|e| e.name.to_ascii_lowercase()))
        .collect();
    if let Some(missing) = wanted.iter().find(|n| !known.contains(*n)) {
        bail!("`{missing}` is not configured");
    }
    Ok(request)
}
