//! Integration tests for the complete termgraph pipeline
//!
//! These tests run real release files through every crate:
//! - flat-file / OWL adapters → normalizer → linker → compiler
//! - file-backed stores → current pointer → reopened snapshot
//! - post-commit embedding → vector store
//!
//! Run with: cargo test --test integration_tests

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use termgraph_compile::{
    CompileRequest, Coordinator, CoordinatorConfig, CrossMapSchema, EndpointRule, PropertyRule,
    StatusRule, VocabularySchema,
};
use termgraph_embed::{EmbeddingConfig, EmbeddingPipeline, TokenHashEmbedder};
use termgraph_ingest_rdfowl::{OwlAdapter, OwlLayout};
use termgraph_ingest_tabular::{TabularAdapter, TabularLayout};
use termgraph_model::{
    ConceptId, EmbeddingOutcome, Lifecycle, MappingType, MetadataValue, RelationType, RunStatus,
    SliceKey, Vocabulary,
};
use termgraph_source::{Fetcher, SourceDescriptor};
use termgraph_storage::{DocumentStore, RunLog, Stores, VectorStore};

// ============================================================================
// Release fixtures
// ============================================================================

const HGNC_V1: &str = "hgnc_id\tsymbol\tname\tstatus\talias_symbol
HGNC:1100\tBRCA1\tBRCA1 DNA repair associated\tApproved\tRNF53|BRCC1
HGNC:1101\tBRCA2\tBRCA2 DNA repair associated\tApproved\tFANCD1
HGNC:9999\tOLDGENE\tobsolete gene\tEntry Withdrawn\t
";

// BRCA1 renamed, BRCA2 dropped.
const HGNC_V2: &str = "hgnc_id\tsymbol\tname\tstatus\talias_symbol
HGNC:1100\tBRCA1\tBRCA1 DNA repair associated protein\tApproved\tRNF53|BRCC1
HGNC:9999\tOLDGENE\tobsolete gene\tEntry Withdrawn\t
";

const HPO_TTL: &str = r#"
@prefix obo: <http://purl.obolibrary.org/obo/> .
@prefix owl: <http://www.w3.org/2002/07/owl#> .
@prefix rdfs: <http://www.w3.org/2000/01/rdf-schema#> .
@prefix oboInOwl: <http://www.geneontology.org/formats/oboInOwl#> .

obo:HP_0000118 a owl:Class ;
    rdfs:label "Phenotypic abnormality" .

obo:HP_0003002 a owl:Class ;
    rdfs:label "Breast carcinoma" ;
    oboInOwl:hasExactSynonym "Breast cancer" ;
    rdfs:subClassOf obo:HP_0000118 .

obo:HP_0002664 a owl:Class ;
    rdfs:label "Neoplasm" ;
    rdfs:subClassOf obo:HP_0000118 .
"#;

const GENES_TO_PHENOTYPE: &str = "ncbi_gene_id\tgene_symbol\thpo_id\thpo_name\tfrequency\tdisease_id
672\tBRCA1\tHP:0003002\tBreast carcinoma\tHP:0040281\tOMIM:604370
675\tBRCA2\tHP:0003002\tBreast carcinoma\t-\tOMIM:612555
675\tBRCA2\tHP:0002664\tNeoplasm\tHP:0040283\tOMIM:612555
";

fn hgnc() -> Vocabulary {
    Vocabulary::new("HGNC").unwrap()
}

fn hpo() -> Vocabulary {
    Vocabulary::new("HPO").unwrap()
}

fn write(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path.to_str().unwrap().to_string()
}

fn hgnc_job(location: &str, fetcher: &Arc<Fetcher>) -> (Arc<TabularAdapter>, VocabularySchema) {
    let layout = TabularLayout::tsv()
        .with_code_column("hgnc_id")
        .with_multi_valued("alias_symbol", '|');
    let schema = VocabularySchema::new(hgnc(), &["symbol"])
        .with_synonyms(&["alias_symbol"])
        .with_definition(&["name"])
        .with_status(StatusRule::active_when("status", &["Approved"]));
    let adapter = TabularAdapter::new(SourceDescriptor::new("HGNC", location), fetcher.clone(), layout);
    (Arc::new(adapter), schema)
}

fn hpo_job(descriptor: SourceDescriptor, fetcher: &Arc<Fetcher>) -> (Arc<OwlAdapter>, VocabularySchema) {
    let schema = VocabularySchema::new(hpo(), &["label"])
        .with_synonyms(&["hasExactSynonym"])
        .with_relation("subClassOf", RelationType::IsA);
    (
        Arc::new(OwlAdapter::new(descriptor, fetcher.clone(), OwlLayout::obo("HP"))),
        schema,
    )
}

fn gene_hpo_job(location: &str, fetcher: &Arc<Fetcher>) -> (Arc<TabularAdapter>, CrossMapSchema) {
    let frequency = PropertyRule {
        field: "frequency".to_string(),
        values: BTreeMap::from([
            ("HP:0040281".to_string(), "VF".to_string()),
            ("HP:0040283".to_string(), "OC".to_string()),
        ]),
        default: Some("UN".to_string()),
    };
    let schema = CrossMapSchema::new(
        "gene_hpo",
        EndpointRule::term(hgnc(), "gene_symbol"),
        EndpointRule::code(hpo(), "hpo_id"),
        MappingType::Annotates,
    )
    .with_property("frequency", frequency);
    let adapter = TabularAdapter::new(
        SourceDescriptor::new("gene_hpo", location),
        fetcher.clone(),
        TabularLayout::tsv(),
    );
    (Arc::new(adapter), schema)
}

fn coordinator(stores: &Stores) -> Coordinator {
    let config = EmbeddingConfig {
        dimension: 32,
        ..EmbeddingConfig::default()
    };
    let pipeline = EmbeddingPipeline::new(stores, Arc::new(TokenHashEmbedder::new(32)), &config);
    Coordinator::new(stores.clone(), CoordinatorConfig::default()).with_embedding(Arc::new(pipeline))
}

// ============================================================================
// Full pipeline over file-backed stores
// ============================================================================

#[tokio::test]
async fn test_release_files_compile_embed_and_survive_restart() {
    let dir = tempdir().unwrap();
    let releases = dir.path().join("releases");
    std::fs::create_dir_all(&releases).unwrap();
    let store_dir = dir.path().join("stores");
    let fetcher = Arc::new(Fetcher::default());

    let hgnc_v1 = write(&releases, "hgnc_v1.txt", HGNC_V1);
    let hgnc_v2 = write(&releases, "hgnc_v2.txt", HGNC_V2);
    let hpo_path = write(&releases, "hp.ttl", HPO_TTL);
    let g2p = write(&releases, "genes_to_phenotype.txt", GENES_TO_PHENOTYPE);

    // --- run 1: everything -------------------------------------------------
    let stores = Stores::open_dir(&store_dir).unwrap();
    let (hgnc_adapter, hgnc_schema) = hgnc_job(&hgnc_v1, &fetcher);
    let (hpo_adapter, hpo_schema) = hpo_job(SourceDescriptor::new("HPO", &hpo_path), &fetcher);
    let (g2p_adapter, g2p_schema) = gene_hpo_job(&g2p, &fetcher);
    let request = CompileRequest::new()
        .vocabulary(hgnc_adapter, hgnc_schema)
        .vocabulary(hpo_adapter, hpo_schema)
        .crossmap(g2p_adapter, g2p_schema);

    let first = coordinator(&stores).compile(request).await.unwrap();
    assert_eq!(first.status, RunStatus::Committed, "{:?}", first.failed);
    assert_eq!(first.committed.len(), 3);
    assert_eq!(first.committed[&SliceKey::Vocabulary(hgnc())].created, 3);
    assert_eq!(first.committed[&SliceKey::Vocabulary(hpo())].relationships, 2);
    assert_eq!(first.committed[&SliceKey::CrossMap("gene_hpo".to_string())].crossmaps, 3);
    assert!(matches!(
        first.embedding,
        Some(EmbeddingOutcome::Completed { embedded: 6, .. })
    ));

    let brca1 = ConceptId::derive(&hgnc(), "HGNC:1100");
    let brca2 = ConceptId::derive(&hgnc(), "HGNC:1101");
    let brca1_v1 = stores.vectors.get(&brca1, "token-hash-32").unwrap().unwrap();

    // --- run 2: renamed + dropped gene ------------------------------------
    let (hgnc_adapter, hgnc_schema) = hgnc_job(&hgnc_v2, &fetcher);
    let second = coordinator(&stores)
        .compile(CompileRequest::new().vocabulary(hgnc_adapter, hgnc_schema))
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Committed);
    let stats = &second.committed[&SliceKey::Vocabulary(hgnc())];
    assert_eq!((stats.updated, stats.retired, stats.unchanged), (1, 1, 1));
    assert!(matches!(
        second.embedding,
        Some(EmbeddingOutcome::Completed { embedded: 1, .. })
    ));
    drop(stores);

    // --- restart ------------------------------------------------------------
    let stores = Stores::open_dir(&store_dir).unwrap();
    let snapshot = stores.snapshot().unwrap().unwrap();
    assert_eq!(snapshot.manifest.run_id, second.run_id);
    assert_eq!(snapshot.manifest.vocabulary(&hgnc()).unwrap().run_id, second.run_id);
    assert_eq!(snapshot.manifest.vocabulary(&hpo()).unwrap().run_id, first.run_id);
    assert_eq!(
        snapshot.manifest.slices[&SliceKey::CrossMap("gene_hpo".to_string())].run_id,
        first.run_id
    );

    let renamed = snapshot.concept(&brca1).unwrap();
    assert_eq!(renamed.lifecycle, Lifecycle::Active);
    assert_eq!(renamed.revision_run, second.run_id);
    assert_eq!(
        renamed.concept.definition.as_deref(),
        Some("BRCA1 DNA repair associated protein")
    );
    assert_eq!(renamed.concept.synonyms, vec!["RNF53", "BRCC1"]);

    let dropped = snapshot.concept(&brca2).unwrap();
    assert_eq!(dropped.lifecycle, Lifecycle::Retired { since: second.run_id });
    assert!(snapshot.active_concept(&brca2).is_none());

    let withdrawn = snapshot.concept_by_code(&hgnc(), "HGNC:9999").unwrap();
    assert_eq!(withdrawn.lifecycle, Lifecycle::Active);
    assert_eq!(withdrawn.concept.metadata["status"], MetadataValue::from("deprecated"));

    let breast = ConceptId::derive(&hpo(), "HP:0003002");
    let frequencies: BTreeMap<&ConceptId, &str> = snapshot
        .crossmaps()
        .filter(|m| m.target_concept_id == breast)
        .map(|m| (&m.source_concept_id, m.properties["frequency"].as_str()))
        .collect();
    assert_eq!(frequencies[&brca1], "VF");
    assert_eq!(frequencies[&brca2], "UN");
    assert!(snapshot.crossmaps().all(|m| m.confidence.is_none()));

    let documents = stores.documents.documents(&hgnc(), second.run_id).unwrap();
    let brca1_doc = documents.iter().find(|d| d.concept_id == brca1).unwrap();
    assert!(brca1_doc.text.contains("associated protein"));

    let brca1_v2 = stores.vectors.get(&brca1, "token-hash-32").unwrap().unwrap();
    assert_ne!(brca1_v1.vector, brca1_v2.vector);
    // Retired concepts keep the vector they had.
    assert!(stores.vectors.get(&brca2, "token-hash-32").unwrap().is_some());

    let runs = stores.runs.list_runs().unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Committed));
}

#[tokio::test]
async fn test_checksum_mismatch_keeps_the_committed_release() {
    let dir = tempdir().unwrap();
    let fetcher = Arc::new(Fetcher::default());
    let hpo_path = write(dir.path(), "hp.ttl", HPO_TTL);
    let stores = Stores::open_dir(dir.path().join("stores")).unwrap();

    let (adapter, schema) = hpo_job(SourceDescriptor::new("HPO", &hpo_path), &fetcher);
    let first = coordinator(&stores)
        .compile(CompileRequest::new().vocabulary(adapter, schema))
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Committed);

    let tampered = SourceDescriptor::new("HPO", &hpo_path)
        .with_checksum(Some(format!("sha256:{}", "0".repeat(64))));
    let (adapter, schema) = hpo_job(tampered, &fetcher);
    let second = coordinator(&stores)
        .compile(CompileRequest::new().vocabulary(adapter, schema))
        .await
        .unwrap();

    assert_eq!(second.status, RunStatus::Failed);
    assert!(second.failed[&SliceKey::Vocabulary(hpo())].contains("checksum"));
    let snapshot = stores.snapshot().unwrap().unwrap();
    assert_eq!(snapshot.manifest.run_id, first.run_id);
    assert_eq!(snapshot.vocabularies[&hpo()].active_count(), 3);
}
