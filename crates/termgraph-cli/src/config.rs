//! `termgraph.toml`
//!
//! ```toml
//! data_dir = "./termgraph-data"
//! workers = 4
//!
//! [fetch]
//! max_attempts = 4
//!
//! [[vocabulary]]
//! name = "HGNC"
//! location = "https://.../hgnc_complete_set_{version}.txt"
//! version = "2024-01-01"
//!
//! [[vocabulary]]
//! name = "OMIM"
//! location = "https://data.bioontology.org/ontologies/OMIM/download?download_format=csv"
//! credentials = [{ env = "BIOPORTAL_API_KEY", apply = "query", param = "apikey" }]
//!
//! [[crossmap]]
//! name = "gene_hpo"
//! location = "./releases/genes_to_phenotype.txt"
//!
//! [embedding]
//! dimension = 256
//! refine = { enabled = true, iterations = 2, alpha = 0.2 }
//! ```
//!
//! Every field has a default, so an empty file (or none at all) is valid.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use termgraph_compile::{CrossMapSchema, VocabularySchema};
use termgraph_embed::EmbeddingConfig;
use termgraph_ingest_json::JsonLayout;
use termgraph_ingest_rdfowl::OwlLayout;
use termgraph_ingest_tabular::TabularLayout;
use termgraph_source::{CredentialKey, RetryPolicy, SourceDescriptor};

pub const CONFIG_ENV: &str = "TERMGRAPH_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "termgraph.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root of the file-backed stores and the download cache.
    pub data_dir: PathBuf,
    pub workers: usize,
    /// Keep a copy of every remote download under `data_dir/downloads`.
    pub keep_downloads: bool,
    pub fetch: RetryPolicy,
    #[serde(rename = "vocabulary")]
    pub vocabularies: Vec<VocabularyEntry>,
    #[serde(rename = "crossmap")]
    pub crossmaps: Vec<CrossMapEntry>,
    pub embedding: EmbeddingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./termgraph-data"),
            workers: 4,
            keep_downloads: true,
            fetch: RetryPolicy::default(),
            vocabularies: Vec::new(),
            crossmaps: Vec::new(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

/// Where and how to download one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub location: String,
    #[serde(default)]
    pub version: Option<String>,
    /// `sha256:<hex>`
    #[serde(default)]
    pub checksum: Option<String>,
    /// Environment variables the adapter reads secrets from.
    #[serde(default)]
    pub credentials: Vec<CredentialKey>,
}

impl SourceEntry {
    pub fn descriptor(&self, name: &str) -> SourceDescriptor {
        SourceDescriptor::new(name, &self.location)
            .with_version(self.version.clone())
            .with_checksum(self.checksum.clone())
            .with_credentials(self.credentials.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyKind {
    Hgnc,
    Ncit,
    Hpo,
    Ordo,
    Omim,
    /// Any flat file; needs `schema` and optionally `tabular`.
    Tabular,
    /// Any OWL / RDF dump; needs `schema` and optionally `owl`.
    Owl,
    /// Any paginated JSON API; needs `schema` and optionally `json`.
    JsonApi,
}

impl VocabularyKind {
    pub fn builtin_for(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "HGNC" => Some(Self::Hgnc),
            "NCIT" => Some(Self::Ncit),
            "HPO" => Some(Self::Hpo),
            "ORDO" | "ORPHANET" => Some(Self::Ordo),
            "OMIM" => Some(Self::Omim),
            _ => None,
        }
    }

    pub fn is_generic(self) -> bool {
        matches!(self, Self::Tabular | Self::Owl | Self::JsonApi)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyEntry {
    pub name: String,
    /// Inferred from `name` for built-in vocabularies.
    #[serde(default)]
    pub kind: Option<VocabularyKind>,
    #[serde(flatten)]
    pub source: SourceEntry,
    /// Replaces the built-in schema; required for generic kinds.
    #[serde(default)]
    pub schema: Option<VocabularySchema>,
    #[serde(default)]
    pub tabular: Option<TabularLayout>,
    #[serde(default)]
    pub owl: Option<OwlLayout>,
    #[serde(default)]
    pub json: Option<JsonLayout>,
}

impl VocabularyEntry {
    pub fn resolved_kind(&self) -> Result<VocabularyKind> {
        match self.kind.or_else(|| VocabularyKind::builtin_for(&self.name)) {
            Some(kind) => Ok(kind),
            None => bail!(
                "vocabulary `{}` is not built in; set `kind` to tabular, owl or json_api",
                self.name
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossMapKind {
    /// HPO `genes_to_phenotype.txt`: gene symbol -> phenotype.
    GeneHpo,
    /// HPO `phenotype.hpoa`, Orphanet rows: phenotype -> rare disease.
    HpoOrdo,
    /// EVS `NCIt-HGNC_Mapping.txt`: NCIt concept -> HGNC gene.
    GeneNcit,
    /// BioPortal OMIM CSV `Gene Symbol` column: disorder -> gene.
    GeneOmim,
    /// SSSOM-style mapping table (`subject_id`, `predicate_id`, `object_id`,
    /// `confidence`).
    Sssom,
    /// Any flat file; needs `schema` and optionally `tabular`.
    Table,
}

impl CrossMapKind {
    pub fn builtin_for(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "gene_hpo" => Some(Self::GeneHpo),
            "hpo_ordo" => Some(Self::HpoOrdo),
            "gene_ncit" => Some(Self::GeneNcit),
            "gene_omim" => Some(Self::GeneOmim),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossMapEntry {
    pub name: String,
    #[serde(default)]
    pub kind: Option<CrossMapKind>,
    #[serde(flatten)]
    pub source: SourceEntry,
    /// SSSOM endpoints.
    #[serde(default)]
    pub subject_vocabulary: Option<String>,
    #[serde(default)]
    pub object_vocabulary: Option<String>,
    #[serde(default)]
    pub schema: Option<CrossMapSchema>,
    #[serde(default)]
    pub tabular: Option<TabularLayout>,
}

impl CrossMapEntry {
    pub fn resolved_kind(&self) -> Result<CrossMapKind> {
        match self.kind.or_else(|| CrossMapKind::builtin_for(&self.name)) {
            Some(kind) => Ok(kind),
            None => bail!(
                "cross-map `{}` is not built in; set `kind` to sssom or table",
                self.name
            ),
        }
    }
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(text).context("invalid termgraph config")?;
        Ok(config)
    }

    /// Load `path`, else `$TERMGRAPH_CONFIG`, else `./termgraph.toml` when it
    /// exists, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let path = match explicit {
            Some(p) => p,
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    tracing::debug!("no config file, using defaults");
                    return Ok(Self::default());
                }
                fallback
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml(&text).with_context(|| format!("in {}", path.display()))?;
        tracing::debug!(path = %path.display(), vocabularies = config.vocabularies.len(), crossmaps = config.crossmaps.len(), "loaded config");
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn stores_dir(&self) -> PathBuf {
        self.data_dir.join("stores")
    }
}
