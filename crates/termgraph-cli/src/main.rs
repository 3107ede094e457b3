//! Termgraph CLI
//!
//! Compiles biomedical vocabulary releases into the versioned concept graph:
//! - `compile` fetches, normalizes, links and commits configured sources
//! - `resume` redoes the failed slices of an earlier run
//! - `embed` (re)computes concept vectors for the committed graph
//! - `status` / `show` / `run` inspect what is committed

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use termgraph_compile::{CancelHandle, Coordinator, CoordinatorConfig};
use termgraph_embed::EmbeddingPipeline;
use termgraph_model::{RunId, RunStatus, RunSummary, Vocabulary};
use termgraph_source::Fetcher;
use termgraph_storage::Stores;
use tracing_subscriber::EnvFilter;

mod catalogue;
mod config;
mod report;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "termgraph")]
#[command(
    author,
    version,
    about = "Termgraph: biomedical vocabulary normalization and knowledge-graph compilation"
)]
struct Cli {
    /// Config file (default: ./termgraph.toml when present)
    #[arg(short, long, global = true, env = "TERMGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter such as `debug` or `termgraph_compile=trace`; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Overrides `data_dir` from the config
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, normalize, link and commit configured vocabularies and cross-maps.
    Compile {
        /// Only these vocabularies / cross-map sources (default: all)
        names: Vec<String>,
        /// Skip the post-commit embedding stage
        #[arg(long)]
        no_embed: bool,
    },

    /// Start a new run over the failed slices of a failed or partially committed run.
    Resume {
        /// Run id (`run-000042` or `42`)
        run_id: String,
        #[arg(long)]
        no_embed: bool,
    },

    /// Embed concepts of the committed graph that have no vector for the
    /// configured model version.
    Embed {
        /// Re-embed every active concept
        #[arg(long)]
        all: bool,
        /// Drop every vector of this model version instead (pinned or not)
        #[arg(long, value_name = "MODEL_VERSION", conflicts_with = "all")]
        purge: Option<String>,
    },

    /// Current run pointer, per-vocabulary counts, locks and recent runs.
    Status {
        /// Number of recent runs listed
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },

    /// One run's record and summary.
    Run { run_id: String },

    /// One concept of the committed graph with its edges.
    Show {
        vocabulary: String,
        /// Native code, e.g. `HGNC:1100` or `HP:0001627`
        code: String,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    match cli.command {
        Commands::Compile { names, no_embed } => cmd_compile(&config, &names, no_embed).await,
        Commands::Resume { run_id, no_embed } => cmd_resume(&config, &run_id, no_embed).await,
        Commands::Embed { all, purge } => cmd_embed(&config, all, purge.as_deref()).await,
        Commands::Status { runs } => report::print_status(&open_stores(&config)?, runs),
        Commands::Run { run_id } => cmd_run(&config, &run_id),
        Commands::Show { vocabulary, code } => cmd_show(&config, &vocabulary, &code),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn open_stores(config: &AppConfig) -> Result<Stores> {
    let dir = config.stores_dir();
    Stores::open_dir(&dir).with_context(|| format!("failed to open stores at {}", dir.display()))
}

fn fetcher(config: &AppConfig) -> Arc<Fetcher> {
    let fetcher = Fetcher::new(config.fetch.clone());
    Arc::new(if config.keep_downloads {
        fetcher.with_download_dir(config.downloads_dir())
    } else {
        fetcher
    })
}

fn coordinator(config: &AppConfig, stores: &Stores, no_embed: bool) -> Result<Coordinator> {
    let mut coordinator = Coordinator::new(
        stores.clone(),
        CoordinatorConfig {
            workers: config.workers.max(1),
            ..CoordinatorConfig::default()
        },
    );
    if config.embedding.enabled && !no_embed {
        let pipeline = EmbeddingPipeline::from_config(stores, &config.embedding)
            .context("failed to set up the embedding backend")?;
        coordinator = coordinator.with_embedding(Arc::new(pipeline));
    }
    coordinator.on_event(Box::new(|event| report::print_event(&event)));
    Ok(coordinator)
}

/// Ctrl-C cancels the run; the current pointer is left untouched.
fn cancel_on_interrupt() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "interrupted, cancelling run".yellow());
            handle.cancel();
        }
    });
    cancel
}

fn parse_run_id(raw: &str) -> Result<RunId> {
    raw.parse().map_err(|e| anyhow!("{e}"))
}

fn finish(summary: &RunSummary) -> Result<()> {
    report::print_summary(summary);
    match summary.status {
        RunStatus::Failed => bail!("{} failed", summary.run_id),
        RunStatus::PartiallyCommitted => {
            println!(
                "\n{} `termgraph resume {}` retries the failed slices",
                "hint:".cyan(),
                summary.run_id
            );
            Ok(())
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_compile(config: &AppConfig, names: &[String], no_embed: bool) -> Result<()> {
    let stores = open_stores(config)?;
    let request = catalogue::build_request(config, &fetcher(config), names)?;
    if request.is_empty() {
        bail!("no vocabularies or cross-maps configured");
    }
    let coordinator = coordinator(config, &stores, no_embed)?;
    let summary = coordinator.compile_with(request, cancel_on_interrupt()).await?;
    finish(&summary)
}

async fn cmd_resume(config: &AppConfig, run_id: &str, no_embed: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let stores = open_stores(config)?;
    let request = catalogue::build_request(config, &fetcher(config), &[])?;
    let coordinator = coordinator(config, &stores, no_embed)?;
    let summary = coordinator
        .resume(run_id, request, cancel_on_interrupt())
        .await?;
    finish(&summary)
}

async fn cmd_embed(config: &AppConfig, all: bool, purge: Option<&str>) -> Result<()> {
    let stores = open_stores(config)?;
    let pipeline = EmbeddingPipeline::from_config(&stores, &config.embedding)?;

    if let Some(version) = purge {
        let removed = pipeline.purge(version)?;
        println!("{} removed {removed} vectors of {}", "✓".green(), version.bold());
        return Ok(());
    }

    let Some(snapshot) = stores.snapshot()? else {
        bail!("nothing committed yet; run `termgraph compile` first");
    };
    let report = if all {
        pipeline.run_all(&snapshot).await?
    } else {
        pipeline.run(&snapshot, &BTreeSet::new()).await?
    };
    report::print_embed_report(&report);
    Ok(())
}

fn cmd_run(config: &AppConfig, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let stores = open_stores(config)?;
    let Some(run) = stores.runs.load_run(run_id)? else {
        bail!("unknown run {run_id}");
    };
    let summary = stores.runs.load_summary(run_id)?;
    report::print_run(&run, summary.as_ref());
    Ok(())
}

fn cmd_show(config: &AppConfig, vocabulary: &str, code: &str) -> Result<()> {
    let vocabulary = Vocabulary::new(vocabulary).map_err(|e| anyhow!("{e}"))?;
    let stores = open_stores(config)?;
    let Some(snapshot) = stores.snapshot()? else {
        bail!("nothing committed yet; run `termgraph compile` first");
    };
    let Some(record) = snapshot.concept_by_code(&vocabulary, code.trim()) else {
        bail!("{vocabulary} has no concept `{code}`");
    };

    let mut versions = Vec::new();
    for version in stores.vectors.model_versions()? {
        if stores.vectors.get(&record.concept.concept_id, &version)?.is_some() {
            versions.push(version);
        }
    }
    report::print_concept(&snapshot, record, &versions);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "termgraph",
            "compile",
            "HGNC",
            "gene_hpo",
            "--no-embed",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Compile { names, no_embed } => {
                assert_eq!(names, vec!["HGNC", "gene_hpo"]);
                assert!(no_embed);
            }
            _ => panic!("expected compile"),
        }
    }

    #[test]
    fn purge_and_all_are_exclusive() {
        assert!(Cli::try_parse_from(["termgraph", "embed", "--all", "--purge", "v1"]).is_err());
    }

    #[test]
    fn run_ids_accept_both_forms() {
        assert_eq!(parse_run_id("run-000042").unwrap(), RunId::new(42));
        assert_eq!(parse_run_id("42").unwrap(), RunId::new(42));
        assert!(parse_run_id("latest").is_err());
    }
}
