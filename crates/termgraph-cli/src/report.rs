//! Terminal output for runs, status and concepts.

use anyhow::Result;
use colored::Colorize;
use std::collections::BTreeMap;
use termgraph_compile::RunEvent;
use termgraph_embed::EmbedReport;
use termgraph_model::{
    CompilationRun, ConceptId, ConceptRecord, EmbeddingOutcome, Lifecycle, RecordIssues, RunStatus,
    RunSummary,
};
use termgraph_storage::{GraphSnapshot, Stores};

fn status_label(status: RunStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Committed => text.green().bold(),
        RunStatus::PartiallyCommitted => text.yellow().bold(),
        RunStatus::Failed => text.red().bold(),
        _ => text.cyan(),
    }
}

pub fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { run_id, slices } => {
            println!("{} {} ({} slices)", "▶".cyan(), run_id.to_string().bold(), slices.len());
        }
        RunEvent::StageEntered { status, .. } => {
            println!("  {} {}", "stage".dimmed(), status_label(*status));
        }
        RunEvent::VocabularyFetched {
            vocabulary,
            version,
            bytes,
        } => {
            println!("  {} {vocabulary} {version} ({bytes} bytes)", "fetched".blue());
        }
        RunEvent::VocabularyNormalized {
            vocabulary,
            concepts,
            quarantined,
        } => {
            let q = if *quarantined > 0 {
                format!(", {quarantined} quarantined").yellow().to_string()
            } else {
                String::new()
            };
            println!("  {} {vocabulary}: {concepts} concepts{q}", "normalized".blue());
        }
        RunEvent::CrossMapLinked {
            source,
            crossmaps,
            unresolved,
        } => {
            println!(
                "  {} {source}: {crossmaps} cross-maps, {unresolved} unresolved",
                "linked".blue()
            );
        }
        RunEvent::SliceCommitted { key, stats, unchanged } => {
            let tag = if *unchanged { "unchanged".dimmed() } else { "written".green() };
            println!(
                "  {} {key} [{tag}] +{} ~{} ={} -{}",
                "✓".green(),
                stats.created,
                stats.updated,
                stats.unchanged,
                stats.retired
            );
        }
        RunEvent::SliceFailed { key, reason } => {
            println!("  {} {key}: {reason}", "✗".red());
        }
        RunEvent::Published { run_id, slices } => {
            println!("  {} current → {run_id} ({slices} slices)", "published".green());
        }
        RunEvent::RunFinished { .. } => {}
    }
}

fn print_issues(title: &str, issues: &BTreeMap<String, RecordIssues>) {
    for (name, issue) in issues.iter().filter(|(_, i)| !i.is_empty()) {
        println!("  {} {name}: {} {title}", "!".yellow(), issue.count);
        for (locator, reason) in &issue.samples {
            println!("      {} {}", locator.dimmed(), reason);
        }
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("{} {}", summary.run_id.to_string().bold(), status_label(summary.status));
    for (key, stats) in &summary.committed {
        let mark = if summary.unchanged.contains(key) {
            "unchanged".dimmed().to_string()
        } else {
            format!(
                "created {} updated {} retired {} relationships {} cross-maps {}",
                stats.created, stats.updated, stats.retired, stats.relationships, stats.crossmaps
            )
        };
        println!("  {} {key}  {mark}", "✓".green());
    }
    for (key, reason) in &summary.failed {
        println!("  {} {key}  {}", "✗".red(), reason.red());
    }
    let quarantined: BTreeMap<String, RecordIssues> = summary
        .quarantined
        .iter()
        .map(|(v, i)| (v.to_string(), i.clone()))
        .collect();
    print_issues("records quarantined", &quarantined);
    print_issues("records unresolved", &summary.unresolved_mappings);
    match &summary.embedding {
        Some(EmbeddingOutcome::Completed {
            model_version,
            embedded,
            superseded,
        }) => println!(
            "  {} {model_version}: {embedded} embedded, {superseded} superseded",
            "embedding".cyan()
        ),
        Some(EmbeddingOutcome::Failed { reason }) => {
            println!("  {} {}", "embedding failed:".yellow(), reason)
        }
        Some(EmbeddingOutcome::Skipped) | None => {}
    }
}

pub fn print_embed_report(report: &EmbedReport) {
    println!(
        "{} {}: {} embedded ({} backfilled), {} retired skipped, {} superseded",
        "✓".green(),
        report.model_version.bold(),
        report.embedded,
        report.backfilled,
        report.skipped_retired,
        report.superseded
    );
}

fn print_run_line(run: &CompilationRun) {
    let finished = run
        .finished_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let resumed = run
        .resumed_from
        .map(|r| format!(" (resumes {r})"))
        .unwrap_or_default();
    println!(
        "  {}  {:<20} {}{}",
        run.run_id,
        status_label(run.status),
        finished.dimmed(),
        resumed
    );
}

/// Current pointer, per-slice counts, held locks and the latest runs.
pub fn print_status(stores: &Stores, recent: usize) -> Result<()> {
    match stores.snapshot()? {
        None => println!("{}", "nothing committed yet".yellow()),
        Some(snapshot) => print_snapshot(&snapshot),
    }

    let locks = stores.cache.locks()?;
    if !locks.is_empty() {
        println!("\n{}", "Locks".bold());
        for (key, run_id) in locks {
            println!("  {key} held by {run_id}");
        }
    }

    let mut runs = stores.runs.list_runs()?;
    runs.sort_by_key(|r| std::cmp::Reverse(r.run_id));
    if !runs.is_empty() {
        println!("\n{}", "Runs".bold());
        for run in runs.iter().take(recent) {
            print_run_line(run);
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &GraphSnapshot) {
    let manifest = &snapshot.manifest;
    println!(
        "{} {} (published {})",
        "current".bold(),
        manifest.run_id.to_string().green(),
        manifest.committed_at.format("%Y-%m-%d %H:%M:%S")
    );

    println!("\n{}", "Vocabularies".bold());
    println!(
        "  {:<10} {:<12} {:>9} {:>9} {:>13}  {}",
        "name", "run", "active", "retired", "relationships", "version"
    );
    for (vocabulary, slice) in &snapshot.vocabularies {
        let version = slice.source_version.as_deref().unwrap_or("-");
        println!(
            "  {:<10} {:<12} {:>9} {:>9} {:>13}  {}",
            vocabulary.as_str(),
            slice.run_id.to_string(),
            slice.active_count(),
            slice.retired_count(),
            slice.relationships.len(),
            version.dimmed()
        );
    }

    if !snapshot.crossmaps.is_empty() {
        println!("\n{}", "Cross-maps".bold());
        for (source, slice) in &snapshot.crossmaps {
            println!(
                "  {:<16} {:<12} {:>9}  {} → {}",
                source,
                slice.run_id.to_string(),
                slice.crossmaps.len(),
                slice.links.0,
                slice.links.1
            );
        }
    }
}

pub fn print_run(run: &CompilationRun, summary: Option<&RunSummary>) {
    print_run_line(run);
    for (vocabulary, version) in &run.per_vocabulary_version {
        println!("    {vocabulary} {}", version.dimmed());
    }
    if let Some(summary) = summary {
        print_summary(summary);
    }
}

fn label(snapshot: &GraphSnapshot, id: &ConceptId) -> String {
    match snapshot.concept(id) {
        Some(r) => format!("{} {} ({})", r.concept.vocabulary, r.concept.native_code, r.concept.preferred_term),
        None => id.to_string(),
    }
}

/// One concept with its edges and stored vector versions.
pub fn print_concept(snapshot: &GraphSnapshot, record: &ConceptRecord, vector_versions: &[String]) {
    let c = &record.concept;
    println!("{} {}", c.native_code.bold(), c.preferred_term);
    println!("  {} {}", "id".dimmed(), c.concept_id);
    println!("  {} {}", "vocabulary".dimmed(), c.vocabulary);
    match record.lifecycle {
        Lifecycle::Active => println!("  {} {}", "lifecycle".dimmed(), "active".green()),
        Lifecycle::Retired { since } => {
            println!("  {} {} since {since}", "lifecycle".dimmed(), "retired".red())
        }
    }
    println!("  {} {}", "revision".dimmed(), record.revision_run);
    if !c.synonyms.is_empty() {
        println!("  {} {}", "synonyms".dimmed(), c.synonyms.join("; "));
    }
    if let Some(def) = &c.definition {
        println!("  {} {def}", "definition".dimmed());
    }
    for (key, value) in &c.metadata {
        println!("  {} {value}", format!("{key}:").dimmed());
    }

    let out: Vec<_> = snapshot
        .relationships()
        .filter(|r| r.source_concept_id == c.concept_id)
        .collect();
    let incoming = snapshot
        .relationships()
        .filter(|r| r.target_concept_id == c.concept_id)
        .count();
    if !out.is_empty() || incoming > 0 {
        println!("\n{} ({incoming} incoming)", "Relationships".bold());
        for r in out {
            println!("  {} {}", r.relation_type.to_string().cyan(), label(snapshot, &r.target_concept_id));
        }
    }

    let maps: Vec<_> = snapshot
        .crossmaps()
        .filter(|m| m.source_concept_id == c.concept_id || m.target_concept_id == c.concept_id)
        .collect();
    if !maps.is_empty() {
        println!("\n{}", "Cross-maps".bold());
        for m in maps {
            let (arrow, other) = if m.source_concept_id == c.concept_id {
                ("→", &m.target_concept_id)
            } else {
                ("←", &m.source_concept_id)
            };
            let confidence = m
                .confidence
                .map(|x| format!(" {x:.2}"))
                .unwrap_or_default();
            let props: Vec<String> = m.properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
            println!(
                "  {} {} {}{}{}",
                m.mapping_type.to_string().cyan(),
                arrow,
                label(snapshot, other),
                confidence,
                if props.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", props.join(", ")).dimmed().to_string()
                }
            );
        }
    }

    if !vector_versions.is_empty() {
        println!("\n{} {}", "Vectors".bold(), vector_versions.join(", "));
    }
}
