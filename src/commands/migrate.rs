//! Migrate command implementation

use crate::config::{BackendKind, Config};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::pipeline::{
    plan_migration, run_pipeline, DryRunReport, MigrationSummary, PipelineOptions,
};
use crate::progress::PipelineProgress;
use crate::source::load_entries;
use crate::store::{Storage, StorageBackend};
use crate::version::VersionPlan;
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Per-invocation overrides of the configuration
#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub backend: Option<BackendKind>,
    pub batch_size: Option<usize>,
    pub source: Option<PathBuf>,
    pub force: bool,
    pub validate: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MigrateOutcome {
    DryRun(DryRunReport),
    Applied(MigrationSummary),
}

impl MigrateOutcome {
    /// An integrity check ran and found problems
    pub fn failed_validation(&self) -> bool {
        match self {
            MigrateOutcome::Applied(summary) => summary
                .integrity
                .as_ref()
                .is_some_and(|report| !report.valid),
            MigrateOutcome::DryRun(_) => false,
        }
    }
}

/// Reconcile stored embeddings with the knowledge-base source
pub async fn cmd_migrate(
    config: &Config,
    embedder: &dyn Embedder,
    options: MigrateOptions,
    progress: &PipelineProgress,
) -> Result<MigrateOutcome> {
    let mut config = config.clone();
    if let Some(backend) = options.backend {
        config.storage.backend = backend.to_string();
    }
    if let Some(batch_size) = options.batch_size {
        if batch_size == 0 {
            return Err(Error::Config("--batch-size must be >= 1".to_string()));
        }
        config.embedding.batch_size = batch_size;
    }

    let source_path = options
        .source
        .clone()
        .unwrap_or_else(|| config.source_path());
    let entries = load_entries(&source_path)?;
    info!("Loaded {} entries from {}", entries.len(), source_path.display());

    let storage = Storage::open(&config).await?;
    let outcome = migrate_with(&storage, embedder, entries, &config, &options, progress).await;
    storage.close().await;
    outcome
}

async fn migrate_with(
    storage: &Storage,
    embedder: &dyn Embedder,
    entries: Vec<crate::models::SourceEntry>,
    config: &Config,
    options: &MigrateOptions,
    progress: &PipelineProgress,
) -> Result<MigrateOutcome> {
    if options.dry_run {
        let report = plan_migration(storage, &embedder.identity(), entries, options.force).await?;
        return Ok(MigrateOutcome::DryRun(report));
    }

    let pipeline_options = PipelineOptions {
        force: options.force,
        ..PipelineOptions::from_config(config)
    };
    let mut summary = run_pipeline(storage, embedder, entries, &pipeline_options, progress).await?;

    if options.validate {
        summary.integrity = Some(storage.validate_integrity().await?);
    }
    Ok(MigrateOutcome::Applied(summary))
}

/// Print a migration outcome to console
pub fn print_migrate_outcome(outcome: &MigrateOutcome) {
    match outcome {
        MigrateOutcome::DryRun(report) => {
            println!("\n🔎 Dry run (nothing written)\n");
            println!("Provider model: {}", report.identity);
            match &report.current_version {
                Some(version) => println!("Current version: {}", version.label()),
                None => println!("Current version: none"),
            }
            if report.would_migrate {
                println!("⚠ Model differs from the current version; a migration would run");
            }
            println!("  New: {}", report.changes.new);
            println!("  Modified: {}", report.changes.modified);
            println!("  Moved: {}", report.changes.retagged);
            println!("  Deleted: {}", report.changes.deleted);
            println!("  Unchanged: {}", report.changes.unchanged);
            println!("  Rejected: {}", report.rejected);
        }
        MigrateOutcome::Applied(summary) => print_summary(summary),
    }
}

fn print_summary(summary: &MigrationSummary) {
    match &summary.plan {
        VersionPlan::Initial { version } => {
            println!("\n✓ Initial load into {}", version.label())
        }
        VersionPlan::Incremental { version } => {
            println!("\n✓ Incremental update of {}", version.label())
        }
        VersionPlan::Migration { previous, version } => println!(
            "\n✓ Migrated {} → {}",
            previous.label(),
            version.label()
        ),
    }

    if summary.no_op {
        println!("  Nothing to do: {} entries unchanged", summary.unchanged);
    } else {
        println!("  New: {}", summary.new);
        println!("  Modified: {}", summary.modified);
        println!("  Moved: {}", summary.retagged);
        println!("  Deleted: {}", summary.deleted);
        println!("  Unchanged: {}", summary.unchanged);
        println!("  Written: {}", summary.written);
    }
    if summary.rejected > 0 {
        println!("  Rejected: {}", summary.rejected);
        for rejected in &summary.rejected_entries {
            println!("    • {}: {}", rejected.entry_id, rejected.reason);
        }
    }
    if summary.had_failures() {
        println!(
            "  ⚠ Failed: {} entries ({} batches exhausted retries)",
            summary.failed, summary.failed_batches
        );
        for id in &summary.failed_ids {
            println!("    • {}", id);
        }
        if !summary.failed_updates.is_empty() {
            println!("  ⚠ Could not move or delete: {}", summary.failed_updates.join(", "));
        }
    }
    println!("  Elapsed: {} ms", summary.elapsed_ms);

    if let Some(report) = &summary.integrity {
        super::print_integrity(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::mock::MockEmbedder;
    use tempfile::TempDir;

    fn setup(entries: usize) -> (Config, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.embedding.initial_backoff_ms = 1;
        config.embedding.max_backoff_ms = 2;
        write_source(&config, entries);
        (config, tmp)
    }

    fn write_source(config: &Config, entries: usize) {
        let lines: Vec<String> = (0..entries)
            .map(|i| {
                serde_json::json!({
                    "id": format!("faq-{i:03}"),
                    "category": "cards",
                    "subcategory": "pin",
                    "question": format!("How do I do thing {i}?"),
                    "answer": format!("Like this {i}."),
                })
                .to_string()
            })
            .collect();
        std::fs::write(config.source_path(), lines.join("\n")).unwrap();
    }

    #[tokio::test]
    async fn test_migrate_applies_and_validates() {
        let (config, _tmp) = setup(12);
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        let options = MigrateOptions {
            validate: true,
            batch_size: Some(5),
            ..MigrateOptions::default()
        };

        let outcome = cmd_migrate(&config, &embedder, options, &PipelineProgress::hidden())
            .await
            .unwrap();
        assert!(!outcome.failed_validation());
        match outcome {
            MigrateOutcome::Applied(summary) => {
                assert_eq!(summary.written, 12);
                assert!(summary.integrity.unwrap().valid);
            }
            other => panic!("expected applied, got {other:?}"),
        }
        assert_eq!(embedder.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_provider_calls() {
        let (config, _tmp) = setup(4);
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        let options = MigrateOptions {
            dry_run: true,
            ..MigrateOptions::default()
        };

        let outcome = cmd_migrate(&config, &embedder, options, &PipelineProgress::hidden())
            .await
            .unwrap();
        match outcome {
            MigrateOutcome::DryRun(report) => assert_eq!(report.changes.new, 4),
            other => panic!("expected dry run, got {other:?}"),
        }
        assert!(embedder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_rejected() {
        let (config, _tmp) = setup(1);
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        let options = MigrateOptions {
            batch_size: Some(0),
            ..MigrateOptions::default()
        };
        assert!(matches!(
            cmd_migrate(&config, &embedder, options, &PipelineProgress::hidden()).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_source_file() {
        let (config, _tmp) = setup(0);
        std::fs::remove_file(config.source_path()).unwrap();
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        let result = cmd_migrate(
            &config,
            &embedder,
            MigrateOptions::default(),
            &PipelineProgress::hidden(),
        )
        .await;
        assert!(result.is_err());
    }
}
