//! Precomputation pipeline
//!
//! Reconciles stored vectors with a source snapshot:
//! 1. Reconcile the embedding version with the provider identity
//! 2. Diff content hashes against the target version
//! 3. Embed new and modified entries in concurrent batches, with retry and
//!    bisection of permanently failing batches
//! 4. Commit each batch in its own transaction, then retag moved entries and
//!    remove deleted ones

mod diff;

pub use diff::*;

use crate::config::Config;
use crate::embed::retry::call_with_retry;
use crate::embed::{Embedder, RetryPolicy};
use crate::error::Result;
use crate::models::{EmbeddingRecord, EmbeddingVersion, SourceEntry};
use crate::progress::PipelineProgress;
use crate::source::screen_entries;
use crate::store::{IntegrityReport, RejectedRecord, StorageBackend};
use crate::version::{reconcile_version, ModelIdentity, VersionPlan};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Knobs for a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Entries per provider call
    pub batch_size: usize,
    /// Provider calls in flight
    pub concurrency: usize,
    /// Rows per INSERT statement
    pub write_batch_size: usize,
    /// Re-embed entries whose content hash is unchanged
    pub force: bool,
    pub retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.embedding.concurrency.max(1),
            write_batch_size: config.storage.write_batch_size.max(1),
            force: false,
            retry: RetryPolicy::from_config(&config.embedding),
        }
    }
}

/// Structured result of a run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationSummary {
    pub plan: VersionPlan,
    pub new: usize,
    pub modified: usize,
    /// Entries moved to another category without a content change
    pub retagged: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Entries the provider could not embed
    pub failed: usize,
    /// Source entries or records refused by validation
    pub rejected: usize,
    pub written: usize,
    pub failed_ids: Vec<String>,
    pub rejected_entries: Vec<RejectedRecord>,
    /// Batches that exhausted their retries or could not be committed
    pub failed_batches: usize,
    /// Moved or deleted entries whose stored row could not be changed
    pub failed_updates: Vec<String>,
    pub no_op: bool,
    pub forced: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
}

impl MigrationSummary {
    fn new(plan: VersionPlan, changes: &ChangeSet, forced: bool) -> Self {
        Self {
            plan,
            new: changes.new.len(),
            modified: changes.modified.len(),
            retagged: 0,
            deleted: 0,
            unchanged: changes.unchanged.len(),
            failed: 0,
            rejected: 0,
            written: 0,
            failed_ids: Vec::new(),
            rejected_entries: Vec::new(),
            failed_batches: 0,
            failed_updates: Vec::new(),
            no_op: changes.is_noop(),
            forced,
            elapsed_ms: 0,
            integrity: None,
        }
    }

    pub fn had_failures(&self) -> bool {
        self.failed > 0 || self.failed_batches > 0 || !self.failed_updates.is_empty()
    }
}

/// What a run would do, computed without provider calls or writes
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub identity: ModelIdentity,
    pub current_version: Option<EmbeddingVersion>,
    pub would_migrate: bool,
    pub changes: ChangeCounts,
    pub rejected: usize,
}

/// Embedding outcome of one dispatched batch
#[derive(Default)]
struct BatchOutcome {
    embedded: Vec<(SourceEntry, Vec<f32>)>,
    failed: Vec<String>,
    exhausted: bool,
}

/// Embed `batch`, bisecting on permanent failures so only offending entries fail
async fn embed_isolating(
    embedder: &dyn Embedder,
    batch: Vec<SourceEntry>,
    policy: &RetryPolicy,
    batch_no: usize,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    let mut pending = vec![batch];

    while let Some(mut group) = pending.pop() {
        let texts: Vec<String> = group.iter().map(SourceEntry::embedding_text).collect();
        let label = format!("batch {} ({} entries)", batch_no, group.len());

        match call_with_retry(policy, &label, || embedder.embed_batch(texts.clone())).await {
            Ok(vectors) => outcome.embedded.extend(group.into_iter().zip(vectors)),
            Err(e) if e.is_retryable() => {
                warn!("{} failed after retries: {}", label, e);
                outcome.exhausted = true;
                outcome.failed.extend(group.into_iter().map(|entry| entry.entry_id));
            }
            Err(e) if group.len() > 1 => {
                debug!("{} rejected, bisecting: {}", label, e);
                let right = group.split_off(group.len() / 2);
                pending.push(right);
                pending.push(group);
            }
            Err(e) => {
                let entry_id = group.remove(0).entry_id;
                warn!(%entry_id, "Provider rejected entry: {}", e);
                outcome.failed.push(entry_id);
            }
        }
    }

    outcome
}

/// Point the stored row of `entry` at its new category; false when the row is gone
async fn retag(storage: &dyn StorageBackend, entry: &SourceEntry) -> Result<bool> {
    let Some(mut record) = storage.load_record(&entry.entry_id).await? else {
        return Ok(false);
    };
    record.category = entry.category.clone();
    record.subcategory = entry.subcategory.clone();
    storage.update_record(&entry.entry_id, &record).await?;
    Ok(true)
}

/// Run the pipeline over a source snapshot
pub async fn run_pipeline(
    storage: &dyn StorageBackend,
    embedder: &dyn Embedder,
    entries: Vec<SourceEntry>,
    options: &PipelineOptions,
    progress: &PipelineProgress,
) -> Result<MigrationSummary> {
    let started = Instant::now();
    let screened = screen_entries(entries);

    let plan = reconcile_version(storage, &embedder.identity()).await?;
    let target = plan.target().version_id;
    let forced = options.force || matches!(plan, VersionPlan::Migration { .. });

    let stored = storage.get_digests(Some(target)).await?;
    let changes = compute_changes(&screened.accepted, &stored, forced);

    let mut summary = MigrationSummary::new(plan, &changes, forced);
    summary.rejected_entries = screened
        .rejected
        .into_iter()
        .map(|(entry_id, reason)| RejectedRecord { entry_id, reason })
        .collect();
    summary.rejected = summary.rejected_entries.len();

    info!(
        version = target,
        new = summary.new,
        modified = summary.modified,
        retagged = changes.retagged.len(),
        deleted = changes.deleted.len(),
        unchanged = summary.unchanged,
        forced,
        "Change set computed"
    );

    if changes.is_noop() {
        info!("Nothing to do; stored embeddings are up to date");
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        return Ok(summary);
    }

    let to_process = changes.to_process();
    progress.start(to_process.len());

    let batches: Vec<Vec<SourceEntry>> = to_process
        .chunks(options.batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect();
    let batch_count = batches.len();

    let mut outcomes = stream::iter(batches.into_iter().enumerate())
        .map(|(idx, batch)| embed_isolating(embedder, batch, &options.retry, idx + 1))
        .buffer_unordered(options.concurrency.max(1));

    // Single consumer: commits happen one batch at a time in completion order
    while let Some(outcome) = outcomes.next().await {
        let attempted = outcome.embedded.len() + outcome.failed.len();
        if outcome.exhausted {
            summary.failed_batches += 1;
        }
        summary.failed_ids.extend(outcome.failed);

        if !outcome.embedded.is_empty() {
            let records: Vec<EmbeddingRecord> = outcome
                .embedded
                .into_iter()
                .map(|(entry, vector)| EmbeddingRecord::from_entry(&entry, vector, target))
                .collect();

            match storage
                .store_records_batch(&records, options.write_batch_size)
                .await
            {
                Ok(report) => {
                    summary.written += report.written;
                    summary.rejected += report.rejected.len();
                    summary.rejected_entries.extend(report.rejected);
                }
                Err(e) => {
                    warn!("Failed to commit batch of {} records: {}", records.len(), e);
                    summary.failed_batches += 1;
                    summary
                        .failed_ids
                        .extend(records.into_iter().map(|r| r.entry_id));
                }
            }
        }

        progress.advance(attempted, summary.failed_ids.len());
    }

    for entry in &changes.retagged {
        match retag(storage, entry).await {
            Ok(true) => summary.retagged += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(entry_id = %entry.entry_id, "Failed to retag record: {}", e);
                summary.failed_updates.push(entry.entry_id.clone());
            }
        }
    }

    // Deletes strictly after every write
    for entry_id in &changes.deleted {
        match storage.delete_record(entry_id).await {
            Ok(true) => summary.deleted += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(%entry_id, "Failed to delete record: {}", e);
                summary.failed_updates.push(entry_id.clone());
            }
        }
    }

    summary.failed_ids.sort();
    summary.failed = summary.failed_ids.len();
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    progress.finish(if summary.had_failures() {
        "completed with failures"
    } else {
        "done"
    });

    info!(
        batches = batch_count,
        written = summary.written,
        failed = summary.failed,
        retagged = summary.retagged,
        deleted = summary.deleted,
        elapsed_ms = summary.elapsed_ms,
        "Pipeline finished"
    );
    Ok(summary)
}

/// Compute the change set a run would apply, without provider calls or writes
pub async fn plan_migration(
    storage: &dyn StorageBackend,
    identity: &ModelIdentity,
    entries: Vec<SourceEntry>,
    force: bool,
) -> Result<DryRunReport> {
    let screened = screen_entries(entries);
    let current = storage.get_current_version().await?;
    let would_migrate = !current.as_ref().is_some_and(|v| identity.matches(v));

    // A migration targets an existing version row when one matches the identity
    let target = if would_migrate {
        storage
            .list_versions()
            .await?
            .into_iter()
            .find(|v| identity.matches(v))
    } else {
        current.clone()
    };

    let stored = match &target {
        Some(version) => storage.get_digests(Some(version.version_id)).await?,
        None => Default::default(),
    };
    let changes = compute_changes(
        &screened.accepted,
        &stored,
        force || (would_migrate && current.is_some()),
    );

    Ok(DryRunReport {
        identity: identity.clone(),
        current_version: current,
        would_migrate,
        changes: changes.counts(),
        rejected: screened.rejected.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::embed::mock::MockEmbedder;
    use crate::store::SqliteStore;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup_store() -> (SqliteStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::connect(&tmp.path().join("kb.db"), &StorageConfig::default())
            .await
            .unwrap();
        store.initialize_schema().await.unwrap();
        (store, tmp)
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            batch_size: 20,
            concurrency: 4,
            write_batch_size: 20,
            force: false,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                call_timeout: Duration::from_secs(5),
            },
        }
    }

    fn entries(n: usize) -> Vec<SourceEntry> {
        (0..n)
            .map(|i| {
                SourceEntry::new(
                    format!("entry-{:04}", i),
                    if i % 2 == 0 { "cards" } else { "loans" },
                    "general",
                    vec![format!("question {}", i), format!("answer {}", i)],
                )
            })
            .collect()
    }

    async fn run(
        store: &SqliteStore,
        embedder: &MockEmbedder,
        entries: Vec<SourceEntry>,
        options: &PipelineOptions,
    ) -> MigrationSummary {
        run_pipeline(store, embedder, entries, options, &PipelineProgress::hidden())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initial_load_then_idempotent_rerun() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 16);

        let first = run(&store, &embedder, entries(45), &options()).await;
        assert!(matches!(first.plan, VersionPlan::Initial { .. }));
        assert_eq!(first.new, 45);
        assert_eq!(first.written, 45);
        assert!(!first.had_failures());
        assert_eq!(embedder.calls().len(), 3);

        let second = run(&store, &embedder, entries(45), &options()).await;
        assert!(second.no_op);
        assert_eq!(second.unchanged, 45);
        assert_eq!(embedder.calls().len(), 3);
        assert_eq!(store.count(None).await.unwrap(), 45);
    }

    #[tokio::test]
    async fn test_incremental_only_embeds_new_entries() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 16);
        run(&store, &embedder, entries(200), &options()).await;
        let before = embedder.submitted().len();

        let summary = run(&store, &embedder, entries(205), &options()).await;
        assert_eq!(summary.new, 5);
        assert_eq!(summary.unchanged, 200);

        let submitted = embedder.submitted();
        assert_eq!(submitted.len() - before, 5);
        assert!(submitted[before..].iter().all(|t| {
            (200..205).any(|i| t.starts_with(&format!("question {}\n", i)))
        }));
        assert_eq!(store.count(None).await.unwrap(), 205);
    }

    #[tokio::test]
    async fn test_modified_and_deleted_entries() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        run(&store, &embedder, entries(10), &options()).await;

        let mut next = entries(10);
        next.remove(9);
        next[3].fields[1] = "a better answer".to_string();

        let summary = run(&store, &embedder, next, &options()).await;
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.unchanged, 8);
        assert!(!store.exists("entry-0009").await.unwrap());
        assert!(store
            .load_by_category("loans", None)
            .await
            .unwrap()
            .iter()
            .all(|r| r.entry_id != "entry-0009"));

        let updated = store.load_record("entry-0003").await.unwrap().unwrap();
        assert_eq!(updated.source_text_fields[1], "a better answer");
    }

    #[tokio::test]
    async fn test_moved_entry_is_retagged_without_reembedding() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        run(&store, &embedder, entries(4), &options()).await;
        let calls = embedder.calls().len();

        let mut next = entries(4);
        next[0].category = "loans".to_string();
        next[0].subcategory = "rates".to_string();

        let summary = run(&store, &embedder, next.clone(), &options()).await;
        assert!(!summary.no_op);
        assert_eq!(summary.retagged, 1);
        assert_eq!(summary.unchanged, 3);
        assert!(!summary.had_failures());
        assert_eq!(embedder.calls().len(), calls);

        let moved: Vec<_> = store
            .load_by_category("loans", Some("rates"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.entry_id)
            .collect();
        assert_eq!(moved, vec!["entry-0000".to_string()]);
        assert!(store
            .load_by_category("cards", None)
            .await
            .unwrap()
            .iter()
            .all(|r| r.entry_id != "entry-0000"));

        let cache = crate::cache::VectorCache::load(&store).await.unwrap();
        assert_eq!(cache.candidates("loans", Some("rates")).len(), 1);

        let rerun = run(&store, &embedder, next, &options()).await;
        assert!(rerun.no_op);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported_not_fatal() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        run(&store, &embedder, entries(3), &options()).await;
        store
            .execute_for_tests(
                "CREATE TRIGGER keep_entry BEFORE DELETE ON embedding_records \
                 WHEN OLD.entry_id = 'entry-0002' BEGIN SELECT RAISE(ABORT, 'locked'); END;",
            )
            .await
            .unwrap();

        let mut next = entries(5);
        next.remove(2);
        let summary = run(&store, &embedder, next, &options()).await;
        assert_eq!(summary.new, 2);
        assert_eq!(summary.written, 2);
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.failed_updates, vec!["entry-0002".to_string()]);
        assert!(summary.had_failures());
        assert!(store.exists("entry-0002").await.unwrap());
    }

    #[tokio::test]
    async fn test_model_change_migrates_every_record() {
        let (store, _tmp) = setup_store().await;
        let v1 = MockEmbedder::new("modelA", "v1", 1024);
        let first = run(&store, &v1, entries(201), &options()).await;
        let v1_id = first.plan.target().version_id;

        let v2 = MockEmbedder::new("modelA", "v2", 1024);
        let summary = run(&store, &v2, entries(201), &options()).await;

        match &summary.plan {
            VersionPlan::Migration { previous, version } => {
                assert_eq!(previous.version_id, v1_id);
                assert_eq!(store.get_current_version().await.unwrap().unwrap(), *version);
            }
            other => panic!("expected migration, got {other:?}"),
        }
        assert_eq!(summary.written, 201);
        assert_eq!(v2.submitted().len(), 201);
        assert_eq!(store.count(None).await.unwrap(), 201);
        // the retired version is kept until cleanup
        assert_eq!(store.count(Some(v1_id)).await.unwrap(), 201);
        assert!(store.validate_integrity().await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_isolated() {
        let (store, _tmp) = setup_store().await;
        let batch = entries(20);
        let mut embedder = MockEmbedder::new("modelA", "v1", 8);
        for entry in &batch[10..15] {
            embedder = embedder.poison(format!("{}\n", entry.fields[0]));
        }

        let summary = run(&store, &embedder, batch, &options()).await;
        assert_eq!(summary.failed, 5);
        assert_eq!(
            summary.failed_ids,
            (10..15).map(|i| format!("entry-{:04}", i)).collect::<Vec<_>>()
        );
        assert_eq!(summary.written, 15);
        assert_eq!(summary.failed_batches, 0);
        assert!(summary.had_failures());
        assert_eq!(store.count(None).await.unwrap(), 15);

        // failed entries are retried by the next run
        let healthy = MockEmbedder::new("modelA", "v1", 8);
        let rerun = run(&store, &healthy, entries(20), &options()).await;
        assert_eq!(rerun.new, 5);
        assert_eq!(healthy.submitted().len(), 5);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8).fail_transiently(2);

        let summary = run(&store, &embedder, entries(5), &options()).await;
        assert!(!summary.had_failures());
        assert_eq!(summary.written, 5);
        assert_eq!(embedder.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_batch_fails_whole() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8).fail_transiently(100);

        let summary = run(&store, &embedder, entries(5), &options()).await;
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.failed, 5);
        assert_eq!(embedder.calls().len(), 3);
        assert_eq!(store.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_force_reembeds_unchanged_entries() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        run(&store, &embedder, entries(6), &options()).await;

        let forced = PipelineOptions {
            force: true,
            ..options()
        };
        let summary = run(&store, &embedder, entries(5), &forced).await;
        assert!(summary.forced);
        assert_eq!(summary.modified, 5);
        assert_eq!(summary.deleted, 1);
        assert_eq!(embedder.submitted().len(), 11);
    }

    #[tokio::test]
    async fn test_invalid_source_entries_are_rejected() {
        let (store, _tmp) = setup_store().await;
        let embedder = MockEmbedder::new("modelA", "v1", 8);
        let mut snapshot = entries(3);
        snapshot.push(SourceEntry::new("blank", "cards", "general", vec![]));
        snapshot.push(entries(1).remove(0));

        let summary = run(&store, &embedder, snapshot, &options()).await;
        assert_eq!(summary.written, 3);
        assert_eq!(summary.rejected, 2);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let (store, _tmp) = setup_store().await;
        let identity = ModelIdentity::new("modelA", "v1", 8);

        let report = plan_migration(&store, &identity, entries(7), false).await.unwrap();
        assert!(report.would_migrate);
        assert_eq!(report.changes.new, 7);
        assert!(store.list_versions().await.unwrap().is_empty());

        let embedder = MockEmbedder::new("modelA", "v1", 8);
        run(&store, &embedder, entries(7), &options()).await;
        let report = plan_migration(&store, &identity, entries(8), false).await.unwrap();
        assert!(!report.would_migrate);
        assert_eq!(report.changes.new, 1);
        assert_eq!(report.changes.unchanged, 7);
    }
}
