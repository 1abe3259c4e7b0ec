//! Durable embedding storage
//!
//! This module defines the storage contract and its two implementations:
//! - [`SqliteStore`]: single-file embedded store (WAL journaling)
//! - [`PostgresStore`]: networked store with a pgvector column and a connection pool
//!
//! The backend is chosen once at startup through [`Storage::open`].

mod postgres;
mod schema;
mod sqlite;

pub use postgres::PostgresStore;
pub use schema::*;
pub use sqlite::SqliteStore;

use crate::config::{BackendKind, Config};
use crate::error::{Error, Result};
use crate::models::{EmbeddingRecord, EmbeddingVersion, SourceEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

mod sealed {
    pub trait Sealed {}

    impl Sealed for super::SqliteStore {}
    impl Sealed for super::PostgresStore {}
    impl Sealed for super::Storage {}
}

/// A (entry, version) pair identifying one stored row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub entry_id: String,
    pub version_id: i64,
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.entry_id, self.version_id)
    }
}

/// Result of an integrity scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub total: u64,
    /// Vectors whose stored dimension disagrees with their version, or that cannot be decoded
    pub corrupted_ids: Vec<RecordRef>,
    /// Records that reference a version that does not exist
    pub orphaned_ids: Vec<RecordRef>,
}

impl IntegrityReport {
    pub(crate) fn new(total: u64, corrupted_ids: Vec<RecordRef>, orphaned_ids: Vec<RecordRef>) -> Self {
        Self {
            valid: corrupted_ids.is_empty() && orphaned_ids.is_empty(),
            total,
            corrupted_ids,
            orphaned_ids,
        }
    }
}

/// Summary of the storage location and contents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub backend_kind: BackendKind,
    pub location: String,
    pub total_records: u64,
    pub size_bytes: u64,
    pub current_version: Option<EmbeddingVersion>,
}

/// Record count for one (category, subcategory) key
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CategoryCount {
    pub category: String,
    pub subcategory: String,
    pub count: i64,
}

/// Change-detection fields of one stored record
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct StoredDigest {
    pub entry_id: String,
    pub content_hash: String,
    pub category: String,
    pub subcategory: String,
}

impl StoredDigest {
    /// Whether `entry` carries the same category tags as the stored row
    pub fn same_tags(&self, entry: &SourceEntry) -> bool {
        self.category == entry.category && self.subcategory == entry.subcategory
    }
}

/// A record refused by `store_records_batch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub entry_id: String,
    pub reason: String,
}

/// Outcome of a batch write
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchWriteReport {
    pub written: usize,
    pub rejected: Vec<RejectedRecord>,
}

/// Storage contract shared by both backends
///
/// `version_id: None` always means "the current version". Single-entry operations
/// are scoped to the current version.
#[async_trait]
pub trait StorageBackend: sealed::Sealed + Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Release pooled connections
    async fn close(&self);

    /// Create tables and indexes if absent
    async fn initialize_schema(&self) -> Result<()>;

    async fn get_or_create_version(
        &self,
        model_name: &str,
        model_version: &str,
        dimension: usize,
    ) -> Result<i64>;

    async fn get_current_version(&self) -> Result<Option<EmbeddingVersion>>;

    async fn set_current_version(&self, version_id: i64) -> Result<()>;

    async fn get_version(&self, version_id: i64) -> Result<Option<EmbeddingVersion>>;

    async fn list_versions(&self) -> Result<Vec<EmbeddingVersion>>;

    /// Remove a retired version and all of its records; returns records removed
    async fn delete_version(&self, version_id: i64) -> Result<u64>;

    /// Write records in a single transaction. Invalid records are rejected
    /// individually and reported; `batch_size` bounds rows per INSERT statement.
    async fn store_records_batch(
        &self,
        records: &[EmbeddingRecord],
        batch_size: usize,
    ) -> Result<BatchWriteReport>;

    async fn load_record(&self, entry_id: &str) -> Result<Option<EmbeddingRecord>>;

    /// Load every decodable record of a version, ordered by entry id
    async fn load_all(&self, version_id: Option<i64>) -> Result<Vec<EmbeddingRecord>>;

    async fn load_by_category(
        &self,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<Vec<EmbeddingRecord>>;

    async fn update_record(&self, entry_id: &str, record: &EmbeddingRecord) -> Result<()>;

    async fn delete_record(&self, entry_id: &str) -> Result<bool>;

    /// entry_id -> hash and tags, without reading vectors
    async fn get_digests(&self, version_id: Option<i64>) -> Result<HashMap<String, StoredDigest>>;

    async fn exists(&self, entry_id: &str) -> Result<bool>;

    async fn count(&self, version_id: Option<i64>) -> Result<u64>;

    async fn all_entry_ids(&self, version_id: Option<i64>) -> Result<Vec<String>>;

    async fn count_by_category(&self, version_id: Option<i64>) -> Result<Vec<CategoryCount>>;

    async fn validate_integrity(&self) -> Result<IntegrityReport>;

    async fn get_storage_info(&self) -> Result<StorageInfo>;

    /// entry_id -> content hash, without reading vectors
    async fn get_content_hashes(&self, version_id: Option<i64>) -> Result<HashMap<String, String>> {
        Ok(self
            .get_digests(version_id)
            .await?
            .into_iter()
            .map(|(entry_id, digest)| (entry_id, digest.content_hash))
            .collect())
    }

    /// Write a single record; a validation failure is returned as an error
    async fn store_record(&self, record: &EmbeddingRecord) -> Result<()> {
        let report = self
            .store_records_batch(std::slice::from_ref(record), 1)
            .await?;
        match report.rejected.into_iter().next() {
            Some(rejected) => Err(Error::validation(rejected.entry_id, rejected.reason)),
            None => Ok(()),
        }
    }
}

/// Split records into those valid for their version and those that are not
pub(crate) fn screen_records<'a>(
    records: &'a [EmbeddingRecord],
    versions: &[EmbeddingVersion],
) -> (Vec<&'a EmbeddingRecord>, Vec<RejectedRecord>) {
    let dims: HashMap<i64, usize> = versions.iter().map(|v| (v.version_id, v.dim())).collect();
    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();

    for record in records {
        let outcome = match dims.get(&record.version_id) {
            Some(dim) => record.validate(*dim),
            None => Err(Error::validation(
                &record.entry_id,
                format!("unknown version {}", record.version_id),
            )),
        };

        match outcome {
            Ok(()) => accepted.push(record),
            Err(e) => {
                let reason = match e {
                    Error::Validation { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(entry_id = %record.entry_id, %reason, "Rejecting record");
                rejected.push(RejectedRecord {
                    entry_id: record.entry_id.clone(),
                    reason,
                });
            }
        }
    }

    (accepted, rejected)
}

/// The configured storage backend
pub enum Storage {
    Embedded(SqliteStore),
    Networked(PostgresStore),
}

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Storage::Embedded($store) => $call,
            Storage::Networked($store) => $call,
        }
    };
}

impl Storage {
    /// Connect to the configured backend and make sure the schema exists
    pub async fn open(config: &Config) -> Result<Self> {
        let storage = match config.storage.backend_kind()? {
            BackendKind::Embedded => Storage::Embedded(
                SqliteStore::connect(&config.sqlite_path(), &config.storage).await?,
            ),
            BackendKind::Networked => {
                Storage::Networked(PostgresStore::connect(&config.storage).await?)
            }
        };
        storage.initialize_schema().await?;
        Ok(storage)
    }
}

#[async_trait]
impl StorageBackend for Storage {
    fn kind(&self) -> BackendKind {
        dispatch!(self, s => s.kind())
    }

    async fn close(&self) {
        dispatch!(self, s => s.close().await)
    }

    async fn initialize_schema(&self) -> Result<()> {
        dispatch!(self, s => s.initialize_schema().await)
    }

    async fn get_or_create_version(
        &self,
        model_name: &str,
        model_version: &str,
        dimension: usize,
    ) -> Result<i64> {
        dispatch!(self, s => s.get_or_create_version(model_name, model_version, dimension).await)
    }

    async fn get_current_version(&self) -> Result<Option<EmbeddingVersion>> {
        dispatch!(self, s => s.get_current_version().await)
    }

    async fn set_current_version(&self, version_id: i64) -> Result<()> {
        dispatch!(self, s => s.set_current_version(version_id).await)
    }

    async fn get_version(&self, version_id: i64) -> Result<Option<EmbeddingVersion>> {
        dispatch!(self, s => s.get_version(version_id).await)
    }

    async fn list_versions(&self) -> Result<Vec<EmbeddingVersion>> {
        dispatch!(self, s => s.list_versions().await)
    }

    async fn delete_version(&self, version_id: i64) -> Result<u64> {
        dispatch!(self, s => s.delete_version(version_id).await)
    }

    async fn store_records_batch(
        &self,
        records: &[EmbeddingRecord],
        batch_size: usize,
    ) -> Result<BatchWriteReport> {
        dispatch!(self, s => s.store_records_batch(records, batch_size).await)
    }

    async fn load_record(&self, entry_id: &str) -> Result<Option<EmbeddingRecord>> {
        dispatch!(self, s => s.load_record(entry_id).await)
    }

    async fn load_all(&self, version_id: Option<i64>) -> Result<Vec<EmbeddingRecord>> {
        dispatch!(self, s => s.load_all(version_id).await)
    }

    async fn load_by_category(
        &self,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<Vec<EmbeddingRecord>> {
        dispatch!(self, s => s.load_by_category(category, subcategory).await)
    }

    async fn update_record(&self, entry_id: &str, record: &EmbeddingRecord) -> Result<()> {
        dispatch!(self, s => s.update_record(entry_id, record).await)
    }

    async fn delete_record(&self, entry_id: &str) -> Result<bool> {
        dispatch!(self, s => s.delete_record(entry_id).await)
    }

    async fn get_digests(&self, version_id: Option<i64>) -> Result<HashMap<String, StoredDigest>> {
        dispatch!(self, s => s.get_digests(version_id).await)
    }

    async fn exists(&self, entry_id: &str) -> Result<bool> {
        dispatch!(self, s => s.exists(entry_id).await)
    }

    async fn count(&self, version_id: Option<i64>) -> Result<u64> {
        dispatch!(self, s => s.count(version_id).await)
    }

    async fn all_entry_ids(&self, version_id: Option<i64>) -> Result<Vec<String>> {
        dispatch!(self, s => s.all_entry_ids(version_id).await)
    }

    async fn count_by_category(&self, version_id: Option<i64>) -> Result<Vec<CategoryCount>> {
        dispatch!(self, s => s.count_by_category(version_id).await)
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        dispatch!(self, s => s.validate_integrity().await)
    }

    async fn get_storage_info(&self) -> Result<StorageInfo> {
        dispatch!(self, s => s.get_storage_info().await)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::SourceEntry;

    pub(crate) fn record(entry_id: &str, category: &str, vector: Vec<f32>, version_id: i64) -> EmbeddingRecord {
        let entry = SourceEntry::new(
            entry_id,
            category,
            "general",
            vec![format!("question {entry_id}"), format!("answer {entry_id}")],
        );
        EmbeddingRecord::from_entry(&entry, vector, version_id)
    }

    /// Behaviour every backend must share
    pub(crate) async fn exercise_contract(store: &dyn StorageBackend) {
        store.initialize_schema().await.unwrap();
        store.initialize_schema().await.unwrap();
        assert!(store.get_current_version().await.unwrap().is_none());

        let v1 = store.get_or_create_version("modelA", "v1", 3).await.unwrap();
        assert_eq!(store.get_or_create_version("modelA", "v1", 3).await.unwrap(), v1);
        store.set_current_version(v1).await.unwrap();
        assert_eq!(store.get_current_version().await.unwrap().unwrap().version_id, v1);

        let records = vec![
            record("a", "cards", vec![1.0, 0.0, 0.0], v1),
            record("b", "cards", vec![0.0, 1.0, 0.0], v1),
            record("c", "loans", vec![0.0, 0.0, 1.0], v1),
            record("bad", "loans", vec![1.0, 2.0], v1),
        ];
        let report = store.store_records_batch(&records, 2).await.unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].entry_id, "bad");

        // round-trip within f32 precision
        let loaded = store.load_record("b").await.unwrap().unwrap();
        assert_eq!(loaded.vector, vec![0.0, 1.0, 0.0]);
        assert_eq!(loaded.source_text_fields, records[1].source_text_fields);
        assert!(store.load_record("missing").await.unwrap().is_none());

        assert_eq!(store.count(None).await.unwrap(), 3);
        assert_eq!(store.count(Some(v1)).await.unwrap(), 3);
        assert_eq!(store.all_entry_ids(None).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.load_by_category("cards", None).await.unwrap().len(), 2);
        assert_eq!(store.load_by_category("cards", Some("other")).await.unwrap().len(), 0);

        let hashes = store.get_content_hashes(None).await.unwrap();
        assert_eq!(hashes.get("a"), Some(&records[0].content_hash));
        let digests = store.get_digests(Some(v1)).await.unwrap();
        assert_eq!(digests["c"].category, "loans");
        assert_eq!(digests["c"].subcategory, "general");

        let mut updated = record("a", "cards", vec![0.5, 0.5, 0.0], v1);
        updated.source_text_fields = vec!["changed".to_string()];
        updated.content_hash = "feed".repeat(16);
        store.update_record("a", &updated).await.unwrap();
        let reloaded = store.load_record("a").await.unwrap().unwrap();
        assert_eq!(reloaded.content_hash, updated.content_hash);
        assert_eq!(reloaded.created_at, records[0].created_at);
        assert!(matches!(
            store.update_record("zzz", &record("zzz", "x", vec![0.0; 3], v1)).await,
            Err(Error::NotFound(_))
        ));

        assert!(store.store_record(&record("d", "cards", vec![1.0], v1)).await.is_err());

        assert!(store.delete_record("c").await.unwrap());
        assert!(!store.delete_record("c").await.unwrap());
        assert!(!store.exists("c").await.unwrap());
        assert!(store.exists("a").await.unwrap());
        assert!(store.load_by_category("loans", None).await.unwrap().is_empty());
        assert!(!store.get_digests(None).await.unwrap().contains_key("c"));

        // a second version retains the first version's rows
        let v2 = store.get_or_create_version("modelA", "v2", 3).await.unwrap();
        store
            .store_record(&record("a", "cards", vec![0.0, 0.0, 1.0], v2))
            .await
            .unwrap();
        store.set_current_version(v2).await.unwrap();
        let current: Vec<_> = store
            .list_versions()
            .await
            .unwrap()
            .into_iter()
            .filter(|v| v.is_current)
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].version_id, v2);
        assert_eq!(store.count(Some(v1)).await.unwrap(), 2);
        assert_eq!(store.count(None).await.unwrap(), 1);

        let counts = store.count_by_category(Some(v1)).await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].count, 2);

        let integrity = store.validate_integrity().await.unwrap();
        assert!(integrity.valid);
        assert_eq!(integrity.total, 3);

        assert!(store.delete_version(v2).await.is_err());
        assert_eq!(store.delete_version(v1).await.unwrap(), 2);
        assert!(store.get_version(v1).await.unwrap().is_none());

        let info = store.get_storage_info().await.unwrap();
        assert_eq!(info.total_records, 1);
        assert_eq!(info.current_version.unwrap().version_id, v2);
    }

    /// A batch that fails part-way leaves storage as it was.
    ///
    /// Expects the backend to refuse inserts of entry id `poison`.
    pub(crate) async fn exercise_atomic_batch(store: &dyn StorageBackend) {
        let v = store.get_or_create_version("modelA", "v1", 3).await.unwrap();
        store.set_current_version(v).await.unwrap();
        store
            .store_record(&record("keep", "cards", vec![1.0, 0.0, 0.0], v))
            .await
            .unwrap();

        let batch = vec![
            record("keep", "cards", vec![0.0, 1.0, 0.0], v),
            record("fresh", "cards", vec![0.0, 0.0, 1.0], v),
            record("poison", "cards", vec![1.0, 1.0, 0.0], v),
        ];
        assert!(store.store_records_batch(&batch, 1).await.is_err());

        assert_eq!(store.count(None).await.unwrap(), 1);
        assert!(!store.exists("fresh").await.unwrap());
        let kept = store.load_record("keep").await.unwrap().unwrap();
        assert_eq!(kept.vector, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_screen_records() {
        let version = EmbeddingVersion {
            version_id: 1,
            model_name: "m".to_string(),
            model_version: "v".to_string(),
            dimension: 2,
            is_current: true,
            created_at: String::new(),
        };
        let records = vec![
            record("ok", "c", vec![1.0, 0.0], 1),
            record("short", "c", vec![1.0], 1),
            record("orphan", "c", vec![1.0, 0.0], 9),
        ];

        let (accepted, rejected) = screen_records(&records, &[version]);
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected.len(), 2);
        assert!(rejected[1].reason.contains("unknown version"));
    }

    #[test]
    fn test_integrity_report_validity() {
        let report = IntegrityReport::new(4, vec![], vec![]);
        assert!(report.valid);

        let broken = RecordRef {
            entry_id: "x".to_string(),
            version_id: 2,
        };
        assert_eq!(broken.to_string(), "x@v2");
        assert!(!IntegrityReport::new(4, vec![broken], vec![]).valid);
    }
}
