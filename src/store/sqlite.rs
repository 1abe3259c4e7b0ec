//! Embedded backend: a single SQLite file in WAL mode
//!
//! Vectors are stored as little-endian f32 BLOBs (see [`crate::codec`]).

use super::{
    screen_records, BatchWriteReport, CategoryCount, IntegrityReport, RecordRef, StorageBackend,
    StorageInfo, StoredDigest, SQLITE_SCHEMA_SQL,
};
use crate::codec::{decode_vector, encode_vector};
use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::models::{parse_fields, EmbeddingRecord, EmbeddingVersion};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// SQLite caps bound parameters per statement; nine are bound per row
const MAX_ROWS_PER_INSERT: usize = 3000;

#[derive(FromRow)]
struct RecordRow {
    entry_id: String,
    version_id: i64,
    category: String,
    subcategory: String,
    fields_json: String,
    vector: Vec<u8>,
    content_hash: String,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn into_record(self) -> Result<EmbeddingRecord> {
        let vector = decode_vector(&self.vector)?;
        let source_text_fields = parse_fields(&self.entry_id, &self.fields_json)?;
        Ok(EmbeddingRecord {
            entry_id: self.entry_id,
            category: self.category,
            subcategory: self.subcategory,
            source_text_fields,
            vector,
            content_hash: self.content_hash,
            version_id: self.version_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Decode rows, skipping the ones that cannot be read back
fn decode_rows(rows: Vec<RecordRow>) -> Vec<EmbeddingRecord> {
    rows.into_iter()
        .filter_map(|row| {
            let entry_id = row.entry_id.clone();
            let version_id = row.version_id;
            match row.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(%entry_id, version_id, "Skipping undecodable record: {}", e);
                    None
                }
            }
        })
        .collect()
}

/// Single-file embedded store
pub struct SqliteStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database file
    pub async fn connect(db_path: &Path, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| {
                Error::Connection(format!("cannot open {}: {}", db_path.display(), e))
            })?;

        Ok(Self {
            pool,
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a raw script, e.g. to install failure triggers
    #[cfg(test)]
    pub(crate) async fn execute_for_tests(&self, sql: &str) -> Result<()> {
        sqlx::raw_sql(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing SQLite schema");
        sqlx::raw_sql(SQLITE_SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn get_or_create_version(
        &self,
        model_name: &str,
        model_version: &str,
        dimension: usize,
    ) -> Result<i64> {
        if dimension == 0 {
            return Err(Error::Config("embedding dimension must be positive".to_string()));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO embedding_versions (model_name, model_version, dimension, is_current, created_at)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(model_name, model_version, dimension) DO NOTHING
            "#,
        )
        .bind(model_name)
        .bind(model_version)
        .bind(dimension as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let version_id: i64 = sqlx::query_scalar(
            "SELECT version_id FROM embedding_versions WHERE model_name = ? AND model_version = ? AND dimension = ?",
        )
        .bind(model_name)
        .bind(model_version)
        .bind(dimension as i64)
        .fetch_one(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            info!(version_id, model_name, model_version, dimension, "Registered embedding version");
        }
        Ok(version_id)
    }

    async fn get_current_version(&self) -> Result<Option<EmbeddingVersion>> {
        let version = sqlx::query_as::<_, EmbeddingVersion>(
            "SELECT * FROM embedding_versions WHERE is_current = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    async fn set_current_version(&self, version_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> =
            sqlx::query_scalar("SELECT version_id FROM embedding_versions WHERE version_id = ?")
                .bind(version_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("version {}", version_id)));
        }

        sqlx::query("UPDATE embedding_versions SET is_current = 0 WHERE is_current = 1")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE embedding_versions SET is_current = 1 WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(version_id, "Current embedding version changed");
        Ok(())
    }

    async fn get_version(&self, version_id: i64) -> Result<Option<EmbeddingVersion>> {
        let version = sqlx::query_as::<_, EmbeddingVersion>(
            "SELECT * FROM embedding_versions WHERE version_id = ?",
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    async fn list_versions(&self) -> Result<Vec<EmbeddingVersion>> {
        let versions = sqlx::query_as::<_, EmbeddingVersion>(
            "SELECT * FROM embedding_versions ORDER BY version_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(versions)
    }

    async fn delete_version(&self, version_id: i64) -> Result<u64> {
        let version = self
            .get_version(version_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("version {}", version_id)))?;
        if version.is_current {
            return Err(Error::Other(format!(
                "refusing to delete current version {}",
                version.label()
            )));
        }

        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM embedding_records WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM embedding_versions WHERE version_id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(version_id, removed, "Deleted embedding version");
        Ok(removed)
    }

    async fn store_records_batch(
        &self,
        records: &[EmbeddingRecord],
        batch_size: usize,
    ) -> Result<BatchWriteReport> {
        let versions = self.list_versions().await?;
        let (accepted, rejected) = screen_records(records, &versions);
        if accepted.is_empty() {
            return Ok(BatchWriteReport { written: 0, rejected });
        }

        let mut rows = Vec::with_capacity(accepted.len());
        for record in &accepted {
            rows.push((*record, record.fields_json()?, encode_vector(&record.vector)));
        }

        let rows_per_insert = batch_size.clamp(1, MAX_ROWS_PER_INSERT);
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(rows_per_insert) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO embedding_records (entry_id, version_id, category, subcategory, \
                 fields_json, vector, content_hash, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, (record, fields_json, blob)| {
                row.push_bind(record.entry_id.clone())
                    .push_bind(record.version_id)
                    .push_bind(record.category.clone())
                    .push_bind(record.subcategory.clone())
                    .push_bind(fields_json.clone())
                    .push_bind(blob.clone())
                    .push_bind(record.content_hash.clone())
                    .push_bind(record.created_at.clone())
                    .push_bind(record.updated_at.clone());
            });
            builder.push(
                " ON CONFLICT(entry_id, version_id) DO UPDATE SET \
                 category = excluded.category, \
                 subcategory = excluded.subcategory, \
                 fields_json = excluded.fields_json, \
                 vector = excluded.vector, \
                 content_hash = excluded.content_hash, \
                 updated_at = excluded.updated_at",
            );
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(written = rows.len(), rejected = rejected.len(), "Stored record batch");

        Ok(BatchWriteReport {
            written: rows.len(),
            rejected,
        })
    }

    async fn load_record(&self, entry_id: &str) -> Result<Option<EmbeddingRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM embedding_records
            WHERE entry_id = ?
              AND version_id = (SELECT version_id FROM embedding_versions WHERE is_current = 1)
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn load_all(&self, version_id: Option<i64>) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM embedding_records
            WHERE version_id = COALESCE(?, (SELECT version_id FROM embedding_versions WHERE is_current = 1))
            ORDER BY entry_id
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(rows))
    }

    async fn load_by_category(
        &self,
        category: &str,
        subcategory: Option<&str>,
    ) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT * FROM embedding_records
            WHERE version_id = (SELECT version_id FROM embedding_versions WHERE is_current = 1)
              AND category = ?
              AND (? IS NULL OR subcategory = ?)
            ORDER BY entry_id
            "#,
        )
        .bind(category)
        .bind(subcategory)
        .bind(subcategory)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_rows(rows))
    }

    async fn update_record(&self, entry_id: &str, record: &EmbeddingRecord) -> Result<()> {
        let current = self.get_current_version().await?.ok_or(Error::NotInitialized)?;
        record.validate(current.dim())?;

        let result = sqlx::query(
            r#"
            UPDATE embedding_records
            SET category = ?, subcategory = ?, fields_json = ?, vector = ?, content_hash = ?, updated_at = ?
            WHERE entry_id = ? AND version_id = ?
            "#,
        )
        .bind(&record.category)
        .bind(&record.subcategory)
        .bind(record.fields_json()?)
        .bind(encode_vector(&record.vector))
        .bind(&record.content_hash)
        .bind(Utc::now().to_rfc3339())
        .bind(entry_id)
        .bind(current.version_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("record '{}'", entry_id)));
        }
        Ok(())
    }

    async fn delete_record(&self, entry_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_records
            WHERE entry_id = ?
              AND version_id = (SELECT version_id FROM embedding_versions WHERE is_current = 1)
            "#,
        )
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_digests(&self, version_id: Option<i64>) -> Result<HashMap<String, StoredDigest>> {
        let digests = sqlx::query_as::<_, StoredDigest>(
            r#"
            SELECT entry_id, content_hash, category, subcategory FROM embedding_records
            WHERE version_id = COALESCE(?, (SELECT version_id FROM embedding_versions WHERE is_current = 1))
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(digests
            .into_iter()
            .map(|digest| (digest.entry_id.clone(), digest))
            .collect())
    }

    async fn exists(&self, entry_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM embedding_records
            WHERE entry_id = ?
              AND version_id = (SELECT version_id FROM embedding_versions WHERE is_current = 1)
            "#,
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn count(&self, version_id: Option<i64>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM embedding_records
            WHERE version_id = COALESCE(?, (SELECT version_id FROM embedding_versions WHERE is_current = 1))
            "#,
        )
        .bind(version_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn all_entry_ids(&self, version_id: Option<i64>) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT entry_id FROM embedding_records
            WHERE version_id = COALESCE(?, (SELECT version_id FROM embedding_versions WHERE is_current = 1))
            ORDER BY entry_id
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn count_by_category(&self, version_id: Option<i64>) -> Result<Vec<CategoryCount>> {
        let counts = sqlx::query_as::<_, CategoryCount>(
            r#"
            SELECT category, subcategory, COUNT(*) AS count FROM embedding_records
            WHERE version_id = COALESCE(?, (SELECT version_id FROM embedding_versions WHERE is_current = 1))
            GROUP BY category, subcategory
            ORDER BY category, subcategory
            "#,
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(counts)
    }

    async fn validate_integrity(&self) -> Result<IntegrityReport> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_records")
            .fetch_one(&self.pool)
            .await?;

        let corrupted: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT r.entry_id, r.version_id
            FROM embedding_records r
            JOIN embedding_versions v ON v.version_id = r.version_id
            WHERE length(r.vector) % 4 != 0 OR length(r.vector) / 4 != v.dimension
            ORDER BY r.version_id, r.entry_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let orphaned: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT r.entry_id, r.version_id
            FROM embedding_records r
            LEFT JOIN embedding_versions v ON v.version_id = r.version_id
            WHERE v.version_id IS NULL
            ORDER BY r.version_id, r.entry_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let to_refs = |rows: Vec<(String, i64)>| -> Vec<RecordRef> {
            rows.into_iter()
                .map(|(entry_id, version_id)| RecordRef { entry_id, version_id })
                .collect()
        };

        Ok(IntegrityReport::new(total as u64, to_refs(corrupted), to_refs(orphaned)))
    }

    async fn get_storage_info(&self) -> Result<StorageInfo> {
        let size: i64 = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageInfo {
            backend_kind: BackendKind::Embedded,
            location: self.path.display().to_string(),
            total_records: self.count(None).await?,
            size_bytes: size.max(0) as u64,
            current_version: self.get_current_version().await?,
        })
    }
}
