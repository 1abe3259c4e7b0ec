//! Networked backend: PostgreSQL with the pgvector extension

use super::{
    screen_records, BatchWriteReport, CategoryCount, IntegrityReport, RecordRef, StorageBackend,
    StorageInfo, StoredDigest, POSTGRES_SCHEMA_SQL,
};
use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::models::{parse_fields, EmbeddingRecord, EmbeddingVersion};
use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

/// Postgres allows 65535 bind parameters; nine are bound per row
const MAX_ROWS_PER_INSERT: usize = 7000;

#[derive(FromRow)]
struct RecordRow {
    entry_id: String,
    version_id: i64,
    category: String,
    subcategory: String,
    fields_json: String,
    vector: Vector,
    content_hash: String,
    created_at: String,
    updated_at: String,
}

impl RecordRow {
    fn into_record(self) -> Result<EmbeddingRecord> {
        let source_text_fields = parse_fields(&self.entry_id, &self.fields_json)?;
        Ok(EmbeddingRecord {
            entry_id: self.entry_id,
            category: self.category,
            subcategory: self.subcategory,
            source_text_fields,
            vector: self.vector.to_vec(),
            content_hash: self.content_hash,
            version_id: self.version_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

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

/// Hide credentials before a URL is logged or displayed
pub(crate) fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<invalid database url>".to_string(),
    }
}

/// Pooled PostgreSQL store
pub struct PostgresStore {
    pool: PgPool,
    location: String,
}

impl PostgresStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let location = redact_url(&config.database_url);
        debug!("Connecting to PostgreSQL at {}", location);

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.database_url)
            .await
            .map_err(|e| Error::Connection(format!("cannot connect to {}: {}", location, e)))?;

        Ok(Self { pool, location })
    }

    /// Drop both tables so a test run starts from nothing
    #[cfg(test)]
    pub(crate) async fn reset_for_tests(&self) -> Result<()> {
        sqlx::raw_sql("DROP TABLE IF EXISTS embedding_records; DROP TABLE IF EXISTS embedding_versions;")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for PostgresStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Networked
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    async fn initialize_schema(&self) -> Result<()> {
        debug!("Initializing PostgreSQL schema");
        sqlx::raw_sql(POSTGRES_SCHEMA_SQL).execute(&self.pool).await?;
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

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO embedding_versions (model_name, model_version, dimension, is_current, created_at)
            VALUES ($1, $2, $3, FALSE, $4)
            ON CONFLICT (model_name, model_version, dimension) DO NOTHING
            RETURNING version_id
            "#,
        )
        .bind(model_name)
        .bind(model_version)
        .bind(dimension as i64)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version_id) = inserted {
            info!(version_id, model_name, model_version, dimension, "Registered embedding version");
            return Ok(version_id);
        }

        let version_id: i64 = sqlx::query_scalar(
            "SELECT version_id FROM embedding_versions WHERE model_name = $1 AND model_version = $2 AND dimension = $3",
        )
        .bind(model_name)
        .bind(model_version)
        .bind(dimension as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(version_id)
    }

    async fn get_current_version(&self) -> Result<Option<EmbeddingVersion>> {
        let version = sqlx::query_as::<_, EmbeddingVersion>(
            "SELECT * FROM embedding_versions WHERE is_current",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(version)
    }

    async fn set_current_version(&self, version_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent switches
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT version_id FROM embedding_versions WHERE version_id = $1 FOR UPDATE",
        )
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("version {}", version_id)));
        }

        sqlx::query("UPDATE embedding_versions SET is_current = FALSE WHERE is_current")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE embedding_versions SET is_current = TRUE WHERE version_id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(version_id, "Current embedding version changed");
        Ok(())
    }

    async fn get_version(&self, version_id: i64) -> Result<Option<EmbeddingVersion>> {
        let version = sqlx::query_as::<_, EmbeddingVersion>(
            "SELECT * FROM embedding_versions WHERE version_id = $1",
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
        let removed = sqlx::query("DELETE FROM embedding_records WHERE version_id = $1")
            .bind(version_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM embedding_versions WHERE version_id = $1")
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
            rows.push((*record, record.fields_json()?));
        }

        let rows_per_insert = batch_size.clamp(1, MAX_ROWS_PER_INSERT);
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(rows_per_insert) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO embedding_records (entry_id, version_id, category, subcategory, \
                 fields_json, vector, content_hash, created_at, updated_at) ",
            );
            builder.push_values(chunk, |mut row, (record, fields_json)| {
                row.push_bind(record.entry_id.clone())
                    .push_bind(record.version_id)
                    .push_bind(record.category.clone())
                    .push_bind(record.subcategory.clone())
                    .push_bind(fields_json.clone())
                    .push_bind(Vector::from(record.vector.clone()))
                    .push_bind(record.content_hash.clone())
                    .push_bind(record.created_at.clone())
                    .push_bind(record.updated_at.clone());
            });
            builder.push(
                " ON CONFLICT (entry_id, version_id) DO UPDATE SET \
                 category = EXCLUDED.category, \
                 subcategory = EXCLUDED.subcategory, \
                 fields_json = EXCLUDED.fields_json, \
                 vector = EXCLUDED.vector, \
                 content_hash = EXCLUDED.content_hash, \
                 updated_at = EXCLUDED.updated_at",
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
            WHERE entry_id = $1
              AND version_id = (SELECT version_id FROM embedding_versions WHERE is_current)
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
            WHERE version_id = COALESCE($1::BIGINT, (SELECT version_id FROM embedding_versions WHERE is_current))
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
            WHERE version_id = (SELECT version_id FROM embedding_versions WHERE is_current)
              AND category = $1
              AND ($2::TEXT IS NULL OR subcategory = $2)
            ORDER BY entry_id
            "#,
        )
        .bind(category)
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
            SET category = $1, subcategory = $2, fields_json = $3, vector = $4, content_hash = $5, updated_at = $6
            WHERE entry_id = $7 AND version_id = $8
            "#,
        )
        .bind(&record.category)
        .bind(&record.subcategory)
        .bind(record.fields_json()?)
        .bind(Vector::from(record.vector.clone()))
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
            WHERE entry_id = $1
              AND version_id = (SELECT version_id FROM embedding_versions WHERE is_current)
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
            WHERE version_id = COALESCE($1::BIGINT, (SELECT version_id FROM embedding_versions WHERE is_current))
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
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM embedding_records
                WHERE entry_id = $1
                  AND version_id = (SELECT version_id FROM embedding_versions WHERE is_current)
            )
            "#,
        )
        .bind(entry_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn count(&self, version_id: Option<i64>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM embedding_records
            WHERE version_id = COALESCE($1::BIGINT, (SELECT version_id FROM embedding_versions WHERE is_current))
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
            WHERE version_id = COALESCE($1::BIGINT, (SELECT version_id FROM embedding_versions WHERE is_current))
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
            WHERE version_id = COALESCE($1::BIGINT, (SELECT version_id FROM embedding_versions WHERE is_current))
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
            WHERE vector_dims(r.vector) <> v.dimension
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
            "SELECT pg_total_relation_size('embedding_records') + pg_total_relation_size('embedding_versions')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageInfo {
            backend_kind: BackendKind::Networked,
            location: self.location.clone(),
            total_records: self.count(None).await?,
            size_bytes: size.max(0) as u64,
            current_version: self.get_current_version().await?,
        })
    }
}
