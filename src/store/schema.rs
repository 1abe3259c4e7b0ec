//! Schema definitions for both storage backends
//!
//! The logical layout is identical; only the vector column differs
//! (little-endian f32 BLOB vs. pgvector `vector`).

/// SQL schema for the embedded (SQLite) backend
pub const SQLITE_SCHEMA_SQL: &str = r#"
-- Version registry: one row per (model, version, dimension)
CREATE TABLE IF NOT EXISTS embedding_versions (
    version_id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    dimension INTEGER NOT NULL CHECK (dimension > 0),
    is_current INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(model_name, model_version, dimension)
);

-- At most one current version
CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_single_current
    ON embedding_versions(is_current) WHERE is_current = 1;

-- Records: one vector per entry per version
CREATE TABLE IF NOT EXISTS embedding_records (
    entry_id TEXT NOT NULL,
    version_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    subcategory TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    vector BLOB NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entry_id, version_id)
);

CREATE INDEX IF NOT EXISTS idx_records_category
    ON embedding_records(version_id, category, subcategory);
"#;

/// SQL schema for the networked (PostgreSQL + pgvector) backend
pub const POSTGRES_SCHEMA_SQL: &str = r#"
CREATE EXTENSION IF NOT EXISTS vector;

CREATE TABLE IF NOT EXISTS embedding_versions (
    version_id BIGSERIAL PRIMARY KEY,
    model_name TEXT NOT NULL,
    model_version TEXT NOT NULL,
    dimension BIGINT NOT NULL CHECK (dimension > 0),
    is_current BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TEXT NOT NULL,
    UNIQUE (model_name, model_version, dimension)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_versions_single_current
    ON embedding_versions (is_current) WHERE is_current;

CREATE TABLE IF NOT EXISTS embedding_records (
    entry_id TEXT NOT NULL,
    version_id BIGINT NOT NULL,
    category TEXT NOT NULL,
    subcategory TEXT NOT NULL,
    fields_json TEXT NOT NULL,
    vector vector NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entry_id, version_id)
);

CREATE INDEX IF NOT EXISTS idx_records_category
    ON embedding_records (version_id, category, subcategory);
"#;
