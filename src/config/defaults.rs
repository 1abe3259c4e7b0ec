//! Default values for configuration

/// Default storage backend ("embedded" SQLite file)
pub fn default_storage_backend() -> String {
    "embedded".to_string()
}

/// Default SQLite file name, relative to the base directory
pub fn default_sqlite_file() -> String {
    "embeddings.db".to_string()
}

/// Default PostgreSQL URL for the networked backend
pub fn default_database_url() -> String {
    "postgres://answerbank@127.0.0.1:5432/answerbank".to_string()
}

/// Default connection pool size
pub fn default_pool_size() -> u32 {
    5
}

/// Default rows per multi-row INSERT inside a write transaction
pub fn default_write_batch_size() -> usize {
    20
}

/// Default seconds to wait for a pooled connection
pub fn default_acquire_timeout() -> u64 {
    10
}

/// Default embedding backend URL
pub fn default_embedding_url() -> String {
    "http://127.0.0.1:7997".to_string()
}

/// Default embedding model
pub fn default_embedding_model() -> String {
    "BAAI/bge-m3".to_string()
}

/// Default embedding model version
pub fn default_embedding_model_version() -> String {
    "v1".to_string()
}

/// Default embedding dimension (bge-m3 dense output)
pub fn default_embedding_dimension() -> usize {
    1024
}

/// Default entries per provider call
pub fn default_embedding_batch_size() -> usize {
    20
}

/// Default number of provider calls in flight
pub fn default_embedding_concurrency() -> usize {
    4
}

/// Default per-call timeout in seconds
pub fn default_embedding_timeout() -> u64 {
    30
}

/// Default attempt ceiling per batch (first try included)
pub fn default_embedding_max_attempts() -> u32 {
    4
}

/// Default first backoff delay
pub fn default_initial_backoff_ms() -> u64 {
    500
}

/// Default backoff cap
pub fn default_max_backoff_ms() -> u64 {
    8_000
}

/// Default number of results
pub fn default_query_top_k() -> usize {
    5
}

/// Hard ceiling on results per query
pub fn default_query_max_top_k() -> usize {
    10
}

/// Scores below this produce a low-confidence warning
pub fn default_low_confidence_threshold() -> f32 {
    0.5
}

/// Default knowledge-base file, relative to the base directory
pub fn default_source_path() -> String {
    "knowledge_base.json".to_string()
}
