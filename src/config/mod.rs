//! Configuration management for answerbank
//!
//! Handles loading, saving, and validating configuration from TOML files.
//! The configuration is read once at startup and passed around by reference.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use crate::version::ModelIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Overrides `storage.database_url`
pub const DATABASE_URL_ENV: &str = "ANSWERBANK_DATABASE_URL";
/// Overrides `embedding.url`
pub const EMBEDDING_URL_ENV: &str = "ANSWERBANK_EMBEDDING_URL";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Knowledge-base source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Which storage backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Embedded,
    Networked,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Embedded => write!(f, "embedded"),
            BackendKind::Networked => write!(f, "networked"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "embedded" | "sqlite" => Ok(BackendKind::Embedded),
            "networked" | "postgres" | "postgresql" => Ok(BackendKind::Networked),
            _ => Err(Error::Config(format!(
                "Unknown storage backend '{}'; expected 'embedded' or 'networked'",
                s
            ))),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "embedded" (SQLite file) or "networked" (PostgreSQL + pgvector)
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// SQLite file, relative to the config directory unless absolute
    #[serde(default = "default_sqlite_file")]
    pub sqlite_file: String,

    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Rows per INSERT statement inside a write transaction
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl StorageConfig {
    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.backend.parse()
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding backend base URL
    #[serde(default = "default_embedding_url")]
    pub url: String,

    /// Model name/identifier
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Model version; bump to force a version migration
    #[serde(default = "default_embedding_model_version")]
    pub model_version: String,

    /// Embedding dimension (must match model)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Entries per provider call
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Provider calls in flight
    #[serde(default = "default_embedding_concurrency")]
    pub concurrency: usize,

    /// Per-call timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Attempts per batch before it is reported as failed
    #[serde(default = "default_embedding_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl EmbeddingConfig {
    /// The identity that the version registry compares against storage
    pub fn identity(&self) -> ModelIdentity {
        ModelIdentity::new(&self.model, &self.model_version, self.dimension)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Default number of results
    #[serde(default = "default_query_top_k")]
    pub default_top_k: usize,

    /// Maximum results allowed
    #[serde(default = "default_query_max_top_k")]
    pub max_top_k: usize,

    /// Minimum similarity regarded as a confident match (0.0 - 1.0)
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f32,

    /// Blend similarity with historical usage (0.7 / 0.3)
    #[serde(default)]
    pub usage_blend: bool,

    /// Optional JSON map of entry_id -> usage count
    #[serde(default)]
    pub usage_file: Option<String>,
}

/// Knowledge-base source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON or JSON Lines file with knowledge-base entries
    #[serde(default = "default_source_path")]
    pub path: String,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for answerbank data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            sqlite_file: default_sqlite_file(),
            database_url: default_database_url(),
            pool_size: default_pool_size(),
            write_batch_size: default_write_batch_size(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            model_version: default_embedding_model_version(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            concurrency: default_embedding_concurrency(),
            timeout_secs: default_embedding_timeout(),
            max_attempts: default_embedding_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_query_top_k(),
            max_top_k: default_query_max_top_k(),
            low_confidence_threshold: default_low_confidence_threshold(),
            usage_blend: false,
            usage_file: None,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: default_source_path(),
        }
    }
}

impl Config {
    /// Get the default base directory for answerbank (~/.answerbank)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".answerbank")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());

        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Let the environment override connection URLs written in the file
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = var(DATABASE_URL_ENV) {
            debug!("Using database URL from {}", DATABASE_URL_ENV);
            self.storage.database_url = url;
        }
        if let Some(url) = var(EMBEDDING_URL_ENV) {
            debug!("Using embedding URL from {}", EMBEDDING_URL_ENV);
            self.embedding.url = url;
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Resolve a possibly relative path against the config directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            path
        } else {
            self.paths.base_dir.join(path)
        }
    }

    /// Absolute path of the embedded database file
    pub fn sqlite_path(&self) -> PathBuf {
        self.resolve_path(&self.storage.sqlite_file)
    }

    /// Absolute path of the knowledge-base source file
    pub fn source_path(&self) -> PathBuf {
        self.resolve_path(&self.source.path)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.storage.backend_kind()?;

        if self.storage.pool_size == 0 {
            return Err(Error::Config("storage.pool_size must be >= 1".to_string()));
        }

        if self.storage.write_batch_size == 0 {
            return Err(Error::Config(
                "storage.write_batch_size must be >= 1".to_string(),
            ));
        }

        if self.embedding.dimension == 0 {
            return Err(Error::Config(
                "embedding.dimension must be positive".to_string(),
            ));
        }

        if self.embedding.batch_size == 0 {
            return Err(Error::Config(
                "embedding.batch_size must be >= 1".to_string(),
            ));
        }

        if self.embedding.concurrency == 0 {
            return Err(Error::Config(
                "embedding.concurrency must be >= 1".to_string(),
            ));
        }

        if self.embedding.max_attempts == 0 {
            return Err(Error::Config(
                "embedding.max_attempts must be >= 1".to_string(),
            ));
        }

        if self.embedding.initial_backoff_ms > self.embedding.max_backoff_ms {
            return Err(Error::Config(
                "embedding.initial_backoff_ms must be <= embedding.max_backoff_ms".to_string(),
            ));
        }

        if self.query.max_top_k == 0 || self.query.default_top_k > self.query.max_top_k {
            return Err(Error::Config(
                "query.default_top_k must be between 1 and query.max_top_k".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.query.low_confidence_threshold) {
            return Err(Error::Config(
                "query.low_confidence_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.backend_kind().unwrap(), BackendKind::Embedded);
        assert_eq!(config.embedding.batch_size, 20);
        assert_eq!(config.query.max_top_k, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_saved_urls() {
        let mut config = Config::default();
        config.storage.database_url = "postgres://file@db/kb".to_string();
        config.apply_env_overrides(|key| match key {
            DATABASE_URL_ENV => Some("postgres://env@db/kb".to_string()),
            EMBEDDING_URL_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.storage.database_url, "postgres://env@db/kb");
        assert_eq!(config.embedding.url, default_embedding_url());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.embedding.model_version = "v2".to_string();
        config.storage.backend = "networked".to_string();

        config.save().unwrap();
        assert!(config.paths.config_file.exists());

        let loaded = Config::load(&config.paths.config_file).unwrap();
        assert_eq!(loaded.embedding.model_version, "v2");
        assert_eq!(loaded.storage.backend_kind().unwrap(), BackendKind::Networked);
        assert_eq!(loaded.sqlite_path(), tmp.path().join("embeddings.db"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[embedding]\nmodel = \"modelA\"\ndimension = 8\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.embedding.model, "modelA");
        assert_eq!(loaded.embedding.dimension, 8);
        assert_eq!(loaded.embedding.max_attempts, 4);
        assert_eq!(loaded.query.default_top_k, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.storage.backend = "mongo".to_string();
        assert!(config.validate().is_err());
        config.storage.backend = "embedded".to_string();

        config.query.default_top_k = 11;
        assert!(config.validate().is_err());
        config.query.default_top_k = 5;

        config.embedding.initial_backoff_ms = 10_000;
        assert!(config.validate().is_err());
        config.embedding.initial_backoff_ms = 100;

        config.query.low_confidence_threshold = 1.5;
        assert!(config.validate().is_err());
        config.query.low_confidence_threshold = 0.4;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_identity_from_config() {
        let mut config = Config::default();
        config.embedding.model = "modelA".to_string();
        config.embedding.model_version = "v1".to_string();
        config.embedding.dimension = 1024;

        let identity = config.embedding.identity();
        assert_eq!(identity, ModelIdentity::new("modelA", "v1", 1024));
    }
}
