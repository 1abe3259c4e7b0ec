//! Data model shared by storage, pipeline and cache

use crate::error::{Error, Result};
use crate::hash::{content_hash, is_content_hash};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A knowledge-base entry as supplied by the source loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(alias = "id")]
    pub entry_id: String,
    pub category: String,
    pub subcategory: String,
    /// Ordered text fields (e.g. question, answer)
    pub fields: Vec<String>,
}

impl SourceEntry {
    pub fn new(
        entry_id: impl Into<String>,
        category: impl Into<String>,
        subcategory: impl Into<String>,
        fields: Vec<String>,
    ) -> Self {
        Self {
            entry_id: entry_id.into(),
            category: category.into(),
            subcategory: subcategory.into(),
            fields,
        }
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.fields)
    }

    /// Text submitted to the embedding provider
    pub fn embedding_text(&self) -> String {
        self.fields.join("\n")
    }

    /// Reject entries that cannot be keyed or embedded
    pub fn validate(&self) -> Result<()> {
        if self.entry_id.trim().is_empty() {
            return Err(Error::validation("<empty>", "entry_id is empty"));
        }
        if self.category.trim().is_empty() {
            return Err(Error::validation(&self.entry_id, "category is empty"));
        }
        if self.fields.iter().all(|f| f.trim().is_empty()) {
            return Err(Error::validation(&self.entry_id, "no non-empty text fields"));
        }
        Ok(())
    }
}

/// One entry's vector plus denormalized metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub entry_id: String,
    pub category: String,
    pub subcategory: String,
    pub source_text_fields: Vec<String>,
    pub vector: Vec<f32>,
    pub content_hash: String,
    pub version_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl EmbeddingRecord {
    /// Build a fresh record for `entry` under `version_id`
    pub fn from_entry(entry: &SourceEntry, vector: Vec<f32>, version_id: i64) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            entry_id: entry.entry_id.clone(),
            category: entry.category.clone(),
            subcategory: entry.subcategory.clone(),
            source_text_fields: entry.fields.clone(),
            content_hash: entry.content_hash(),
            vector,
            version_id,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Check the record against the dimension of its version
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.entry_id.trim().is_empty() {
            return Err(Error::validation("<empty>", "entry_id is empty"));
        }
        if self.vector.len() != dimension {
            return Err(Error::validation(
                &self.entry_id,
                format!(
                    "vector has {} components, version {} expects {}",
                    self.vector.len(),
                    self.version_id,
                    dimension
                ),
            ));
        }
        if self.vector.iter().any(|v| !v.is_finite()) {
            return Err(Error::validation(
                &self.entry_id,
                "vector contains non-finite values",
            ));
        }
        if !is_content_hash(&self.content_hash) {
            return Err(Error::validation(&self.entry_id, "malformed content hash"));
        }
        Ok(())
    }

    pub fn fields_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.source_text_fields)?)
    }
}

/// A registered (model, version, dimension) tuple
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct EmbeddingVersion {
    pub version_id: i64,
    pub model_name: String,
    pub model_version: String,
    pub dimension: i64,
    pub is_current: bool,
    pub created_at: String,
}

impl EmbeddingVersion {
    pub fn dim(&self) -> usize {
        self.dimension as usize
    }

    pub fn label(&self) -> String {
        format!(
            "{}@{} ({}d, #{})",
            self.model_name, self.model_version, self.dimension, self.version_id
        )
    }
}

/// Parse the JSON-encoded text fields column
pub(crate) fn parse_fields(entry_id: &str, fields_json: &str) -> Result<Vec<String>> {
    serde_json::from_str(fields_json).map_err(|e| {
        Error::Serialization(format!(
            "text fields of '{}' are not a JSON string list: {}",
            entry_id, e
        ))
    })
}
