//! Embedding version reconciliation
//!
//! Compares the provider's model identity with the version currently marked in storage
//! and decides whether a run is an initial load, an incremental update or a migration.

use crate::error::{Error, Result};
use crate::models::EmbeddingVersion;
use crate::store::StorageBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// (model name, model version, dimension) as reported by an embedding provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelIdentity {
    pub model_name: String,
    pub model_version: String,
    pub dimension: usize,
}

impl ModelIdentity {
    pub fn new(model_name: &str, model_version: &str, dimension: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            model_version: model_version.to_string(),
            dimension,
        }
    }

    pub fn matches(&self, version: &EmbeddingVersion) -> bool {
        self.model_name == version.model_name
            && self.model_version == version.model_version
            && self.dimension == version.dim()
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({}d)", self.model_name, self.model_version, self.dimension)
    }
}

/// What a pipeline run has to do with respect to versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionPlan {
    /// No current version existed; one was created and marked current
    Initial { version: EmbeddingVersion },
    /// The current version matches the provider
    Incremental { version: EmbeddingVersion },
    /// The provider changed; `version` is now current and every entry is re-embedded
    Migration {
        previous: EmbeddingVersion,
        version: EmbeddingVersion,
    },
}

impl VersionPlan {
    /// The version records are written under
    pub fn target(&self) -> &EmbeddingVersion {
        match self {
            VersionPlan::Initial { version }
            | VersionPlan::Incremental { version }
            | VersionPlan::Migration { version, .. } => version,
        }
    }

    /// Initial loads and migrations process every entry
    pub fn requires_full_embed(&self) -> bool {
        !matches!(self, VersionPlan::Incremental { .. })
    }
}

/// Make storage's current version agree with `identity`
pub async fn reconcile_version(
    storage: &dyn StorageBackend,
    identity: &ModelIdentity,
) -> Result<VersionPlan> {
    let current = storage.get_current_version().await?;

    if let Some(version) = current.as_ref().filter(|v| identity.matches(v)) {
        return Ok(VersionPlan::Incremental {
            version: version.clone(),
        });
    }

    let version_id = storage
        .get_or_create_version(&identity.model_name, &identity.model_version, identity.dimension)
        .await?;
    storage.set_current_version(version_id).await?;
    let version = storage.get_current_version().await?.ok_or_else(|| {
        Error::Integrity(format!("version {} vanished after activation", version_id))
    })?;

    match current {
        None => {
            info!("Initial embedding version {}", version.label());
            Ok(VersionPlan::Initial { version })
        }
        Some(previous) => {
            info!(
                "Embedding model changed: {} -> {}",
                previous.label(),
                version.label()
            );
            Ok(VersionPlan::Migration { previous, version })
        }
    }
}
