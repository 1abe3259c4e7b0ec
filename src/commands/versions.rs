//! Versions command implementation

use crate::error::Result;
use crate::models::EmbeddingVersion;
use crate::store::StorageBackend;
use serde::Serialize;

/// A registered version with its record count
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    #[serde(flatten)]
    pub version: EmbeddingVersion,
    pub records: u64,
}

/// List every version, oldest first
pub async fn cmd_versions(storage: &dyn StorageBackend) -> Result<Vec<VersionInfo>> {
    let mut result = Vec::new();
    for version in storage.list_versions().await? {
        let records = storage.count(Some(version.version_id)).await?;
        result.push(VersionInfo { version, records });
    }
    Ok(result)
}

/// Print versions to console
pub fn print_versions(versions: &[VersionInfo]) {
    println!("\n🗂  Embedding Versions\n");

    if versions.is_empty() {
        println!("No versions registered. Run 'answerbank migrate' first.");
        return;
    }

    for info in versions {
        let marker = if info.version.is_current { "*" } else { " " };
        println!(
            "{} #{} {}@{} ({}d), {} records, created {}",
            marker,
            info.version.version_id,
            info.version.model_name,
            info.version.model_version,
            info.version.dimension,
            info.records,
            info.version.created_at
        );
    }
}
