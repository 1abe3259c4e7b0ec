//! Status command implementation

use crate::config::Config;
use crate::error::Result;
use crate::store::{CategoryCount, StorageBackend, StorageInfo};
use crate::version::ModelIdentity;
use serde::Serialize;
use tracing::info;

/// Status information
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub config_path: String,
    pub storage: StorageInfo,
    pub configured_model: ModelIdentity,
    /// The configured model matches the current version
    pub model_matches: bool,
    pub version_count: usize,
    pub categories: Vec<CategoryCount>,
}

/// Get system status
pub async fn cmd_status(config: &Config, storage: &dyn StorageBackend) -> Result<StatusInfo> {
    info!("Getting status");

    let info = storage.get_storage_info().await?;
    let configured_model = config.embedding.identity();
    let model_matches = info
        .current_version
        .as_ref()
        .is_some_and(|v| configured_model.matches(v));

    Ok(StatusInfo {
        config_path: config.paths.config_file.display().to_string(),
        version_count: storage.list_versions().await?.len(),
        categories: storage.count_by_category(None).await?,
        storage: info,
        configured_model,
        model_matches,
    })
}

/// Print status to console
pub fn print_status(status: &StatusInfo) {
    println!("\n📊 answerbank Status\n");
    println!("Configuration: {}", status.config_path);
    println!("\nStorage:");
    println!("  Backend: {}", status.storage.backend_kind);
    println!("  Location: {}", status.storage.location);
    println!("  Size: {} bytes", status.storage.size_bytes);
    println!("  Records (current version): {}", status.storage.total_records);
    println!("  Versions: {}", status.version_count);

    match &status.storage.current_version {
        Some(version) => println!("\nCurrent version: {}", version.label()),
        None => println!("\nCurrent version: none (run 'answerbank migrate')"),
    }
    println!("Configured model: {}", status.configured_model);
    if status.storage.current_version.is_some() && !status.model_matches {
        println!("⚠ Configured model differs; the next migrate will re-embed everything");
    }

    if !status.categories.is_empty() {
        println!("\nCategories:");
        for c in &status.categories {
            if c.subcategory.is_empty() {
                println!("  {}: {}", c.category, c.count);
            } else {
                println!("  {}/{}: {}", c.category, c.subcategory, c.count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::store::{SqliteStore, StorageBackend};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_of_fresh_store() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        let store = SqliteStore::connect(&config.sqlite_path(), &config.storage)
            .await
            .unwrap();
        store.initialize_schema().await.unwrap();

        let status = cmd_status(&config, &store).await.unwrap();
        assert_eq!(status.storage.backend_kind, BackendKind::Embedded);
        assert_eq!(status.version_count, 0);
        assert!(!status.model_matches);
        assert!(status.categories.is_empty());
    }
}
