//! Cleanup command implementation

use crate::error::Result;
use crate::store::StorageBackend;
use serde::Serialize;
use tracing::info;

/// What cleanup removed, or would remove
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub retired_versions: Vec<String>,
    pub records_removed: u64,
    pub applied: bool,
}

/// Delete every non-current version and its records.
///
/// Without `confirmed` nothing is deleted and the candidates are only listed.
pub async fn cmd_cleanup(storage: &dyn StorageBackend, confirmed: bool) -> Result<CleanupStats> {
    let retired: Vec<_> = storage
        .list_versions()
        .await?
        .into_iter()
        .filter(|v| !v.is_current)
        .collect();

    let mut stats = CleanupStats {
        applied: confirmed,
        ..CleanupStats::default()
    };

    for version in retired {
        stats.retired_versions.push(version.label());
        if confirmed {
            stats.records_removed += storage.delete_version(version.version_id).await?;
        } else {
            stats.records_removed += storage.count(Some(version.version_id)).await?;
        }
    }

    if confirmed {
        info!(
            versions = stats.retired_versions.len(),
            records = stats.records_removed,
            "Removed retired versions"
        );
    }
    Ok(stats)
}

/// Print cleanup stats to console
pub fn print_cleanup_stats(stats: &CleanupStats) {
    if stats.retired_versions.is_empty() {
        println!("No retired versions to remove.");
        return;
    }

    let verb = if stats.applied { "Removed" } else { "Would remove" };
    println!(
        "\n🧹 {} {} version(s), {} record(s):",
        verb,
        stats.retired_versions.len(),
        stats.records_removed
    );
    for label in &stats.retired_versions {
        println!("  • {}", label);
    }
    if !stats.applied {
        println!("\nRun with --yes to delete them.");
    }
}
