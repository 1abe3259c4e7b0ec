//! Validate command implementation

use crate::error::Result;
use crate::store::{IntegrityReport, StorageBackend};
use tracing::info;

/// Run an integrity scan over every stored record
pub async fn cmd_validate(storage: &dyn StorageBackend) -> Result<IntegrityReport> {
    info!("Validating stored embeddings");
    storage.validate_integrity().await
}

/// Print an integrity report to console
pub fn print_integrity(report: &IntegrityReport) {
    println!("\n🩺 Integrity\n");
    println!("Records checked: {}", report.total);
    if report.valid {
        println!("Status: ✓ Valid");
        return;
    }

    println!("Status: ✗ Invalid");
    if !report.corrupted_ids.is_empty() {
        println!("Corrupted ({}):", report.corrupted_ids.len());
        for id in &report.corrupted_ids {
            println!("  • {}", id);
        }
    }
    if !report.orphaned_ids.is_empty() {
        println!("Orphaned ({}):", report.orphaned_ids.len());
        for id in &report.orphaned_ids {
            println!("  • {}", id);
        }
    }
}
