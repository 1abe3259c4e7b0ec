//! Knowledge-base source loading
//!
//! Accepts either a JSON array of entries or JSON Lines (one entry per line).
//! `question`/`answer` keys are accepted in place of `fields`.

use crate::error::{Error, Result};
use crate::models::SourceEntry;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(alias = "id")]
    entry_id: String,
    category: String,
    #[serde(default)]
    subcategory: String,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    answer: Option<String>,
}

impl From<RawEntry> for SourceEntry {
    fn from(raw: RawEntry) -> Self {
        let fields = if raw.fields.is_empty() {
            raw.question.into_iter().chain(raw.answer).collect()
        } else {
            raw.fields
        };
        SourceEntry::new(raw.entry_id, raw.category, raw.subcategory, fields)
    }
}

/// Parse entries from JSON array or JSON Lines text
pub fn parse_entries(content: &str) -> Result<Vec<SourceEntry>> {
    let trimmed = content.trim_start();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let raw: Vec<RawEntry> = serde_json::from_str(trimmed)?;
        return Ok(raw.into_iter().map(SourceEntry::from).collect());
    }

    let mut entries = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawEntry = serde_json::from_str(line).map_err(|e| {
            Error::Config(format!("invalid entry at line {}: {}", line_no + 1, e))
        })?;
        entries.push(raw.into());
    }
    Ok(entries)
}

/// Load entries from a file
pub fn load_entries(path: &Path) -> Result<Vec<SourceEntry>> {
    debug!("Loading knowledge base from {:?}", path);
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("cannot read knowledge base {}: {}", path.display(), e))
    })?;
    parse_entries(&content)
}

/// Entries that survived validation, and the ones that did not
#[derive(Debug, Default)]
pub struct ScreenedEntries {
    pub accepted: Vec<SourceEntry>,
    pub rejected: Vec<(String, String)>,
}

/// Drop malformed and duplicate entries, keeping the first occurrence of each id
pub fn screen_entries(entries: Vec<SourceEntry>) -> ScreenedEntries {
    let mut screened = ScreenedEntries::default();
    let mut seen = HashSet::new();

    for entry in entries {
        if let Err(e) = entry.validate() {
            let (id, reason) = match e {
                Error::Validation { entry_id, reason } => (entry_id, reason),
                other => (entry.entry_id.clone(), other.to_string()),
            };
            warn!(entry_id = %id, %reason, "Rejecting source entry");
            screened.rejected.push((id, reason));
            continue;
        }
        if !seen.insert(entry.entry_id.clone()) {
            warn!(entry_id = %entry.entry_id, "Rejecting duplicate source entry");
            screened
                .rejected
                .push((entry.entry_id, "duplicate entry_id".to_string()));
            continue;
        }
        screened.accepted.push(entry);
    }

    screened
}

/// Load a usage signal (`entry_id -> count`) and scale it into [0, 1]
pub fn load_usage_signal(path: &Path) -> Result<HashMap<String, f32>> {
    let content = std::fs::read_to_string(path)?;
    let counts: HashMap<String, f64> = serde_json::from_str(&content)?;
    Ok(normalize_usage(&counts))
}

pub fn normalize_usage(counts: &HashMap<String, f64>) -> HashMap<String, f32> {
    let max = counts.values().copied().fold(0.0f64, f64::max);
    if max <= 0.0 {
        return counts.keys().map(|k| (k.clone(), 0.0)).collect();
    }
    counts
        .iter()
        .map(|(k, v)| (k.clone(), (v.max(0.0) / max) as f32))
        .collect()
}
