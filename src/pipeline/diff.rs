//! Change detection between source entries and stored content hashes

use crate::models::SourceEntry;
use crate::store::StoredDigest;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Classification of a source snapshot against one stored version
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub new: Vec<SourceEntry>,
    pub modified: Vec<SourceEntry>,
    /// Same content, moved to another category or subcategory; no re-embedding needed
    pub retagged: Vec<SourceEntry>,
    /// Stored ids absent from the source
    pub deleted: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Counts only, for dry runs and summaries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub new: usize,
    pub modified: usize,
    pub retagged: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ChangeSet {
    /// Nothing to embed and nothing to delete
    pub fn is_noop(&self) -> bool {
        self.new.is_empty()
            && self.modified.is_empty()
            && self.retagged.is_empty()
            && self.deleted.is_empty()
    }

    /// Entries that need a provider call, new ones first
    pub fn to_process(&self) -> Vec<SourceEntry> {
        self.new.iter().chain(self.modified.iter()).cloned().collect()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            new: self.new.len(),
            modified: self.modified.len(),
            retagged: self.retagged.len(),
            deleted: self.deleted.len(),
            unchanged: self.unchanged.len(),
        }
    }
}

/// Compare `entries` with the stored digests of one version.
///
/// With `force`, entries whose hash matches are reported as modified so they are
/// re-embedded; deletions are still computed.
pub fn compute_changes(
    entries: &[SourceEntry],
    stored: &HashMap<String, StoredDigest>,
    force: bool,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(entries.len());

    for entry in entries {
        seen.insert(entry.entry_id.as_str());
        match stored.get(&entry.entry_id) {
            None => changes.new.push(entry.clone()),
            Some(digest) if force || digest.content_hash != entry.content_hash() => {
                changes.modified.push(entry.clone())
            }
            Some(digest) if !digest.same_tags(entry) => changes.retagged.push(entry.clone()),
            Some(_) => changes.unchanged.push(entry.entry_id.clone()),
        }
    }

    changes.deleted = stored
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    changes.deleted.sort();

    changes
}
