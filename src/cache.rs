//! In-memory vector cache
//!
//! Built once from the current version's records. Vectors are L2-normalized and
//! packed into one row-major arena; lookups by id and by (category, subcategory)
//! are precomputed. The cache is immutable: a refresh builds a new one and swaps it
//! in through [`CacheHandle`].

use crate::embed::{embedding_norm, normalize_embedding};
use crate::error::Result;
use crate::models::{EmbeddingRecord, EmbeddingVersion};
use crate::store::StorageBackend;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Text and tags kept alongside each cached vector
#[derive(Debug, Clone, Serialize)]
pub struct CachedEntry {
    pub entry_id: String,
    pub category: String,
    pub subcategory: String,
    pub fields: Vec<String>,
}

/// A record left out of the cache, and why
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedEntry {
    pub entry_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct VectorCache {
    version: Option<EmbeddingVersion>,
    dimension: usize,
    arena: Vec<f32>,
    entries: Vec<CachedEntry>,
    rows_by_id: HashMap<String, usize>,
    rows_by_category: HashMap<String, Vec<usize>>,
    rows_by_key: HashMap<(String, String), Vec<usize>>,
    excluded: Vec<ExcludedEntry>,
}

impl VectorCache {
    /// Load the current version from storage
    pub async fn load(storage: &dyn StorageBackend) -> Result<Self> {
        let Some(version) = storage.get_current_version().await? else {
            info!("No current embedding version; cache is empty");
            return Ok(Self::default());
        };

        let stored = storage.count(Some(version.version_id)).await?;
        let records = storage.load_all(Some(version.version_id)).await?;
        if records.len() as u64 != stored {
            warn!(
                stored,
                loaded = records.len(),
                "Some stored records could not be decoded"
            );
        }

        let cache = Self::from_records(version, records);
        info!(
            rows = cache.len(),
            excluded = cache.excluded.len(),
            dimension = cache.dimension,
            "Vector cache ready"
        );
        Ok(cache)
    }

    /// Build a cache from already loaded records
    pub fn from_records(version: EmbeddingVersion, records: Vec<EmbeddingRecord>) -> Self {
        let dimension = version.dim();
        let mut cache = Self {
            dimension,
            arena: Vec::with_capacity(records.len() * dimension),
            entries: Vec::with_capacity(records.len()),
            version: Some(version),
            ..Self::default()
        };

        for record in records {
            if let Err(reason) = check_vector(&record.vector, dimension) {
                warn!(entry_id = %record.entry_id, %reason, "Excluding record from cache");
                cache.excluded.push(ExcludedEntry {
                    entry_id: record.entry_id,
                    reason,
                });
                continue;
            }
            if cache.rows_by_id.contains_key(&record.entry_id) {
                continue;
            }

            cache.arena.extend(normalize_embedding(&record.vector));

            let row = cache.entries.len();
            cache.rows_by_id.insert(record.entry_id.clone(), row);
            cache
                .rows_by_category
                .entry(record.category.clone())
                .or_default()
                .push(row);
            cache
                .rows_by_key
                .entry((record.category.clone(), record.subcategory.clone()))
                .or_default()
                .push(row);
            cache.entries.push(CachedEntry {
                entry_id: record.entry_id,
                category: record.category,
                subcategory: record.subcategory,
                fields: record.source_text_fields,
            });
        }

        cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn version(&self) -> Option<&EmbeddingVersion> {
        self.version.as_ref()
    }

    pub fn excluded(&self) -> &[ExcludedEntry] {
        &self.excluded
    }

    /// Unit-length vector of `row`
    pub fn row(&self, row: usize) -> &[f32] {
        &self.arena[row * self.dimension..(row + 1) * self.dimension]
    }

    pub fn entry(&self, row: usize) -> &CachedEntry {
        &self.entries[row]
    }

    pub fn row_of(&self, entry_id: &str) -> Option<usize> {
        self.rows_by_id.get(entry_id).copied()
    }

    pub fn vector(&self, entry_id: &str) -> Option<&[f32]> {
        self.row_of(entry_id).map(|row| self.row(row))
    }

    /// Rows tagged with `category`, narrowed to `subcategory` when given
    pub fn candidates(&self, category: &str, subcategory: Option<&str>) -> &[usize] {
        let rows = match subcategory {
            Some(sub) => self
                .rows_by_key
                .get(&(category.to_string(), sub.to_string())),
            None => self.rows_by_category.get(category),
        };
        rows.map(Vec::as_slice).unwrap_or(&[])
    }
}

fn check_vector(vector: &[f32], dimension: usize) -> std::result::Result<(), String> {
    if vector.len() != dimension {
        return Err(format!(
            "dimension {} does not match version dimension {}",
            vector.len(),
            dimension
        ));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err("vector contains non-finite values".to_string());
    }
    let norm = embedding_norm(vector);
    if norm == 0.0 {
        return Err("vector has zero norm".to_string());
    }
    if !norm.is_finite() {
        return Err("vector norm is not finite".to_string());
    }
    Ok(())
}

/// Shared, swappable cache
#[derive(Debug, Default)]
pub struct CacheHandle {
    inner: RwLock<Arc<VectorCache>>,
}

impl CacheHandle {
    pub fn new(cache: VectorCache) -> Self {
        Self {
            inner: RwLock::new(Arc::new(cache)),
        }
    }

    /// The cache as of now; later refreshes do not affect it
    pub fn snapshot(&self) -> Arc<VectorCache> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Rebuild from storage and swap the new cache in
    pub async fn refresh(&self, storage: &dyn StorageBackend) -> Result<Arc<VectorCache>> {
        let fresh = Arc::new(VectorCache::load(storage).await?);
        match self.inner.write() {
            Ok(mut guard) => *guard = Arc::clone(&fresh),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&fresh),
        }
        Ok(fresh)
    }
}
