//! Similarity ranking over the vector cache
//!
//! This module handles:
//! - Batched dot products of a query against candidate rows (SIMD)
//! - Deterministic ordering and top-k truncation
//! - Optional blending with a usage signal
//! - Category-scoped search with warnings for weak or empty results

use crate::cache::VectorCache;
use crate::config::QueryConfig;
use crate::embed::{embedding_norm, normalize_embedding};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use wide::f32x8;

const SIMILARITY_WEIGHT: f32 = 0.7;
const USAGE_WEIGHT: f32 = 0.3;

fn lanes(s: &[f32]) -> f32x8 {
    f32x8::new([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]])
}

/// Dot product of two equal-length slices
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = f32x8::splat(0.0);
    let mut a_chunks = a.chunks_exact(8);
    let mut b_chunks = b.chunks_exact(8);
    for (ca, cb) in (&mut a_chunks).zip(&mut b_chunks) {
        acc += lanes(ca) * lanes(cb);
    }

    let mut sum = acc.reduce_add();
    for (x, y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        sum += x * y;
    }
    sum
}

/// Dot products of `query` against each of `rows` in the cache arena
pub fn score_rows(cache: &VectorCache, query: &[f32], rows: &[usize]) -> Vec<f32> {
    rows.iter().map(|&row| dot(cache.row(row), query)).collect()
}

/// Unit-length copy of `query`, checked against the cache dimension
fn prepare_query(query: &[f32], dimension: usize) -> Result<Vec<f32>> {
    if query.len() != dimension {
        return Err(Error::Integrity(format!(
            "query has {} dimensions, cache holds {}-dimensional vectors",
            query.len(),
            dimension
        )));
    }
    if query.iter().any(|v| !v.is_finite()) {
        return Err(Error::validation("<query>", "query vector contains non-finite values"));
    }
    if embedding_norm(query) == 0.0 {
        return Err(Error::validation("<query>", "query vector has zero norm"));
    }
    Ok(normalize_embedding(query))
}

/// One ranked entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub entry_id: String,
    /// Final score (blended when a usage signal is active)
    pub score: f32,
    /// Cosine similarity, clamped to [0, 1]
    pub similarity: f32,
    pub category: String,
    pub subcategory: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query_vector: Vec<f32>,
    pub category: String,
    pub subcategory: Option<String>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchWarning {
    EmptyCache,
    NoCandidates {
        category: String,
        subcategory: Option<String>,
    },
    LowConfidence { best: f32, threshold: f32 },
}

impl fmt::Display for SearchWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchWarning::EmptyCache => write!(f, "the vector cache is empty"),
            SearchWarning::NoCandidates {
                category,
                subcategory: Some(sub),
            } => write!(f, "no candidates in category '{}/{}'", category, sub),
            SearchWarning::NoCandidates { category, .. } => {
                write!(f, "no candidates in category '{}'", category)
            }
            SearchWarning::LowConfidence { best, threshold } => write!(
                f,
                "all scores below low-confidence threshold {:.2} (best {:.3})",
                threshold, best
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub candidates_considered: usize,
    pub warnings: Vec<SearchWarning>,
}

/// Rank cached entries against query vectors
#[derive(Debug, Clone)]
pub struct Ranker {
    max_top_k: usize,
    low_confidence_threshold: f32,
    usage: Option<HashMap<String, f32>>,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

impl Ranker {
    pub fn new(max_top_k: usize, low_confidence_threshold: f32) -> Self {
        Self {
            max_top_k: max_top_k.max(1),
            low_confidence_threshold,
            usage: None,
        }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.max_top_k, config.low_confidence_threshold)
    }

    /// Blend similarity with a per-entry signal in [0, 1]
    pub fn with_usage(mut self, usage: HashMap<String, f32>) -> Self {
        self.usage = Some(usage);
        self
    }

    fn blend(&self, entry_id: &str, similarity: f32) -> f32 {
        match &self.usage {
            Some(usage) => {
                let signal = usage.get(entry_id).copied().unwrap_or(0.0).clamp(0.0, 1.0);
                SIMILARITY_WEIGHT * similarity + USAGE_WEIGHT * signal
            }
            None => similarity,
        }
    }

    /// Score and order `rows`, keeping at most `top_k` (bounded by `max_top_k`)
    fn rank_rows(
        &self,
        cache: &VectorCache,
        query: &[f32],
        rows: &[usize],
        top_k: usize,
    ) -> Result<Vec<(usize, f32, f32)>> {
        let query = prepare_query(query, cache.dimension())?;
        let mut scored: Vec<(usize, f32, f32)> = rows
            .iter()
            .zip(score_rows(cache, &query, rows))
            .map(|(&row, raw)| {
                let similarity = raw.clamp(0.0, 1.0);
                let score = self.blend(&cache.entry(row).entry_id, similarity);
                (row, score, similarity)
            })
            .collect();

        scored.sort_by(|a, b| match b.1.total_cmp(&a.1) {
            Ordering::Equal => cache.entry(a.0).entry_id.cmp(&cache.entry(b.0).entry_id),
            other => other,
        });
        scored.truncate(top_k.min(self.max_top_k));
        Ok(scored)
    }

    /// Rank `candidate_ids` against `query`; ids missing from the cache are ignored
    pub fn rank<S: AsRef<str>>(
        &self,
        cache: &VectorCache,
        query: &[f32],
        candidate_ids: &[S],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        if cache.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<usize> = candidate_ids
            .iter()
            .filter_map(|id| cache.row_of(id.as_ref()))
            .collect();

        Ok(self
            .rank_rows(cache, query, &rows, top_k)?
            .into_iter()
            .map(|(row, score, _)| (cache.entry(row).entry_id.clone(), score))
            .collect())
    }

    /// Category-scoped search
    pub fn search(&self, cache: &VectorCache, request: &SearchRequest) -> Result<SearchResponse> {
        let mut response = SearchResponse::default();
        if cache.is_empty() {
            response.warnings.push(SearchWarning::EmptyCache);
            return Ok(response);
        }

        let rows = cache.candidates(&request.category, request.subcategory.as_deref());
        response.candidates_considered = rows.len();
        if rows.is_empty() {
            response.warnings.push(SearchWarning::NoCandidates {
                category: request.category.clone(),
                subcategory: request.subcategory.clone(),
            });
            return Ok(response);
        }

        let ranked = self.rank_rows(cache, &request.query_vector, rows, request.top_k)?;
        response.results = ranked
            .into_iter()
            .map(|(row, score, similarity)| {
                let entry = cache.entry(row);
                SearchResult {
                    entry_id: entry.entry_id.clone(),
                    score,
                    similarity,
                    category: entry.category.clone(),
                    subcategory: entry.subcategory.clone(),
                    fields: entry.fields.clone(),
                }
            })
            .collect();

        let best = response.results.first().map(|r| r.score).unwrap_or(0.0);
        if !response.results.is_empty() && best < self.low_confidence_threshold {
            response.warnings.push(SearchWarning::LowConfidence {
                best,
                threshold: self.low_confidence_threshold,
            });
        }

        Ok(response)
    }
}
