//! Query command implementation

use crate::cache::VectorCache;
use crate::config::Config;
use crate::embed::{call_with_retry, Embedder, RetryPolicy};
use crate::error::{Error, Result};
use crate::rank::{Ranker, SearchRequest, SearchResponse, SearchWarning};
use crate::source::load_usage_signal;
use crate::store::StorageBackend;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Query options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Category to search within
    pub category: String,
    /// Narrow to one subcategory
    pub subcategory: Option<String>,
    /// Number of results to return
    pub top_k: Option<usize>,
}

/// Query result for CLI display
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub version: Option<String>,
    #[serde(flatten)]
    pub response: SearchResponse,
}

/// Embed `query` and rank it against the current version's vectors
pub async fn cmd_query(
    config: &Config,
    storage: &dyn StorageBackend,
    embedder: &dyn Embedder,
    query: &str,
    options: QueryOptions,
) -> Result<QueryResult> {
    info!("Querying: {}", query);

    let top_k = options.top_k.unwrap_or(config.query.default_top_k);
    if top_k == 0 {
        return Err(Error::Config("--top-k must be >= 1".to_string()));
    }

    let cache = VectorCache::load(storage).await?;
    if let Some(version) = cache.version() {
        if !embedder.identity().matches(version) {
            warn!(
                "Provider model {} differs from current version {}; run 'answerbank migrate'",
                embedder.identity(),
                version.label()
            );
        }
    }

    let policy = RetryPolicy::from_config(&config.embedding);
    let query_vector = call_with_retry(&policy, "query embedding", || {
        embedder.embed_batch(vec![query.to_string()])
    })
    .await?
    .into_iter()
    .next()
    .ok_or_else(|| Error::permanent("No embedding returned"))?;

    let mut ranker = Ranker::from_config(&config.query);
    if config.query.usage_blend {
        if let Some(path) = &config.query.usage_file {
            let usage = load_usage_signal(&config.resolve_path(path))?;
            debug!("Loaded usage signal for {} entries", usage.len());
            ranker = ranker.with_usage(usage);
        }
    }

    let request = SearchRequest {
        query_vector,
        category: options.category,
        subcategory: options.subcategory,
        top_k,
    };
    let response = ranker.search(&cache, &request)?;
    info!(
        "Returning {} of {} candidates",
        response.results.len(),
        response.candidates_considered
    );

    Ok(QueryResult {
        query: query.to_string(),
        version: cache.version().map(|v| v.label()),
        response,
    })
}

/// Print query results to console
pub fn print_query_results(result: &QueryResult) {
    for warning in &result.response.warnings {
        println!("⚠ {}", warning);
    }

    if result.response.results.is_empty() {
        if !result
            .response
            .warnings
            .iter()
            .any(|w| !matches!(w, SearchWarning::LowConfidence { .. }))
        {
            println!("No results found.");
        }
        return;
    }

    println!(
        "\n🔍 Results for: \"{}\" ({} candidates)\n",
        result.query, result.response.candidates_considered
    );

    for (i, r) in result.response.results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, r.score, r.entry_id);
        if r.subcategory.is_empty() {
            println!("   Category: {}", r.category);
        } else {
            println!("   Category: {}/{}", r.category, r.subcategory);
        }
        if let Some(first) = r.fields.first() {
            println!("   {}", first);
        }
        for field in r.fields.iter().skip(1) {
            let preview: String = field.chars().take(200).collect();
            let ellipsis = if field.chars().count() > 200 { "..." } else { "" };
            println!("   > {}{}", preview.replace('\n', " "), ellipsis);
        }
        println!();
    }
}
