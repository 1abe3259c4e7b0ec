//! Embedding generation
//!
//! This module provides:
//! - The [`Embedder`] trait implemented by every provider
//! - An HTTP JSON provider
//! - A bounded retry state machine used by the pipeline

mod http_backend;
#[cfg(test)]
pub(crate) mod mock;
pub mod retry;

pub use http_backend::*;
pub use retry::{call_with_retry, RetryPolicy, RetryState, Step};

use crate::config::EmbeddingConfig;
use crate::error::Result;
use crate::version::ModelIdentity;
use async_trait::async_trait;

/// L2 norm accumulated in f64, so squares of large or subnormal components
/// neither overflow nor vanish
pub fn embedding_norm(vector: &[f32]) -> f64 {
    vector
        .iter()
        .map(|&v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt()
}

/// Scale a vector to unit length; vectors without a usable norm are returned unchanged
pub fn normalize_embedding(vector: &[f32]) -> Vec<f32> {
    let norm = embedding_norm(vector);
    if norm == 0.0 || !norm.is_finite() {
        return vector.to_vec();
    }
    vector.iter().map(|&v| (f64::from(v) / norm) as f32).collect()
}

/// Trait for embedding providers
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; output order matches input order.
    ///
    /// Failures carry their classification through [`crate::error::Error::is_retryable`].
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// The identity stored vectors are versioned by
    fn identity(&self) -> ModelIdentity;
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    let embedder = HttpEmbedder::new(config)?;
    Ok(Box::new(embedder))
}
