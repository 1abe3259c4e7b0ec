//! Deterministic in-process provider for tests

use super::Embedder;
use crate::error::{Error, Result};
use crate::version::ModelIdentity;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Vectors derived from the BLAKE3 XOF of the text, components in [-1, 1]
pub(crate) fn deterministic_vector(text: &str, dimension: usize) -> Vec<f32> {
    let mut reader = blake3::Hasher::new().update(text.as_bytes()).finalize_xof();
    let mut bytes = vec![0u8; dimension * 4];
    reader.fill(&mut bytes);
    bytes
        .chunks_exact(4)
        .map(|b| {
            let raw = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
        })
        .collect()
}

pub(crate) struct MockEmbedder {
    identity: ModelIdentity,
    calls: Mutex<Vec<Vec<String>>>,
    /// Any batch containing one of these substrings fails permanently
    poison: HashSet<String>,
    transient_failures: AtomicU32,
}

impl MockEmbedder {
    pub(crate) fn new(model_name: &str, model_version: &str, dimension: usize) -> Self {
        Self {
            identity: ModelIdentity::new(model_name, model_version, dimension),
            calls: Mutex::new(Vec::new()),
            poison: HashSet::new(),
            transient_failures: AtomicU32::new(0),
        }
    }

    /// Fail permanently whenever a batch contains text including `marker`
    pub(crate) fn poison(mut self, marker: impl Into<String>) -> Self {
        self.poison.insert(marker.into());
        self
    }

    /// Fail the next `n` calls with a retryable error
    pub(crate) fn fail_transiently(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Every text submitted, across all calls
    pub(crate) fn submitted(&self) -> Vec<String> {
        self.calls().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        self.calls.lock().unwrap().push(texts.clone());

        let pending = self.transient_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_failures.store(pending - 1, Ordering::SeqCst);
            return Err(Error::transient("mock provider busy"));
        }

        if let Some(bad) = texts
            .iter()
            .find(|t| self.poison.iter().any(|p| t.contains(p.as_str())))
        {
            return Err(Error::permanent(format!("mock provider rejected '{}'", bad)));
        }

        Ok(texts
            .iter()
            .map(|t| deterministic_vector(t, self.identity.dimension))
            .collect())
    }

    fn identity(&self) -> ModelIdentity {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectors_are_deterministic() {
        let a = deterministic_vector("hello", 16);
        assert_eq!(a, deterministic_vector("hello", 16));
        assert_ne!(a, deterministic_vector("hello!", 16));
        assert!(a.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let mock = MockEmbedder::new("m", "v1", 4).poison("BAD").fail_transiently(1);

        assert!(mock.embed_batch(vec!["ok".into()]).await.unwrap_err().is_retryable());
        assert_eq!(mock.embed_batch(vec!["ok".into()]).await.unwrap().len(), 1);
        assert!(!mock
            .embed_batch(vec!["ok".into(), "a BAD one".into()])
            .await
            .unwrap_err()
            .is_retryable());
        assert_eq!(mock.calls().len(), 3);
    }
}
