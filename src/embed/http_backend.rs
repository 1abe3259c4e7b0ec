//! HTTP JSON embedding provider
//!
//! `POST {url}/v1/embed/text` with `{"model", "inputs"}`. The response may carry
//! `embeddings`, `vectors` or OpenAI-style `data[].embedding`.

use super::Embedder;
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::version::ModelIdentity;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Serialize)]
struct EmbedTextRequest<'a> {
    model: &'a str,
    inputs: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Embeddings { embeddings: Vec<Vec<f32>> },
    Vectors { vectors: Vec<Vec<f32>> },
    Data { data: Vec<EmbeddingData> },
}

#[derive(Debug, Clone, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    fn into_embeddings(self) -> Vec<Vec<f32>> {
        match self {
            EmbeddingResponse::Embeddings { embeddings } => embeddings,
            EmbeddingResponse::Vectors { vectors } => vectors,
            EmbeddingResponse::Data { data } => data.into_iter().map(|d| d.embedding).collect(),
        }
    }
}

/// Whether an HTTP status is worth retrying
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn classify_send_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::transient(format!("embedding request failed: {}", err))
    } else {
        Error::permanent(format!("embedding request failed: {}", err))
    }
}

/// Embedding provider speaking the JSON protocol above.
///
/// Makes exactly one attempt per call; retries belong to the caller.
pub struct HttpEmbedder {
    client: Client,
    endpoint: Url,
    identity: ModelIdentity,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)?;
        let endpoint = base_url
            .join("/v1/embed/text")
            .map_err(|e| Error::Config(format!("Invalid embedding backend URL: {}", e)))?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            identity: config.identity(),
        })
    }

    fn validate_embeddings(&self, expected: usize, embeddings: &[Vec<f32>]) -> Result<()> {
        if embeddings.len() != expected {
            return Err(Error::permanent(format!(
                "provider returned {} embeddings for {} inputs",
                embeddings.len(),
                expected
            )));
        }
        if let Some(mismatch) = embeddings
            .iter()
            .find(|vec| vec.len() != self.identity.dimension)
        {
            return Err(Error::permanent(format!(
                "Embedding dimension mismatch for model '{}': expected {}, got {}",
                self.identity.model_name,
                self.identity.dimension,
                mismatch.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(inputs = texts.len(), "POST {}", self.endpoint);
        let request = EmbedTextRequest {
            model: &self.identity.model_name,
            inputs: &texts,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("provider returned {}: {}", status, body.trim());
            return Err(if is_transient_status(status) {
                Error::transient(message)
            } else {
                Error::permanent(message)
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                Error::transient(format!("provider response timed out: {}", e))
            } else {
                Error::permanent(format!("malformed provider response: {}", e))
            }
        })?;
        let embeddings = parsed.into_embeddings();
        self.validate_embeddings(texts.len(), &embeddings)?;
        Ok(embeddings)
    }

    fn identity(&self) -> ModelIdentity {
        self.identity.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn embedder_for(server: &MockServer, dimension: usize) -> HttpEmbedder {
        let config = EmbeddingConfig {
            url: server.uri(),
            model: "modelA".to_string(),
            dimension,
            timeout_secs: 5,
            ..EmbeddingConfig::default()
        };
        HttpEmbedder::new(&config).unwrap()
    }

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("text {}", i)).collect()
    }

    #[tokio::test]
    async fn test_embeddings_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embed/text"))
            .and(body_partial_json(json!({"model": "modelA", "inputs": ["text 0", "text 1"]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let vectors = embedder_for(&server, 2).embed_batch(texts(2)).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_openai_style_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": [{"embedding": [0.5, 0.5, 0.0]}]}),
            ))
            .mount(&server)
            .await;

        let vectors = embedder_for(&server, 3).embed_batch(texts(1)).await.unwrap();
        assert_eq!(vectors[0], vec![0.5, 0.5, 0.0]);
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = embedder_for(&server, 2).embed_batch(texts(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = embedder_for(&server, 2).embed_batch(texts(1)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("input too long"))
            .mount(&server)
            .await;

        let err = embedder_for(&server, 2).embed_batch(texts(1)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("input too long"));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"vectors": [[1.0, 0.0, 0.0]]})),
            )
            .mount(&server)
            .await;

        let err = embedder_for(&server, 2).embed_batch(texts(1)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[tokio::test]
    async fn test_count_mismatch_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 0.0]]})),
            )
            .mount(&server)
            .await;

        let err = embedder_for(&server, 2).embed_batch(texts(3)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = embedder_for(&server, 2).embed_batch(texts(1)).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transient() {
        let config = EmbeddingConfig {
            url: "http://127.0.0.1:9".to_string(),
            dimension: 2,
            timeout_secs: 2,
            ..EmbeddingConfig::default()
        };
        let err = HttpEmbedder::new(&config)
            .unwrap()
            .embed_batch(texts(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let vectors = embedder_for(&server, 2).embed_batch(Vec::new()).await.unwrap();
        assert!(vectors.is_empty());
    }
}
