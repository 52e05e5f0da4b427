use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Enumeration of errors from the embedding collaborator.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("embedding service returned an invalid response: {0}")]
    BadResponse(String),
    #[error("embedding has dimension {got}, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Request(_) | EmbeddingError::Unavailable(_)
        )
    }
}

/// Opaque `bytes -> vector of dimension D` collaborator.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, EmbeddingError>;

    /// The dimension every returned vector must have, shared with the
    /// vector-store configuration.
    fn dimension(&self) -> usize;
}

#[derive(Serialize)]
struct EmbedRequest {
    image: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Embedder backed by an HTTP inference service. Image bytes go over the
/// wire base64-encoded; the response carries the raw vector.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(url: &str, dimension: usize, timeout: Duration) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_owned(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let request = EmbedRequest {
            image: base64::engine::general_purpose::STANDARD.encode(image),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let payload: EmbedResponse = response
            .json()
            .await
            .map_err(|err| EmbeddingError::BadResponse(err.to_string()))?;

        if payload.embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                got: payload.embedding.len(),
            });
        }
        if payload.embedding.iter().any(|value| !value.is_finite()) {
            return Err(EmbeddingError::BadResponse(
                "embedding contains non-finite values".to_string(),
            ));
        }

        Ok(payload.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embedder test double returning a fixed vector. Failures and latency are
/// scriptable so tests can drive the retry and timeout paths.
pub struct StaticEmbedder {
    vector: Vec<f32>,
    fail_first: AtomicU32,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl StaticEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            vector: vec![0.25; dimension],
            fail_first: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    /// Fail the first `count` calls with a transient error.
    pub fn fail_first(self, count: u32) -> Self {
        self.fail_first.store(count, Ordering::SeqCst);
        self
    }

    /// Sleep this long before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for StaticEmbedder {
    async fn embed_image(&self, _image: &[u8]) -> Result<Vec<f32>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if call < self.fail_first.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("injected failure".to_string()));
        }
        Ok(self.vector.clone())
    }

    fn dimension(&self) -> usize {
        self.vector.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_embedder_fails_then_recovers() {
        let embedder = StaticEmbedder::new(4).fail_first(2);

        assert!(embedder.embed_image(b"img").await.is_err());
        assert!(embedder.embed_image(b"img").await.is_err());
        let vector = embedder.embed_image(b"img").await.unwrap();
        assert_eq!(vector.len(), 4);
        assert_eq!(embedder.calls(), 3);
    }

    #[test]
    fn transient_classification() {
        assert!(EmbeddingError::Unavailable("x".to_string()).is_transient());
        assert!(!EmbeddingError::DimensionMismatch { expected: 512, got: 4 }.is_transient());
        assert!(!EmbeddingError::BadResponse("x".to_string()).is_transient());
    }
}
