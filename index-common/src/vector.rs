use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Enumeration of errors from the vector-store collaborator.
#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("vector store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("vector store rejected the point: {0}")]
    Rejected(String),
    #[error("vector store returned an invalid response: {0}")]
    BadResponse(String),
    #[error("vector store unavailable: {0}")]
    Unavailable(String),
}

impl VectorIndexError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VectorIndexError::Request(_) | VectorIndexError::Unavailable(_)
        )
    }
}

/// A product embedding plus its payload, ready to upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPoint {
    pub product_id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl IndexPoint {
    /// Assemble the point written for an indexed product: the caller's
    /// metadata plus the standard payload fields.
    pub fn for_product(
        product_id: &str,
        name: &str,
        description: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
        vector: Vec<f32>,
    ) -> Self {
        let mut payload = metadata.clone();
        payload.insert("product_id".to_string(), serde_json::json!(product_id));
        payload.insert("name".to_string(), serde_json::json!(name));
        payload.insert("description".to_string(), serde_json::json!(description));
        payload.insert(
            "indexed_at".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
        payload.insert("has_image".to_string(), serde_json::json!(true));

        Self {
            product_id: product_id.to_owned(),
            vector,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub score: f32,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Upsert-by-id + similarity-search over the external vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if it does not exist yet.
    async fn ensure_collection(&self) -> Result<(), VectorIndexError>;

    async fn upsert(&self, point: IndexPoint) -> Result<(), VectorIndexError>;

    async fn search(&self, vector: &[f32], limit: usize)
        -> Result<Vec<SearchHit>, VectorIndexError>;

    async fn healthy(&self) -> bool;
}

/// Deterministic point id for a product, stable across re-indexing.
pub fn point_id(product_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, product_id.as_bytes())
}

#[derive(Serialize)]
struct CreateCollectionRequest {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Serialize)]
struct UpsertRequest {
    points: Vec<PointStruct>,
}

#[derive(Serialize)]
struct PointStruct {
    id: Uuid,
    vector: Vec<f32>,
    payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct SearchRequest<'v> {
    vector: &'v [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<RawHit>,
}

#[derive(Deserialize)]
struct RawHit {
    score: f32,
    #[serde(default)]
    payload: serde_json::Map<String, serde_json::Value>,
}

/// `VectorIndex` over a Qdrant-style REST API, cosine distance.
pub struct HttpVectorIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    dimension: usize,
}

impl HttpVectorIndex {
    pub fn new(
        base_url: &str,
        collection: &str,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, VectorIndexError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            collection: collection.to_owned(),
            dimension,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn ensure_collection(&self) -> Result<(), VectorIndexError> {
        let existing = self.client.get(self.collection_url()).send().await?;
        if existing.status().is_success() {
            return Ok(());
        }

        info!("creating vector collection {}", self.collection);
        let request = CreateCollectionRequest {
            vectors: VectorParams {
                size: self.dimension,
                distance: "Cosine",
            },
        };
        self.client
            .put(self.collection_url())
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn upsert(&self, point: IndexPoint) -> Result<(), VectorIndexError> {
        let request = UpsertRequest {
            points: vec![PointStruct {
                id: point_id(&point.product_id),
                vector: point.vector,
                payload: point.payload,
            }],
        };

        let response = self
            .client
            .put(format!("{}/points?wait=true", self.collection_url()))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            // validation failures are permanent for this attempt
            let detail = response.text().await.unwrap_or_default();
            return Err(VectorIndexError::Rejected(format!("{status}: {detail}")));
        }
        response.error_for_status()?;
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorIndexError> {
        let request = SearchRequest {
            vector,
            limit,
            with_payload: true,
        };

        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| VectorIndexError::BadResponse(err.to_string()))?;

        Ok(payload
            .result
            .into_iter()
            .map(|hit| SearchHit {
                score: hit.score,
                payload: hit.payload,
            })
            .collect())
    }

    async fn healthy(&self) -> bool {
        match self
            .client
            .get(format!("{}/collections", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// In-memory `VectorIndex` for tests, keyed by `product_id`, with failure
/// injection.
#[derive(Clone, Default)]
pub struct InMemoryVectorIndex {
    points: Arc<Mutex<HashMap<String, IndexPoint>>>,
    fail: Arc<AtomicBool>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, IndexPoint>> {
        match self.points.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn point(&self, product_id: &str) -> Option<IndexPoint> {
        self.lock().get(product_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), VectorIndexError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(VectorIndexError::Unavailable(
                "injected failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_collection(&self) -> Result<(), VectorIndexError> {
        self.check()
    }

    async fn upsert(&self, point: IndexPoint) -> Result<(), VectorIndexError> {
        self.check()?;
        self.lock().insert(point.product_id.clone(), point);
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>, VectorIndexError> {
        self.check()?;
        let points = self.lock();
        let mut hits: Vec<SearchHit> = points
            .values()
            .map(|point| SearchHit {
                score: dot(&point.vector, vector),
                payload: point.payload.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn healthy(&self) -> bool {
        self.check().is_ok()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(product_id: &str, vector: Vec<f32>) -> IndexPoint {
        let mut payload = serde_json::Map::new();
        payload.insert("product_id".to_string(), json!(product_id));
        IndexPoint {
            product_id: product_id.to_string(),
            vector,
            payload,
        }
    }

    #[test]
    fn point_ids_are_stable_and_distinct() {
        assert_eq!(point_id("p1"), point_id("p1"));
        assert_ne!(point_id("p1"), point_id("p2"));
    }

    #[tokio::test]
    async fn upsert_replaces_by_product_id() {
        let index = InMemoryVectorIndex::new();
        index.upsert(point("p1", vec![1.0, 0.0])).await.unwrap();
        index.upsert(point("p1", vec![0.0, 1.0])).await.unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.point("p1").unwrap().vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let index = InMemoryVectorIndex::new();
        index.upsert(point("near", vec![1.0, 0.0])).await.unwrap();
        index.upsert(point("far", vec![0.0, 1.0])).await.unwrap();

        let hits = index.search(&[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.get("product_id").unwrap(), "near");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn injected_failure_is_transient() {
        let index = InMemoryVectorIndex::new();
        index.fail_all(true);

        let err = index.upsert(point("p1", vec![1.0])).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!index.healthy().await);
    }
}
