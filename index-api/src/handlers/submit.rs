use axum::extract::multipart::Multipart;
use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use index_common::job::Job;
use index_common::metrics::SYNC_FALLBACKS;
use index_common::staging::{self, detect_format};
use index_common::vector::IndexPoint;

use super::State;

/// Enumeration of errors surfaced to submitters. Everything the caller can
/// fix is a 400; nothing is persisted for those.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("failed to decode multipart request: {0}")]
    RequestDecodingError(String),
    #[error("request is missing required field product_id")]
    MissingProductId,
    #[error("request is missing an image_file")]
    MissingImage,
    #[error("image_file is empty or not a supported image format")]
    UnsupportedImage,
    #[error("metadata is not a JSON object")]
    InvalidMetadata,
    #[error("failed to stage image payload")]
    StagingFailed,
    #[error("synchronous indexing failed: {0}")]
    SyncIndexingFailed(String),
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        match self {
            SubmitError::RequestDecodingError(_)
            | SubmitError::MissingProductId
            | SubmitError::MissingImage
            | SubmitError::UnsupportedImage
            | SubmitError::InvalidMetadata => (StatusCode::BAD_REQUEST, self.to_string()),

            SubmitError::StagingFailed | SubmitError::SyncIndexingFailed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}

/// A decoded submission, before validation.
#[derive(Debug, Default)]
pub struct Submission {
    pub product_id: String,
    pub name: String,
    pub description: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub image: Bytes,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    has_image_part: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub status: &'static str,
    pub job_id: String,
    pub product_id: String,
    pub processing_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

pub async fn submit(
    AxumState(state): AxumState<State>,
    multipart: Multipart,
) -> Result<Response, SubmitError> {
    let submission = parse_submission(multipart).await?;
    let (status, response) = handle_submission(&state, submission).await?;
    Ok((status, Json(response)).into_response())
}

/// Decode the multipart form. Unknown fields are ignored.
pub async fn parse_submission(mut multipart: Multipart) -> Result<Submission, SubmitError> {
    let mut submission = Submission::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| SubmitError::RequestDecodingError(err.to_string()))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "product_id" => submission.product_id = text_field(field).await?,
            "name" => submission.name = text_field(field).await?,
            "description" => submission.description = text_field(field).await?,
            "metadata" => {
                let raw = text_field(field).await?;
                if raw.trim().is_empty() {
                    continue;
                }
                submission.metadata = serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()
                    .and_then(|value| value.as_object().cloned())
                    .ok_or(SubmitError::InvalidMetadata)?;
            }
            "image_file" => {
                submission.has_image_part = true;
                submission.content_type = field.content_type().map(str::to_owned);
                submission.filename = field.file_name().map(str::to_owned);
                submission.image = field
                    .bytes()
                    .await
                    .map_err(|err| SubmitError::RequestDecodingError(err.to_string()))?;
            }
            _ => {}
        }
    }

    Ok(submission)
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, SubmitError> {
    field
        .text()
        .await
        .map_err(|err| SubmitError::RequestDecodingError(err.to_string()))
}

/// Validate, stage and enqueue a submission; fall back to in-line indexing
/// when the queue is unreachable.
pub async fn handle_submission(
    state: &State,
    submission: Submission,
) -> Result<(StatusCode, SubmitResponse), SubmitError> {
    if submission.product_id.is_empty() {
        return Err(SubmitError::MissingProductId);
    }
    if !submission.has_image_part {
        return Err(SubmitError::MissingImage);
    }
    let format = detect_format(
        submission.content_type.as_deref(),
        submission.filename.as_deref(),
        &submission.image,
    )
    .ok_or(SubmitError::UnsupportedImage)?;

    let mut job = Job::new(
        &submission.product_id,
        "",
        &submission.name,
        &submission.description,
        submission.metadata.clone(),
    );
    let staged = state
        .staging
        .stage(&job.job_id, format, &submission.image)
        .await
        .map_err(|err| {
            error!("failed to stage image for {}: {}", submission.product_id, err);
            SubmitError::StagingFailed
        })?;
    job.image_ref = staged.to_string_lossy().to_string();

    if state.queue.enqueue(&job).await {
        let response = SubmitResponse {
            status: "queued",
            status_url: Some(format!("/api/v1/queue/status/{}", job.job_id)),
            product_id: job.product_id,
            processing_mode: "async",
            job_id: job.job_id.clone(),
        };
        return Ok((StatusCode::ACCEPTED, response));
    }

    // The queue is unreachable: run the whole pipeline on this request
    // instead of dropping the submission. The staged payload is not needed
    // either way it ends.
    warn!(
        "queue unavailable, indexing product {} synchronously",
        submission.product_id
    );
    counter!(SYNC_FALLBACKS).increment(1);

    let outcome = index_synchronously(state, &submission).await;
    staging::remove_staged(&job.image_ref).await;
    match outcome {
        Ok(()) => Ok((
            StatusCode::OK,
            SubmitResponse {
                status: "indexed",
                job_id: job.job_id,
                product_id: submission.product_id,
                processing_mode: "sync",
                status_url: None,
            },
        )),
        Err(reason) => {
            error!(
                "synchronous indexing of product {} failed: {}",
                submission.product_id, reason
            );
            Err(SubmitError::SyncIndexingFailed(reason))
        }
    }
}

async fn index_synchronously(state: &State, submission: &Submission) -> Result<(), String> {
    let vector = state
        .embedder
        .embed_image(&submission.image)
        .await
        .map_err(|err| err.to_string())?;

    state
        .vectors
        .upsert(IndexPoint::for_product(
            &submission.product_id,
            &submission.name,
            &submission.description,
            &submission.metadata,
            vector,
        ))
        .await
        .map_err(|err| err.to_string())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use index_common::embedding::StaticEmbedder;
    use index_common::job::JobStatus;
    use index_common::queue::{JobQueue, PENDING_LIST_KEY};
    use index_common::staging::StagingArea;
    use index_common::store::{MemoryStore, Store};
    use index_common::vector::InMemoryVectorIndex;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

    struct Fixture {
        state: State,
        store: MemoryStore,
        vectors: InMemoryVectorIndex,
        staging_root: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_embedder(StaticEmbedder::new(8))
        }

        fn with_embedder(embedder: StaticEmbedder) -> Self {
            let store = MemoryStore::new();
            let vectors = InMemoryVectorIndex::new();
            let staging_root = std::env::temp_dir().join(format!(
                "submit-test-{}",
                Job::new("tmp", "", "", "", Default::default()).job_id
            ));
            let state = State {
                queue: JobQueue::new(Arc::new(store.clone())),
                embedder: Arc::new(embedder),
                vectors: Arc::new(vectors.clone()),
                staging: StagingArea::new(&staging_root),
            };
            Self {
                state,
                store,
                vectors,
                staging_root,
            }
        }

        fn staged_files(&self) -> usize {
            std::fs::read_dir(&self.staging_root)
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.staging_root).ok();
        }
    }

    fn submission(product_id: &str, image: &[u8]) -> Submission {
        Submission {
            product_id: product_id.to_string(),
            name: "Red Shirt".to_string(),
            description: "cotton".to_string(),
            metadata: Default::default(),
            image: Bytes::copy_from_slice(image),
            content_type: Some("image/jpeg".to_string()),
            filename: Some("shirt.jpg".to_string()),
            has_image_part: true,
        }
    }

    #[tokio::test]
    async fn valid_submission_is_staged_and_enqueued() {
        let fixture = Fixture::new();

        let (status, response) = handle_submission(&fixture.state, submission("p1", JPEG))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(response.status, "queued");
        assert_eq!(response.processing_mode, "async");
        assert_eq!(
            response.status_url.as_deref(),
            Some(format!("/api/v1/queue/status/{}", response.job_id).as_str())
        );

        let record = fixture.state.queue.load(&response.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert!(std::path::Path::new(&record.image_ref).exists());
        assert_eq!(
            fixture.store.list_len(PENDING_LIST_KEY).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn empty_image_is_rejected_without_side_effects() {
        let fixture = Fixture::new();

        let result = handle_submission(&fixture.state, submission("p1", b"")).await;

        assert!(matches!(result, Err(SubmitError::UnsupportedImage)));
        assert_eq!(fixture.store.list_len(PENDING_LIST_KEY).await.unwrap(), 0);
        assert_eq!(fixture.staged_files(), 0);
    }

    #[tokio::test]
    async fn non_image_payload_is_rejected() {
        let fixture = Fixture::new();
        let mut bad = submission("p1", b"just some text");
        bad.content_type = Some("text/plain".to_string());
        bad.filename = Some("notes.txt".to_string());

        let result = handle_submission(&fixture.state, bad).await;

        assert!(matches!(result, Err(SubmitError::UnsupportedImage)));
        assert_eq!(fixture.staged_files(), 0);
    }

    #[tokio::test]
    async fn missing_product_id_is_rejected() {
        let fixture = Fixture::new();

        let result = handle_submission(&fixture.state, submission("", JPEG)).await;

        assert!(matches!(result, Err(SubmitError::MissingProductId)));
    }

    #[tokio::test]
    async fn missing_image_part_is_rejected() {
        let fixture = Fixture::new();
        let mut incomplete = submission("p1", JPEG);
        incomplete.has_image_part = false;
        incomplete.image = Bytes::new();

        let result = handle_submission(&fixture.state, incomplete).await;

        assert!(matches!(result, Err(SubmitError::MissingImage)));
    }

    #[tokio::test]
    async fn unavailable_store_falls_back_to_sync_indexing() {
        let fixture = Fixture::new();
        fixture.store.fail_all(true);

        let (status, response) = handle_submission(&fixture.state, submission("p1", JPEG))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response.status, "indexed");
        assert_eq!(response.processing_mode, "sync");
        assert!(response.status_url.is_none());

        // the vector store got the upsert, with no job record left behind
        let point = fixture.vectors.point("p1").expect("vector not upserted");
        assert_eq!(
            point.payload.get("has_image"),
            Some(&serde_json::Value::Bool(true))
        );
        assert_eq!(fixture.staged_files(), 0);

        fixture.store.fail_all(false);
        assert!(fixture.state.queue.load(&response.job_id).await.is_none());
    }

    #[tokio::test]
    async fn failed_sync_fallback_leaves_no_partial_state() {
        let fixture = Fixture::with_embedder(StaticEmbedder::new(8).fail_first(u32::MAX));
        fixture.store.fail_all(true);

        let result = handle_submission(&fixture.state, submission("p1", JPEG)).await;

        assert!(matches!(result, Err(SubmitError::SyncIndexingFailed(_))));
        assert!(fixture.vectors.is_empty());
        assert_eq!(fixture.staged_files(), 0);
    }

    #[test]
    fn submit_errors_map_to_http_statuses() {
        for err in [
            SubmitError::MissingProductId,
            SubmitError::MissingImage,
            SubmitError::UnsupportedImage,
            SubmitError::InvalidMetadata,
            SubmitError::RequestDecodingError("bad".to_string()),
        ] {
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
        assert_eq!(
            SubmitError::SyncIndexingFailed("boom".to_string())
                .into_response()
                .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
