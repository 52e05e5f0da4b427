use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use index_common::job::Job;
use index_common::queue::QueueStats;

use super::State;

/// The job record view returned by the status endpoint.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: String,
    pub product_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error_message: String,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status.to_string(),
            product_id: job.product_id,
            created_at: job.created_at,
            updated_at: job.updated_at,
            retry_count: job.retry_count,
            error_message: job.error_message,
        }
    }
}

pub async fn job_status(
    AxumState(state): AxumState<State>,
    Path(job_id): Path<String>,
) -> Response {
    match state.queue.load(&job_id).await {
        Some(job) => (StatusCode::OK, Json(JobStatusResponse::from(job))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("job {job_id} not found") })),
        )
            .into_response(),
    }
}

pub async fn queue_stats(AxumState(state): AxumState<State>) -> Json<QueueStats> {
    Json(state.queue.stats().await)
}

pub async fn retry_job(
    AxumState(state): AxumState<State>,
    Path(job_id): Path<String>,
) -> Response {
    if state.queue.retry(&job_id).await {
        Json(json!({ "status": "retrying", "job_id": job_id })).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": format!("job {job_id} is not retryable") })),
        )
            .into_response()
    }
}

pub async fn list_workers(AxumState(state): AxumState<State>) -> Response {
    let workers = state.queue.list_workers().await;
    Json(json!({ "worker_count": workers.len(), "workers": workers })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use index_common::embedding::StaticEmbedder;
    use index_common::job::JobStatus;
    use index_common::queue::{JobQueue, WorkerStatus};
    use index_common::staging::StagingArea;
    use index_common::store::MemoryStore;
    use index_common::vector::InMemoryVectorIndex;

    fn state() -> State {
        State {
            queue: JobQueue::new(Arc::new(MemoryStore::new())),
            embedder: Arc::new(StaticEmbedder::new(8)),
            vectors: Arc::new(InMemoryVectorIndex::new()),
            staging: StagingArea::new(std::env::temp_dir()),
        }
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let response = job_status(AxumState(state()), Path("nope".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn known_job_returns_its_record_view() {
        let state = state();
        let job = Job::new("p1", "/tmp/p1.jpg", "", "", Default::default());
        assert!(state.queue.enqueue(&job).await);

        let response = job_status(AxumState(state.clone()), Path(job.job_id.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn retry_of_non_retryable_job_is_400_and_mutates_nothing() {
        let state = state();
        let job = Job::new("p1", "/tmp/p1.jpg", "", "", Default::default());
        assert!(state.queue.enqueue(&job).await);

        // queued, so not retryable
        let response = retry_job(AxumState(state.clone()), Path(job.job_id.clone())).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let record = state.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_of_failed_job_requeues_it() {
        let state = state();
        let job = Job::new("p1", "/tmp/p1.jpg", "", "", Default::default());
        assert!(state.queue.enqueue(&job).await);
        state.queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(
            state
                .queue
                .update_status(&job.job_id, JobStatus::Failed, Some("boom"))
                .await
        );

        let response = retry_job(AxumState(state.clone()), Path(job.job_id.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let record = state.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn stats_and_workers_reflect_the_store() {
        let state = state();
        let job = Job::new("p1", "/tmp/p1.jpg", "", "", Default::default());
        assert!(state.queue.enqueue(&job).await);
        assert!(
            state
                .queue
                .publish_worker_status(&WorkerStatus {
                    worker_id: "worker-1".to_string(),
                    status: "running".to_string(),
                    tasks_processed: 3,
                    tasks_failed: 1,
                    last_seen: Utc::now(),
                })
                .await
        );

        let stats = queue_stats(AxumState(state.clone())).await.0;
        assert!(stats.available);
        assert_eq!(stats.jobs.queued, 1);
        assert_eq!(stats.pending_in_queue, 1);

        let response = list_workers(AxumState(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
