use std::future::ready;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use health::HealthRegistry;
use index_common::embedding::Embedder;
use index_common::metrics::{setup_metrics_recorder, track_metrics};
use index_common::queue::JobQueue;
use index_common::staging::StagingArea;
use index_common::vector::VectorIndex;

pub mod queue;
pub mod submit;

/// Submissions carry a full image payload, so the default 2 MB body cap is
/// too tight.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct State {
    pub queue: JobQueue,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorIndex>,
    pub staging: StagingArea,
}

async fn index() -> &'static str {
    "image index api"
}

pub fn router(state: State, liveness: HealthRegistry, metrics: bool) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/api/v1/index-image", post(submit::submit))
        .route("/api/v1/queue/status/:job_id", get(queue::job_status))
        .route("/api/v1/queue/stats", get(queue::queue_stats))
        .route("/api/v1/queue/retry/:job_id", post(queue::retry_job))
        .route("/api/v1/queue/workers", get(queue::list_workers))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install the recorder unless asked to: a global recorder does not
    // work well when the router is built repeatedly during tests.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
