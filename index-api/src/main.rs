//! HTTP ingestion surface for the image-indexing queue: accepts submissions,
//! serves job status and queue observability, and falls back to in-line
//! indexing when the store is unreachable.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use health::{HealthHandle, HealthRegistry};
use index_common::embedding::HttpEmbedder;
use index_common::queue::JobQueue;
use index_common::staging::StagingArea;
use index_common::store::RedisStore;
use index_common::vector::{HttpVectorIndex, VectorIndex};

mod config;
mod handlers;

fn setup_tracing() {
    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => EnvFilter::new(level),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically delete terminal job records past their retention age.
async fn cleanup_loop(
    queue: JobQueue,
    interval_secs: u64,
    max_age: chrono::Duration,
    liveness: HealthHandle,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        liveness.report_healthy().await;
        queue.cleanup(max_age).await;
    }
}

#[tokio::main]
async fn main() {
    setup_tracing();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    // the connection is lazy, so the service comes up (and can serve the
    // sync fallback) even while the store is down
    let store = RedisStore::new(&config.store_url).expect("invalid store url");
    let queue = JobQueue::new(Arc::new(store));

    let embedder = Arc::new(
        HttpEmbedder::new(
            &config.embedding_url,
            config.embedding_dimension,
            Duration::from_secs(config.embedding_timeout_secs),
        )
        .expect("failed to build embedding client"),
    );
    let vectors = Arc::new(
        HttpVectorIndex::new(
            &config.vector_store_url,
            &config.vector_collection,
            config.embedding_dimension,
            Duration::from_secs(config.vector_store_timeout_secs),
        )
        .expect("failed to build vector store client"),
    );
    if let Err(err) = vectors.ensure_collection().await {
        warn!("could not ensure vector collection at startup: {}", err);
    }

    let liveness = HealthRegistry::new("liveness");
    let cleanup_liveness = liveness
        .register(
            "cleanup".to_string(),
            chrono::Duration::seconds(2 * config.cleanup_interval_secs as i64),
        )
        .await;

    let state = handlers::State {
        queue: queue.clone(),
        embedder,
        vectors,
        staging: StagingArea::new(&config.staging_dir),
    };
    let app = handlers::router(state, liveness, config.export_prometheus);

    let http_server = Box::pin(listen(app, config.bind()));
    let cleanup = Box::pin(cleanup_loop(
        queue,
        config.cleanup_interval_secs,
        chrono::Duration::hours(config.cleanup_max_age_hours),
        cleanup_liveness,
    ));

    match select(http_server, cleanup).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start index-api http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("index-api cleanup task exited")
        }
    };
}
