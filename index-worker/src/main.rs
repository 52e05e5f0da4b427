//! Drain the pending list and index product images into the vector store.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use health::HealthRegistry;
use index_common::embedding::HttpEmbedder;
use index_common::metrics::{serve, setup_metrics_routes};
use index_common::queue::JobQueue;
use index_common::retry::BackoffPolicy;
use index_common::store::{RedisStore, Store};
use index_common::vector::{HttpVectorIndex, VectorIndex};
use index_worker::config::{Config, EnvSecsDuration};
use index_worker::error::WorkerError;
use index_worker::worker::{IndexWorker, WorkerConfig};

/// Flags override their environment mirrors: `STORE_URL`,
/// `WORKER_POLL_INTERVAL`, `WORKER_BATCH_SIZE`, `TASK_TIMEOUT`.
/// `LOG_LEVEL` controls logging.
#[derive(Parser)]
#[command(name = "index-worker", about = "Image indexing queue worker")]
struct Cli {
    /// Unique worker identifier
    #[arg(long)]
    worker_id: String,

    /// Store connection URL
    #[arg(long)]
    store_url: Option<String>,

    /// Seconds to sleep after an empty batch
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Jobs to dequeue and process per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Per-job processing timeout in seconds
    #[arg(long)]
    task_timeout: Option<u64>,
}

fn setup_tracing() {
    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => EnvFilter::new(level),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let cli = Cli::parse();
    let mut config =
        Config::init_from_env().map_err(|err| WorkerError::Config(err.to_string()))?;
    if let Some(url) = cli.store_url {
        config.store_url = url;
    }
    if let Some(secs) = cli.poll_interval {
        config.poll_interval = EnvSecsDuration(Duration::from_secs_f64(secs));
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(secs) = cli.task_timeout {
        config.task_timeout = EnvSecsDuration(Duration::from_secs(secs));
    }

    info!("starting worker {}", cli.worker_id);

    let store = RedisStore::new(&config.store_url)?;
    // an unreachable store at startup is fatal; later outages are retried
    store.ping().await?;
    let queue = JobQueue::new(Arc::new(store));

    let embedder = Arc::new(HttpEmbedder::new(
        &config.embedding_url,
        config.embedding_dimension,
        config.embedding_timeout.0,
    )?);
    let vectors = Arc::new(HttpVectorIndex::new(
        &config.vector_store_url,
        &config.vector_collection,
        config.embedding_dimension,
        config.vector_store_timeout.0,
    )?);
    if let Err(err) = vectors.ensure_collection().await {
        warn!("could not ensure vector collection at startup: {}", err);
    }

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), chrono::Duration::seconds(60))
        .await;

    let worker = IndexWorker::new(
        WorkerConfig {
            worker_id: cli.worker_id,
            poll_interval: config.poll_interval.0,
            dequeue_timeout: config.dequeue_timeout.0,
            batch_size: config.batch_size,
            task_timeout: config.task_timeout.0,
            heartbeat_interval: config.heartbeat_interval.0,
        },
        queue,
        embedder,
        vectors,
        BackoffPolicy::default(),
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current batch");
            _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await;

    Ok(())
}

pub async fn index() -> &'static str {
    "image index worker"
}
