use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use health::HealthHandle;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use index_common::embedding::Embedder;
use index_common::job::{Job, JobStatus};
use index_common::metrics::{JOBS_COMPLETED, JOBS_FAILED, JOB_PROCESSING_SECONDS};
use index_common::queue::{JobQueue, WorkerStatus};
use index_common::retry::BackoffPolicy;
use index_common::staging;
use index_common::vector::{IndexPoint, VectorIndex};

use crate::error::ProcessError;

#[derive(Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub dequeue_timeout: Duration,
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// A worker to drain the pending list and index each job's image into the
/// vector store.
///
/// Within a batch, jobs run in parallel; across batches the worker is
/// sequential. Every failure inside `process` becomes a `failed` status on
/// the job record, never an error out of the loop, and the worker never
/// re-enqueues a failed job on its own: re-queuing is an operator action.
pub struct IndexWorker {
    config: WorkerConfig,
    queue: JobQueue,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorIndex>,
    backoff: BackoffPolicy,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
}

impl IndexWorker {
    pub fn new(
        config: WorkerConfig,
        queue: JobQueue,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
        backoff: BackoffPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            config,
            queue,
            embedder,
            vectors,
            backoff,
            liveness,
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        }
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::SeqCst)
    }

    pub fn tasks_failed(&self) -> u64 {
        self.tasks_failed.load(Ordering::SeqCst)
    }

    /// Run this worker until `shutdown` flips. The in-flight batch is
    /// finished (bounded by `task_timeout`) before returning; a final
    /// heartbeat marks the worker stopped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "worker {} starting: poll_interval={:?} batch_size={}",
            self.config.worker_id, self.config.poll_interval, self.config.batch_size
        );

        self.publish_heartbeat("running").await;
        let mut last_heartbeat = Instant::now();

        while !*shutdown.borrow() {
            self.liveness.report_healthy().await;

            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.publish_heartbeat("running").await;
                last_heartbeat = Instant::now();
            }

            let processed = self.process_batch().await;
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        self.publish_heartbeat("stopped").await;
        info!(
            "worker {} stopped. processed: {}, failed: {}",
            self.config.worker_id,
            self.tasks_processed(),
            self.tasks_failed()
        );
    }

    /// Drain up to `batch_size` jobs and process them concurrently.
    /// Returns the number of jobs in the batch.
    pub async fn process_batch(&self) -> usize {
        let mut jobs = Vec::with_capacity(self.config.batch_size);
        for _ in 0..self.config.batch_size {
            match self.queue.dequeue(self.config.dequeue_timeout).await {
                Some(job) => jobs.push(job),
                None => break,
            }
        }

        if jobs.is_empty() {
            return 0;
        }

        debug!("processing batch of {} jobs", jobs.len());
        let batch_len = jobs.len();
        futures::future::join_all(jobs.into_iter().map(|job| self.run_job(job))).await;
        batch_len
    }

    /// Process one job to a terminal status. The staged image is unlinked
    /// whichever way it ends.
    async fn run_job(&self, job: Job) {
        let job_id = job.job_id.clone();
        let image_ref = job.image_ref.clone();
        let started = Instant::now();

        let result = match tokio::time::timeout(self.config.task_timeout, self.process(&job)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProcessError::Timeout),
        };

        metrics::histogram!(JOB_PROCESSING_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                self.queue
                    .update_status(&job_id, JobStatus::Completed, None)
                    .await;
                self.tasks_processed.fetch_add(1, Ordering::SeqCst);
                counter!(JOBS_COMPLETED).increment(1);
                info!("job {} completed for product {}", job_id, job.product_id);
            }
            Err(err) => {
                error!("job {} failed: {}", job_id, err);
                self.queue
                    .update_status(&job_id, JobStatus::Failed, Some(&err.reason()))
                    .await;
                self.tasks_failed.fetch_add(1, Ordering::SeqCst);
                counter!(JOBS_FAILED).increment(1);
            }
        }

        staging::remove_staged(&image_ref).await;
    }

    async fn process(&self, job: &Job) -> Result<(), ProcessError> {
        let image = staging::read_staged(&job.image_ref)
            .await
            .map_err(|_| ProcessError::ImageUnreadable)?;

        let vector = self.embed_with_backoff(&image).await?;

        self.vectors
            .upsert(IndexPoint::for_product(
                &job.product_id,
                &job.name,
                &job.description,
                &job.metadata,
                vector,
            ))
            .await
            .map_err(ProcessError::VectorStore)?;

        Ok(())
    }

    /// Call the embedding collaborator with bounded backoff. The final
    /// attempt's failure propagates; it is never reported as success.
    async fn embed_with_backoff(&self, image: &[u8]) -> Result<Vec<f32>, ProcessError> {
        let mut attempt = 0;
        loop {
            match self.embedder.embed_image(image).await {
                Ok(vector) => return Ok(vector),
                Err(err) => {
                    attempt += 1;
                    if !err.is_transient() || attempt >= self.backoff.max_attempts() {
                        return Err(ProcessError::Embedding(err));
                    }
                    let wait = self.backoff.interval_after(attempt - 1);
                    warn!(
                        "embedding attempt {} failed, retrying in {:?}: {}",
                        attempt, wait, err
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn publish_heartbeat(&self, status: &str) {
        let heartbeat = WorkerStatus {
            worker_id: self.config.worker_id.clone(),
            status: status.to_string(),
            tasks_processed: self.tasks_processed(),
            tasks_failed: self.tasks_failed(),
            last_seen: Utc::now(),
        };
        self.queue.publish_worker_status(&heartbeat).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use index_common::embedding::StaticEmbedder;
    use index_common::store::MemoryStore;
    use index_common::vector::InMemoryVectorIndex;
    use serde_json::Value;

    const DIMENSION: usize = 8;

    struct Fixture {
        queue: JobQueue,
        vectors: InMemoryVectorIndex,
        staging_root: std::path::PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let queue = JobQueue::new(Arc::new(MemoryStore::new()));
            let staging_root =
                std::env::temp_dir().join(format!("worker-test-{}", uuid_like_suffix()));
            std::fs::create_dir_all(&staging_root).unwrap();
            Self {
                queue,
                vectors: InMemoryVectorIndex::new(),
                staging_root,
            }
        }

        async fn worker(&self, worker_id: &str, embedder: StaticEmbedder) -> IndexWorker {
            self.worker_with_timeout(worker_id, embedder, Duration::from_secs(5))
                .await
        }

        async fn worker_with_timeout(
            &self,
            worker_id: &str,
            embedder: StaticEmbedder,
            task_timeout: Duration,
        ) -> IndexWorker {
            let registry = HealthRegistry::new("liveness");
            let liveness = registry
                .register("worker".to_string(), chrono::Duration::seconds(30))
                .await;
            IndexWorker::new(
                WorkerConfig {
                    worker_id: worker_id.to_string(),
                    poll_interval: Duration::from_millis(10),
                    dequeue_timeout: Duration::from_millis(50),
                    batch_size: 4,
                    task_timeout,
                    heartbeat_interval: Duration::from_secs(30),
                },
                self.queue.clone(),
                Arc::new(embedder),
                Arc::new(self.vectors.clone()),
                // no waiting between attempts in tests
                BackoffPolicy::new(3, 0, Duration::ZERO, None),
                liveness,
            )
        }

        async fn enqueue_job_with_image(&self, product_id: &str) -> Job {
            let mut job = Job::new(product_id, "", "name", "desc", Default::default());
            let path = self.staging_root.join(format!("{}.jpg", job.job_id));
            std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();
            job.image_ref = path.to_string_lossy().to_string();
            assert!(self.queue.enqueue(&job).await);
            job
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.staging_root).ok();
        }
    }

    fn uuid_like_suffix() -> String {
        // job ids are uuids already; reuse one for a unique directory name
        Job::new("tmp", "", "", "", Default::default()).job_id
    }

    fn image_exists(job: &Job) -> bool {
        std::path::Path::new(&job.image_ref).exists()
    }

    #[tokio::test]
    async fn completes_job_and_indexes_vector() {
        let fixture = Fixture::new();
        let job = fixture.enqueue_job_with_image("p1").await;
        let worker = fixture.worker("worker-1", StaticEmbedder::new(DIMENSION)).await;

        assert_eq!(worker.process_batch().await, 1);

        let record = fixture.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.error_message, "");
        assert_eq!(worker.tasks_processed(), 1);
        assert_eq!(worker.tasks_failed(), 0);

        let point = fixture.vectors.point("p1").expect("vector not upserted");
        assert_eq!(point.vector.len(), DIMENSION);
        assert_eq!(point.payload.get("has_image"), Some(&Value::Bool(true)));
        assert_eq!(point.payload.get("name"), Some(&Value::String("name".into())));
        assert!(point.payload.contains_key("indexed_at"));

        assert!(!image_exists(&job));
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried_within_the_attempt() {
        let fixture = Fixture::new();
        let job = fixture.enqueue_job_with_image("p1").await;
        let embedder = StaticEmbedder::new(DIMENSION).fail_first(2);
        let worker = fixture.worker("worker-1", embedder).await;

        worker.process_batch().await;

        let record = fixture.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(worker.tasks_processed(), 1);
    }

    #[tokio::test]
    async fn exhausted_embedding_attempts_fail_the_job() {
        let fixture = Fixture::new();
        let job = fixture.enqueue_job_with_image("p1").await;
        // one more failure than the policy's three attempts allow
        let embedder = StaticEmbedder::new(DIMENSION).fail_first(3);
        let worker = fixture.worker("worker-1", embedder).await;

        worker.process_batch().await;

        let record = fixture.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.starts_with("embedding-failed"));
        assert_eq!(worker.tasks_failed(), 1);
        assert_eq!(worker.tasks_processed(), 0);
        assert!(fixture.vectors.is_empty());
        // the payload is unlinked on failure too
        assert!(!image_exists(&job));

        // the worker does not re-enqueue on its own
        assert!(fixture.queue.dequeue(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn unreadable_image_fails_the_job() {
        let fixture = Fixture::new();
        let job = Job::new("p1", "/nonexistent/image.jpg", "", "", Default::default());
        assert!(fixture.queue.enqueue(&job).await);

        let worker = fixture.worker("worker-1", StaticEmbedder::new(DIMENSION)).await;
        worker.process_batch().await;

        let record = fixture.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message, "image-unreadable");
        assert!(fixture.vectors.is_empty());
    }

    #[tokio::test]
    async fn slow_processing_times_out() {
        let fixture = Fixture::new();
        let job = fixture.enqueue_job_with_image("p1").await;
        let embedder = StaticEmbedder::new(DIMENSION).with_delay(Duration::from_millis(200));
        let worker = fixture
            .worker_with_timeout("worker-1", embedder, Duration::from_millis(50))
            .await;

        worker.process_batch().await;

        let record = fixture.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message, "timeout");
        assert_eq!(worker.tasks_failed(), 1);
    }

    #[tokio::test]
    async fn vector_store_failure_fails_the_job() {
        let fixture = Fixture::new();
        let job = fixture.enqueue_job_with_image("p1").await;
        fixture.vectors.fail_all(true);

        let worker = fixture.worker("worker-1", StaticEmbedder::new(DIMENSION)).await;
        worker.process_batch().await;

        let record = fixture.queue.load(&job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.starts_with("vector-store-failed"));
    }

    #[tokio::test]
    async fn two_workers_split_the_queue_without_overlap() {
        let fixture = Fixture::new();
        let mut jobs = Vec::new();
        for i in 0..10 {
            jobs.push(fixture.enqueue_job_with_image(&format!("p{i}")).await);
        }

        let first = fixture.worker("worker-1", StaticEmbedder::new(DIMENSION)).await;
        let second = fixture.worker("worker-2", StaticEmbedder::new(DIMENSION)).await;

        loop {
            let (a, b) = tokio::join!(first.process_batch(), second.process_batch());
            if a == 0 && b == 0 {
                break;
            }
        }

        for job in &jobs {
            let record = fixture.queue.load(&job.job_id).await.unwrap();
            assert_eq!(record.status, JobStatus::Completed);
        }
        // each success is counted by exactly one worker
        assert_eq!(first.tasks_processed() + second.tasks_processed(), 10);
        assert_eq!(first.tasks_failed() + second.tasks_failed(), 0);
    }

    #[tokio::test]
    async fn heartbeats_carry_counters_and_reach_the_store() {
        let fixture = Fixture::new();
        fixture.enqueue_job_with_image("p1").await;
        let worker = fixture.worker("worker-1", StaticEmbedder::new(DIMENSION)).await;

        worker.process_batch().await;
        worker.publish_heartbeat("running").await;

        let workers = fixture.queue.list_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].worker_id, "worker-1");
        assert_eq!(workers[0].status, "running");
        assert_eq!(workers[0].tasks_processed, 1);
        assert_eq!(workers[0].tasks_failed, 0);
    }

    #[tokio::test]
    async fn run_honors_shutdown_and_publishes_stopped() {
        let fixture = Fixture::new();
        let worker = fixture.worker("worker-1", StaticEmbedder::new(DIMENSION)).await;
        let (tx, rx) = watch::channel(false);

        let run = {
            tokio::time::timeout(Duration::from_secs(5), async {
                tokio::join!(worker.run(rx), async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    tx.send(true).unwrap();
                })
            })
        };
        run.await.expect("worker did not shut down");

        let workers = fixture.queue.list_workers().await;
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].status, "stopped");
    }
}
