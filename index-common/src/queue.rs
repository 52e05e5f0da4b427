//! # JobQueue
//!
//! The submission-to-completion protocol on top of the shared store: one
//! pending list of job ids, one hash record per job, one TTL-bounded
//! heartbeat blob per worker. All key naming lives here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobStatus};
use crate::metrics::{JOBS_CLEANED_UP, JOBS_ENQUEUED, JOBS_RETRIED};
use crate::store::{Store, StoreError};

/// Ordered sequence of job ids awaiting a worker.
pub const PENDING_LIST_KEY: &str = "queue:pending";

const JOB_KEY_PREFIX: &str = "job:";
const WORKER_KEY_PREFIX: &str = "worker:";

/// Job records expire a day after their last update; the pending list never
/// expires.
pub const JOB_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Heartbeats expire on their own so crashed workers disappear without
/// explicit cleanup.
pub const WORKER_STATUS_TTL: Duration = Duration::from_secs(60);

/// Periodic liveness record written by each worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub status: String,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub available: bool,
    pub pending_in_queue: u64,
    pub jobs: JobCounts,
    pub timestamp: DateTime<Utc>,
}

impl QueueStats {
    fn unavailable() -> Self {
        Self {
            available: false,
            pending_in_queue: 0,
            jobs: JobCounts::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Owns the store client and every persistence operation of the job
/// lifecycle. Producers call `enqueue`, workers call `dequeue` and
/// `update_status`, operators call `retry`, observers call the rest.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn is_available(&self) -> bool {
        self.store.is_available().await
    }

    fn job_key(job_id: &str) -> String {
        format!("{JOB_KEY_PREFIX}{job_id}")
    }

    fn worker_key(worker_id: &str) -> String {
        format!("{WORKER_KEY_PREFIX}{worker_id}")
    }

    /// Persist the job record, then push its id onto the pending list.
    ///
    /// The record is written first: a crash between the two writes leaves an
    /// expiring record that no worker will ever see, instead of a dangling
    /// list entry. Returns `false` on any store failure so the caller can
    /// fall back to synchronous processing.
    pub async fn enqueue(&self, job: &Job) -> bool {
        if !self.store.is_available().await {
            warn!("store unavailable, refusing to enqueue job {}", job.job_id);
            return false;
        }

        let key = Self::job_key(&job.job_id);
        if let Err(err) = self.store.hash_set(&key, job.to_fields()).await {
            error!("failed to write record for job {}: {}", job.job_id, err);
            return false;
        }
        if let Err(err) = self.store.expire(&key, JOB_RECORD_TTL).await {
            warn!("failed to set TTL on job {}: {}", job.job_id, err);
        }
        if let Err(err) = self.store.list_push_right(PENDING_LIST_KEY, &job.job_id).await {
            error!("failed to push job {} onto pending list: {}", job.job_id, err);
            return false;
        }

        counter!(JOBS_ENQUEUED).increment(1);
        info!("job {} enqueued for product {}", job.job_id, job.product_id);
        true
    }

    /// Blocking pop of the next job id, then load and claim its record.
    ///
    /// This is the only way a worker acquires a job. Ids whose record has
    /// expired (or was cleaned up) are dropped silently; ids whose record is
    /// no longer `queued` were claimed through a duplicate list entry and
    /// are skipped. Both cases return `None`, like an empty queue.
    pub async fn dequeue(&self, block_timeout: Duration) -> Option<Job> {
        let job_id = match self
            .store
            .list_block_pop_left(PENDING_LIST_KEY, block_timeout)
            .await
        {
            Ok(Some(job_id)) => job_id,
            Ok(None) => return None,
            Err(err) => {
                warn!("failed to pop from pending list: {}", err);
                return None;
            }
        };

        let key = Self::job_key(&job_id);
        let fields = match self.store.hash_get_all(&key).await {
            Ok(fields) => fields,
            Err(StoreError::NotFound) => {
                warn!("job {} not found in storage, dropping", job_id);
                return None;
            }
            Err(err) => {
                error!("failed to load record for job {}: {}", job_id, err);
                return None;
            }
        };

        let mut job = match Job::from_fields(&fields) {
            Ok(job) => job,
            Err(err) => {
                error!("corrupt record for job {}: {}", job_id, err);
                return None;
            }
        };

        if job.status != JobStatus::Queued {
            debug!(
                "job {} already in state {}, skipping duplicate delivery",
                job_id, job.status
            );
            return None;
        }

        // claim it before handing it out, so a concurrent consumer of a
        // duplicate list entry sees `processing` and skips
        if job.transition(JobStatus::Processing).is_err() {
            return None;
        }
        self.write_status(&key, job.status, job.updated_at, None).await;

        debug!("dequeued job {} for product {}", job.job_id, job.product_id);
        Some(job)
    }

    /// Idempotently set the status (and optionally the error message) of an
    /// existing record. Returns `false` for unknown job ids without raising.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> bool {
        let key = Self::job_key(job_id);
        match self.store.hash_get_all(&key).await {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                warn!("refusing to update status of unknown job {}", job_id);
                return false;
            }
            Err(err) => {
                error!("failed to read job {}: {}", job_id, err);
                return false;
            }
        }

        self.write_status(&key, status, Utc::now(), error_message).await;
        debug!("job {} status: {}", job_id, status);
        true
    }

    /// Re-queue a failed job, accounting the attempt. Refuses (returns
    /// `false`) when the job is unknown, not in `failed`, or out of retries.
    pub async fn retry(&self, job_id: &str) -> bool {
        let key = Self::job_key(job_id);
        let fields = match self.store.hash_get_all(&key).await {
            Ok(fields) => fields,
            Err(err) => {
                warn!("cannot retry job {}: {}", job_id, err);
                return false;
            }
        };
        let job = match Job::from_fields(&fields) {
            Ok(job) => job,
            Err(err) => {
                error!("corrupt record for job {}: {}", job_id, err);
                return false;
            }
        };

        if job.status != JobStatus::Failed {
            debug!("job {} is {}, not retryable", job_id, job.status);
            return false;
        }
        if job.retry_count >= job.max_retries {
            warn!(
                "job {} exceeded max retries ({}), refusing",
                job_id, job.max_retries
            );
            return false;
        }

        if let Err(err) = self.store.hash_incr_by(&key, "retry_count", 1).await {
            error!("failed to increment retry count for job {}: {}", job_id, err);
            return false;
        }
        self.write_status(&key, JobStatus::Queued, Utc::now(), Some("")).await;
        if let Err(err) = self.store.list_push_right(PENDING_LIST_KEY, job_id).await {
            error!("failed to re-queue job {}: {}", job_id, err);
            return false;
        }

        counter!(JOBS_RETRIED).increment(1);
        info!("job {} re-queued (attempt {})", job_id, job.retry_count + 1);
        true
    }

    /// Load a record for the status endpoint. `None` when unknown.
    pub async fn load(&self, job_id: &str) -> Option<Job> {
        let fields = self.store.hash_get_all(&Self::job_key(job_id)).await.ok()?;
        match Job::from_fields(&fields) {
            Ok(job) => Some(job),
            Err(err) => {
                error!("corrupt record for job {}: {}", job_id, err);
                None
            }
        }
    }

    /// Aggregate job counts by status plus the current list depth.
    ///
    /// Scans every job record; never call this on the submission or worker
    /// hot path.
    pub async fn stats(&self) -> QueueStats {
        if !self.store.is_available().await {
            return QueueStats::unavailable();
        }

        let keys = match self.store.scan(&format!("{JOB_KEY_PREFIX}*")).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("failed to scan job records: {}", err);
                return QueueStats::unavailable();
            }
        };

        let mut jobs = JobCounts::default();
        for key in &keys {
            let Ok(fields) = self.store.hash_get_all(key).await else {
                continue;
            };
            jobs.total += 1;
            match fields.get("status").map(String::as_str) {
                Some("queued") => jobs.queued += 1,
                Some("processing") => jobs.processing += 1,
                Some("completed") => jobs.completed += 1,
                Some("failed") => jobs.failed += 1,
                _ => {}
            }
        }

        let pending_in_queue = self.store.list_len(PENDING_LIST_KEY).await.unwrap_or(0);

        QueueStats {
            available: true,
            pending_in_queue,
            jobs,
            timestamp: Utc::now(),
        }
    }

    /// Delete terminal records older than `older_than`. Returns how many
    /// were deleted. Non-terminal records are never touched.
    pub async fn cleanup(&self, older_than: chrono::Duration) -> u64 {
        let cutoff = Utc::now() - older_than;
        let keys = match self.store.scan(&format!("{JOB_KEY_PREFIX}*")).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("cleanup scan failed: {}", err);
                return 0;
            }
        };

        let mut deleted = 0;
        for key in &keys {
            let Ok(fields) = self.store.hash_get_all(key).await else {
                continue;
            };
            let Ok(job) = Job::from_fields(&fields) else {
                continue;
            };
            if !job.status.is_terminal() || job.created_at >= cutoff {
                continue;
            }
            if self.store.delete(key).await.is_ok() {
                deleted += 1;
            }
        }

        if deleted > 0 {
            counter!(JOBS_CLEANED_UP).increment(deleted);
            info!("cleaned up {} old jobs", deleted);
        }
        deleted
    }

    /// Publish a worker heartbeat with a 60 s TTL.
    pub async fn publish_worker_status(&self, status: &WorkerStatus) -> bool {
        let payload = match serde_json::to_string(status) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to serialize worker status: {}", err);
                return false;
            }
        };
        match self
            .store
            .set_string(
                &Self::worker_key(&status.worker_id),
                &payload,
                Some(WORKER_STATUS_TTL),
            )
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to publish heartbeat for {}: {}", status.worker_id, err);
                false
            }
        }
    }

    /// All workers whose heartbeat has not yet expired.
    pub async fn list_workers(&self) -> Vec<WorkerStatus> {
        let keys = match self.store.scan(&format!("{WORKER_KEY_PREFIX}*")).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("failed to scan worker heartbeats: {}", err);
                return Vec::new();
            }
        };

        let mut workers = Vec::with_capacity(keys.len());
        for key in &keys {
            let Ok(payload) = self.store.get_string(key).await else {
                continue;
            };
            match serde_json::from_str::<WorkerStatus>(&payload) {
                Ok(status) => workers.push(status),
                Err(err) => warn!("unreadable heartbeat at {}: {}", key, err),
            }
        }
        workers
    }

    async fn write_status(
        &self,
        key: &str,
        status: JobStatus,
        updated_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) {
        let mut fields = HashMap::from([
            ("status".to_string(), status.to_string()),
            ("updated_at".to_string(), updated_at.to_rfc3339()),
        ]);
        if let Some(message) = error_message {
            fields.insert("error_message".to_string(), message.to_string());
        }

        if let Err(err) = self.store.hash_set(key, fields).await {
            error!("failed to write status for {}: {}", key, err);
            return;
        }
        if let Err(err) = self.store.expire(key, JOB_RECORD_TTL).await {
            warn!("failed to refresh TTL on {}: {}", key, err);
        }
    }
}
