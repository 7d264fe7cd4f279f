//! Job queue contract shared by the PostgreSQL and in-memory backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::events::QueueEvent;
use super::job::{Job, JobErrorRecord, JobPriority, JobStatus, JobType};

/// Upper bound on a serialized job payload.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Default worker lease; a running job whose lease expires is considered
/// abandoned and re-enqueued by the reaper.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

/// Default retention for terminal jobs before the cleanup sweep removes them.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(Uuid),
    #[error("job {id} is {status:?} and cannot transition")]
    Terminal { id: Uuid, status: JobStatus },
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Options accepted at enqueue time.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EnqueueOptions {
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = 3)]
    pub retry_max: i32,
    #[builder(default = 300_000)]
    pub timeout_ms: i64,
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub parent_id: Option<Uuid>,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub estimated_duration_ms: Option<i64>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Mutable fields a handler may touch while a job runs.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub progress: Option<i16>,
    pub result: Option<serde_json::Value>,
}

/// Counters across the status sets.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub retrying: i64,
    pub paused: i64,
    pub dead_letter: i64,
    pub total: i64,
}

/// Durable, priority-ordered job queue.
///
/// Claim order is priority first, FIFO within a priority. `claim_next` is
/// atomic: a job moves pending → running exactly once per lease. Terminal
/// statuses are never overwritten; re-running means enqueueing a new job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a new pending job and publish `Added`.
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError>;

    /// List jobs, optionally filtered by status, newest first.
    /// Returns the page and the total matching count.
    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), QueueError>;

    /// Apply a progress/result delta. Fails on terminal jobs.
    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, QueueError>;

    /// Cancel a job. Returns false when the job was already terminal.
    async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<bool, QueueError>;

    /// Atomically claim the highest-priority due job, skipping the given
    /// types (open circuit breakers). `None` is normal idleness.
    async fn claim_next(
        &self,
        worker_id: &str,
        skip_types: &[JobType],
    ) -> Result<Option<Job>, QueueError>;

    /// Mark a claimed job completed with its result and progress 100.
    async fn complete(&self, id: Uuid, result: Option<serde_json::Value>)
        -> Result<Job, QueueError>;

    /// Mark a claimed job failed; optionally route it to the dead-letter set.
    async fn fail(
        &self,
        id: Uuid,
        error: JobErrorRecord,
        dead_letter: bool,
    ) -> Result<Job, QueueError>;

    /// Schedule a retry: status retrying, retry_count bumped, claimable
    /// again after `delay`.
    async fn requeue_retry(&self, id: Uuid, delay: Duration) -> Result<Job, QueueError>;

    /// Re-enqueue running jobs whose lease expired. Returns how many were
    /// recovered.
    async fn reap_expired(&self) -> Result<u64, QueueError>;

    /// Remove terminal jobs older than `retention`.
    async fn cleanup(&self, retention: Duration) -> Result<u64, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Terminal jobs, newest first.
    async fn history(&self, limit: i64) -> Result<Vec<Job>, QueueError>;

    /// Subscribe to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}

/// Reject payloads over the size bound before they reach storage.
pub fn check_payload_size(payload: &serde_json::Value) -> Result<(), QueueError> {
    let size = serde_json::to_vec(payload)?.len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(QueueError::PayloadTooLarge {
            size,
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}
