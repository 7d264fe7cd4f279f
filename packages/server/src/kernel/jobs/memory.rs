//! In-memory job queue.
//!
//! Same contract and ordering semantics as the PostgreSQL backend, held in a
//! single mutex. Used by the test suite and by embedded deployments that run
//! without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{QueueEvent, QueueEvents};
use super::job::{Job, JobErrorRecord, JobStatus, JobType};
use super::queue::{
    check_payload_size, EnqueueOptions, JobQueue, JobUpdate, QueueError, QueueStats, DEFAULT_LEASE,
};

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<Uuid, Job>,
    /// Claim order: (composite score, enqueue sequence) → job id.
    ready: BTreeMap<(i64, u64), Uuid>,
    seq: u64,
}

pub struct MemoryJobQueue {
    inner: Mutex<QueueInner>,
    events: QueueEvents,
    lease: Duration,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_events(QueueEvents::default())
    }

    pub fn with_events(events: QueueEvents) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            events,
            lease: DEFAULT_LEASE,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_ready(inner: &mut QueueInner, job: &Job) {
        inner.seq += 1;
        inner.ready.insert((job.claim_score(), inner.seq), job.id);
    }

    fn remove_ready(inner: &mut QueueInner, id: Uuid) {
        inner.ready.retain(|_, v| *v != id);
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError> {
        check_payload_size(&payload)?;

        let mut job = Job::builder().job_type(job_type).payload(payload).build();
        job.priority = opts.priority;
        job.retry_max = opts.retry_max;
        job.timeout_ms = opts.timeout_ms;
        job.run_at = opts.run_at;
        job.created_by = opts.created_by;
        job.parent_id = opts.parent_id;
        job.tags = opts.tags;
        job.estimated_duration_ms = opts.estimated_duration_ms;

        let mut inner = self.lock();
        Self::insert_ready(&mut inner, &job);
        inner.jobs.insert(job.id, job.clone());
        drop(inner);

        self.events.publish(QueueEvent::Added { job: job.clone() });
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), QueueError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = jobs.len() as i64;
        let page = jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, QueueError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.is_terminal() {
            return Err(QueueError::Terminal {
                id,
                status: job.status,
            });
        }
        if let Some(progress) = update.progress {
            job.progress = progress.clamp(0, 100);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        job.updated_at = Utc::now();
        let snapshot = job.clone();
        drop(inner);

        self.events.publish(QueueEvent::Updated {
            job_id: id,
            progress: snapshot.progress,
        });
        Ok(snapshot)
    }

    async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<bool, QueueError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.error_message = reason.clone();
        job.completed_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Self::remove_ready(&mut inner, id);
        drop(inner);

        self.events
            .publish(QueueEvent::Cancelled { job_id: id, reason });
        Ok(true)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        skip_types: &[JobType],
    ) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();

        let mut claimed_key = None;
        for (key, id) in inner.ready.iter() {
            let Some(job) = inner.jobs.get(id) else {
                continue;
            };
            if !job.is_claimable(now) || skip_types.contains(&job.job_type) {
                continue;
            }
            claimed_key = Some((*key, *id));
            break;
        }

        let Some((key, id)) = claimed_key else {
            return Ok(None);
        };

        inner.ready.remove(&key);
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::seconds(60));
        let job = inner.jobs.get_mut(&id).expect("ready entry has a job");
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.started_at.get_or_insert(now);
        job.lease_expires_at = Some(now + lease);
        job.updated_at = now;
        let snapshot = job.clone();
        drop(inner);

        self.events.publish(QueueEvent::Started {
            job_id: snapshot.id,
            job_type: snapshot.job_type,
            worker_id: worker_id.to_string(),
            attempt: snapshot.retry_count + 1,
        });
        Ok(Some(snapshot))
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<Job, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.is_terminal() {
            return Err(QueueError::Terminal {
                id,
                status: job.status,
            });
        }
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.result = result;
        job.completed_at = Some(now);
        job.lease_expires_at = None;
        job.updated_at = now;
        let snapshot = job.clone();
        drop(inner);

        let duration_ms = snapshot
            .started_at
            .map(|s| (now - s).num_milliseconds())
            .unwrap_or(0);
        self.events.publish(QueueEvent::Completed {
            job_id: id,
            job_type: snapshot.job_type,
            duration_ms,
        });
        Ok(snapshot)
    }

    async fn fail(
        &self,
        id: Uuid,
        error: JobErrorRecord,
        dead_letter: bool,
    ) -> Result<Job, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.is_terminal() {
            return Err(QueueError::Terminal {
                id,
                status: job.status,
            });
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error.message.clone());
        job.error_kind = Some(error.kind);
        job.error_at = Some(error.occurred_at);
        job.dead_lettered = dead_letter;
        job.completed_at = Some(now);
        job.lease_expires_at = None;
        job.updated_at = now;
        let snapshot = job.clone();
        drop(inner);

        self.events.publish(QueueEvent::Failed {
            job_id: id,
            job_type: snapshot.job_type,
            error: error.message.clone(),
            error_kind: error.kind,
            will_retry: false,
        });
        if dead_letter {
            self.events.publish(QueueEvent::DeadLettered {
                job_id: id,
                job_type: snapshot.job_type,
                final_error: error.message,
            });
        }
        Ok(snapshot)
    }

    async fn requeue_retry(&self, id: Uuid, delay: Duration) -> Result<Job, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if job.is_terminal() {
            return Err(QueueError::Terminal {
                id,
                status: job.status,
            });
        }
        job.status = JobStatus::Retrying;
        job.retry_count += 1;
        job.run_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
        job.worker_id = None;
        job.lease_expires_at = None;
        job.updated_at = now;
        let snapshot = job.clone();
        Self::insert_ready(&mut inner, &snapshot);
        Ok(snapshot)
    }

    async fn reap_expired(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.lease_expires_at.map_or(false, |at| at < now)
            })
            .map(|j| j.id)
            .collect();

        let mut recovered = Vec::new();
        for id in expired {
            let job = inner.jobs.get_mut(&id).expect("job exists");
            job.status = JobStatus::Pending;
            job.retry_count += 1;
            job.worker_id = None;
            job.lease_expires_at = None;
            job.updated_at = now;
            let snapshot = job.clone();
            Self::insert_ready(&mut inner, &snapshot);
            recovered.push((id, snapshot.retry_count));
        }
        drop(inner);

        for (job_id, retry_count) in &recovered {
            self.events.publish(QueueEvent::LeaseRecovered {
                job_id: *job_id,
                retry_count: *retry_count,
            });
        }
        Ok(recovered.len() as u64)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| {
            !(j.is_terminal() && j.completed_at.map_or(j.updated_at < cutoff, |at| at < cutoff))
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.lock();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Paused => stats.paused += 1,
            }
            if job.dead_lettered {
                stats.dead_letter += 1;
            }
        }
        stats.total = inner.jobs.len() as i64;
        Ok(stats)
    }

    async fn history(&self, limit: i64) -> Result<Vec<Job>, QueueError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobPriority;
    use crate::kernel::jobs::queue::DEFAULT_RETENTION;

    fn sync_payload() -> serde_json::Value {
        serde_json::json!({"tables": ["incident"]})
    }

    async fn enqueue(
        queue: &MemoryJobQueue,
        priority: JobPriority,
    ) -> Job {
        queue
            .enqueue(
                JobType::DataSync,
                sync_payload(),
                EnqueueOptions::builder().priority(priority).build(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claim_order_is_priority_then_fifo() {
        let queue = MemoryJobQueue::new();
        let a = enqueue(&queue, JobPriority::Normal).await;
        let b = enqueue(&queue, JobPriority::High).await;
        let c = enqueue(&queue, JobPriority::Normal).await;

        let first = queue.claim_next("w1", &[]).await.unwrap().unwrap();
        let second = queue.claim_next("w1", &[]).await.unwrap().unwrap();
        let third = queue.claim_next("w1", &[]).await.unwrap().unwrap();

        assert_eq!(first.id, b.id);
        assert_eq!(second.id, a.id);
        assert_eq!(third.id, c.id);
        assert!(queue.claim_next("w1", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_holds_across_many_jobs_of_equal_priority() {
        let queue = MemoryJobQueue::new();
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(enqueue(&queue, JobPriority::Normal).await.id);
        }
        for expected in ids {
            let claimed = queue.claim_next("w", &[]).await.unwrap().unwrap();
            assert_eq!(claimed.id, expected);
        }
    }

    #[tokio::test]
    async fn claim_sets_running_state_and_lease() {
        let queue = MemoryJobQueue::new();
        let job = enqueue(&queue, JobPriority::Normal).await;
        let claimed = queue.claim_next("w1", &[]).await.unwrap().unwrap();

        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.started_at.is_some());
        assert!(claimed.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn skip_types_leaves_jobs_pending() {
        let queue = MemoryJobQueue::new();
        enqueue(&queue, JobPriority::Urgent).await;
        let report = queue
            .enqueue(JobType::Report, sync_payload(), EnqueueOptions::default())
            .await
            .unwrap();

        let claimed = queue
            .claim_next("w1", &[JobType::DataSync])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, report.id);

        // The skipped job is still claimable later.
        let claimed = queue.claim_next("w1", &[]).await.unwrap().unwrap();
        assert_eq!(claimed.job_type, JobType::DataSync);
    }

    #[tokio::test]
    async fn retry_delay_gates_claiming() {
        let queue = MemoryJobQueue::new();
        let job = enqueue(&queue, JobPriority::Normal).await;
        queue.claim_next("w1", &[]).await.unwrap().unwrap();
        queue
            .requeue_retry(job.id, Duration::from_secs(60))
            .await
            .unwrap();

        // Not due yet.
        assert!(queue.claim_next("w1", &[]).await.unwrap().is_none());
        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let queue = MemoryJobQueue::new();
        let job = enqueue(&queue, JobPriority::Normal).await;
        queue.claim_next("w1", &[]).await.unwrap().unwrap();
        queue.complete(job.id, None).await.unwrap();

        assert!(matches!(
            queue.update(job.id, JobUpdate::default()).await,
            Err(QueueError::Terminal { .. })
        ));
        assert!(matches!(
            queue
                .fail(job.id, JobErrorRecord::new("late", Default::default()), false)
                .await,
            Err(QueueError::Terminal { .. })
        ));
        assert!(!queue.cancel(job.id, None).await.unwrap());

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_removes_pending_job_from_claim_order() {
        let queue = MemoryJobQueue::new();
        let job = enqueue(&queue, JobPriority::Urgent).await;
        assert!(queue.cancel(job.id, Some("operator".into())).await.unwrap());
        assert!(queue.claim_next("w1", &[]).await.unwrap().is_none());

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.error_message.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn reaper_recovers_expired_leases() {
        let mut queue = MemoryJobQueue::new();
        queue.lease = Duration::from_millis(0);
        let job = enqueue(&queue, JobPriority::Normal).await;
        queue.claim_next("w1", &[]).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let recovered = queue.reap_expired().await.unwrap();
        assert_eq!(recovered, 1);

        let stored = queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.retry_count, 1);

        // Recovered job is claimable again.
        assert!(queue.claim_next("w2", &[]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_respects_retention() {
        let queue = MemoryJobQueue::new();
        let job = enqueue(&queue, JobPriority::Normal).await;
        queue.claim_next("w1", &[]).await.unwrap().unwrap();
        queue.complete(job.id, None).await.unwrap();

        // Fresh terminal job survives a 7-day retention sweep.
        assert_eq!(queue.cleanup(DEFAULT_RETENTION).await.unwrap(), 0);
        // Zero retention removes it.
        assert_eq!(queue.cleanup(Duration::from_secs(0)).await.unwrap(), 1);
        assert!(queue.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_count_status_sets() {
        let queue = MemoryJobQueue::new();
        let a = enqueue(&queue, JobPriority::Normal).await;
        enqueue(&queue, JobPriority::Normal).await;
        queue.claim_next("w1", &[]).await.unwrap().unwrap();
        queue
            .fail(a.id, JobErrorRecord::new("x", Default::default()), true)
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_reports_total() {
        let queue = MemoryJobQueue::new();
        for _ in 0..5 {
            enqueue(&queue, JobPriority::Normal).await;
        }
        let (page, total) = queue.list(Some(JobStatus::Pending), 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(total, 5);

        let (page, total) = queue.list(Some(JobStatus::Running), 10, 0).await.unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 0);
    }
}
