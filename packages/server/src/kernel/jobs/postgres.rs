//! PostgreSQL-backed job queue.
//!
//! Jobs live in the `tasks` table; the status column realises the named
//! status sets. Claiming uses `FOR UPDATE SKIP LOCKED` so concurrent workers
//! never double-claim, and the pending → running move is a single statement.

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

const JOB_COLUMNS: &str = "id, job_type, payload, priority, status, progress, retry_count, \
     retry_max, timeout_ms, run_at, lease_expires_at, worker_id, dead_lettered, error_message, \
     error_kind, error_at, result, created_by, parent_id, tags, estimated_duration_ms, \
     created_at, started_at, completed_at, updated_at";

pub struct PostgresJobQueue {
    pool: sqlx::PgPool,
    events: QueueEvents,
    lease: Duration,
}

impl PostgresJobQueue {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self::with_events(pool, QueueEvents::default())
    }

    pub fn with_events(pool: sqlx::PgPool, events: QueueEvents) -> Self {
        Self {
            pool,
            events,
            lease: DEFAULT_LEASE,
        }
    }

    async fn fetch(&self, id: Uuid) -> Result<Job, QueueError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotFound(id))?;
        Ok(job)
    }

    fn ensure_not_terminal(job: &Job) -> Result<(), QueueError> {
        if job.is_terminal() {
            return Err(QueueError::Terminal {
                id: job.id,
                status: job.status,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<Job, QueueError> {
        check_payload_size(&payload)?;

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO tasks (
                id, job_type, payload, priority, retry_max, timeout_ms, run_at,
                created_by, parent_id, tags, estimated_duration_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(job_type)
        .bind(payload)
        .bind(opts.priority)
        .bind(opts.retry_max)
        .bind(opts.timeout_ms)
        .bind(opts.run_at)
        .bind(&opts.created_by)
        .bind(opts.parent_id)
        .bind(&opts.tags)
        .bind(opts.estimated_duration_ms)
        .fetch_one(&self.pool)
        .await?;

        self.events.publish(QueueEvent::Added { job: job.clone() });
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), QueueError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM tasks
            WHERE ($1::job_status IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasks WHERE ($1::job_status IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        Ok((jobs, total))
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<Job, QueueError> {
        let current = self.fetch(id).await?;
        Self::ensure_not_terminal(&current)?;

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE tasks
            SET progress = COALESCE($2, progress),
                result = COALESCE($3, result),
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(update.progress.map(|p| p.clamp(0, 100)))
        .bind(update.result)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::Terminal {
            id,
            status: current.status,
        })?;

        self.events.publish(QueueEvent::Updated {
            job_id: id,
            progress: job.progress,
        });
        Ok(job)
    }

    async fn cancel(&self, id: Uuid, reason: Option<String>) -> Result<bool, QueueError> {
        // Existence check so a bogus id is a 404, not a silent no-op.
        self.fetch(id).await?;

        let updated = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled',
                error_message = $2,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(id)
        .bind(&reason)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            self.events
                .publish(QueueEvent::Cancelled { job_id: id, reason });
        }
        Ok(updated > 0)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        skip_types: &[JobType],
    ) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next_job AS (
                SELECT id FROM tasks
                WHERE status IN ('pending', 'retrying')
                  AND (run_at IS NULL OR run_at <= NOW())
                  AND NOT (job_type = ANY($3))
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET status = 'running',
                worker_id = $1,
                started_at = COALESCE(started_at, NOW()),
                lease_expires_at = NOW() + ($2 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind((self.lease.as_millis() as i64).to_string())
        .bind(skip_types)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            self.events.publish(QueueEvent::Started {
                job_id: job.id,
                job_type: job.job_type,
                worker_id: worker_id.to_string(),
                attempt: job.retry_count + 1,
            });
        }
        Ok(job)
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<Job, QueueError> {
        let current = self.fetch(id).await?;
        Self::ensure_not_terminal(&current)?;

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE tasks
            SET status = 'completed',
                progress = 100,
                result = $2,
                completed_at = NOW(),
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(result)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::Terminal {
            id,
            status: current.status,
        })?;

        let duration_ms = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        self.events.publish(QueueEvent::Completed {
            job_id: id,
            job_type: job.job_type,
            duration_ms,
        });
        Ok(job)
    }

    async fn fail(
        &self,
        id: Uuid,
        error: JobErrorRecord,
        dead_letter: bool,
    ) -> Result<Job, QueueError> {
        let current = self.fetch(id).await?;
        Self::ensure_not_terminal(&current)?;

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE tasks
            SET status = 'failed',
                error_message = $2,
                error_kind = $3,
                error_at = $4,
                dead_lettered = $5,
                completed_at = NOW(),
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&error.message)
        .bind(error.kind)
        .bind(error.occurred_at)
        .bind(dead_letter)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::Terminal {
            id,
            status: current.status,
        })?;

        self.events.publish(QueueEvent::Failed {
            job_id: id,
            job_type: job.job_type,
            error: error.message.clone(),
            error_kind: error.kind,
            will_retry: false,
        });
        if dead_letter {
            self.events.publish(QueueEvent::DeadLettered {
                job_id: id,
                job_type: job.job_type,
                final_error: error.message,
            });
        }
        Ok(job)
    }

    async fn requeue_retry(&self, id: Uuid, delay: Duration) -> Result<Job, QueueError> {
        let current = self.fetch(id).await?;
        Self::ensure_not_terminal(&current)?;

        let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE tasks
            SET status = 'retrying',
                retry_count = retry_count + 1,
                run_at = $2,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(run_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::Terminal {
            id,
            status: current.status,
        })?;

        Ok(job)
    }

    async fn reap_expired(&self) -> Result<u64, QueueError> {
        let recovered = sqlx::query_as::<_, (Uuid, i32)>(
            r#"
            UPDATE tasks
            SET status = 'pending',
                retry_count = retry_count + 1,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running' AND lease_expires_at < NOW()
            RETURNING id, retry_count
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for (job_id, retry_count) in &recovered {
            tracing::warn!(job_id = %job_id, retry_count, "recovered job with expired lease");
            self.events.publish(QueueEvent::LeaseRecovered {
                job_id: *job_id,
                retry_count: *retry_count,
            });
        }
        Ok(recovered.len() as u64)
    }

    async fn cleanup(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let removed = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, updated_at) < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if removed > 0 {
            tracing::info!(removed, "cleaned up terminal jobs past retention");
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let dead_letter = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tasks WHERE dead_lettered",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut stats = QueueStats {
            dead_letter,
            ..Default::default()
        };
        for (status, count) in rows {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Cancelled => stats.cancelled = count,
                JobStatus::Retrying => stats.retrying = count,
                JobStatus::Paused => stats.paused = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    async fn history(&self, limit: i64) -> Result<Vec<Job>, QueueError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM tasks
            WHERE status IN ('completed', 'failed', 'cancelled')
            ORDER BY completed_at DESC NULLS LAST
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}
