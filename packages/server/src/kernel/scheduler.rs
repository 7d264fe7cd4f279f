//! Cron scheduler: materialises recurring work into the task queue.
//!
//! Scheduled entries live in their own store. Every tick (60 s) an instance
//! tries to take the scheduler lock (30 s lease); only the holder scans for
//! due entries, so running several instances against one database never
//! double-enqueues a tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::kernel::cron::{CronError, CronSchedule};
use crate::kernel::jobs::{EnqueueOptions, JobPriority, JobQueue, JobType, QueueError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression `{expr}`: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: CronError,
    },
    #[error("scheduled job not found: {0}")]
    NotFound(Uuid),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

// ============================================================================
// Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ScheduledJob {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub name: String,
    #[builder(default, setter(strip_option))]
    pub description: Option<String>,
    pub cron: String,
    pub job_type: JobType,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default = 3)]
    pub retry_max: i32,
    #[builder(default = 300_000)]
    pub timeout_ms: i64,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default, setter(strip_option))]
    pub last_run: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub next_run: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub run_count: i64,
    #[builder(default = 0)]
    pub fail_count: i64,
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// Creation input accepted by `Scheduler::schedule`.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateSchedule {
    pub name: String,
    #[builder(default)]
    pub description: Option<String>,
    pub cron: String,
    #[serde(alias = "type")]
    pub job_type: JobType,
    #[builder(default = serde_json::json!({}))]
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[builder(default)]
    #[serde(default)]
    pub priority: JobPriority,
    #[builder(default = 3)]
    #[serde(default = "default_retry_max")]
    pub retry_max: i32,
    #[builder(default = 300_000)]
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[builder(default = true)]
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[builder(default)]
    #[serde(default)]
    pub created_by: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}
fn default_retry_max() -> i32 {
    3
}
fn default_timeout_ms() -> i64 {
    300_000
}
fn default_enabled() -> bool {
    true
}

/// Partial update; a changed cron forces next_run recomputation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cron: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub priority: Option<JobPriority>,
    pub retry_max: Option<i32>,
    pub timeout_ms: Option<i64>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub total: i64,
    pub enabled: i64,
    pub total_runs: i64,
    pub total_failures: i64,
    pub next_wake: Option<DateTime<Utc>>,
}

// ============================================================================
// Store
// ============================================================================

/// Persistence for scheduled entries plus the materialisation lock.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn insert(&self, entry: ScheduledJob) -> Result<ScheduledJob, SchedulerError>;
    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, SchedulerError>;
    async fn update(&self, entry: ScheduledJob) -> Result<ScheduledJob, SchedulerError>;
    async fn delete(&self, id: Uuid) -> Result<bool, SchedulerError>;
    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError>;
    /// Enabled entries due at or before `now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError>;
    /// Take the materialisation lock for `ttl`. Re-entrant for the holder.
    async fn try_lock(&self, owner: &str, ttl: Duration) -> Result<bool, SchedulerError>;
    async fn unlock(&self, owner: &str) -> Result<(), SchedulerError>;
}

pub struct PostgresScheduleStore {
    pool: sqlx::PgPool,
}

const SCHEDULE_COLUMNS: &str = "id, name, description, cron, job_type, payload, priority, \
     retry_max, timeout_ms, enabled, last_run, next_run, run_count, fail_count, created_by, \
     tags, created_at, updated_at";

impl PostgresScheduleStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn insert(&self, entry: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let row = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            INSERT INTO scheduled_tasks (
                id, name, description, cron, job_type, payload, priority, retry_max,
                timeout_ms, enabled, last_run, next_run, run_count, fail_count,
                created_by, tags, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(entry.id)
        .bind(&entry.name)
        .bind(&entry.description)
        .bind(&entry.cron)
        .bind(entry.job_type)
        .bind(&entry.payload)
        .bind(entry.priority)
        .bind(entry.retry_max)
        .bind(entry.timeout_ms)
        .bind(entry.enabled)
        .bind(entry.last_run)
        .bind(entry.next_run)
        .bind(entry.run_count)
        .bind(entry.fail_count)
        .bind(&entry.created_by)
        .bind(&entry.tags)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, SchedulerError> {
        let row = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update(&self, entry: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let row = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            UPDATE scheduled_tasks SET
                name = $2, description = $3, cron = $4, job_type = $5, payload = $6,
                priority = $7, retry_max = $8, timeout_ms = $9, enabled = $10,
                last_run = $11, next_run = $12, run_count = $13, fail_count = $14,
                created_by = $15, tags = $16, updated_at = NOW()
            WHERE id = $1
            RETURNING {SCHEDULE_COLUMNS}
            "#
        ))
        .bind(entry.id)
        .bind(&entry.name)
        .bind(&entry.description)
        .bind(&entry.cron)
        .bind(entry.job_type)
        .bind(&entry.payload)
        .bind(entry.priority)
        .bind(entry.retry_max)
        .bind(entry.timeout_ms)
        .bind(entry.enabled)
        .bind(entry.last_run)
        .bind(entry.next_run)
        .bind(entry.run_count)
        .bind(entry.fail_count)
        .bind(&entry.created_by)
        .bind(&entry.tags)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SchedulerError::NotFound(entry.id))?;
        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, SchedulerError> {
        let deleted = sqlx::query("DELETE FROM scheduled_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let rows = sqlx::query_as::<_, ScheduledJob>(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let rows = sqlx::query_as::<_, ScheduledJob>(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks
            WHERE enabled AND next_run IS NOT NULL AND next_run <= $1
            ORDER BY next_run
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn try_lock(&self, owner: &str, ttl: Duration) -> Result<bool, SchedulerError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let acquired = sqlx::query(
            r#"
            INSERT INTO scheduler_lock (id, owner, expires_at)
            VALUES (TRUE, $1, $2)
            ON CONFLICT (id) DO UPDATE
            SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
            WHERE scheduler_lock.expires_at < NOW() OR scheduler_lock.owner = EXCLUDED.owner
            "#,
        )
        .bind(owner)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(acquired > 0)
    }

    async fn unlock(&self, owner: &str) -> Result<(), SchedulerError> {
        sqlx::query("DELETE FROM scheduler_lock WHERE owner = $1")
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory schedule store for tests and embedded use.
#[derive(Default)]
pub struct MemoryScheduleStore {
    inner: Mutex<MemoryScheduleInner>,
}

#[derive(Default)]
struct MemoryScheduleInner {
    entries: HashMap<Uuid, ScheduledJob>,
    lock: Option<(String, DateTime<Utc>)>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, MemoryScheduleInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, entry: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        self.lock_inner().entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledJob>, SchedulerError> {
        Ok(self.lock_inner().entries.get(&id).cloned())
    }

    async fn update(&self, entry: ScheduledJob) -> Result<ScheduledJob, SchedulerError> {
        let mut inner = self.lock_inner();
        if !inner.entries.contains_key(&entry.id) {
            return Err(SchedulerError::NotFound(entry.id));
        }
        inner.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, SchedulerError> {
        Ok(self.lock_inner().entries.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let mut entries: Vec<_> = self.lock_inner().entries.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let mut due: Vec<_> = self
            .lock_inner()
            .entries
            .values()
            .filter(|e| e.enabled && e.next_run.map_or(false, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_run);
        Ok(due)
    }

    async fn try_lock(&self, owner: &str, ttl: Duration) -> Result<bool, SchedulerError> {
        let now = Utc::now();
        let mut inner = self.lock_inner();
        let available = match &inner.lock {
            None => true,
            Some((holder, expires_at)) => holder == owner || *expires_at < now,
        };
        if available {
            let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
            inner.lock = Some((owner.to_string(), expires_at));
        }
        Ok(available)
    }

    async fn unlock(&self, owner: &str) -> Result<(), SchedulerError> {
        let mut inner = self.lock_inner();
        if inner.lock.as_ref().map_or(false, |(holder, _)| holder == owner) {
            inner.lock = None;
        }
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub lock_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    queue: Arc<dyn JobQueue>,
    instance_id: String,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self::with_config(store, queue, SchedulerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ScheduleStore>,
        queue: Arc<dyn JobQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
            config,
        }
    }

    /// Create a scheduled entry. Invalid cron expressions are rejected here,
    /// at creation time, never silently deferred.
    pub async fn schedule(&self, input: CreateSchedule) -> Result<ScheduledJob, SchedulerError> {
        let schedule = parse_cron(&input.cron)?;
        let next_run = schedule
            .next_after(Utc::now())
            .map_err(|source| SchedulerError::InvalidCron {
                expr: input.cron.clone(),
                source,
            })?;

        let mut entry = ScheduledJob::builder()
            .name(input.name)
            .cron(input.cron)
            .job_type(input.job_type)
            .payload(input.payload)
            .priority(input.priority)
            .retry_max(input.retry_max)
            .timeout_ms(input.timeout_ms)
            .enabled(input.enabled)
            .tags(input.tags)
            .build();
        entry.description = input.description;
        entry.created_by = input.created_by;
        entry.next_run = input.enabled.then_some(next_run);

        let entry = self.store.insert(entry).await?;
        info!(schedule_id = %entry.id, name = %entry.name, cron = %entry.cron, "schedule created");
        Ok(entry)
    }

    pub async fn unschedule(&self, id: Uuid) -> Result<bool, SchedulerError> {
        self.store.delete(id).await
    }

    pub async fn update(&self, id: Uuid, delta: ScheduleUpdate) -> Result<ScheduledJob, SchedulerError> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;

        if let Some(name) = delta.name {
            entry.name = name;
        }
        if let Some(description) = delta.description {
            entry.description = Some(description);
        }
        if let Some(payload) = delta.payload {
            entry.payload = payload;
        }
        if let Some(priority) = delta.priority {
            entry.priority = priority;
        }
        if let Some(retry_max) = delta.retry_max {
            entry.retry_max = retry_max;
        }
        if let Some(timeout_ms) = delta.timeout_ms {
            entry.timeout_ms = timeout_ms;
        }
        if let Some(tags) = delta.tags {
            entry.tags = tags;
        }
        if let Some(cron) = delta.cron {
            let schedule = parse_cron(&cron)?;
            let next_run =
                schedule
                    .next_after(Utc::now())
                    .map_err(|source| SchedulerError::InvalidCron {
                        expr: cron.clone(),
                        source,
                    })?;
            entry.cron = cron;
            entry.next_run = Some(next_run);
        }
        entry.updated_at = Utc::now();

        self.store.update(entry).await
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ScheduledJob, SchedulerError> {
        let mut entry = self
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;

        entry.enabled = enabled;
        if enabled {
            let schedule = parse_cron(&entry.cron)?;
            entry.next_run = Some(schedule.next_after(Utc::now()).map_err(|source| {
                SchedulerError::InvalidCron {
                    expr: entry.cron.clone(),
                    source,
                }
            })?);
        }
        entry.updated_at = Utc::now();
        self.store.update(entry).await
    }

    /// Enqueue the derived job immediately, leaving the schedule untouched.
    pub async fn trigger(&self, id: Uuid) -> Result<Uuid, SchedulerError> {
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))?;
        let job = self.enqueue_derived(&entry).await?;
        info!(schedule_id = %id, job_id = %job, "schedule triggered manually");
        Ok(job)
    }

    pub async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        self.store.list().await
    }

    pub async fn stats(&self) -> Result<SchedulerStats, SchedulerError> {
        let entries = self.store.list().await?;
        let mut stats = SchedulerStats {
            total: entries.len() as i64,
            ..Default::default()
        };
        for entry in &entries {
            if entry.enabled {
                stats.enabled += 1;
                stats.next_wake = match (stats.next_wake, entry.next_run) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            stats.total_runs += entry.run_count;
            stats.total_failures += entry.fail_count;
        }
        Ok(stats)
    }

    /// One evaluation pass. Returns `None` when another instance holds the
    /// lock, otherwise the number of jobs materialised.
    pub async fn tick(&self) -> Result<Option<usize>, SchedulerError> {
        if !self
            .store
            .try_lock(&self.instance_id, self.config.lock_ttl)
            .await?
        {
            debug!("scheduler lock held elsewhere, skipping tick");
            return Ok(None);
        }

        let result = self.tick_locked(Utc::now()).await;
        if let Err(e) = self.store.unlock(&self.instance_id).await {
            warn!(error = %e, "failed to release scheduler lock");
        }
        result.map(Some)
    }

    async fn tick_locked(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.store.due(now).await?;
        let mut materialised = 0;

        for mut entry in due {
            let schedule = match parse_cron(&entry.cron) {
                Ok(schedule) => schedule,
                Err(e) => {
                    // A stored entry with a bad cron should be impossible;
                    // disable it rather than wedge the tick.
                    error!(schedule_id = %entry.id, error = %e, "stored cron invalid, disabling");
                    entry.enabled = false;
                    self.store.update(entry).await?;
                    continue;
                }
            };

            match self.enqueue_derived(&entry).await {
                Ok(job_id) => {
                    debug!(schedule_id = %entry.id, job_id = %job_id, "materialised scheduled job");
                    entry.run_count += 1;
                    materialised += 1;
                }
                Err(e) => {
                    warn!(schedule_id = %entry.id, error = %e, "failed to materialise schedule");
                    entry.fail_count += 1;
                }
            }

            // A failing enqueue must not stall the schedule.
            entry.last_run = Some(now);
            entry.next_run = schedule.next_after(now).ok();
            entry.updated_at = Utc::now();
            self.store.update(entry).await?;
        }

        Ok(materialised)
    }

    /// Run the tick loop until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(instance_id = %self.instance_id, "scheduler starting");
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick().await {
                Ok(Some(0)) | Ok(None) => {}
                Ok(Some(n)) => info!(materialised = n, "scheduler tick complete"),
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
        }
        info!("scheduler stopped");
    }

    async fn enqueue_derived(&self, entry: &ScheduledJob) -> Result<Uuid, SchedulerError> {
        let opts = EnqueueOptions::builder()
            .priority(entry.priority)
            .retry_max(entry.retry_max)
            .timeout_ms(entry.timeout_ms)
            .created_by(entry.created_by.clone().unwrap_or_else(|| "scheduler".into()))
            .parent_id(entry.id)
            .tags(entry.tags.clone())
            .build();
        let job = self
            .queue
            .enqueue(entry.job_type, entry.payload.clone(), opts)
            .await?;
        Ok(job.id)
    }
}

fn parse_cron(expr: &str) -> Result<CronSchedule, SchedulerError> {
    CronSchedule::parse(expr).map_err(|source| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::{JobStatus, MemoryJobQueue};

    fn scheduler() -> (Arc<Scheduler>, Arc<MemoryScheduleStore>, Arc<dyn JobQueue>) {
        let store = Arc::new(MemoryScheduleStore::new());
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let scheduler = Arc::new(Scheduler::new(store.clone(), queue.clone()));
        (scheduler, store, queue)
    }

    fn sync_schedule(cron: &str) -> CreateSchedule {
        CreateSchedule::builder()
            .name("delta sync")
            .cron(cron)
            .job_type(JobType::DataSync)
            .payload(serde_json::json!({"tables": ["incident"]}))
            .build()
    }

    #[tokio::test]
    async fn schedule_computes_future_next_run() {
        let (scheduler, _, _) = scheduler();
        let entry = scheduler.schedule(sync_schedule("*/15 * * * *")).await.unwrap();
        assert!(entry.enabled);
        assert!(entry.next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_at_creation() {
        let (scheduler, store, _) = scheduler();
        let err = scheduler.schedule(sync_schedule("1-5 * * * *")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_entry_materialises_a_pending_job() {
        let (scheduler, store, queue) = scheduler();
        let entry = scheduler.schedule(sync_schedule("*/15 * * * *")).await.unwrap();

        // Force the entry due.
        let mut due = store.get(entry.id).await.unwrap().unwrap();
        due.next_run = Some(Utc::now() - chrono::Duration::minutes(1));
        store.update(due).await.unwrap();

        let materialised = scheduler.tick().await.unwrap();
        assert_eq!(materialised, Some(1));

        let (jobs, total) = queue.list(Some(JobStatus::Pending), 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(jobs[0].job_type, JobType::DataSync);
        assert_eq!(jobs[0].payload["tables"][0], "incident");
        assert_eq!(jobs[0].parent_id, Some(entry.id));

        let after = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(after.run_count, 1);
        assert!(after.last_run.is_some());
        assert!(after.next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn lock_holder_excludes_other_instances() {
        let (scheduler, store, queue) = scheduler();
        let entry = scheduler.schedule(sync_schedule("*/5 * * * *")).await.unwrap();
        let mut due = store.get(entry.id).await.unwrap().unwrap();
        due.next_run = Some(Utc::now() - chrono::Duration::minutes(1));
        store.update(due).await.unwrap();

        // Another instance holds the lock: this tick must do nothing.
        assert!(store.try_lock("rival", Duration::from_secs(30)).await.unwrap());
        assert_eq!(scheduler.tick().await.unwrap(), None);
        let (_, total) = queue.list(None, 10, 0).await.unwrap();
        assert_eq!(total, 0);

        // Lock released: the tick materialises.
        store.unlock("rival").await.unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn expired_lock_can_be_stolen() {
        let store = MemoryScheduleStore::new();
        assert!(store.try_lock("a", Duration::from_millis(0)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.try_lock("b", Duration::from_secs(30)).await.unwrap());
        // And not re-stealable while fresh.
        assert!(!store.try_lock("a", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn cron_update_recomputes_next_run() {
        let (scheduler, _, _) = scheduler();
        let entry = scheduler.schedule(sync_schedule("*/15 * * * *")).await.unwrap();
        let before = entry.next_run.unwrap();

        let updated = scheduler
            .update(
                entry.id,
                ScheduleUpdate {
                    cron: Some("0 0 * * *".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.cron, "0 0 * * *");
        assert!(updated.next_run.unwrap() > Utc::now());
        assert_ne!(updated.next_run.unwrap(), before);

        // Invalid update is rejected and leaves the entry unchanged.
        let err = scheduler
            .update(
                entry.id,
                ScheduleUpdate {
                    cron: Some("nope".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[tokio::test]
    async fn enable_recomputes_next_run() {
        let (scheduler, store, _) = scheduler();
        let entry = scheduler.schedule(sync_schedule("*/15 * * * *")).await.unwrap();

        scheduler.set_enabled(entry.id, false).await.unwrap();
        // Stale next_run while disabled is fine; re-enabling must refresh it.
        let mut disabled = store.get(entry.id).await.unwrap().unwrap();
        disabled.next_run = Some(Utc::now() - chrono::Duration::hours(1));
        store.update(disabled).await.unwrap();

        let enabled = scheduler.set_enabled(entry.id, true).await.unwrap();
        assert!(enabled.next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn trigger_enqueues_without_advancing_schedule() {
        let (scheduler, store, queue) = scheduler();
        let entry = scheduler.schedule(sync_schedule("0 3 * * *")).await.unwrap();

        let job_id = scheduler.trigger(entry.id).await.unwrap();
        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, JobType::DataSync);

        let after = store.get(entry.id).await.unwrap().unwrap();
        assert_eq!(after.run_count, 0);
        assert_eq!(after.next_run, entry.next_run);
    }

    #[tokio::test]
    async fn stats_aggregate_counts() {
        let (scheduler, _, _) = scheduler();
        scheduler.schedule(sync_schedule("*/15 * * * *")).await.unwrap();
        let b = scheduler.schedule(sync_schedule("0 0 * * *")).await.unwrap();
        scheduler.set_enabled(b.id, false).await.unwrap();

        let stats = scheduler.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert!(stats.next_wake.is_some());
    }
}
