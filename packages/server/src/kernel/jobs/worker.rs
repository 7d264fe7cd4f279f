//! Worker pool: claims jobs, dispatches handlers, enforces timeouts,
//! retries with exponential backoff, dead-letters exhausted jobs.
//!
//! Each worker is an independent task sharing one queue handle. A per-job
//! cancellation token is registered so an API cancel reaches the running
//! handler at its next checkpoint. A per-job-type circuit breaker keeps a
//! misbehaving handler from burning through the queue: after 5 consecutive
//! failures the type is skipped at claim time for 30 s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{classify_error, ErrorKind, Job, JobErrorRecord, JobType};
use super::queue::{JobQueue, DEFAULT_RETENTION};
use super::registry::{JobContext, SharedJobRegistry};
use crate::kernel::breaker::CircuitBreaker;
use crate::kernel::deps::ServerDeps;

/// Exponential backoff before retry `retry_count`, bounded by `cap`.
pub fn retry_backoff(retry_count: i32, base: Duration, cap: Duration) -> Duration {
    let exponent = retry_count.clamp(0, 16) as u32;
    let delay = base.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(cap)
}

/// Tokens for jobs currently held by workers, keyed by job id.
///
/// Shared with the HTTP layer so `cancel` reaches in-flight handlers.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: RwLock<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: Uuid, token: CancellationToken) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id, token);
    }

    pub fn remove(&self, job_id: Uuid) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }

    /// Cancel a running job's token. Idempotent; unknown ids are a no-op.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some(token) = self
            .tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
        {
            token.cancel();
        }
    }

    pub fn running_count(&self) -> usize {
        self.tokens.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub dead_letter_enabled: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
            reap_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            retention: DEFAULT_RETENTION,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(30),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            dead_letter_enabled: true,
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    registry: SharedJobRegistry,
    deps: Arc<ServerDeps>,
    config: WorkerPoolConfig,
    breakers: Mutex<HashMap<JobType, Arc<CircuitBreaker>>>,
    cancellations: Arc<CancelRegistry>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<ServerDeps>,
        cancellations: Arc<CancelRegistry>,
    ) -> Self {
        Self::with_config(queue, registry, deps, cancellations, WorkerPoolConfig::default())
    }

    pub fn with_config(
        queue: Arc<dyn JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<ServerDeps>,
        cancellations: Arc<CancelRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            deps,
            config,
            breakers: Mutex::new(HashMap::new()),
            cancellations,
        }
    }

    fn breaker_for(&self, job_type: JobType) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .entry(job_type)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.breaker_threshold,
                    self.config.breaker_cooldown,
                ))
            })
            .clone()
    }

    /// Job types whose breaker is currently open.
    pub fn open_breaker_types(&self) -> Vec<JobType> {
        self.breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, breaker)| breaker.is_open())
            .map(|(job_type, _)| *job_type)
            .collect()
    }

    /// Run the pool until shutdown: N worker loops plus the lease reaper and
    /// the retention sweep.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_count = self.config.worker_count,
            "worker pool starting"
        );

        let mut handles = Vec::new();

        for n in 0..self.config.worker_count {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            let worker_id = format!("worker-{n}");
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }

        {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.reaper_loop(shutdown).await;
            }));
        }
        {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.cleanup_loop(shutdown).await;
            }));
        }

        futures::future::join_all(handles).await;
        info!("worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let skip = self.open_breaker_types();
            let claimed = match self.queue.claim_next(&worker_id, &skip).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to claim job");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            match claimed {
                Some(job) => self.process_job(&worker_id, job, &shutdown).await,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
        debug!(worker_id = %worker_id, "worker stopped");
    }

    async fn process_job(&self, worker_id: &str, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type;
        let cancel = shutdown.child_token();
        self.cancellations.register(job_id, cancel.clone());

        debug!(worker_id = %worker_id, job_id = %job_id, job_type = %job_type, "executing job");

        let ctx = JobContext::new(job_id, cancel.clone(), self.queue.clone());
        let timeout = if job.timeout_ms > 0 {
            Duration::from_millis(job.timeout_ms as u64)
        } else {
            Duration::from_secs(300)
        };
        let breaker = self.breaker_for(job_type);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(timeout, self.registry.execute(&job, ctx, self.deps.clone())) => {
                match result {
                    Ok(Ok(result)) => Outcome::Succeeded(result),
                    Ok(Err(e)) => Outcome::Failed(e.to_string(), classify_error(&e)),
                    Err(_) => Outcome::Failed(
                        format!("handler timed out after {} ms", timeout.as_millis()),
                        ErrorKind::Retryable,
                    ),
                }
            }
        };

        match outcome {
            Outcome::Succeeded(result) => {
                breaker.record_success();
                info!(job_id = %job_id, job_type = %job_type, "job succeeded");
                if let Err(e) = self.queue.complete(job_id, result).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job completed");
                }
            }
            Outcome::Failed(message, kind) => {
                breaker.record_failure();
                warn!(job_id = %job_id, job_type = %job_type, error = %message, "job failed");
                self.handle_failure(&job, message, kind).await;
            }
            Outcome::Cancelled => {
                // The cancel path already wrote the terminal status; the
                // in-flight operation is abandoned, not rolled back.
                info!(job_id = %job_id, job_type = %job_type, "job cancelled");
            }
        }

        self.cancellations.remove(job_id);
    }

    async fn handle_failure(&self, job: &Job, message: String, kind: ErrorKind) {
        if kind.should_retry() && job.retry_count < job.retry_max {
            let delay = retry_backoff(job.retry_count, self.config.retry_base, self.config.retry_cap);
            debug!(
                job_id = %job.id,
                retry_count = job.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling retry"
            );
            if let Err(e) = self.queue.requeue_retry(job.id, delay).await {
                error!(job_id = %job.id, error = %e, "failed to schedule retry");
            }
            return;
        }

        let record = JobErrorRecord::new(message, kind);
        if let Err(e) = self
            .queue
            .fail(job.id, record, self.config.dead_letter_enabled)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to mark job failed");
        }
    }

    async fn reaper_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reap_interval) => {}
            }
            match self.queue.reap_expired().await {
                Ok(0) => {}
                Ok(n) => warn!(recovered = n, "reaper re-enqueued expired leases"),
                Err(e) => error!(error = %e, "lease reaper failed"),
            }
        }
    }

    async fn cleanup_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.cleanup_interval) => {}
            }
            if let Err(e) = self.queue.cleanup(self.config.retention).await {
                error!(error = %e, "retention cleanup failed");
            }
        }
    }
}

enum Outcome {
    Succeeded(Option<serde_json::Value>),
    Failed(String, ErrorKind),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::kernel::jobs::job::{JobPriority, JobStatus};
    use crate::kernel::jobs::memory::MemoryJobQueue;
    use crate::kernel::jobs::queue::EnqueueOptions;
    use crate::kernel::jobs::registry::JobRegistry;
    use crate::kernel::test_deps::memory_deps;

    fn fast_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(5),
            reap_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            retry_base: Duration::from_millis(5),
            retry_cap: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn start_pool(
        queue: Arc<dyn JobQueue>,
        registry: JobRegistry,
        config: WorkerPoolConfig,
    ) -> (Arc<WorkerPool>, CancellationToken) {
        let cancellations = Arc::new(CancelRegistry::new());
        let pool = Arc::new(WorkerPool::with_config(
            queue,
            Arc::new(registry),
            memory_deps(),
            cancellations,
            config,
        ));
        let shutdown = CancellationToken::new();
        tokio::spawn(pool.clone().run(shutdown.clone()));
        (pool, shutdown)
    }

    async fn wait_for_status(
        queue: &Arc<dyn JobQueue>,
        id: Uuid,
        status: JobStatus,
    ) -> Job {
        for _ in 0..600 {
            let job = queue.get(id).await.unwrap().unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached {status:?}");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        assert_eq!(retry_backoff(0, base, cap), Duration::from_secs(1));
        assert_eq!(retry_backoff(1, base, cap), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, base, cap), Duration::from_secs(4));
        assert_eq!(retry_backoff(4, base, cap), Duration::from_secs(16));
        assert_eq!(retry_backoff(5, base, cap), Duration::from_secs(30));
        assert_eq!(retry_backoff(30, base, cap), Duration::from_secs(30));
    }

    #[test]
    fn backoff_stays_within_spec_bounds() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(30);
        for i in 0..10 {
            let delay = retry_backoff(i, base, cap);
            let bound = Duration::from_millis((1000u64 << i.min(6) as u64).min(30_000));
            assert!(delay <= bound, "retry {i}: {delay:?} > {bound:?}");
        }
    }

    #[tokio::test]
    async fn flaky_handler_retries_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_handler = attempts.clone();

        let mut registry = JobRegistry::new();
        registry.register::<serde_json::Value, _, _>(
            JobType::ParquetExport,
            move |_payload, _ctx, _deps| {
                let attempts = attempts_in_handler.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("connection reset by upstream");
                    }
                    Ok(Some(serde_json::json!({"exported": 1000, "bytes": 2_500_000})))
                }
            },
        );

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let job = queue
            .enqueue(
                JobType::ParquetExport,
                serde_json::json!({"table": "incident"}),
                EnqueueOptions::builder().retry_max(3).build(),
            )
            .await
            .unwrap();

        let (_pool, shutdown) = start_pool(queue.clone(), registry, fast_config());
        let done = wait_for_status(&queue, job.id, JobStatus::Completed).await;
        shutdown.cancel();

        assert_eq!(done.retry_count, 2);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result.as_ref().unwrap()["exported"], 1000);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_bounds_handler_invocations() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_handler = attempts.clone();

        let mut registry = JobRegistry::new();
        registry.register::<serde_json::Value, _, _>(
            JobType::DataSync,
            move |_payload, _ctx, _deps| {
                let attempts = attempts_in_handler.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("upstream timeout")
                }
            },
        );

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let job = queue
            .enqueue(
                JobType::DataSync,
                serde_json::json!({}),
                EnqueueOptions::builder().retry_max(2).build(),
            )
            .await
            .unwrap();

        let (_pool, shutdown) = start_pool(queue.clone(), registry, fast_config());
        let done = wait_for_status(&queue, job.id, JobStatus::Failed).await;
        shutdown.cancel();

        assert_eq!(attempts.load(Ordering::SeqCst), 3); // retry_max + 1
        assert_eq!(done.retry_count, 2);
        assert!(done.dead_lettered);
        assert_eq!(done.error_kind, Some(ErrorKind::Retryable));
    }

    #[tokio::test]
    async fn non_retryable_failure_skips_retries() {
        let mut registry = JobRegistry::new();
        registry.register::<serde_json::Value, _, _>(
            JobType::Report,
            |_payload, _ctx, _deps| async move { anyhow::bail!("invalid report definition") },
        );

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let job = queue
            .enqueue(
                JobType::Report,
                serde_json::json!({}),
                EnqueueOptions::builder().retry_max(3).build(),
            )
            .await
            .unwrap();

        let (_pool, shutdown) = start_pool(queue.clone(), registry, fast_config());
        let done = wait_for_status(&queue, job.id, JobStatus::Failed).await;
        shutdown.cancel();

        assert_eq!(done.retry_count, 0);
        assert_eq!(done.error_kind, Some(ErrorKind::NonRetryable));
    }

    #[tokio::test]
    async fn cancel_reaches_running_handler() {
        let mut registry = JobRegistry::new();
        registry.register::<serde_json::Value, _, _>(
            JobType::PipelineExecution,
            |_payload, ctx: JobContext, _deps| async move {
                ctx.cancel.cancelled().await;
                Ok(None)
            },
        );

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let job = queue
            .enqueue(
                JobType::PipelineExecution,
                serde_json::json!({}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let (pool, shutdown) = start_pool(queue.clone(), registry, fast_config());
        let _running = wait_for_status(&queue, job.id, JobStatus::Running).await;

        // API cancel: flip status, then signal the worker's token.
        queue.cancel(job.id, Some("operator".into())).await.unwrap();
        pool.cancellations.cancel(job.id);

        let done = wait_for_status(&queue, job.id, JobStatus::Cancelled).await;
        shutdown.cancel();
        assert_eq!(done.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn breaker_opens_after_consecutive_failures_and_skips_type() {
        let mut registry = JobRegistry::new();
        registry.register::<serde_json::Value, _, _>(
            JobType::Upload,
            |_payload, _ctx, _deps| async move { anyhow::bail!("connection refused") },
        );
        registry.register::<serde_json::Value, _, _>(
            JobType::Notify,
            |_payload, _ctx, _deps| async move { Ok(None) },
        );

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let mut failing = Vec::new();
        for _ in 0..5 {
            failing.push(
                queue
                    .enqueue(
                        JobType::Upload,
                        serde_json::json!({}),
                        EnqueueOptions::builder().retry_max(0).build(),
                    )
                    .await
                    .unwrap(),
            );
        }

        let mut config = fast_config();
        config.worker_count = 1;
        let (pool, shutdown) = start_pool(queue.clone(), registry, config);

        for job in &failing {
            wait_for_status(&queue, job.id, JobStatus::Failed).await;
        }
        assert!(pool.open_breaker_types().contains(&JobType::Upload));

        // While open: uploads stay pending, other types still run.
        let stuck = queue
            .enqueue(
                JobType::Upload,
                serde_json::json!({}),
                EnqueueOptions::builder().retry_max(0).build(),
            )
            .await
            .unwrap();
        let notify = queue
            .enqueue(JobType::Notify, serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        wait_for_status(&queue, notify.id, JobStatus::Completed).await;
        let stuck_job = queue.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck_job.status, JobStatus::Pending);

        shutdown.cancel();
    }
}
