//! Job registry: typed payload decode and dispatch per job type.
//!
//! The queue keeps payloads untyped; the registry is where the type tag
//! becomes a concrete payload struct. Handlers are async functions receiving
//! the decoded payload, a per-job context (id, cancellation, progress), and
//! the shared dependency set.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::job::{Job, JobType};
use super::queue::{JobQueue, JobUpdate};
use crate::kernel::deps::ServerDeps;

/// Per-invocation context handed to a job handler.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub cancel: CancellationToken,
    queue: Arc<dyn JobQueue>,
}

impl JobContext {
    pub fn new(job_id: Uuid, cancel: CancellationToken, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            job_id,
            cancel,
            queue,
        }
    }

    /// Report progress (0-100). Errors are logged, never fatal to the job.
    pub async fn report_progress(&self, progress: i16) {
        let update = JobUpdate {
            progress: Some(progress),
            result: None,
        };
        if let Err(e) = self.queue.update(self.job_id, update).await {
            tracing::debug!(job_id = %self.job_id, error = %e, "progress update failed");
        }
    }

    /// Cooperative cancellation checkpoint.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            JobContext,
            Arc<ServerDeps>,
        ) -> Pin<Box<dyn Future<Output = Result<Option<serde_json::Value>>> + Send>>
        + Send
        + Sync,
>;

/// Maps job types to their handlers.
///
/// Each handler decodes the payload into its typed form and returns an
/// optional result payload stored on the completed job.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobType, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type.
    ///
    /// `P` is the typed payload; decode failures are non-retryable.
    pub fn register<P, F, Fut>(&mut self, job_type: JobType, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Option<serde_json::Value>>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, ctx, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value).map_err(|e| {
                    anyhow!("malformed payload for {}: {}", job_type, e)
                })?;
                handler(payload, ctx, deps).await
            })
        });
        self.handlers.insert(job_type, boxed);
    }

    /// Execute a claimed job through its registered handler.
    pub async fn execute(
        &self,
        job: &Job,
        ctx: JobContext,
        deps: Arc<ServerDeps>,
    ) -> Result<Option<serde_json::Value>> {
        let handler = self
            .handlers
            .get(&job.job_type)
            .ok_or_else(|| anyhow!("invalid job type with no registered handler: {}", job.job_type))?;
        (handler)(job.payload.clone(), ctx, deps).await
    }

    pub fn is_registered(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn registered_types(&self) -> Vec<JobType> {
        self.handlers.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedJobRegistry = Arc<JobRegistry>;
