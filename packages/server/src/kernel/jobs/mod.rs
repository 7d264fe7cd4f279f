//! Background task engine: durable queue, typed registry, worker pool.

pub mod events;
pub mod job;
pub mod memory;
pub mod postgres;
pub mod queue;
pub mod registry;
pub mod worker;

pub use events::{QueueEvent, QueueEvents};
pub use job::{
    classify_error, claim_score, ErrorKind, Job, JobErrorRecord, JobPriority, JobStatus, JobType,
};
pub use memory::MemoryJobQueue;
pub use postgres::PostgresJobQueue;
pub use queue::{EnqueueOptions, JobQueue, JobUpdate, QueueError, QueueStats};
pub use registry::{JobContext, JobRegistry, SharedJobRegistry};
pub use worker::{retry_backoff, CancelRegistry, WorkerPool, WorkerPoolConfig};
