//! Job model for background task execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_type", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    ParquetExport,
    PipelineExecution,
    #[default]
    DataSync,
    Report,
    CacheRefresh,
    Index,
    Upload,
    Cleanup,
    Backup,
    Notify,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ParquetExport => "parquet-export",
            JobType::PipelineExecution => "pipeline-execution",
            JobType::DataSync => "data-sync",
            JobType::Report => "report",
            JobType::CacheRefresh => "cache-refresh",
            JobType::Index => "index",
            JobType::Upload => "upload",
            JobType::Cleanup => "cleanup",
            JobType::Backup => "backup",
            JobType::Notify => "notify",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Urgent,
}

impl JobPriority {
    /// Claim rank: lower ranks are claimed first.
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::Urgent => 0,
            JobPriority::Critical => 1,
            JobPriority::High => 2,
            JobPriority::Normal => 3,
            JobPriority::Low => 4,
        }
    }
}

/// Priority band width for the composite claim score. Larger than any
/// plausible epoch-millisecond value so priority always dominates and
/// enqueue time breaks ties FIFO within a priority.
pub const PRIORITY_BAND: i64 = 100_000_000_000_000;

/// Composite claim score: lowest score is claimed first.
pub fn claim_score(priority: JobPriority, enqueue_millis: i64) -> i64 {
    priority.rank() * PRIORITY_BAND + enqueue_millis
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Paused,
}

impl JobStatus {
    /// Terminal statuses are never overwritten except by explicit re-enqueue
    /// under a new id.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// Classify an error message to determine retry behavior.
///
/// Transient upstream failures (timeouts, 5xx, rate limits, connection
/// resets) are retryable; validation, authorization, and malformed payload
/// failures are not.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("invalid")
        || error_str.contains("malformed")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
        || error_str.contains("permission denied")
        || error_str.contains("authentication")
        || error_str.contains("deserialize")
        || error_str.contains("parse")
        || error_str.contains("not found")
    {
        return ErrorKind::NonRetryable;
    }

    ErrorKind::Retryable
}

// ============================================================================
// Error record
// ============================================================================

/// Snapshot of the most recent failure attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobErrorRecord {
    pub message: String,
    pub kind: ErrorKind,
    pub retryable: bool,
    pub occurred_at: DateTime<Utc>,
}

impl JobErrorRecord {
    pub fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
            retryable: kind.should_retry(),
            occurred_at: Utc::now(),
        }
    }
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub job_type: JobType,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,

    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub progress: i16,

    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub retry_max: i32,
    #[builder(default = 300_000)] // 5 minutes
    pub timeout_ms: i64,

    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default = false)]
    pub dead_lettered: bool,

    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,
    #[builder(default, setter(strip_option))]
    pub error_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    // Metadata
    #[builder(default, setter(strip_option))]
    pub created_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub parent_id: Option<Uuid>,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub estimated_duration_ms: Option<i64>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create an immediate job with defaults (convenience constructor).
    pub fn immediate(job_type: JobType, payload: serde_json::Value) -> Self {
        Self::builder().job_type(job_type).payload(payload).build()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job may still be claimed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Retrying)
            && self.run_at.map_or(true, |at| at <= now)
    }

    /// The error record shape exposed on the API, if any failure occurred.
    pub fn error_record(&self) -> Option<JobErrorRecord> {
        let message = self.error_message.clone()?;
        let kind = self.error_kind.unwrap_or_default();
        Some(JobErrorRecord {
            message,
            kind,
            retryable: kind.should_retry(),
            occurred_at: self.error_at.unwrap_or(self.updated_at),
        })
    }

    pub fn claim_score(&self) -> i64 {
        claim_score(self.priority, self.created_at.timestamp_millis())
    }
}
