//! Task queue endpoints.
//!
//! Long-running work responds immediately with a job id; callers poll
//! `GET /tasks/{id}` for progress and the terminal record.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{ApiEnvelope, ApiError};
use crate::kernel::jobs::{EnqueueOptions, JobPriority, JobStatus, JobType, QueueError};
use crate::server::app::AppState;

type ApiResult = Result<Json<ApiEnvelope<Value>>, ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(ApiEnvelope::ok(data)))
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("invalid request: {e}")))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);
    let (jobs, total) = state.deps.job_queue.list(query.status, limit, offset).await?;
    ok(json!({
        "tasks": jobs,
        "total": total,
        "limit": limit,
        "offset": offset,
    }))
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(rename = "type")]
    job_type: JobType,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    priority: Option<JobPriority>,
    #[serde(default)]
    retry_max: Option<i32>,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    created_by: Option<String>,
}

pub async fn create(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let request: CreateTaskRequest = decode(body)?;
    let mut opts = EnqueueOptions::builder()
        .priority(request.priority.unwrap_or_default())
        .tags(request.tags)
        .build();
    if let Some(retry_max) = request.retry_max {
        opts.retry_max = retry_max;
    }
    if let Some(timeout_ms) = request.timeout_ms {
        opts.timeout_ms = timeout_ms;
    }
    opts.created_by = request.created_by;

    let job = state
        .deps
        .job_queue
        .enqueue(
            request.job_type,
            request.payload.unwrap_or_else(|| json!({})),
            opts,
        )
        .await?;
    ok(json!({"job_id": job.id, "status": job.status}))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let job = state
        .deps
        .job_queue
        .get(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {id}")))?;
    let error_record = job.error_record();
    ok(json!({"task": job, "error": error_record}))
}

#[derive(Debug, Deserialize, Default)]
struct CancelRequest {
    #[serde(default)]
    reason: Option<String>,
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let request: CancelRequest = match body {
        Some(Json(value)) => decode(value)?,
        None => CancelRequest::default(),
    };

    let cancelled = match state.deps.job_queue.cancel(id, request.reason).await {
        Ok(cancelled) => cancelled,
        Err(QueueError::NotFound(_)) => {
            return Err(ApiError::NotFound(format!("job not found: {id}")))
        }
        Err(e) => return Err(e.into()),
    };
    // Reach any worker currently holding the job.
    state.deps.cancellations.cancel(id);

    ok(json!({"job_id": id, "cancelled": cancelled}))
}

pub async fn stats(State(state): State<AppState>) -> ApiResult {
    let stats = state.deps.job_queue.stats().await?;
    ok(serde_json::to_value(stats).map_err(|e| ApiError::Internal(e.to_string()))?)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

pub async fn history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let jobs = state.deps.job_queue.history(limit).await?;
    ok(json!({"tasks": jobs, "limit": limit}))
}

pub async fn health(State(state): State<AppState>) -> ApiResult {
    let queue = state.deps.job_queue.stats().await?;
    let scheduler = state.deps.scheduler.stats().await?;
    ok(json!({
        "status": "ok",
        "queue": queue,
        "scheduler": scheduler,
    }))
}

// ============================================================================
// High-level shortcuts
// ============================================================================

fn shortcut_opts(priority: Option<JobPriority>, created_by: &str) -> EnqueueOptions {
    EnqueueOptions::builder()
        .priority(priority.unwrap_or_default())
        .created_by(created_by.to_string())
        .build()
}

#[derive(Debug, Deserialize)]
struct ExportRequest {
    table: String,
    #[serde(default)]
    filters: Option<Value>,
    #[serde(default)]
    compression: Option<String>,
    #[serde(default)]
    priority: Option<JobPriority>,
}

pub async fn export_parquet(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let request: ExportRequest = decode(body)?;
    validate_tables(std::slice::from_ref(&request.table))?;
    let job = state
        .deps
        .job_queue
        .enqueue(
            JobType::ParquetExport,
            json!({
                "table": request.table,
                "filters": request.filters,
                "compression": request.compression,
            }),
            shortcut_opts(request.priority, "api:export"),
        )
        .await?;
    ok(json!({"job_id": job.id}))
}

#[derive(Debug, Deserialize)]
struct PipelineRequest {
    #[serde(rename = "pipelineId")]
    pipeline_id: String,
    #[serde(default)]
    tables: Option<Vec<String>>,
    #[serde(default)]
    priority: Option<JobPriority>,
}

pub async fn pipeline_execute(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let request: PipelineRequest = decode(body)?;
    if let Some(tables) = &request.tables {
        validate_tables(tables)?;
    }
    let job = state
        .deps
        .job_queue
        .enqueue(
            JobType::PipelineExecution,
            json!({
                "pipelineId": request.pipeline_id,
                "tables": request.tables,
            }),
            shortcut_opts(request.priority, "api:pipeline"),
        )
        .await?;
    ok(json!({"job_id": job.id}))
}

#[derive(Debug, Deserialize)]
struct SyncDataRequest {
    tables: Vec<String>,
    #[serde(default)]
    incremental: Option<bool>,
    #[serde(default)]
    priority: Option<JobPriority>,
}

pub async fn sync_data(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let request: SyncDataRequest = decode(body)?;
    validate_tables(&request.tables)?;
    let job = state
        .deps
        .job_queue
        .enqueue(
            JobType::DataSync,
            json!({
                "tables": request.tables,
                "incremental": request.incremental,
            }),
            shortcut_opts(request.priority, "api:sync"),
        )
        .await?;
    ok(json!({"job_id": job.id}))
}

#[derive(Debug, Deserialize)]
struct CacheRefreshRequest {
    #[serde(default)]
    keys: Option<Vec<String>>,
    #[serde(default)]
    priority: Option<JobPriority>,
}

pub async fn cache_refresh(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let request: CacheRefreshRequest = decode(body)?;
    if let Some(keys) = &request.keys {
        validate_tables(keys)?;
    }
    let job = state
        .deps
        .job_queue
        .enqueue(
            JobType::CacheRefresh,
            json!({"keys": request.keys}),
            shortcut_opts(request.priority, "api:cache"),
        )
        .await?;
    ok(json!({"job_id": job.id}))
}

fn validate_tables(names: &[String]) -> Result<(), ApiError> {
    for name in names {
        if crate::domains::sync::TicketTable::parse(name).is_none() {
            return Err(ApiError::BadRequest(format!("invalid table name: {name}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_deps::harness;

    fn state() -> AppState {
        AppState {
            deps: harness().deps,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let state = state();
        let created = create(
            State(state.clone()),
            Json(json!({"type": "data-sync", "payload": {"tables": ["incident"]}})),
        )
        .await
        .unwrap();
        let job_id: Uuid =
            serde_json::from_value(created.0.data.as_ref().unwrap()["job_id"].clone()).unwrap();

        let fetched = get_one(State(state), Path(job_id)).await.unwrap();
        assert!(fetched.0.success);
        assert_eq!(fetched.0.data.as_ref().unwrap()["task"]["status"], "pending");
    }

    #[tokio::test]
    async fn create_rejects_unknown_type() {
        let state = state();
        let err = create(State(state), Json(json!({"type": "mine-bitcoin"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn get_unknown_job_is_404() {
        let state = state();
        let err = get_one(State(state), Path(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let state = state();
        create(State(state.clone()), Json(json!({"type": "report"})))
            .await
            .unwrap();

        let listed = list(
            State(state.clone()),
            Query(ListQuery {
                status: Some(JobStatus::Pending),
                limit: None,
                offset: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(listed.0.data.as_ref().unwrap()["total"], 1);

        let empty = list(
            State(state),
            Query(ListQuery {
                status: Some(JobStatus::Running),
                limit: None,
                offset: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(empty.0.data.as_ref().unwrap()["total"], 0);
    }

    #[tokio::test]
    async fn cancel_pending_job() {
        let state = state();
        let created = create(State(state.clone()), Json(json!({"type": "backup"})))
            .await
            .unwrap();
        let job_id: Uuid =
            serde_json::from_value(created.0.data.as_ref().unwrap()["job_id"].clone()).unwrap();

        let cancelled = cancel(
            State(state),
            Path(job_id),
            Some(Json(json!({"reason": "operator"}))),
        )
        .await
        .unwrap();
        assert_eq!(cancelled.0.data.as_ref().unwrap()["cancelled"], true);
    }

    #[tokio::test]
    async fn sync_shortcut_validates_tables() {
        let state = state();
        let err = sync_data(
            State(state.clone()),
            Json(json!({"tables": ["cmdb_ci"]})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let accepted = sync_data(
            State(state),
            Json(json!({"tables": ["incident"], "priority": "high"})),
        )
        .await
        .unwrap();
        assert!(accepted.0.success);
    }
}
