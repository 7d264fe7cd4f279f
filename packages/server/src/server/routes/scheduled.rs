//! Scheduled task endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{ApiEnvelope, ApiError};
use crate::kernel::scheduler::CreateSchedule;
use crate::server::app::AppState;

type ApiResult = Result<Json<ApiEnvelope<Value>>, ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(ApiEnvelope::ok(data)))
}

pub async fn list(State(state): State<AppState>) -> ApiResult {
    let schedules = state.deps.scheduler.list().await?;
    let stats = state.deps.scheduler.stats().await?;
    ok(json!({"scheduled": schedules, "stats": stats}))
}

pub async fn create(State(state): State<AppState>, Json(body): Json<Value>) -> ApiResult {
    let input: CreateSchedule = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid schedule: {e}")))?;
    let entry = state.deps.scheduler.schedule(input).await?;
    ok(json!({"scheduled": entry}))
}

pub async fn remove(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let removed = state.deps.scheduler.unschedule(id).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("scheduled job not found: {id}")));
    }
    ok(json!({"removed": true, "id": id}))
}

pub async fn trigger(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let job_id = state.deps.scheduler.trigger(id).await?;
    ok(json!({"job_id": job_id}))
}

#[derive(Debug, Deserialize)]
struct EnableRequest {
    enabled: bool,
}

pub async fn enable(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<Value>,
) -> ApiResult {
    let request: EnableRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid request: {e}")))?;
    let entry = state.deps.scheduler.set_enabled(id, request.enabled).await?;
    ok(json!({"scheduled": entry}))
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
    async fn create_list_and_remove() {
        let state = state();
        let created = create(
            State(state.clone()),
            Json(json!({
                "name": "nightly sync",
                "cron": "0 3 * * *",
                "job_type": "data-sync",
                "payload": {"tables": ["incident"]}
            })),
        )
        .await
        .unwrap();
        let id: Uuid = serde_json::from_value(
            created.0.data.as_ref().unwrap()["scheduled"]["id"].clone(),
        )
        .unwrap();

        let listed = list(State(state.clone())).await.unwrap();
        assert_eq!(listed.0.data.as_ref().unwrap()["stats"]["total"], 1);

        remove(State(state.clone()), Path(id)).await.unwrap();
        let err = remove(State(state), Path(id)).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_cron_is_a_400() {
        let state = state();
        let err = create(
            State(state),
            Json(json!({
                "name": "broken",
                "cron": "every 5 minutes",
                "job_type": "report"
            })),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn trigger_returns_a_job_id() {
        let state = state();
        let created = create(
            State(state.clone()),
            Json(json!({
                "name": "refresh",
                "cron": "*/15 * * * *",
                "job_type": "cache-refresh"
            })),
        )
        .await
        .unwrap();
        let id: Uuid = serde_json::from_value(
            created.0.data.as_ref().unwrap()["scheduled"]["id"].clone(),
        )
        .unwrap();

        let triggered = trigger(State(state.clone()), Path(id)).await.unwrap();
        let job_id: Uuid =
            serde_json::from_value(triggered.0.data.as_ref().unwrap()["job_id"].clone()).unwrap();
        assert!(state.deps.job_queue.get(job_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enable_toggles_the_entry() {
        let state = state();
        let created = create(
            State(state.clone()),
            Json(json!({
                "name": "weekly backup",
                "cron": "0 2 * * 0",
                "job_type": "backup"
            })),
        )
        .await
        .unwrap();
        let id: Uuid = serde_json::from_value(
            created.0.data.as_ref().unwrap()["scheduled"]["id"].clone(),
        )
        .unwrap();

        let disabled = enable(
            State(state),
            Path(id),
            Json(json!({"enabled": false})),
        )
        .await
        .unwrap();
        assert_eq!(
            disabled.0.data.as_ref().unwrap()["scheduled"]["enabled"],
            false
        );
    }
}
