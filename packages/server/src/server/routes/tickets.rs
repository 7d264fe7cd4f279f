//! Ticket data endpoints backing the operational dashboards.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::common::{ApiEnvelope, ApiError};
use crate::domains::sync::TicketTable;
use crate::server::app::AppState;

type ApiResult = Result<Json<ApiEnvelope<Value>>, ApiError>;

fn ok(data: Value) -> ApiResult {
    Ok(Json(ApiEnvelope::ok(data)))
}

fn parse_table(raw: &str) -> Result<TicketTable, ApiError> {
    TicketTable::parse(raw)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid table name: {raw}")))
}

/// Full stored envelope for one ticket.
pub async fn data(
    State(state): State<AppState>,
    Path((table, sys_id)): Path<(String, String)>,
) -> ApiResult {
    let table = parse_table(&table)?;
    let envelope = state
        .deps
        .ticket_store
        .get(table, &sys_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("ticket not found: {table}/{sys_id}")))?;
    ok(json!({"ticket": envelope}))
}

/// Partial ticket update: written upstream first, then reconciled locally
/// through the sync engine and published as an API-sourced change.
pub async fn update(
    State(state): State<AppState>,
    Path((table, sys_id)): Path<(String, String)>,
    Json(patch): Json<Value>,
) -> ApiResult {
    let table = parse_table(&table)?;
    if !patch.is_object() || patch.as_object().is_some_and(|m| m.is_empty()) {
        return Err(ApiError::BadRequest("patch must be a non-empty object".into()));
    }

    let envelope = state
        .deps
        .sync
        .apply_local_update(table, &sys_id, &patch)
        .await?;
    ok(json!({"ticket": envelope}))
}

/// Re-render one dashboard section from the stored envelope.
pub async fn refresh_section(
    State(state): State<AppState>,
    Path((section, table, sys_id)): Path<(String, String, String)>,
) -> ApiResult {
    let table = parse_table(&table)?;
    let envelope = state
        .deps
        .ticket_store
        .get(table, &sys_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("ticket not found: {table}/{sys_id}")))?;

    match section.as_str() {
        "details" => ok(json!({
            "section": "details",
            "fields": envelope.entity_payload,
        })),
        "slas" => ok(json!({
            "section": "slas",
            "entries": envelope.related_sla_entries,
        })),
        "metadata" => ok(json!({
            "section": "metadata",
            "sync_timestamp": envelope.sync_timestamp,
            "schema_version": envelope.schema_version,
            "partition_prefix": envelope.partition_prefix,
            "updated_at": envelope.updated_at,
        })),
        other => Err(ApiError::BadRequest(format!("unknown section: {other}"))),
    }
}
