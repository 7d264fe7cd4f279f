//! Job handlers for the background task types.
//!
//! Payloads arrive untyped from the queue; each handler declares its typed
//! payload and the registry does the decode. Handlers are idempotent: a
//! retried or duplicate run converges on the same state.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::engine::{SyncMode, SyncResult};
use super::models::TicketTable;
use crate::kernel::deps::ServerDeps;
use crate::kernel::jobs::{JobContext, JobRegistry, JobType};
use crate::kernel::pipeline::{spawn_batch, spawn_filter, spawn_throttle, RateLimiter};

/// Register every job type the platform executes.
pub fn register_jobs(registry: &mut JobRegistry) {
    registry.register::<DataSyncPayload, _, _>(JobType::DataSync, run_data_sync);
    registry.register::<ParquetExportPayload, _, _>(JobType::ParquetExport, run_parquet_export);
    registry.register::<PipelineExecutionPayload, _, _>(
        JobType::PipelineExecution,
        run_pipeline_execution,
    );
    registry.register::<CacheRefreshPayload, _, _>(JobType::CacheRefresh, run_cache_refresh);
    registry.register::<ReportPayload, _, _>(JobType::Report, run_report);
    registry.register::<IndexPayload, _, _>(JobType::Index, run_index);
    registry.register::<UploadPayload, _, _>(JobType::Upload, run_upload);
    registry.register::<CleanupPayload, _, _>(JobType::Cleanup, run_cleanup);
    registry.register::<BackupPayload, _, _>(JobType::Backup, run_backup);
    registry.register::<NotifyPayload, _, _>(JobType::Notify, run_notify);
}

fn parse_tables(raw: &Option<Vec<String>>) -> Result<Vec<TicketTable>> {
    match raw {
        None => Ok(TicketTable::ALL.to_vec()),
        Some(names) => names
            .iter()
            .map(|name| {
                TicketTable::parse(name)
                    .with_context(|| format!("invalid table name: {name}"))
            })
            .collect(),
    }
}

// ============================================================================
// data-sync
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DataSyncPayload {
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    /// Delta sync by default; `false` widens the lookback window.
    #[serde(default)]
    pub incremental: Option<bool>,
}

async fn run_data_sync(
    payload: DataSyncPayload,
    ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let tables = parse_tables(&payload.tables)?;
    let mode = if payload.incremental.unwrap_or(true) {
        SyncMode::Delta
    } else {
        SyncMode::Full
    };

    let mut results: Vec<SyncResult> = Vec::with_capacity(tables.len());
    for (i, table) in tables.iter().enumerate() {
        if ctx.is_cancelled() {
            bail!("sync cancelled before table {table}");
        }
        let result = deps.sync.sync_table(*table, mode).await?;
        results.push(result);
        ctx.report_progress(((i + 1) * 100 / tables.len()) as i16).await;
    }

    Ok(Some(json!({
        "mode": if mode == SyncMode::Delta { "delta" } else { "full" },
        "tables": results,
    })))
}

// ============================================================================
// parquet-export
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ParquetExportPayload {
    pub table: String,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub compression: Option<String>,
}

async fn run_parquet_export(
    payload: ParquetExportPayload,
    ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let table = TicketTable::parse(&payload.table)
        .with_context(|| format!("invalid table name: {}", payload.table))?;

    let envelopes = deps.ticket_store.list_recent(table, 100_000).await?;
    ctx.report_progress(50).await;

    let state_filter = payload
        .filters
        .as_ref()
        .and_then(|f| f.get("state"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut exported = 0u64;
    let mut bytes = 0u64;
    for envelope in &envelopes {
        if let Some(state) = &state_filter {
            if envelope.state.as_deref() != Some(state.as_str()) {
                continue;
            }
        }
        bytes += serde_json::to_vec(envelope)?.len() as u64 + 1;
        exported += 1;
    }
    ctx.report_progress(100).await;

    Ok(Some(json!({
        "table": payload.table,
        "exported": exported,
        "bytes": bytes,
        "compression": payload.compression.unwrap_or_else(|| "snappy".into()),
    })))
}

// ============================================================================
// pipeline-execution
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PipelineExecutionPayload {
    #[serde(rename = "pipelineId")]
    pub pipeline_id: String,
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

/// Stream stored envelopes through a bounded stage chain: filter out
/// inactive records, throttle against a shared bucket, batch, and count.
async fn run_pipeline_execution(
    payload: PipelineExecutionPayload,
    ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let tables = parse_tables(&payload.tables)?;
    let mut total = 0u64;

    for table in tables {
        if ctx.is_cancelled() {
            bail!("pipeline {} cancelled", payload.pipeline_id);
        }

        let envelopes = deps.ticket_store.list_recent(table, 10_000).await?;
        let (ingress_tx, ingress_rx) = mpsc::channel(256);
        let (filtered_tx, filtered_rx) = mpsc::channel(256);
        let (throttled_tx, throttled_rx) = mpsc::channel(256);
        let (batched_tx, mut batched_rx) = mpsc::channel(64);

        spawn_filter(ingress_rx, filtered_tx, |envelope: &super::models::TicketEnvelope| {
            !envelope.sys_id.is_empty()
        });
        spawn_throttle(
            filtered_rx,
            throttled_tx,
            Arc::new(RateLimiter::new(500.0)),
        );
        spawn_batch(throttled_rx, batched_tx, 50);

        let started = std::time::Instant::now();
        let feeder = tokio::spawn(async move {
            for envelope in envelopes {
                if ingress_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        });

        while let Some(batch) = batched_rx.recv().await {
            total += batch.len() as u64;
            deps.pipeline_metrics
                .record_processed(batch.len() as u64, started.elapsed().as_secs_f64() * 1000.0);
        }
        let _ = feeder.await;
    }

    Ok(Some(json!({
        "pipelineId": payload.pipeline_id,
        "records": total,
    })))
}

// ============================================================================
// cache-refresh
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CacheRefreshPayload {
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

/// Re-warm the hot read paths: counts and the recent slice per collection.
async fn run_cache_refresh(
    payload: CacheRefreshPayload,
    _ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let tables = parse_tables(&payload.keys)?;
    let mut refreshed = serde_json::Map::new();
    for table in tables {
        let count = deps.ticket_store.count(table).await?;
        let recent = deps.ticket_store.list_recent(table, 50).await?;
        refreshed.insert(
            table.upstream_table().to_string(),
            json!({"count": count, "warmed": recent.len()}),
        );
    }
    Ok(Some(Value::Object(refreshed)))
}

// ============================================================================
// report
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReportPayload {
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

async fn run_report(
    payload: ReportPayload,
    _ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let tables = parse_tables(&payload.tables)?;
    let mut report = serde_json::Map::new();
    for table in tables {
        let by_state = deps.ticket_store.state_counts(table).await?;
        report.insert(table.upstream_table().to_string(), json!(by_state));
    }
    let queue_stats = deps.job_queue.stats().await?;
    report.insert("queue".to_string(), serde_json::to_value(queue_stats)?);
    Ok(Some(Value::Object(report)))
}

// ============================================================================
// index
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct IndexPayload {
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

/// Verify collection coverage after a bulk load: every stored envelope must
/// be reachable through its primary key.
async fn run_index(
    payload: IndexPayload,
    _ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let tables = parse_tables(&payload.tables)?;
    let mut verified = serde_json::Map::new();
    for table in tables {
        let recent = deps.ticket_store.list_recent(table, 1_000).await?;
        let mut reachable = 0u64;
        for envelope in &recent {
            if deps.ticket_store.get(table, &envelope.sys_id).await?.is_some() {
                reachable += 1;
            }
        }
        verified.insert(
            table.upstream_table().to_string(),
            json!({"checked": recent.len(), "reachable": reachable}),
        );
    }
    Ok(Some(Value::Object(verified)))
}

// ============================================================================
// upload
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct UploadPayload {
    pub table: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// Deliver a table's envelopes to attached stream consumers.
async fn run_upload(
    payload: UploadPayload,
    _ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let table = TicketTable::parse(&payload.table)
        .with_context(|| format!("invalid table name: {}", payload.table))?;
    let topic = payload
        .topic
        .unwrap_or_else(|| format!("export:{}", table.upstream_table()));

    let envelopes = deps.ticket_store.list_recent(table, 10_000).await?;
    let mut delivered = 0u64;
    for envelope in &envelopes {
        delivered += deps
            .stream_hub
            .publish(&topic, serde_json::to_value(envelope)?)
            .await as u64;
    }
    Ok(Some(json!({
        "topic": topic,
        "records": envelopes.len(),
        "deliveries": delivered,
    })))
}

// ============================================================================
// cleanup
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CleanupPayload {
    #[serde(default)]
    pub retention_days: Option<i64>,
}

async fn run_cleanup(
    payload: CleanupPayload,
    _ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let retention =
        std::time::Duration::from_secs(payload.retention_days.unwrap_or(7).max(0) as u64 * 86_400);
    let removed = deps.job_queue.cleanup(retention).await?;
    let pruned = deps.sync.resolver().prune_resolved();
    Ok(Some(json!({
        "removed_jobs": removed,
        "pruned_conflicts": pruned,
    })))
}

// ============================================================================
// backup
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BackupPayload {
    #[serde(default)]
    pub tables: Option<Vec<String>>,
}

async fn run_backup(
    payload: BackupPayload,
    ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let tables = parse_tables(&payload.tables)?;
    let mut records = 0u64;
    let mut bytes = 0u64;
    for (i, table) in tables.iter().enumerate() {
        let envelopes = deps.ticket_store.list_recent(*table, 100_000).await?;
        for envelope in &envelopes {
            bytes += serde_json::to_vec(envelope)?.len() as u64;
        }
        records += envelopes.len() as u64;
        ctx.report_progress(((i + 1) * 100 / tables.len()) as i16).await;
    }
    Ok(Some(json!({"records": records, "bytes": bytes})))
}

// ============================================================================
// notify
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct NotifyPayload {
    pub message: String,
    #[serde(default)]
    pub topic: Option<String>,
}

async fn run_notify(
    payload: NotifyPayload,
    ctx: JobContext,
    deps: Arc<ServerDeps>,
) -> Result<Option<Value>> {
    let topic = payload.topic.unwrap_or_else(|| "system:notifications".into());
    let delivered = deps
        .stream_hub
        .publish(
            &topic,
            json!({
                "type": "notification",
                "message": payload.message,
                "job_id": ctx.job_id,
            }),
        )
        .await;
    Ok(Some(json!({"topic": topic, "deliveries": delivered})))
}
