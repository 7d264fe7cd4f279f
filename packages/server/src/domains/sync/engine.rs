//! Synchronization engine: windowed delta pulls, per-record reconciliation,
//! change-event publication.
//!
//! Tables sync sequentially and batches are processed in order, so updates
//! to one sys_id within a run are strictly serialised. Every successful
//! upsert publishes a ChangeEvent; consumers are expected to tolerate
//! duplicates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::conflict::{ConflictError, ConflictResolver, Resolution};
use super::models::{
    normalized_field, parse_sys_timestamp, RelatedSlaEntry, TicketEnvelope, TicketTable,
};
use super::source::{SourceError, TicketSource};
use super::store::{StoreError, TicketStore};
use crate::kernel::changelog::{
    ChangeAction, ChangeLog, ChangeLogError, ChangeSource, NewChangeEvent,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    ChangeLog(#[from] ChangeLogError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error("upstream record has no sys_id")]
    MissingSysId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Delta,
    Full,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Lookback for delta mode.
    pub delta_hours: i64,
    /// Lookback for full mode.
    pub full_hours: i64,
    pub batch_size: u32,
    /// Pause between batches (upstream rate limits).
    pub batch_delay: Duration,
    /// Pause between tables.
    pub table_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            delta_hours: 24,
            full_hours: 168,
            batch_size: 50,
            batch_delay: Duration::from_millis(500),
            table_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub table: String,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
    pub conflicts: u64,
    pub duration_ms: u64,
    pub last_sync_time: DateTime<Utc>,
}

enum RecordOutcome {
    Created,
    Updated { conflicted: bool },
}

pub struct SyncEngine {
    source: Arc<dyn TicketSource>,
    store: Arc<dyn TicketStore>,
    change_log: Arc<dyn ChangeLog>,
    resolver: ConflictResolver,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn TicketSource>,
        store: Arc<dyn TicketStore>,
        change_log: Arc<dyn ChangeLog>,
        resolver: ConflictResolver,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            change_log,
            resolver,
            config,
        }
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Pull changed records for one table and reconcile them into the store.
    pub async fn sync_table(
        &self,
        table: TicketTable,
        mode: SyncMode,
    ) -> Result<SyncResult, SyncError> {
        let started = std::time::Instant::now();
        let lookback_hours = match mode {
            SyncMode::Delta => self.config.delta_hours,
            SyncMode::Full => self.config.full_hours,
        };
        let since = Utc::now() - chrono::Duration::hours(lookback_hours);
        let batch_size = self.config.batch_size.max(1);

        let mut result = SyncResult {
            table: table.upstream_table().to_string(),
            processed: 0,
            created: 0,
            updated: 0,
            errors: 0,
            conflicts: 0,
            duration_ms: 0,
            last_sync_time: Utc::now(),
        };

        let mut offset = 0u32;
        loop {
            let batch = self
                .source
                .fetch_updated(table, since, offset, batch_size)
                .await?;
            let batch_len = batch.len();

            for record in batch {
                result.processed += 1;
                match self.process_record(table, record).await {
                    Ok(RecordOutcome::Created) => result.created += 1,
                    Ok(RecordOutcome::Updated { conflicted }) => {
                        result.updated += 1;
                        if conflicted {
                            result.conflicts += 1;
                        }
                    }
                    Err(SyncError::Conflict(e)) => {
                        warn!(table = %table, error = %e, "conflict left pending");
                        result.conflicts += 1;
                        result.errors += 1;
                    }
                    Err(e) => {
                        warn!(table = %table, error = %e, "record sync failed");
                        result.errors += 1;
                    }
                }
            }

            if batch_len < batch_size as usize {
                break;
            }
            offset += batch_len as u32;
            tokio::time::sleep(self.config.batch_delay).await;
        }

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.last_sync_time = Utc::now();
        info!(
            table = %table,
            processed = result.processed,
            created = result.created,
            updated = result.updated,
            conflicts = result.conflicts,
            errors = result.errors,
            duration_ms = result.duration_ms,
            "table sync complete"
        );
        Ok(result)
    }

    /// Sync every tracked table sequentially, then prune resolved conflicts.
    pub async fn sync_all(&self, mode: SyncMode) -> Result<Vec<SyncResult>, SyncError> {
        let mut results = Vec::with_capacity(TicketTable::ALL.len());
        for (i, table) in TicketTable::ALL.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.table_delay).await;
            }
            results.push(self.sync_table(table, mode).await?);
        }
        let pruned = self.resolver.prune_resolved();
        if pruned > 0 {
            debug!(pruned, "pruned resolved conflicts after full cycle");
        }
        Ok(results)
    }

    /// Fetch one record by sys_id and reconcile it. Returns false when the
    /// record no longer exists upstream.
    pub async fn force_sync(&self, sys_id: &str, table: TicketTable) -> Result<bool, SyncError> {
        match self.source.fetch_record(table, sys_id).await? {
            Some(record) => {
                self.process_record(table, record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Real-time reconciliation driven by the change log. Events this
    /// engine published itself are skipped; everything else triggers a
    /// single-record refetch.
    pub async fn handle_stream_change(
        &self,
        event: &crate::kernel::changelog::ChangeEvent,
    ) -> Result<bool, SyncError> {
        if event.source == ChangeSource::SyncEngine {
            return Ok(false);
        }
        let Some(table) = TicketTable::parse(&event.topic) else {
            return Ok(false);
        };
        self.force_sync(&event.sys_id, table).await
    }

    /// Apply an operator edit: write upstream first, then reconcile the
    /// returned view locally and publish an API-sourced change event.
    pub async fn apply_local_update(
        &self,
        table: TicketTable,
        sys_id: &str,
        patch: &Value,
    ) -> Result<TicketEnvelope, SyncError> {
        let updated = self.source.push_update(table, sys_id, patch).await?;

        let mut envelope =
            TicketEnvelope::from_upstream(updated).ok_or(SyncError::MissingSysId)?;
        envelope.related_sla_entries = match self.store.get(table, sys_id).await? {
            Some(existing) => existing.related_sla_entries,
            None => sla_entries_from(&envelope.entity_payload),
        };
        self.store.upsert(table, envelope.clone()).await?;

        self.change_log
            .append(
                table.upstream_table(),
                NewChangeEvent {
                    action: ChangeAction::Updated,
                    sys_id: sys_id.to_string(),
                    changed_fields: patch.clone(),
                    source: ChangeSource::Api,
                },
            )
            .await?;
        Ok(envelope)
    }

    async fn process_record(
        &self,
        table: TicketTable,
        record: Value,
    ) -> Result<RecordOutcome, SyncError> {
        let sys_id = normalized_field(&record, "sys_id").ok_or(SyncError::MissingSysId)?;
        let stored = self.store.get(table, &sys_id).await?;

        match stored {
            None => {
                let mut envelope =
                    TicketEnvelope::from_upstream(record).ok_or(SyncError::MissingSysId)?;
                envelope.related_sla_entries = sla_entries_from(&envelope.entity_payload);
                let changed = self.critical_snapshot(&envelope.entity_payload);
                self.store.upsert(table, envelope).await?;
                self.publish(table, ChangeAction::Created, &sys_id, changed)
                    .await;
                Ok(RecordOutcome::Created)
            }
            Some(existing) => {
                let resolution =
                    self.resolver
                        .resolve(table, &sys_id, &existing.entity_payload, &record)?;
                let (winning_payload, conflicted) = match resolution {
                    Resolution::Clean => (record, false),
                    Resolution::Resolved { payload, .. } => (payload, true),
                };

                let changed = self.changed_fields(&existing.entity_payload, &winning_payload);
                let mut envelope = TicketEnvelope::from_upstream(winning_payload)
                    .ok_or(SyncError::MissingSysId)?;
                let fresh_slas = sla_entries_from(&envelope.entity_payload);
                envelope.related_sla_entries = if fresh_slas.is_empty() {
                    existing.related_sla_entries.clone()
                } else {
                    fresh_slas
                };
                self.store.upsert(table, envelope).await?;
                self.publish(table, ChangeAction::Updated, &sys_id, changed)
                    .await;
                Ok(RecordOutcome::Updated { conflicted })
            }
        }
    }

    /// Minimal diff over the critical field set.
    fn changed_fields(&self, old: &Value, new: &Value) -> Value {
        let mut diff = serde_json::Map::new();
        for field in self.resolver.critical_fields() {
            let before = normalized_field(old, field);
            let after = normalized_field(new, field);
            if before != after {
                diff.insert(field.clone(), json!(after));
            }
        }
        Value::Object(diff)
    }

    fn critical_snapshot(&self, payload: &Value) -> Value {
        let mut snapshot = serde_json::Map::new();
        for field in self.resolver.critical_fields() {
            if let Some(value) = normalized_field(payload, field) {
                snapshot.insert(field.clone(), json!(value));
            }
        }
        Value::Object(snapshot)
    }

    /// Event publication failure is logged, never fails the sync write.
    async fn publish(&self, table: TicketTable, action: ChangeAction, sys_id: &str, diff: Value) {
        let event = NewChangeEvent {
            action,
            sys_id: sys_id.to_string(),
            changed_fields: diff,
            source: ChangeSource::SyncEngine,
        };
        if let Err(e) = self.change_log.append(table.upstream_table(), event).await {
            warn!(table = %table, sys_id = %sys_id, error = %e, "change event publish failed");
        }
    }
}

/// Run the engine as a change-log consumer: API-sourced events trigger a
/// single-record refetch so operator edits reconcile in near real time.
pub fn spawn_stream_consumer(
    sync: Arc<SyncEngine>,
    change_log: Arc<dyn ChangeLog>,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let consumer = format!("sync-{}", uuid::Uuid::new_v4());
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            for table in TicketTable::ALL {
                let topic = table.upstream_table();
                let events = match change_log
                    .read(topic, "sync-engine", &consumer, 50, Duration::from_millis(500))
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(topic, error = %e, "stream consumer read failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };

                let mut acked = Vec::with_capacity(events.len());
                for event in &events {
                    match sync.handle_stream_change(event).await {
                        Ok(_) => acked.push(event.stream_offset),
                        Err(e) => {
                            // Left un-acked: redelivered on the next pass.
                            warn!(topic, sys_id = %event.sys_id, error = %e, "stream reconciliation failed");
                        }
                    }
                }
                if !acked.is_empty() {
                    if let Err(e) = change_log.ack(topic, "sync-engine", &acked).await {
                        warn!(topic, error = %e, "stream consumer ack failed");
                    }
                }
            }
        }
    })
}

/// Map embedded `task_slas` entries onto the SLA model; absent or
/// malformed entries are simply skipped.
fn sla_entries_from(payload: &Value) -> Vec<RelatedSlaEntry> {
    let Some(entries) = payload.get("task_slas").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            Some(RelatedSlaEntry {
                sys_id: normalized_field(entry, "sys_id")?,
                ticket_number: normalized_field(entry, "task").unwrap_or_default(),
                business_percentage: normalized_field(entry, "business_percentage")?
                    .parse()
                    .ok()?,
                start_time: normalized_field(entry, "start_time")
                    .as_deref()
                    .and_then(parse_sys_timestamp),
                end_time: normalized_field(entry, "end_time")
                    .as_deref()
                    .and_then(parse_sys_timestamp),
                stage: normalized_field(entry, "stage").unwrap_or_default(),
                breached: normalized_field(entry, "has_breached")
                    .map(|v| v == "true")
                    .unwrap_or(false),
                assignment_group: normalized_field(entry, "assignment_group"),
            })
        })
        .collect()
}
