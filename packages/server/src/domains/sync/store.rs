//! Ticket store: the sync engine is the only writer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use super::models::{TicketEnvelope, TicketTable};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn get(
        &self,
        table: TicketTable,
        sys_id: &str,
    ) -> Result<Option<TicketEnvelope>, StoreError>;

    /// Insert or overwrite by sys_id. `created_at` of an existing row is
    /// preserved and `sync_timestamp` never moves backwards.
    async fn upsert(&self, table: TicketTable, envelope: TicketEnvelope) -> Result<(), StoreError>;

    async fn count(&self, table: TicketTable) -> Result<i64, StoreError>;

    /// Most recently updated envelopes, newest first.
    async fn list_recent(
        &self,
        table: TicketTable,
        limit: i64,
    ) -> Result<Vec<TicketEnvelope>, StoreError>;

    /// Ticket counts grouped by state.
    async fn state_counts(&self, table: TicketTable) -> Result<HashMap<String, i64>, StoreError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

const ENVELOPE_COLUMNS: &str = "sys_id, number, state, priority, short_description, \
     assignment_group, entity_payload, related_sla_entries, sync_timestamp, schema_version, \
     partition_prefix, created_at, updated_at";

pub struct PostgresTicketStore {
    pool: sqlx::PgPool,
}

impl PostgresTicketStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketStore for PostgresTicketStore {
    async fn get(
        &self,
        table: TicketTable,
        sys_id: &str,
    ) -> Result<Option<TicketEnvelope>, StoreError> {
        let row = sqlx::query_as::<_, TicketEnvelope>(&format!(
            "SELECT {ENVELOPE_COLUMNS} FROM {} WHERE sys_id = $1",
            table.collection()
        ))
        .bind(sys_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert(&self, table: TicketTable, envelope: TicketEnvelope) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                sys_id, number, state, priority, short_description, assignment_group,
                entity_payload, related_sla_entries, sync_timestamp, schema_version,
                partition_prefix, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (sys_id) DO UPDATE SET
                number = EXCLUDED.number,
                state = EXCLUDED.state,
                priority = EXCLUDED.priority,
                short_description = EXCLUDED.short_description,
                assignment_group = EXCLUDED.assignment_group,
                entity_payload = EXCLUDED.entity_payload,
                related_sla_entries = EXCLUDED.related_sla_entries,
                sync_timestamp = GREATEST({0}.sync_timestamp, EXCLUDED.sync_timestamp),
                schema_version = EXCLUDED.schema_version,
                partition_prefix = EXCLUDED.partition_prefix,
                updated_at = NOW()
            "#,
            table.collection()
        ))
        .bind(&envelope.sys_id)
        .bind(&envelope.number)
        .bind(&envelope.state)
        .bind(&envelope.priority)
        .bind(&envelope.short_description)
        .bind(&envelope.assignment_group)
        .bind(&envelope.entity_payload)
        .bind(serde_json::to_value(&envelope.related_sla_entries)?)
        .bind(envelope.sync_timestamp)
        .bind(envelope.schema_version)
        .bind(&envelope.partition_prefix)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self, table: TicketTable) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {}",
            table.collection()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_recent(
        &self,
        table: TicketTable,
        limit: i64,
    ) -> Result<Vec<TicketEnvelope>, StoreError> {
        let rows = sqlx::query_as::<_, TicketEnvelope>(&format!(
            "SELECT {ENVELOPE_COLUMNS} FROM {} ORDER BY updated_at DESC LIMIT $1",
            table.collection()
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn state_counts(&self, table: TicketTable) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query_as::<_, (Option<String>, i64)>(&format!(
            "SELECT state, COUNT(*) FROM {} GROUP BY state",
            table.collection()
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(state, count)| (state.unwrap_or_else(|| "unknown".into()), count))
            .collect())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryTicketStore {
    records: Mutex<HashMap<(TicketTable, String), TicketEnvelope>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(TicketTable, String), TicketEnvelope>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn get(
        &self,
        table: TicketTable,
        sys_id: &str,
    ) -> Result<Option<TicketEnvelope>, StoreError> {
        Ok(self.lock().get(&(table, sys_id.to_string())).cloned())
    }

    async fn upsert(
        &self,
        table: TicketTable,
        mut envelope: TicketEnvelope,
    ) -> Result<(), StoreError> {
        let mut records = self.lock();
        let key = (table, envelope.sys_id.clone());
        if let Some(existing) = records.get(&key) {
            envelope.created_at = existing.created_at;
            envelope.sync_timestamp = envelope.sync_timestamp.max(existing.sync_timestamp);
        }
        records.insert(key, envelope);
        Ok(())
    }

    async fn count(&self, table: TicketTable) -> Result<i64, StoreError> {
        Ok(self.lock().keys().filter(|(t, _)| *t == table).count() as i64)
    }

    async fn list_recent(
        &self,
        table: TicketTable,
        limit: i64,
    ) -> Result<Vec<TicketEnvelope>, StoreError> {
        let mut rows: Vec<TicketEnvelope> = self
            .lock()
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, envelope)| envelope.clone())
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn state_counts(&self, table: TicketTable) -> Result<HashMap<String, i64>, StoreError> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for ((t, _), envelope) in self.lock().iter() {
            if *t == table {
                let state = envelope.state.clone().unwrap_or_else(|| "unknown".into());
                *counts.entry(state).or_default() += 1;
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(sys_id: &str, state: &str) -> TicketEnvelope {
        TicketEnvelope::from_upstream(json!({
            "sys_id": sys_id,
            "number": "INC1",
            "state": state,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = MemoryTicketStore::new();
        store
            .upsert(TicketTable::Incident, envelope("aaa", "2"))
            .await
            .unwrap();

        let fetched = store.get(TicketTable::Incident, "aaa").await.unwrap().unwrap();
        assert_eq!(fetched.state.as_deref(), Some("2"));

        // Tables are isolated.
        assert!(store.get(TicketTable::ChangeTask, "aaa").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_preserves_created_at_and_sync_monotonicity() {
        let store = MemoryTicketStore::new();
        let first = envelope("aaa", "2");
        let created_at = first.created_at;
        let first_sync = first.sync_timestamp;
        store.upsert(TicketTable::Incident, first).await.unwrap();

        let mut second = envelope("aaa", "6");
        // An envelope carrying an older sync timestamp must not move the
        // stored one backwards.
        second.sync_timestamp = first_sync - chrono::Duration::hours(1);
        store.upsert(TicketTable::Incident, second).await.unwrap();

        let stored = store.get(TicketTable::Incident, "aaa").await.unwrap().unwrap();
        assert_eq!(stored.state.as_deref(), Some("6"));
        assert_eq!(stored.created_at, created_at);
        assert!(stored.sync_timestamp >= first_sync);
    }

    #[tokio::test]
    async fn counts_and_state_groups() {
        let store = MemoryTicketStore::new();
        store.upsert(TicketTable::Incident, envelope("a", "1")).await.unwrap();
        store.upsert(TicketTable::Incident, envelope("b", "1")).await.unwrap();
        store.upsert(TicketTable::Incident, envelope("c", "6")).await.unwrap();

        assert_eq!(store.count(TicketTable::Incident).await.unwrap(), 3);
        let counts = store.state_counts(TicketTable::Incident).await.unwrap();
        assert_eq!(counts.get("1"), Some(&2));
        assert_eq!(counts.get("6"), Some(&1));
    }
}
