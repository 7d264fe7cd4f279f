//! Append-only change log with consumer-group semantics.
//!
//! One topic per entity table. Delivery is at-least-once: reading marks
//! events pending for the group, acknowledging removes them, and a consumer
//! that crashes mid-batch gets its un-acked events again on the next read.
//! Offsets increase strictly within a topic; duplicates are the consumer's
//! problem (handlers must be idempotent).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ChangeLogError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "change_action", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "change_source", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    SyncEngine,
    Api,
}

/// A record on the log. `stream_offset` is assigned at append time.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub stream_offset: i64,
    pub id: Uuid,
    pub topic: String,
    pub action: ChangeAction,
    pub sys_id: String,
    pub changed_fields: serde_json::Value,
    pub source: ChangeSource,
    pub created_at: DateTime<Utc>,
}

/// Input to `append`; offset and timestamp are assigned by the log.
#[derive(Debug, Clone)]
pub struct NewChangeEvent {
    pub action: ChangeAction,
    pub sys_id: String,
    pub changed_fields: serde_json::Value,
    pub source: ChangeSource,
}

#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Append an event to a topic; returns its offset.
    async fn append(&self, topic: &str, event: NewChangeEvent) -> Result<i64, ChangeLogError>;

    /// Read up to `max` events for a consumer group: un-acked pending events
    /// first, then new ones. Blocks up to `block` when nothing is available.
    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<ChangeEvent>, ChangeLogError>;

    /// Acknowledge processed offsets for a group. Returns how many were
    /// still pending.
    async fn ack(&self, topic: &str, group: &str, offsets: &[i64]) -> Result<u64, ChangeLogError>;

    /// Drop a consumer group (connection teardown). Idempotent.
    async fn remove_group(&self, topic: &str, group: &str) -> Result<(), ChangeLogError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct TopicState {
    events: Vec<ChangeEvent>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: i64,
    /// offset → consumer that holds the un-acked delivery.
    pending: BTreeMap<i64, String>,
}

/// In-memory change log with the same delivery contract as the PostgreSQL
/// backend. Offsets are global across topics, strictly increasing.
#[derive(Default)]
pub struct MemoryChangeLog {
    inner: Mutex<MemoryLogInner>,
    appended: Notify,
}

#[derive(Default)]
struct MemoryLogInner {
    topics: HashMap<String, TopicState>,
    next_offset: i64,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Vec<ChangeEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let TopicState { events, groups } = inner.topics.entry(topic.to_string()).or_default();
        let group_state = groups.entry(group.to_string()).or_default();

        let mut out = Vec::new();

        // Re-deliver this consumer's un-acked events first.
        let pending_offsets: Vec<i64> = group_state
            .pending
            .iter()
            .filter(|(_, holder)| holder.as_str() == consumer)
            .map(|(offset, _)| *offset)
            .take(max)
            .collect();
        for offset in &pending_offsets {
            if let Some(event) = events.iter().find(|e| e.stream_offset == *offset) {
                out.push(event.clone());
            }
        }

        // Then new events past the group's delivery point.
        let mut last = group_state.last_delivered;
        for event in events.iter() {
            if out.len() >= max {
                break;
            }
            if event.stream_offset > last {
                group_state
                    .pending
                    .insert(event.stream_offset, consumer.to_string());
                last = event.stream_offset;
                out.push(event.clone());
            }
        }
        group_state.last_delivered = last;

        out
    }
}

#[async_trait]
impl ChangeLog for MemoryChangeLog {
    async fn append(&self, topic: &str, event: NewChangeEvent) -> Result<i64, ChangeLogError> {
        let offset = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.next_offset += 1;
            let offset = inner.next_offset;
            let state = inner.topics.entry(topic.to_string()).or_default();
            state.events.push(ChangeEvent {
                stream_offset: offset,
                id: Uuid::new_v4(),
                topic: topic.to_string(),
                action: event.action,
                sys_id: event.sys_id,
                changed_fields: event.changed_fields,
                source: event.source,
                created_at: Utc::now(),
            });
            offset
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<ChangeEvent>, ChangeLogError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let events = self.collect(topic, group, consumer, max);
            if !events.is_empty() {
                return Ok(events);
            }
            let notified = self.appended.notified();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // Wake on append or deadline, whichever first.
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, topic: &str, group: &str, offsets: &[i64]) -> Result<u64, ChangeLogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = inner.topics.get_mut(topic) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };
        let mut acked = 0;
        for offset in offsets {
            if group_state.pending.remove(offset).is_some() {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn remove_group(&self, topic: &str, group: &str) -> Result<(), ChangeLogError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = inner.topics.get_mut(topic) {
            state.groups.remove(group);
        }
        Ok(())
    }
}

// ============================================================================
// PostgreSQL implementation
// ============================================================================

const EVENT_COLUMNS: &str =
    "stream_offset, id, topic, action, sys_id, changed_fields, source, created_at";

/// Poll cadence for blocking reads.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct PostgresChangeLog {
    pool: sqlx::PgPool,
}

impl PostgresChangeLog {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    async fn read_once(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<ChangeEvent>, ChangeLogError> {
        let mut tx = self.pool.begin().await?;

        // Serialise readers of the same group on the offsets row.
        sqlx::query(
            r#"
            INSERT INTO change_log_offsets (topic, group_name)
            VALUES ($1, $2)
            ON CONFLICT (topic, group_name) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(group)
        .execute(&mut *tx)
        .await?;

        let last_delivered = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT last_delivered FROM change_log_offsets
            WHERE topic = $1 AND group_name = $2
            FOR UPDATE
            "#,
        )
        .bind(topic)
        .bind(group)
        .fetch_one(&mut *tx)
        .await?;

        let mut events = sqlx::query_as::<_, ChangeEvent>(
            r#"
            SELECT e.stream_offset, e.id, e.topic, e.action, e.sys_id,
                   e.changed_fields, e.source, e.created_at
            FROM change_events e
            JOIN change_log_pending p
              ON p.topic = e.topic AND p.stream_offset = e.stream_offset
            WHERE p.topic = $1 AND p.group_name = $2 AND p.consumer = $3
            ORDER BY e.stream_offset
            LIMIT $4
            "#,
        )
        .bind(topic)
        .bind(group)
        .bind(consumer)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await?;

        let remaining = max.saturating_sub(events.len());
        if remaining > 0 {
            let fresh = sqlx::query_as::<_, ChangeEvent>(&format!(
                r#"
                SELECT {EVENT_COLUMNS} FROM change_events
                WHERE topic = $1 AND stream_offset > $2
                ORDER BY stream_offset
                LIMIT $3
                "#
            ))
            .bind(topic)
            .bind(last_delivered)
            .bind(remaining as i64)
            .fetch_all(&mut *tx)
            .await?;

            if let Some(latest) = fresh.last() {
                sqlx::query(
                    r#"
                    UPDATE change_log_offsets SET last_delivered = $3
                    WHERE topic = $1 AND group_name = $2
                    "#,
                )
                .bind(topic)
                .bind(group)
                .bind(latest.stream_offset)
                .execute(&mut *tx)
                .await?;
            }
            for event in &fresh {
                sqlx::query(
                    r#"
                    INSERT INTO change_log_pending (topic, group_name, stream_offset, consumer)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (topic, group_name, stream_offset) DO NOTHING
                    "#,
                )
                .bind(topic)
                .bind(group)
                .bind(event.stream_offset)
                .bind(consumer)
                .execute(&mut *tx)
                .await?;
            }
            events.extend(fresh);
        }

        tx.commit().await?;
        Ok(events)
    }
}

#[async_trait]
impl ChangeLog for PostgresChangeLog {
    async fn append(&self, topic: &str, event: NewChangeEvent) -> Result<i64, ChangeLogError> {
        let offset = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO change_events (id, topic, action, sys_id, changed_fields, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING stream_offset
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(topic)
        .bind(event.action)
        .bind(&event.sys_id)
        .bind(&event.changed_fields)
        .bind(event.source)
        .fetch_one(&self.pool)
        .await?;
        Ok(offset)
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<ChangeEvent>, ChangeLogError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let events = self.read_once(topic, group, consumer, max).await?;
            if !events.is_empty() {
                return Ok(events);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(READ_POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, topic: &str, group: &str, offsets: &[i64]) -> Result<u64, ChangeLogError> {
        let acked = sqlx::query(
            r#"
            DELETE FROM change_log_pending
            WHERE topic = $1 AND group_name = $2 AND stream_offset = ANY($3)
            "#,
        )
        .bind(topic)
        .bind(group)
        .bind(offsets)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(acked)
    }

    async fn remove_group(&self, topic: &str, group: &str) -> Result<(), ChangeLogError> {
        sqlx::query("DELETE FROM change_log_pending WHERE topic = $1 AND group_name = $2")
            .bind(topic)
            .bind(group)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM change_log_offsets WHERE topic = $1 AND group_name = $2")
            .bind(topic)
            .bind(group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn update_event(sys_id: &str) -> NewChangeEvent {
        NewChangeEvent {
            action: ChangeAction::Updated,
            sys_id: sys_id.to_string(),
            changed_fields: serde_json::json!({"state": "6"}),
            source: ChangeSource::SyncEngine,
        }
    }

    #[tokio::test]
    async fn offsets_increase_strictly_within_topic() {
        let log = MemoryChangeLog::new();
        let a = log.append("incident", update_event("a")).await.unwrap();
        let b = log.append("incident", update_event("b")).await.unwrap();
        let c = log.append("incident", update_event("c")).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn read_delivers_in_order_and_ack_clears_pending() {
        let log = MemoryChangeLog::new();
        for i in 0..3 {
            log.append("incident", update_event(&format!("s{i}")))
                .await
                .unwrap();
        }

        let events = log
            .read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sys_id, "s0");
        assert_eq!(events[2].sys_id, "s2");

        let offsets: Vec<i64> = events.iter().map(|e| e.stream_offset).collect();
        assert_eq!(log.ack("incident", "g1", &offsets).await.unwrap(), 3);

        // Nothing pending, nothing new.
        let again = log
            .read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn unacked_events_are_redelivered_after_crash() {
        let log = MemoryChangeLog::new();
        for i in 0..5 {
            log.append("incident", update_event(&format!("s{i}")))
                .await
                .unwrap();
        }

        // Consumer reads five, acks two, then "crashes".
        let events = log
            .read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let acked: Vec<i64> = events[..2].iter().map(|e| e.stream_offset).collect();
        log.ack("incident", "g1", &acked).await.unwrap();

        // Restarted consumer sees exactly the three un-acked events again.
        let redelivered = log
            .read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let sys_ids: Vec<&str> = redelivered.iter().map(|e| e.sys_id.as_str()).collect();
        assert_eq!(sys_ids, vec!["s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn groups_track_independent_offsets() {
        let log = MemoryChangeLog::new();
        log.append("incident", update_event("a")).await.unwrap();

        let g1 = log
            .read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        let g2 = log
            .read("incident", "g2", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g2.len(), 1);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let log = MemoryChangeLog::new();
        log.append("incident", update_event("a")).await.unwrap();
        let events = log
            .read("change_task", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let log = Arc::new(MemoryChangeLog::new());

        let reader = {
            let log = log.clone();
            tokio::spawn(async move {
                log.read("incident", "g1", "c1", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("incident", update_event("late")).await.unwrap();

        let events = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sys_id, "late");
    }

    #[tokio::test]
    async fn remove_group_forgets_delivery_state() {
        let log = MemoryChangeLog::new();
        log.append("incident", update_event("a")).await.unwrap();
        log.read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        log.remove_group("incident", "g1").await.unwrap();

        // A fresh group with the same name starts from the beginning.
        let events = log
            .read("incident", "g1", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}
