//! Real-time fan-out: one task per client connection.
//!
//! Each connection owns its change-log consumer group, its heartbeat timer,
//! and the outbound writer. Teardown is the task ending: the consumer group
//! is removed and nothing else references the subscription. Broker errors
//! degrade the heartbeat status; they never tear the process down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domains::sync::models::TicketTable;
use crate::kernel::changelog::{ChangeEvent, ChangeLog};
use crate::kernel::deps::ServerDeps;
use crate::kernel::stream_hub::SYSTEM_METRICS_TOPIC;

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub heartbeat_interval: Duration,
    /// Total blocking budget of one read pass across all topics.
    pub read_block: Duration,
    pub read_batch: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_block: Duration::from_secs(1),
            read_batch: 100,
        }
    }
}

/// Spawn the per-connection feed for one sys_id.
///
/// Pushes a `connection` event immediately, `heartbeat` events on the
/// configured cadence, and a `ticket-updated` event for every change-log
/// record matching the sys_id. The task ends when `out` is closed.
pub fn spawn_ticket_feed(
    change_log: Arc<dyn ChangeLog>,
    sys_id: String,
    out: mpsc::Sender<Value>,
    config: FanoutConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let connection_id = Uuid::new_v4();
        let group = format!("fanout-{connection_id}");
        let consumer = connection_id.to_string();
        let topics: Vec<&'static str> = TicketTable::ALL
            .iter()
            .map(|t| t.upstream_table())
            .collect();

        debug!(connection_id = %connection_id, sys_id = %sys_id, "ticket feed connected");

        let connected = out
            .send(json!({
                "type": "connection",
                "connection_id": connection_id,
                "sys_id": sys_id,
                "timestamp": Utc::now(),
            }))
            .await;
        if connected.is_err() {
            return;
        }

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // immediate first tick
        let mut degraded = false;

        'feed: loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let sent = out
                        .send(json!({
                            "type": "heartbeat",
                            "status": if degraded { "degraded" } else { "ok" },
                            "timestamp": Utc::now(),
                        }))
                        .await;
                    if sent.is_err() {
                        break 'feed;
                    }
                }
                result = read_pass(change_log.as_ref(), &topics, &group, &consumer, &config) => {
                    match result {
                        Ok(events) => {
                            degraded = false;
                            for event in &events {
                                if event.sys_id == sys_id {
                                    let sent = out.send(ticket_updated(event)).await;
                                    if sent.is_err() {
                                        break 'feed;
                                    }
                                }
                            }
                            ack_all(change_log.as_ref(), &group, &events).await;
                        }
                        Err(e) => {
                            warn!(connection_id = %connection_id, error = %e, "change log read failed");
                            degraded = true;
                            tokio::time::sleep(config.read_block).await;
                        }
                    }
                }
            }
        }

        // Idempotent teardown: the consumer group dies with the connection.
        for topic in topics {
            if let Err(e) = change_log.remove_group(topic, &group).await {
                warn!(connection_id = %connection_id, topic, error = %e, "group teardown failed");
            }
        }
        debug!(connection_id = %connection_id, "ticket feed disconnected");
    })
}

fn ticket_updated(event: &ChangeEvent) -> Value {
    json!({
        "type": "ticket-updated",
        "sys_id": event.sys_id,
        "table": event.topic,
        "action": event.action,
        "changed_fields": event.changed_fields,
        "source": event.source,
        "offset": event.stream_offset,
        "timestamp": event.created_at,
    })
}

async fn read_pass(
    change_log: &dyn ChangeLog,
    topics: &[&'static str],
    group: &str,
    consumer: &str,
    config: &FanoutConfig,
) -> Result<Vec<ChangeEvent>, crate::kernel::changelog::ChangeLogError> {
    let per_topic = config.read_block / topics.len().max(1) as u32;
    let mut all = Vec::new();
    for topic in topics {
        let events = change_log
            .read(topic, group, consumer, config.read_batch, per_topic)
            .await?;
        all.extend(events);
    }
    Ok(all)
}

/// Acknowledge every delivered event, matching or not; this group exists
/// only for this connection.
async fn ack_all(change_log: &dyn ChangeLog, group: &str, events: &[ChangeEvent]) {
    let topics: std::collections::HashSet<&str> =
        events.iter().map(|e| e.topic.as_str()).collect();
    for topic in topics {
        let offsets: Vec<i64> = events
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| e.stream_offset)
            .collect();
        if let Err(e) = change_log.ack(topic, group, &offsets).await {
            warn!(topic, error = %e, "ack failed");
        }
    }
}

/// Publish processor/system metric snapshots to the system topic on a fixed
/// cadence.
pub fn spawn_metrics_publisher(
    deps: Arc<ServerDeps>,
    interval: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = deps.pipeline_metrics.snapshot(1_000);
            let queue = match deps.job_queue.stats().await {
                Ok(stats) => serde_json::to_value(stats).unwrap_or(Value::Null),
                Err(e) => {
                    warn!(error = %e, "queue stats unavailable for metrics feed");
                    Value::Null
                }
            };

            deps.stream_hub
                .publish(
                    SYSTEM_METRICS_TOPIC,
                    json!({
                        "type": "performance",
                        "stream": snapshot,
                        "queue": queue,
                        "timestamp": Utc::now(),
                    }),
                )
                .await;
        }
    })
}
