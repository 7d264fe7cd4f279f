//! Server-sent event streams: per-ticket updates and system metrics.
//!
//! Each ticket-updates connection gets its own fan-out task owning the
//! change-log consumer group; dropping the HTTP connection drops the
//! channel, which ends the task and tears the group down.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;

use crate::kernel::fanout::{spawn_ticket_feed, FanoutConfig};
use crate::kernel::stream_hub::SYSTEM_METRICS_TOPIC;
use crate::server::app::AppState;

fn to_sse_event(value: serde_json::Value) -> Event {
    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("message")
        .to_string();
    Event::default().event(event_type).data(value.to_string())
}

/// Long-lived per-ticket stream: `connection`, `heartbeat`, and
/// `ticket-updated` events.
pub async fn ticket_updates(
    State(state): State<AppState>,
    Path(sys_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    spawn_ticket_feed(
        state.deps.change_log.clone(),
        sys_id,
        tx,
        FanoutConfig::default(),
    );

    let stream = ReceiverStream::new(rx).map(|value| Ok(to_sse_event(value)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// System metrics stream fed by the metrics publisher.
pub async fn performance(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.deps.stream_hub.subscribe(SYSTEM_METRICS_TOPIC).await;

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(value) => Some(Ok(to_sse_event(value))),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Ok(Event::default()
            .event("lagged")
            .data(format!("{{\"skipped\":{skipped}}}")))),
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
