//! Typed queue lifecycle events.
//!
//! Published on a broadcast channel so observers (metrics, logs, real-time
//! streams) can subscribe without the queue knowing about them. Publishing
//! never blocks a state transition; with no receivers the event is dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Added {
        job: Job,
    },
    Updated {
        job_id: Uuid,
        progress: i16,
    },
    Started {
        job_id: Uuid,
        job_type: JobType,
        worker_id: String,
        attempt: i32,
    },
    Completed {
        job_id: Uuid,
        job_type: JobType,
        duration_ms: i64,
    },
    Failed {
        job_id: Uuid,
        job_type: JobType,
        error: String,
        error_kind: ErrorKind,
        will_retry: bool,
    },
    Cancelled {
        job_id: Uuid,
        reason: Option<String>,
    },
    DeadLettered {
        job_id: Uuid,
        job_type: JobType,
        final_error: String,
    },
    LeaseRecovered {
        job_id: Uuid,
        retry_count: i32,
    },
}

/// Broadcast topic for queue lifecycle events.
#[derive(Debug, Clone)]
pub struct QueueEvents {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Send errors (no receivers) are ignored.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let events = QueueEvents::default();
        let mut rx = events.subscribe();

        events.publish(QueueEvent::Updated {
            job_id: Uuid::new_v4(),
            progress: 40,
        });

        match rx.recv().await.unwrap() {
            QueueEvent::Updated { progress, .. } => assert_eq!(progress, 40),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_does_not_block() {
        let events = QueueEvents::default();
        events.publish(QueueEvent::Cancelled {
            job_id: Uuid::new_v4(),
            reason: None,
        });
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = QueueEvent::Completed {
            job_id: Uuid::new_v4(),
            job_type: JobType::DataSync,
            duration_ms: 1500,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"completed\""));
        assert!(json.contains("1500"));
    }
}
