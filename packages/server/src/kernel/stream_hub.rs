//! In-process pub/sub hub bridging producers to event-stream endpoints.
//!
//! Topic-keyed broadcast channels carrying JSON values. The hub knows
//! nothing about payload shapes; producers serialize their own types and
//! consumers (SSE handlers) forward values as-is. Lagging subscribers drop
//! messages rather than backpressure the producer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

/// Well-known topic for processor/system metric snapshots.
pub const SYSTEM_METRICS_TOPIC: &str = "system:metrics";

#[derive(Clone)]
pub struct StreamHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<serde_json::Value>>>>,
    capacity: usize,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Publish to a topic. Returns the number of subscribers that will see
    /// the value; zero subscribers is a silent no-op.
    pub async fn publish(&self, topic: &str, value: serde_json::Value) -> usize {
        let channels = self.channels.read().await;
        match channels.get(topic) {
            Some(tx) => tx.send(value).unwrap_or(0),
            None => 0,
        }
    }

    /// Subscribe to a topic, creating the channel on first use.
    pub async fn subscribe(&self, topic: &str) -> broadcast::Receiver<serde_json::Value> {
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop channels nobody listens to anymore.
    pub async fn prune(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_values() {
        let hub = StreamHub::new();
        let mut rx = hub.subscribe("ticket:abc").await;

        let value = serde_json::json!({"type": "ticket-updated", "sys_id": "abc"});
        let delivered = hub.publish("ticket:abc", value.clone()).await;

        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap(), value);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let hub = StreamHub::new();
        assert_eq!(hub.publish("nobody", serde_json::json!({})).await, 0);
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = StreamHub::new();
        let rx = hub.subscribe("short-lived").await;
        assert_eq!(hub.topic_count().await, 1);

        drop(rx);
        hub.prune().await;
        assert_eq!(hub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let hub = StreamHub::new();
        let mut rx1 = hub.subscribe(SYSTEM_METRICS_TOPIC).await;
        let mut rx2 = hub.subscribe(SYSTEM_METRICS_TOPIC).await;

        let value = serde_json::json!({"throughput_per_second": 42.0});
        assert_eq!(hub.publish(SYSTEM_METRICS_TOPIC, value.clone()).await, 2);
        assert_eq!(rx1.recv().await.unwrap(), value);
        assert_eq!(rx2.recv().await.unwrap(), value);
    }
}
