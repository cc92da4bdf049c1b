//! Process-local topic bus.
//!
//! Carries the two coordination signals of the deploy pipeline:
//! `run_timeout.<trace_id>` (command deadline fired) and `run_started`
//! (restart callback confirmed liveness). Delivery is at-most-once per live
//! subscriber; subscribers must tolerate duplicates and drops.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const TOPIC_RUN_TIMEOUT: &str = "run_timeout";
pub const TOPIC_RUN_STARTED: &str = "run_started";

pub fn run_timeout_topic(trace_id: &str) -> String {
    format!("{TOPIC_RUN_TIMEOUT}.{trace_id}")
}

#[derive(Clone, Default)]
pub struct PubSub {
    topics: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic. Dropping the receiver unsubscribes; the dead
    /// sender is pruned on the next publish.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish a payload to all live subscribers of a topic.
    pub fn publish(&self, topic: &str, payload: Value) {
        let mut topics = self.topics.write();
        let Some(senders) = topics.get_mut(topic) else {
            return;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        if senders.is_empty() {
            topics.remove(topic);
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = PubSub::new();
        let mut rx = bus.subscribe("t");
        bus.publish("t", json!({"x": 1}));
        let got = rx.recv().await.unwrap();
        assert_eq!(got["x"], 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = PubSub::new();
        bus.publish("nobody", json!(null));
        assert_eq!(bus.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_pruned() {
        let bus = PubSub::new();
        let rx = bus.subscribe("t");
        drop(rx);
        bus.publish("t", json!(1));
        assert_eq!(bus.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_fanout_to_multiple_subscribers() {
        let bus = PubSub::new();
        let mut a = bus.subscribe("t");
        let mut b = bus.subscribe("t");
        bus.publish("t", json!("m"));
        assert_eq!(a.recv().await.unwrap(), json!("m"));
        assert_eq!(b.recv().await.unwrap(), json!("m"));
    }

    #[test]
    fn test_run_timeout_topic_format() {
        assert_eq!(run_timeout_topic("abc"), "run_timeout.abc");
    }
}
