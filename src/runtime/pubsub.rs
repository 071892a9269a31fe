/// In-process pubsub bus.
///
/// Topic-keyed broadcast channels with best-effort delivery: publishing to
/// a topic nobody subscribes to is a no-op, and a lagging subscriber drops
/// messages rather than backpressuring the publisher. Gaps are repaired by
/// historical sync, so lossiness here is acceptable.
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Channel capacity for each topic.
const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// A data event delivered to topic subscribers.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// The topics this message was published on.
    pub topics: Vec<String>,
    /// The raw payload.
    pub data: Vec<u8>,
}

/// The process-wide topic bus.
pub struct PubSub {
    topics: DashMap<String, broadcast::Sender<PubSubMessage>>,
}

impl PubSub {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    /// Subscribe to a topic, creating it if needed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<PubSubMessage> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Drop a topic's channel once its last receiver is gone.
    ///
    /// Receivers unsubscribe by being dropped; this reclaims the sender
    /// side so the topic map does not grow without bound.
    pub fn unsubscribe(&self, topic: &str) {
        self.topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0);
    }

    /// Publish a payload on a set of topics. Best-effort.
    pub fn publish(&self, data: Vec<u8>, topics: &[String]) {
        let message = PubSubMessage {
            topics: topics.to_vec(),
            data,
        };
        for topic in topics {
            if let Some(sender) = self.topics.get(topic) {
                // No subscribers is fine; the send result is ignored.
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Number of live subscribers on a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = PubSub::new();
        let mut rx = bus.subscribe("site-a/federation");

        bus.publish(b"hello".to_vec(), &["site-a/federation".to_string()]);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.data, b"hello");
        assert_eq!(message.topics, vec!["site-a/federation".to_string()]);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = PubSub::new();
        let mut rx = bus.subscribe("site-a/federation");
        let _other = bus.subscribe("site-b/federation");

        bus.publish(b"for-b".to_vec(), &["site-b/federation".to_string()]);
        bus.publish(b"for-a".to_vec(), &["site-a/federation".to_string()]);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.data, b"for-a");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = PubSub::new();
        bus.publish(b"dropped".to_vec(), &["nobody/federation".to_string()]);
        assert_eq!(bus.subscriber_count("nobody/federation"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_reclaims_empty_topics() {
        let bus = PubSub::new();
        let rx = bus.subscribe("site-a/federation");
        assert_eq!(bus.subscriber_count("site-a/federation"), 1);

        drop(rx);
        bus.unsubscribe("site-a/federation");
        assert_eq!(bus.subscriber_count("site-a/federation"), 0);
    }
}
