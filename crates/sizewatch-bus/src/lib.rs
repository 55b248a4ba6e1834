// In-process pub/sub bus with durable per-consumer-group queues.
// Every publish is copied to each queue subscribed to the topic; queues are
// acked independently so consumer groups never share a failure domain.
use ahash::RandomState;
use arc_swap::ArcSwap;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod queue;

pub use queue::{DeadLetter, Delivery, Queue, QueueConfig, QueueStats, Receipt};

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("invalid queue config: {0}")]
    InvalidQueueConfig(&'static str),
}

#[derive(Debug)]
struct TopicState {
    // Snapshot read by publish without taking the registry lock.
    queues_snapshot: ArcSwap<Vec<Arc<Queue>>>,
    // Registry mutated only on subscribe.
    queues: Mutex<Vec<Arc<Queue>>>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            queues_snapshot: ArcSwap::from_pointee(Vec::new()),
            queues: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self, topic: &str, queue_name: &str, config: QueueConfig) -> Arc<Queue> {
        let mut queues = self.queues.lock();
        if let Some(existing) = queues.iter().find(|queue| queue.name() == queue_name) {
            return Arc::clone(existing);
        }
        let queue = Arc::new(Queue::new(queue_name.to_string(), topic.to_string(), config));
        queues.push(Arc::clone(&queue));
        self.queues_snapshot.store(Arc::new(queues.clone()));
        queue
    }

    #[inline]
    fn snapshot(&self) -> Arc<Vec<Arc<Queue>>> {
        self.queues_snapshot.load_full()
    }
}

/// In-process bus for fan-out delivery.
///
/// ```
/// use bytes::Bytes;
/// use sizewatch_bus::{Bus, QueueConfig};
/// use std::time::Duration;
///
/// let bus = Bus::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     bus.create_topic("changes").await;
///     let queue = bus
///         .subscribe("changes", "tracker", QueueConfig::default())
///         .await
///         .expect("subscribe");
///     bus.publish("changes", Bytes::from_static(b"hello"))
///         .await
///         .expect("publish");
///     let batch = queue.receive_batch(10, Duration::from_millis(10)).await;
///     assert_eq!(batch[0].payload(), &Bytes::from_static(b"hello"));
///     assert!(queue.ack(&batch[0].receipt()));
/// });
/// ```
#[derive(Debug, Default)]
pub struct Bus {
    topics: RwLock<HashMap<String, Arc<TopicState>, RandomState>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic. Returns false if it already existed.
    pub async fn create_topic(&self, topic: impl Into<String>) -> bool {
        let topic = topic.into();
        let mut topics = self.topics.write().await;
        if topics.contains_key(&topic) {
            return false;
        }
        tracing::debug!(%topic, "topic created");
        topics.insert(topic, Arc::new(TopicState::new()));
        true
    }

    /// Attach a durable queue to a topic. Subscribing an existing queue name
    /// returns the existing queue and ignores `config`.
    pub async fn subscribe(
        &self,
        topic: &str,
        queue_name: &str,
        config: QueueConfig,
    ) -> Result<Arc<Queue>> {
        config.validate()?;
        let state = self.topic_state(topic).await?;
        Ok(state.subscribe(topic, queue_name, config))
    }

    pub async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize> {
        self.publish_batch(topic, std::slice::from_ref(&payload))
            .await
    }

    /// Copy every payload to every queue on the topic.
    ///
    /// Returns the number of queue enqueues that succeeded. A full queue drops
    /// the payload for itself only.
    pub async fn publish_batch(&self, topic: &str, payloads: &[Bytes]) -> Result<usize> {
        let state = self.topic_state(topic).await?;
        let queues = state.snapshot();
        let mut delivered = 0usize;
        for queue in queues.iter() {
            for payload in payloads {
                if queue.enqueue(payload.clone()) {
                    delivered += 1;
                } else {
                    tracing::warn!(%topic, queue = queue.name(), "queue full; dropping payload");
                }
            }
        }
        metrics::counter!("sizewatch_bus_published_total", "topic" => topic.to_string())
            .increment(payloads.len() as u64);
        Ok(delivered)
    }

    pub async fn queues(&self, topic: &str) -> Result<Vec<Arc<Queue>>> {
        let state = self.topic_state(topic).await?;
        Ok(state.snapshot().as_ref().clone())
    }

    /// Every queue on every topic, sorted by (topic, queue name).
    pub async fn all_queues(&self) -> Vec<Arc<Queue>> {
        let topics = self.topics.read().await;
        let mut queues: Vec<Arc<Queue>> = topics
            .values()
            .flat_map(|state| state.snapshot().as_ref().clone())
            .collect();
        queues.sort_by(|a, b| (a.topic(), a.name()).cmp(&(b.topic(), b.name())));
        queues
    }

    async fn topic_state(&self, topic: &str) -> Result<Arc<TopicState>> {
        self.topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| BusError::TopicNotFound(topic.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn bus_with_topic(topic: &str) -> Bus {
        let bus = Bus::new();
        assert!(bus.create_topic(topic).await);
        bus
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_queue() {
        let bus = bus_with_topic("changes").await;
        let tracker = bus
            .subscribe("changes", "tracker", QueueConfig::default())
            .await
            .expect("subscribe");
        let logger = bus
            .subscribe("changes", "logger", QueueConfig::default())
            .await
            .expect("subscribe");

        let delivered = bus
            .publish("changes", Bytes::from_static(b"fanout"))
            .await
            .expect("publish");
        assert_eq!(delivered, 2);

        for queue in [&tracker, &logger] {
            let batch = queue.receive_batch(10, Duration::ZERO).await;
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].payload(), &Bytes::from_static(b"fanout"));
        }
    }

    #[tokio::test]
    async fn acking_one_queue_leaves_the_other_untouched() {
        let bus = bus_with_topic("changes").await;
        let a = bus
            .subscribe("changes", "a", QueueConfig::default())
            .await
            .expect("subscribe");
        let b = bus
            .subscribe("changes", "b", QueueConfig::default())
            .await
            .expect("subscribe");
        bus.publish("changes", Bytes::from_static(b"x"))
            .await
            .expect("publish");

        let batch = a.receive_batch(1, Duration::ZERO).await;
        assert!(a.ack(&batch[0].receipt()));
        assert_eq!(a.stats(), QueueStats::default());
        assert_eq!(b.stats().visible, 1);
    }

    #[tokio::test]
    async fn publish_without_queues_returns_zero() {
        let bus = bus_with_topic("changes").await;
        let delivered = bus
            .publish("changes", Bytes::from_static(b"nobody"))
            .await
            .expect("publish");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_errors() {
        let bus = Bus::new();
        let err = bus
            .publish("missing", Bytes::from_static(b"x"))
            .await
            .expect_err("unknown topic");
        assert!(matches!(err, BusError::TopicNotFound(t) if t == "missing"));
        assert!(
            bus.subscribe("missing", "q", QueueConfig::default())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn create_topic_is_idempotent() {
        let bus = bus_with_topic("changes").await;
        assert!(!bus.create_topic("changes").await);
        assert!(bus.create_topic("other").await);
    }

    #[tokio::test]
    async fn subscribing_same_name_returns_same_queue() {
        let bus = bus_with_topic("changes").await;
        let first = bus
            .subscribe("changes", "tracker", QueueConfig::default())
            .await
            .expect("subscribe");
        let second = bus
            .subscribe("changes", "tracker", QueueConfig::default())
            .await
            .expect("subscribe");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bus.queues("changes").await.expect("queues").len(), 1);
    }

    #[tokio::test]
    async fn invalid_queue_config_is_rejected() {
        let bus = bus_with_topic("changes").await;
        let config = QueueConfig {
            max_receive_count: 0,
            ..QueueConfig::default()
        };
        let err = bus
            .subscribe("changes", "q", config)
            .await
            .expect_err("invalid");
        assert!(matches!(err, BusError::InvalidQueueConfig(_)));
    }

    #[tokio::test]
    async fn full_queue_drops_only_for_itself() {
        let bus = bus_with_topic("changes").await;
        let small = bus
            .subscribe(
                "changes",
                "small",
                QueueConfig {
                    capacity: 1,
                    ..QueueConfig::default()
                },
            )
            .await
            .expect("subscribe");
        let large = bus
            .subscribe("changes", "large", QueueConfig::default())
            .await
            .expect("subscribe");
        let payloads = [Bytes::from_static(b"1"), Bytes::from_static(b"2")];
        let delivered = bus
            .publish_batch("changes", &payloads)
            .await
            .expect("publish");
        assert_eq!(delivered, 3);
        assert_eq!(small.stats().visible, 1);
        assert_eq!(large.stats().visible, 2);
    }

    #[tokio::test]
    async fn all_queues_lists_every_topic() {
        let bus = bus_with_topic("changes").await;
        bus.create_topic("alarm-actions").await;
        bus.subscribe("changes", "tracker", QueueConfig::default())
            .await
            .expect("subscribe");
        bus.subscribe("alarm-actions", "remediation", QueueConfig::default())
            .await
            .expect("subscribe");
        let names: Vec<(String, String)> = bus
            .all_queues()
            .await
            .iter()
            .map(|q| (q.topic().to_string(), q.name().to_string()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("alarm-actions".to_string(), "remediation".to_string()),
                ("changes".to_string(), "tracker".to_string()),
            ]
        );
    }

    #[test]
    fn bus_error_display() {
        let err = BusError::TopicNotFound("changes".into());
        assert_eq!(err.to_string(), "topic not found: changes");
        let err = BusError::InvalidQueueConfig("capacity must be positive");
        assert_eq!(
            err.to_string(),
            "invalid queue config: capacity must be positive"
        );
    }
}
