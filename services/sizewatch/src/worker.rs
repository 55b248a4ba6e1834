// Worker pools that long-poll a bus queue and dispatch batches to a handler.
// Each delivery is acked or left in flight individually; anything left in
// flight reappears after the queue's visibility timeout. A worker that sees
// shutdown after handling a batch releases what it left in flight.
use async_trait::async_trait;
use sizewatch_bus::{Delivery, Queue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What to do with one delivery after its batch was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with it, successfully or by dropping it.
    Ack,
    /// Leave in flight so the visibility timeout redelivers it.
    Retry,
}

#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Returns one disposition per delivery, in order.
    async fn handle(&self, deliveries: &[Delivery]) -> Vec<Disposition>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub receive_wait: Duration,
}

/// Apply a handler to one batch and settle every delivery. Returns the number acked.
pub async fn process_batch(queue: &Queue, handler: &dyn BatchHandler, batch: &[Delivery]) -> usize {
    let dispositions = handler.handle(batch).await;
    if dispositions.len() != batch.len() {
        tracing::error!(
            handler = handler.name(),
            deliveries = batch.len(),
            dispositions = dispositions.len(),
            "handler returned mismatched dispositions; leaving the rest for redelivery"
        );
    }
    let mut acked = 0usize;
    for (delivery, disposition) in batch.iter().zip(dispositions) {
        match disposition {
            Disposition::Ack => {
                if queue.ack(&delivery.receipt()) {
                    acked += 1;
                }
            }
            Disposition::Retry => {
                metrics::counter!("sizewatch_worker_retries_total", "handler" => handler.name())
                    .increment(1);
                tracing::debug!(
                    handler = handler.name(),
                    message_id = delivery.receipt().message_id(),
                    receive_count = delivery.receive_count(),
                    "delivery left for redelivery"
                );
            }
        }
    }
    metrics::counter!("sizewatch_worker_acked_total", "handler" => handler.name())
        .increment(acked as u64);
    acked
}

fn release_unacked(queue: &Queue, handler: &'static str, batch: &[Delivery]) {
    // Acked receipts are no longer in flight, so release skips them.
    let released = batch
        .iter()
        .filter(|delivery| queue.release(&delivery.receipt()))
        .count();
    if released > 0 {
        tracing::info!(handler, released, "released unacked deliveries on shutdown");
    }
}

/// Spawn `config.workers` tasks that consume `queue` until `shutdown` flips to true.
pub fn spawn_pool(
    queue: Arc<Queue>,
    handler: Arc<dyn BatchHandler>,
    config: PoolConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..config.workers.max(1))
        .map(|worker_id| {
            let queue = Arc::clone(&queue);
            let handler = Arc::clone(&handler);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::debug!(handler = handler.name(), worker_id, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    let batch = tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                        batch = queue.receive_batch(config.batch_size, config.receive_wait) => batch,
                    };
                    if batch.is_empty() {
                        continue;
                    }
                    process_batch(&queue, handler.as_ref(), &batch).await;
                    if *shutdown.borrow() {
                        release_unacked(&queue, handler.name(), &batch);
                        break;
                    }
                }
                tracing::debug!(handler = handler.name(), worker_id, "worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use sizewatch_bus::{Bus, QueueConfig};

    struct Scripted {
        // Payloads seen, in order.
        seen: Mutex<Vec<Bytes>>,
        retry_payload: &'static [u8],
    }

    #[async_trait]
    impl BatchHandler for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, deliveries: &[Delivery]) -> Vec<Disposition> {
            deliveries
                .iter()
                .map(|delivery| {
                    self.seen.lock().push(delivery.payload().clone());
                    if delivery.payload().as_ref() == self.retry_payload {
                        Disposition::Retry
                    } else {
                        Disposition::Ack
                    }
                })
                .collect()
        }
    }

    async fn queue_with(payloads: &[&'static [u8]], config: QueueConfig) -> Arc<Queue> {
        let bus = Bus::new();
        bus.create_topic("t").await;
        let queue = bus.subscribe("t", "q", config).await.expect("subscribe");
        for payload in payloads {
            bus.publish("t", Bytes::from_static(payload))
                .await
                .expect("publish");
        }
        queue
    }

    #[tokio::test]
    async fn process_batch_acks_only_successes() {
        let queue = queue_with(&[b"ok-1", b"bad", b"ok-2"], QueueConfig::default()).await;
        let handler = Scripted {
            seen: Mutex::new(Vec::new()),
            retry_payload: b"bad",
        };
        let batch = queue.receive_batch(10, Duration::ZERO).await;
        assert_eq!(process_batch(&queue, &handler, &batch).await, 2);
        let stats = queue.stats();
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.visible, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_redelivers_until_dead_letter_then_stops() {
        let config = QueueConfig {
            visibility_timeout: Duration::from_secs(5),
            max_receive_count: 3,
            ..QueueConfig::default()
        };
        let queue = queue_with(&[b"bad", b"good"], config).await;
        let handler = Arc::new(Scripted {
            seen: Mutex::new(Vec::new()),
            retry_payload: b"bad",
        });
        let (tx, rx) = watch::channel(false);
        let tasks = spawn_pool(
            Arc::clone(&queue),
            handler.clone(),
            PoolConfig {
                workers: 2,
                batch_size: 10,
                receive_wait: Duration::from_millis(100),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.dead_letter_len(), 1);
        let bad_attempts = handler
            .seen
            .lock()
            .iter()
            .filter(|payload| payload.as_ref() == b"bad")
            .count();
        assert_eq!(bad_attempts, 3);

        tx.send(true).expect("shutdown");
        for task in tasks {
            task.await.expect("worker join");
        }
        assert_eq!(queue.stats().in_flight, 0);
    }

    struct Slow;

    #[async_trait]
    impl BatchHandler for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn handle(&self, deliveries: &[Delivery]) -> Vec<Disposition> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            deliveries
                .iter()
                .map(|delivery| {
                    if delivery.payload().as_ref() == b"fail" {
                        Disposition::Retry
                    } else {
                        Disposition::Ack
                    }
                })
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_batch_releases_unacked_deliveries() {
        let queue = queue_with(&[b"fail", b"ok"], QueueConfig::default()).await;
        let (tx, rx) = watch::channel(false);
        let tasks = spawn_pool(
            Arc::clone(&queue),
            Arc::new(Slow),
            PoolConfig {
                workers: 1,
                batch_size: 10,
                receive_wait: Duration::from_millis(100),
            },
            rx,
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.stats().in_flight, 2);
        tx.send(true).expect("shutdown");
        for task in tasks {
            task.await.expect("worker join");
        }

        let stats = queue.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.visible, 1);
        let batch = queue.receive_batch(10, Duration::ZERO).await;
        assert_eq!(batch[0].payload().as_ref(), b"fail");
        assert_eq!(batch[0].receive_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_idle_workers() {
        let queue = queue_with(&[], QueueConfig::default()).await;
        let handler = Arc::new(Scripted {
            seen: Mutex::new(Vec::new()),
            retry_payload: b"",
        });
        let (tx, rx) = watch::channel(false);
        let tasks = spawn_pool(
            queue,
            handler,
            PoolConfig {
                workers: 3,
                batch_size: 1,
                receive_wait: Duration::from_secs(60),
            },
            rx,
        );
        tx.send(true).expect("shutdown");
        for task in tasks {
            task.await.expect("worker join");
        }
    }
}
