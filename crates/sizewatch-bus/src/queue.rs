// Durable consumer queue with visibility-timeout redelivery.
//
// A received message stays in flight until acked. Once its visibility deadline
// passes it is appended back to the visible tail, so redelivery reorders.
// Messages received `max_receive_count` times move to the dead-letter list on
// their next receive.
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{BusError, Result};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;
const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    // How long a received message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
    // Receives allowed before the message is dead-lettered.
    pub max_receive_count: u32,
    // Visible plus in-flight messages; publishes beyond this are dropped for this queue.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.visibility_timeout.is_zero() {
            return Err(BusError::InvalidQueueConfig("visibility timeout must be positive"));
        }
        if self.max_receive_count == 0 {
            return Err(BusError::InvalidQueueConfig("max receive count must be at least 1"));
        }
        if self.capacity == 0 {
            return Err(BusError::InvalidQueueConfig("capacity must be positive"));
        }
        Ok(())
    }
}

/// Handle identifying one delivery attempt of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    message_id: u64,
    attempt: u32,
}

impl Receipt {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    receipt: Receipt,
    payload: Bytes,
}

impl Delivery {
    pub fn receipt(&self) -> Receipt {
        self.receipt
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// How many times this message has been received, including this delivery.
    pub fn receive_count(&self) -> u32 {
        self.receipt.attempt
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: u64,
    pub payload: Bytes,
    pub receive_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

#[derive(Debug)]
struct Message {
    id: u64,
    payload: Bytes,
    receive_count: u32,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<Message>,
    in_flight: HashMap<u64, InFlight>,
    dead_letters: Vec<DeadLetter>,
    next_id: u64,
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    topic: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    // Wakes receivers blocked in `receive_batch`.
    notify: Notify,
}

impl Queue {
    pub(crate) fn new(name: String, topic: String, config: QueueConfig) -> Self {
        Self {
            name,
            topic,
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Append a payload to the visible tail. Returns false if the queue is full.
    pub(crate) fn enqueue(&self, payload: Bytes) -> bool {
        {
            let mut state = self.state.lock();
            if state.visible.len() + state.in_flight.len() >= self.config.capacity {
                metrics::counter!("sizewatch_queue_dropped_total", "queue" => self.name.clone())
                    .increment(1);
                return false;
            }
            let id = state.next_id;
            state.next_id += 1;
            state.visible.push_back(Message {
                id,
                payload,
                receive_count: 0,
                enqueued_at: Instant::now(),
            });
        }
        metrics::counter!("sizewatch_queue_enqueued_total", "queue" => self.name.clone())
            .increment(1);
        self.notify.notify_one();
        true
    }

    /// Receive up to `max` messages, waiting at most `wait` for the first one.
    ///
    /// Returns an empty batch on timeout. Every returned delivery is hidden
    /// from other receivers until acked or until the visibility timeout
    /// elapses.
    pub async fn receive_batch(&self, max: usize, wait: Duration) -> Vec<Delivery> {
        let max = max.max(1);
        let deadline = Instant::now() + wait;
        loop {
            // Register for wakeups before looking so a publish in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_expiry) = self.take_visible(max);
            if !batch.is_empty() {
                return batch;
            }
            if Instant::now() >= deadline {
                return batch;
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn take_visible(&self, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.reclaim_expired(&mut state, now);

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut message) = state.visible.pop_front() else {
                break;
            };
            if message.receive_count >= self.config.max_receive_count {
                tracing::warn!(
                    queue = %self.name,
                    message_id = message.id,
                    receive_count = message.receive_count,
                    "retry budget exhausted; moving message to dead letters"
                );
                metrics::counter!("sizewatch_queue_dead_lettered_total", "queue" => self.name.clone())
                    .increment(1);
                state.dead_letters.push(DeadLetter {
                    message_id: message.id,
                    payload: message.payload,
                    receive_count: message.receive_count,
                });
                continue;
            }
            message.receive_count += 1;
            let receipt = Receipt {
                message_id: message.id,
                attempt: message.receive_count,
            };
            batch.push(Delivery {
                receipt,
                payload: message.payload.clone(),
            });
            state.in_flight.insert(
                message.id,
                InFlight {
                    message,
                    deadline: now + self.config.visibility_timeout,
                },
            );
        }
        let next_expiry = state.in_flight.values().map(|entry| entry.deadline).min();
        self.record_depth(&state);
        (batch, next_expiry)
    }

    fn reclaim_expired(&self, state: &mut QueueState, now: Instant) {
        let mut expired: Vec<(Instant, u64)> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, entry)| (entry.deadline, *id))
            .collect();
        if expired.is_empty() {
            return;
        }
        expired.sort_unstable();
        for (_, id) in expired {
            if let Some(entry) = state.in_flight.remove(&id) {
                state.visible.push_back(entry.message);
                metrics::counter!("sizewatch_queue_redelivered_total", "queue" => self.name.clone())
                    .increment(1);
            }
        }
    }

    /// Delete an in-flight message. Stale receipts (from an earlier attempt) are ignored.
    pub fn ack(&self, receipt: &Receipt) -> bool {
        let mut state = self.state.lock();
        let current = state
            .in_flight
            .get(&receipt.message_id)
            .map(|entry| entry.message.receive_count);
        if current != Some(receipt.attempt) {
            tracing::debug!(
                queue = %self.name,
                message_id = receipt.message_id,
                attempt = receipt.attempt,
                "ignoring stale or unknown receipt"
            );
            return false;
        }
        if let Some(entry) = state.in_flight.remove(&receipt.message_id) {
            let age = entry.message.enqueued_at.elapsed().as_secs_f64();
            metrics::histogram!("sizewatch_queue_message_age_seconds", "queue" => self.name.clone())
                .record(age);
        }
        metrics::counter!("sizewatch_queue_acked_total", "queue" => self.name.clone())
            .increment(1);
        self.record_depth(&state);
        true
    }

    /// Make an in-flight message visible again right away. The attempt that
    /// received it still counts toward `max_receive_count`.
    pub fn release(&self, receipt: &Receipt) -> bool {
        {
            let mut state = self.state.lock();
            let matches = state
                .in_flight
                .get(&receipt.message_id)
                .is_some_and(|entry| entry.message.receive_count == receipt.attempt);
            if !matches {
                return false;
            }
            if let Some(entry) = state.in_flight.remove(&receipt.message_id) {
                state.visible.push_front(entry.message);
            }
        }
        self.notify.notify_one();
        true
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    pub fn dead_letter_len(&self) -> usize {
        self.state.lock().dead_letters.len()
    }

    /// Move every dead letter back onto the visible queue with a fresh retry budget.
    pub fn redrive_dead_letters(&self) -> usize {
        let moved = {
            let mut state = self.state.lock();
            let dead = std::mem::take(&mut state.dead_letters);
            let moved = dead.len();
            let now = Instant::now();
            for letter in dead {
                state.visible.push_back(Message {
                    id: letter.message_id,
                    payload: letter.payload,
                    receive_count: 0,
                    enqueued_at: now,
                });
            }
            self.record_depth(&state);
            moved
        };
        if moved > 0 {
            tracing::info!(queue = %self.name, moved, "redrove dead letters");
            self.notify.notify_waiters();
        }
        moved
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            visible: state.visible.len(),
            in_flight: state.in_flight.len(),
            dead_letters: state.dead_letters.len(),
        }
    }

    fn record_depth(&self, state: &QueueState) {
        metrics::gauge!("sizewatch_queue_visible", "queue" => self.name.clone())
            .set(state.visible.len() as f64);
        metrics::gauge!("sizewatch_queue_in_flight", "queue" => self.name.clone())
            .set(state.in_flight.len() as f64);
        metrics::gauge!("sizewatch_queue_dead_letters", "queue" => self.name.clone())
            .set(state.dead_letters.len() as f64);
    }
}
