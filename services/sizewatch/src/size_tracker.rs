//! Size-tracking consumer.
//!
//! A batch names a set of subjects; each one is recomputed from a full listing
//! of the store and written as a new history record. Events only say *which*
//! subjects changed, never by how much, so duplicates and reordering cannot
//! skew the total.
use async_trait::async_trait;
use sizewatch_bus::Delivery;
use sizewatch_common::{Clock, HistoryRecord};
use sizewatch_storage::{HistoryStore, ObjectStore, StorageError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::worker::{BatchHandler, Disposition};

pub struct SizeTracker {
    store: Arc<dyn ObjectStore>,
    history: Arc<dyn HistoryStore>,
    clock: Arc<dyn Clock>,
}

impl SizeTracker {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        history: Arc<dyn HistoryStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            history,
            clock,
        }
    }

    /// List the subject, sum its object sizes and append a snapshot.
    pub async fn recompute(&self, subject: &str) -> Result<HistoryRecord, StorageError> {
        let objects = self.store.list_all(subject).await?;
        let size_bytes: u64 = objects.iter().map(|object| object.size_bytes).sum();
        let record = HistoryRecord {
            subject: subject.to_string(),
            ts: self.clock.now_ms(),
            size_bytes,
            object_count: objects.len() as u64,
        };
        let stored = self.history.append(record).await?;
        metrics::gauge!("sizewatch_history_size_bytes", "subject" => subject.to_string())
            .set(stored.size_bytes as f64);
        metrics::gauge!("sizewatch_history_object_count", "subject" => subject.to_string())
            .set(stored.object_count as f64);
        tracing::info!(
            subject = %stored.subject,
            ts = stored.ts,
            size_bytes = stored.size_bytes,
            object_count = stored.object_count,
            "size recomputed"
        );
        Ok(stored)
    }
}

#[async_trait]
impl BatchHandler for SizeTracker {
    fn name(&self) -> &'static str {
        "size_tracker"
    }

    async fn handle(&self, deliveries: &[Delivery]) -> Vec<Disposition> {
        // Subjects per delivery; None marks a payload that is dropped.
        let mut per_delivery: Vec<Option<BTreeSet<String>>> = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match sizewatch_wire::decode_change_events(delivery.payload()) {
                Ok(events) => {
                    per_delivery.push(Some(events.into_iter().map(|event| event.subject).collect()))
                }
                Err(err) => {
                    metrics::counter!("sizewatch_malformed_payloads_total", "handler" => self.name())
                        .increment(1);
                    tracing::warn!(
                        error = %err,
                        message_id = delivery.receipt().message_id(),
                        "dropping malformed change payload"
                    );
                    per_delivery.push(None);
                }
            }
        }

        let subjects: BTreeSet<&String> = per_delivery.iter().flatten().flatten().collect();
        let mut succeeded: BTreeMap<&str, bool> = BTreeMap::new();
        for subject in subjects {
            let ok = match self.recompute(subject).await {
                Ok(_) => true,
                Err(err) => {
                    metrics::counter!("sizewatch_recompute_failures_total").increment(1);
                    tracing::warn!(%subject, error = %err, "size recompute failed; will retry");
                    false
                }
            };
            succeeded.insert(subject.as_str(), ok);
        }

        per_delivery
            .iter()
            .map(|subjects| match subjects {
                None => Disposition::Ack,
                Some(subjects) => {
                    if subjects
                        .iter()
                        .all(|subject| succeeded.get(subject.as_str()).copied().unwrap_or(false))
                    {
                        Disposition::Ack
                    } else {
                        Disposition::Retry
                    }
                }
            })
            .collect()
    }
}
