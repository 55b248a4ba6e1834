//! Remediation worker: deletes the single largest object of a subject.
//!
//! Invocations arrive at least once. A request whose invocation id was seen
//! within the dedupe TTL is skipped, and a delete that finds nothing is a
//! success, so redundant invocations converge on the same store state.
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sizewatch_bus::Delivery;
use sizewatch_common::ObjectInfo;
use sizewatch_storage::{EphemeralCache, ObjectStore, StorageError};
use sizewatch_wire::RemediationRequest;
use std::sync::Arc;
use std::time::Duration;

use crate::worker::{BatchHandler, Disposition};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RemediationOutcome {
    Deleted { key: String, size_bytes: u64 },
    Empty,
    AlreadyGone { key: String },
    Duplicate,
}

/// Largest object; ties go to the lexicographically smallest key.
pub fn pick_largest(objects: &[ObjectInfo]) -> Option<&ObjectInfo> {
    objects.iter().min_by(|a, b| {
        b.size_bytes
            .cmp(&a.size_bytes)
            .then_with(|| a.key.cmp(&b.key))
    })
}

pub struct Remediator {
    store: Arc<dyn ObjectStore>,
    seen: Arc<EphemeralCache>,
    dedupe_ttl: Duration,
}

impl Remediator {
    pub fn new(store: Arc<dyn ObjectStore>, seen: Arc<EphemeralCache>, dedupe_ttl: Duration) -> Self {
        Self {
            store,
            seen,
            dedupe_ttl,
        }
    }

    pub async fn remediate(
        &self,
        request: &RemediationRequest,
    ) -> Result<RemediationOutcome, StorageError> {
        let dedupe_key = request.invocation_id.map(|id| id.to_string());
        if let Some(key) = &dedupe_key
            && !self
                .seen
                .insert_if_absent(key.clone(), Bytes::new(), Some(self.dedupe_ttl))
                .await
        {
            tracing::info!(invocation_id = %key, "duplicate remediation invocation skipped");
            return Ok(RemediationOutcome::Duplicate);
        }
        if dedupe_key.is_some() {
            metrics::gauge!("sizewatch_remediation_dedupe_entries")
                .set(self.seen.len().await as f64);
        }

        let outcome = self.delete_largest(&request.subject).await;
        if outcome.is_err()
            && let Some(key) = &dedupe_key
        {
            // Forget the id so the redelivery is not mistaken for a duplicate.
            self.seen.delete(key).await;
        }
        let outcome = outcome?;
        metrics::counter!("sizewatch_remediations_total", "outcome" => outcome_label(&outcome))
            .increment(1);
        Ok(outcome)
    }

    async fn delete_largest(&self, subject: &str) -> Result<RemediationOutcome, StorageError> {
        let objects = self.store.list_all(subject).await?;
        let Some(target) = pick_largest(&objects) else {
            tracing::info!(%subject, "nothing to remediate; subject is empty");
            return Ok(RemediationOutcome::Empty);
        };
        match self.store.delete(subject, &target.key).await {
            Ok(removed) => {
                tracing::info!(
                    %subject,
                    key = %removed.key,
                    size_bytes = removed.size_bytes,
                    "deleted largest object"
                );
                Ok(RemediationOutcome::Deleted {
                    key: removed.key,
                    size_bytes: removed.size_bytes,
                })
            }
            Err(err) if err.is_not_found() => {
                tracing::info!(%subject, key = %target.key, "largest object already gone");
                Ok(RemediationOutcome::AlreadyGone {
                    key: target.key.clone(),
                })
            }
            Err(err) => Err(err),
        }
    }
}

fn outcome_label(outcome: &RemediationOutcome) -> &'static str {
    match outcome {
        RemediationOutcome::Deleted { .. } => "deleted",
        RemediationOutcome::Empty => "empty",
        RemediationOutcome::AlreadyGone { .. } => "already_gone",
        RemediationOutcome::Duplicate => "duplicate",
    }
}

#[async_trait]
impl BatchHandler for Remediator {
    fn name(&self) -> &'static str {
        "remediation"
    }

    async fn handle(&self, deliveries: &[Delivery]) -> Vec<Disposition> {
        let mut dispositions = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            let request = match RemediationRequest::decode(delivery.payload()) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(error = %err, "dropping malformed remediation request");
                    dispositions.push(Disposition::Ack);
                    continue;
                }
            };
            match self.remediate(&request).await {
                Ok(_) => dispositions.push(Disposition::Ack),
                Err(err) => {
                    tracing::warn!(
                        subject = %request.subject,
                        error = %err,
                        "remediation failed; will retry"
                    );
                    dispositions.push(Disposition::Retry);
                }
            }
        }
        dispositions
    }
}
