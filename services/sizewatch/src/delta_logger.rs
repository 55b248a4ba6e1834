// Logging consumer: one structured delta line per change event.
use async_trait::async_trait;
use sizewatch_bus::Delivery;
use sizewatch_common::{Clock, DeltaLogRecord};
use sizewatch_metrics::LogStream;
use std::sync::Arc;

use crate::worker::{BatchHandler, Disposition};

pub struct DeltaLogger {
    stream: Arc<LogStream>,
    clock: Arc<dyn Clock>,
}

impl DeltaLogger {
    pub fn new(stream: Arc<LogStream>, clock: Arc<dyn Clock>) -> Self {
        Self { stream, clock }
    }
}

#[async_trait]
impl BatchHandler for DeltaLogger {
    fn name(&self) -> &'static str {
        "delta_logger"
    }

    async fn handle(&self, deliveries: &[Delivery]) -> Vec<Disposition> {
        for delivery in deliveries {
            let events = match sizewatch_wire::decode_change_events(delivery.payload()) {
                Ok(events) => events,
                Err(err) => {
                    metrics::counter!("sizewatch_malformed_payloads_total", "handler" => self.name())
                        .increment(1);
                    tracing::warn!(
                        error = %err,
                        message_id = delivery.receipt().message_id(),
                        "dropping malformed change payload"
                    );
                    continue;
                }
            };
            for event in &events {
                let now_ms = self.clock.now_ms();
                let record = DeltaLogRecord::from_event(event, now_ms);
                let line = match sizewatch_wire::encode_delta_line(&record) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::warn!(error = %err, key = %event.key, "failed to encode delta line");
                        continue;
                    }
                };
                tracing::info!(
                    object_name = %record.object_name,
                    size_delta = record.size_delta,
                    event_name = %event.event_name,
                    "{line}"
                );
                self.stream.append(now_ms, line);
            }
        }
        // Log lines are best-effort; nothing here is worth a redelivery.
        vec![Disposition::Ack; deliveries.len()]
    }
}
