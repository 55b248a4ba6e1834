// Publishes object-store change events onto the bus.
use async_trait::async_trait;
use sizewatch_bus::Bus;
use sizewatch_common::ChangeEvent;
use sizewatch_storage::{ChangeNotifier, StorageError};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BusNotifier {
    bus: Arc<Bus>,
    topic: String,
}

impl BusNotifier {
    pub fn new(bus: Arc<Bus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl ChangeNotifier for BusNotifier {
    async fn notify(&self, events: &[ChangeEvent]) -> sizewatch_storage::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let payload = sizewatch_wire::encode_change_events(events)
            .map_err(|err| StorageError::Notify(err.to_string()))?;
        let delivered = self
            .bus
            .publish(&self.topic, payload)
            .await
            .map_err(|err| StorageError::Notify(err.to_string()))?;
        tracing::debug!(topic = %self.topic, events = events.len(), delivered, "change published");
        Ok(())
    }
}
