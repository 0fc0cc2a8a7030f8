use super::{Delivery, DeliveryError, EndpointHealth};
use crate::model::Record;
use tokio_util::sync::CancellationToken;

/// Dry-run backend: writes each record to the log instead of the network.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

impl LogSender {
    pub fn new() -> Self {
        Self
    }
}

impl Delivery for LogSender {
    async fn send(&self, record: &Record, _cancel: &CancellationToken) -> Result<(), DeliveryError> {
        let payload = serde_json::to_string_pretty(record)?;
        tracing::info!(
            record_id = %record.id(),
            device_id = record.device_id(),
            device_name = record.device_name(),
            device_group = record.device_group(),
            values_count = record.measurements().len(),
            payload = %payload,
            "dry run: record not sent"
        );
        Ok(())
    }

    async fn send_batch(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        for record in records {
            self.send(record, cancel).await?;
        }
        Ok(())
    }

    async fn health(&self) -> EndpointHealth {
        EndpointHealth::Healthy
    }
}
