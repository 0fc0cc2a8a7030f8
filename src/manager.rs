use crate::config::{Config, DeviceConfig, StationConfig};
use crate::delivery::{Delivery, DeliveryError};
use crate::model::{CollectedSample, Record, StationIdentity};
use crate::queue::DurableQueue;
use crate::source::DataSource;
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub replay_interval: Duration,
    pub replay_batch_size: u32,
    pub max_age: Duration,
    pub max_concurrent_polls: usize,
}

impl ManagerSettings {
    pub fn new(config: &Config, station: &StationConfig) -> Self {
        Self {
            poll_interval: station.poll_interval(),
            poll_timeout: station.poll_timeout(),
            replay_interval: config.replay_interval,
            replay_batch_size: config.replay_batch_size,
            max_age: config.queue_max_age,
            max_concurrent_polls: config.max_concurrent_polls,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub devices: usize,
    pub failed_polls: usize,
    pub empty_samples: usize,
    pub delivered: usize,
    pub queued: usize,
    pub lost: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub fetched: usize,
    pub delivered: usize,
    pub evicted: u64,
}

/// Drives collection rounds and queue replay for one station.
pub struct Manager<S, D> {
    station: StationIdentity,
    devices: Vec<DeviceConfig>,
    source: S,
    sender: D,
    queue: Option<DurableQueue>,
    settings: ManagerSettings,
}

impl<S: DataSource, D: Delivery> Manager<S, D> {
    pub fn new(
        station: &StationConfig,
        source: S,
        sender: D,
        queue: Option<DurableQueue>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            station: station.identity(),
            devices: station.devices.clone(),
            source,
            sender,
            queue,
            settings,
        }
    }

    /// Runs both loops until `cancel` fires, then closes the source and the queue.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            devices = self.devices.len(),
            source = self.source.name(),
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            queue_enabled = self.queue.is_some(),
            "starting collection manager"
        );

        tokio::join!(self.collection_loop(&cancel), self.replay_loop(&cancel));
        self.shutdown().await;
        tracing::info!("collection manager stopped");
    }

    async fn collection_loop(&self, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let summary = self.run_round(cancel).await;
            tracing::debug!(
                devices = summary.devices,
                failed_polls = summary.failed_polls,
                empty_samples = summary.empty_samples,
                delivered = summary.delivered,
                queued = summary.queued,
                lost = summary.lost,
                "collection round finished"
            );
        }
    }

    async fn replay_loop(&self, cancel: &CancellationToken) {
        if self.queue.is_none() {
            return;
        }

        let period = self.settings.replay_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.replay_once(cancel).await;
        }
    }

    /// Polls every device, then delivers each non-empty sample, queueing the ones that fail.
    pub async fn run_round(&self, cancel: &CancellationToken) -> RoundSummary {
        let mut summary = RoundSummary {
            devices: self.devices.len(),
            ..RoundSummary::default()
        };

        let samples: Vec<Option<CollectedSample>> = stream::iter(&self.devices)
            .map(|device| self.poll(device))
            .buffer_unordered(self.settings.max_concurrent_polls.max(1))
            .collect()
            .await;

        for sample in samples {
            let Some(sample) = sample else {
                summary.failed_polls += 1;
                continue;
            };
            if sample.is_empty() {
                tracing::debug!(device_id = %sample.device_id, "skipping empty sample");
                summary.empty_samples += 1;
                continue;
            }

            let record = Record::new(&self.station, sample);
            self.deliver(record, cancel, &mut summary).await;
        }

        summary
    }

    async fn poll(&self, device: &DeviceConfig) -> Option<CollectedSample> {
        let timeout = self.settings.poll_timeout;
        match tokio::time::timeout(timeout, self.source.collect(device, timeout)).await {
            Ok(Ok(sample)) => Some(sample),
            Ok(Err(err)) => {
                tracing::error!(device_id = %device.id, error = %err, "failed to collect data");
                None
            }
            Err(_) => {
                tracing::error!(
                    device_id = %device.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "device poll timed out"
                );
                None
            }
        }
    }

    async fn deliver(&self, record: Record, cancel: &CancellationToken, summary: &mut RoundSummary) {
        // After shutdown starts, records go straight to the queue instead of the network.
        let result = if cancel.is_cancelled() {
            Err(DeliveryError::Cancelled)
        } else {
            self.sender.send(&record, cancel).await
        };

        let err = match result {
            Ok(()) => {
                tracing::debug!(device_id = record.device_id(), record_id = %record.id(), "record delivered");
                summary.delivered += 1;
                return;
            }
            Err(err) => err,
        };

        tracing::error!(device_id = record.device_id(), error = %err, "failed to send data");
        let Some(queue) = &self.queue else {
            tracing::error!(
                device_id = record.device_id(),
                record_id = %record.id(),
                "queue disabled, record dropped"
            );
            summary.lost += 1;
            return;
        };

        match queue.store(&record).await {
            Ok(()) => {
                tracing::info!(device_id = record.device_id(), record_id = %record.id(), "record queued for replay");
                summary.queued += 1;
            }
            Err(store_err) => {
                tracing::error!(
                    device_id = record.device_id(),
                    record_id = %record.id(),
                    error = %store_err,
                    "failed to queue record, data lost"
                );
                summary.lost += 1;
            }
        }
    }

    /// Redelivers the oldest queued records in order, stopping at the first failure, then evicts
    /// expired entries.
    pub async fn replay_once(&self, cancel: &CancellationToken) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        let Some(queue) = &self.queue else {
            return summary;
        };

        match queue.get_pending(self.settings.replay_batch_size).await {
            Ok(pending) => {
                summary.fetched = pending.len();
                if !pending.is_empty() {
                    tracing::info!(count = pending.len(), "replaying queued records");
                }

                let mut delivered = Vec::with_capacity(pending.len());
                for queued in &pending {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(err) = self.sender.send(&queued.record, cancel).await {
                        tracing::debug!(
                            record_id = %queued.record.id(),
                            error = %err,
                            "replay stopped at first failure"
                        );
                        break;
                    }
                    delivered.push(queued.record.id());
                }

                summary.delivered = delivered.len();
                if !delivered.is_empty() {
                    match queue.mark_sent(&delivered).await {
                        Ok(()) => tracing::info!(count = delivered.len(), "queued records delivered"),
                        Err(err) => {
                            tracing::error!(error = %err, "failed to acknowledge replayed records")
                        }
                    }
                }
            }
            Err(err) => tracing::error!(error = %err, "failed to fetch queued records"),
        }

        match queue.cleanup(self.settings.max_age).await {
            Ok(evicted) => {
                if evicted > 0 {
                    tracing::warn!(count = evicted, "evicted expired queued records");
                }
                summary.evicted = evicted;
            }
            Err(err) => tracing::error!(error = %err, "failed to evict expired records"),
        }

        summary
    }

    async fn shutdown(&self) {
        if let Err(err) = self.source.close() {
            tracing::error!(source = self.source.name(), error = %err, "failed to close data source");
        }
        if let Some(queue) = &self.queue {
            queue.close().await;
        }
    }
}
