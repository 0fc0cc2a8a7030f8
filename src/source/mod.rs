pub mod energy_api;

pub use energy_api::EnergyApiSource;

use crate::config::DeviceConfig;
use crate::model::CollectedSample;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;

/// A protocol adapter that reads one device at a time.
///
/// `collect` may run concurrently for distinct devices. `close` is called once at shutdown and
/// must tolerate repeated calls.
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn collect(
        &self,
        device: &DeviceConfig,
        timeout: Duration,
    ) -> impl Future<Output = Result<CollectedSample>> + Send;

    fn close(&self) -> Result<()>;
}
