use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "edge-gateway",
    version,
    about = "Polls station devices and ships their telemetry to the ingestion endpoint"
)]
pub struct Args {
    /// Station file path; overrides GATEWAY_STATION_CONFIG.
    #[arg(long)]
    pub station_config: Option<PathBuf>,
    /// Log records instead of sending them. Disables the durable queue.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}
