use anyhow::{anyhow, Result};
use clap::Parser;
use edge_gateway::cli::Args;
use edge_gateway::config::{Config, StationConfig};
use edge_gateway::delivery::retry::RetryPolicy;
use edge_gateway::delivery::{HttpSender, LogSender, Sender};
use edge_gateway::health::{self, HealthCheck, HealthState, QueueCheck, SenderCheck};
use edge_gateway::manager::{Manager, ManagerSettings};
use edge_gateway::queue::DurableQueue;
use edge_gateway::source::EnergyApiSource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_gateway=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn build_sender(config: &Config, station: &StationConfig, dry_run: bool) -> Result<Sender> {
    if dry_run {
        tracing::warn!("dry run: records will be logged, not sent");
        return Ok(Sender::Log(LogSender::new()));
    }

    let token = config
        .sender_token
        .clone()
        .ok_or_else(|| anyhow!("GATEWAY_SENDER_TOKEN is required unless --dry-run is set"))?;
    let retry = RetryPolicy::new(config.retry.max_attempts, config.retry.backoff_policy());
    let sender = HttpSender::new(
        &config.sender_url,
        &station.station_id,
        token,
        config.sender_timeout,
        retry,
    )?;
    tracing::info!(endpoint = %sender.endpoint(), "sending to ingestion endpoint");
    Ok(Sender::Http(sender))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    init_tracing()?;

    if let Some(path) = args.station_config {
        config.station_config_path = path;
    }
    let station = StationConfig::load(&config.station_config_path)?;
    tracing::info!(
        station_id = %station.station_id,
        station_name = %station.station_name,
        devices = station.devices.len(),
        "loaded station config"
    );

    let source = EnergyApiSource::new(&station.connection.base_url, station.connection_timeout())?;
    let sender = Arc::new(build_sender(&config, &station, args.dry_run)?);
    let queue = if config.queue_enabled && !args.dry_run {
        Some(DurableQueue::open(&config.queue_path).await?)
    } else {
        tracing::warn!("durable queue disabled, failed deliveries will be dropped");
        None
    };

    let cancel = CancellationToken::new();

    let mut checks: Vec<Arc<dyn HealthCheck>> = vec![Arc::new(SenderCheck::new(sender.clone()))];
    if let Some(queue) = &queue {
        checks.push(Arc::new(QueueCheck::new(
            queue.clone(),
            config.queue_degraded_threshold,
        )));
    }
    let health_handle =
        health::spawn(&config.health_bind, HealthState::new(checks), cancel.clone()).await?;

    tokio::spawn(shutdown_signal(cancel.clone()));

    let settings = ManagerSettings::new(&config, &station);
    let manager = Manager::new(&station, source, sender, queue, settings);
    let span = tracing::info_span!("station", station_id = %station.station_id);
    manager.run(cancel.clone()).instrument(span).await;

    cancel.cancel();
    health_handle.await?;
    Ok(())
}
