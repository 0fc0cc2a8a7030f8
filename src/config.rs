use crate::delivery::backoff::{BackoffPolicy, ExponentialBackoff, JitteredBackoff};
use crate::model::StationIdentity;
use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_STATION_CONFIG_PATH: &str = "config/station.json";
const DEFAULT_QUEUE_PATH: &str = "/var/lib/edge-gateway/buffer.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Exponential,
    Jittered,
}

impl BackoffKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "jittered" | "jitter" => Ok(Self::Jittered),
            other => bail!("unknown backoff policy {other:?} (expected exponential or jittered)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffKind,
    pub jitter: f64,
}

impl RetryConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let exponential = ExponentialBackoff::new(self.initial_delay, self.max_delay);
        match self.backoff {
            BackoffKind::Exponential => BackoffPolicy::Exponential(exponential),
            BackoffKind::Jittered => {
                BackoffPolicy::Jittered(JitteredBackoff::new(exponential, self.jitter))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub station_config_path: PathBuf,

    pub sender_url: Url,
    pub sender_token: Option<String>,
    pub sender_timeout: Duration,
    pub retry: RetryConfig,

    pub queue_enabled: bool,
    pub queue_path: PathBuf,
    pub queue_max_age: Duration,
    pub replay_interval: Duration,
    pub replay_batch_size: u32,

    pub max_concurrent_polls: usize,

    pub health_bind: String,
    pub queue_degraded_threshold: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let station_config_path = PathBuf::from(env_string(
            "GATEWAY_STATION_CONFIG",
            Some(DEFAULT_STATION_CONFIG_PATH.to_string()),
        )?);

        let raw_url = env_string("GATEWAY_SENDER_URL", None)?;
        let sender_url = Url::parse(&raw_url).context("invalid GATEWAY_SENDER_URL")?;
        if !matches!(sender_url.scheme(), "http" | "https") {
            bail!("GATEWAY_SENDER_URL must be http or https");
        }
        let sender_token = env_optional("GATEWAY_SENDER_TOKEN");
        let sender_timeout =
            Duration::from_millis(env_u64("GATEWAY_SENDER_TIMEOUT_MS", Some(30_000))?);

        let max_attempts = env_u64("GATEWAY_RETRY_MAX_ATTEMPTS", Some(5))?;
        if max_attempts == 0 {
            bail!("GATEWAY_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        let initial_delay =
            Duration::from_millis(env_u64("GATEWAY_RETRY_INITIAL_DELAY_MS", Some(1000))?);
        let max_delay =
            Duration::from_millis(env_u64("GATEWAY_RETRY_MAX_DELAY_MS", Some(60_000))?);
        let backoff = BackoffKind::parse(&env_string(
            "GATEWAY_RETRY_BACKOFF",
            Some("exponential".to_string()),
        )?)?;
        let jitter = env_f64("GATEWAY_RETRY_JITTER", Some(0.1))?;
        if !(0.0..=1.0).contains(&jitter) {
            bail!("GATEWAY_RETRY_JITTER must be within 0..=1");
        }

        let queue_enabled = env_bool("GATEWAY_QUEUE_ENABLED", Some(true))?;
        let queue_path = PathBuf::from(env_string(
            "GATEWAY_QUEUE_PATH",
            Some(DEFAULT_QUEUE_PATH.to_string()),
        )?);
        let queue_max_age =
            Duration::from_secs(env_u64("GATEWAY_QUEUE_MAX_AGE_SECONDS", Some(24 * 3600))?);
        let replay_interval =
            Duration::from_secs(env_u64("GATEWAY_REPLAY_INTERVAL_SECONDS", Some(30))?.max(1));
        let replay_batch_size =
            env_u64("GATEWAY_REPLAY_BATCH_SIZE", Some(100))?.clamp(1, u32::MAX as u64) as u32;

        let max_concurrent_polls =
            env_u64("GATEWAY_MAX_CONCURRENT_POLLS", Some(16))?.max(1) as usize;

        let health_bind = env_string("GATEWAY_HEALTH_BIND", Some("0.0.0.0:8080".to_string()))?;
        let queue_degraded_threshold =
            env_u64("GATEWAY_QUEUE_DEGRADED_THRESHOLD", Some(1000))?;

        Ok(Self {
            station_config_path,
            sender_url,
            sender_token,
            sender_timeout,
            retry: RetryConfig {
                max_attempts: max_attempts.min(u32::MAX as u64) as u32,
                initial_delay,
                max_delay,
                backoff,
                jitter,
            },
            queue_enabled,
            queue_path,
            queue_max_age,
            replay_interval,
            replay_batch_size,
            max_concurrent_polls,
            health_bind,
            queue_degraded_threshold,
        })
    }
}

/// Per-station device layout, loaded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub station_id: String,
    #[serde(default)]
    pub station_name: String,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub base_url: String,
    #[serde(default = "default_adapter")]
    pub adapter: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            timeout_ms: default_poll_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub endpoint: String,
    #[serde(default)]
    pub request_param: String,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Float,
    Int,
    Bool,
    String,
    Raw,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub severity: Option<String>,
}

fn default_adapter() -> String {
    "energy_api".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    5_000
}

impl StationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read station config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse station config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.station_id.trim().is_empty() {
            bail!("station_id must not be empty");
        }
        Url::parse(&self.connection.base_url).context("invalid connection.base_url")?;
        if self.connection.adapter != "energy_api" {
            bail!("unknown adapter {:?}", self.connection.adapter);
        }
        if self.polling.interval_ms == 0 || self.polling.timeout_ms == 0 {
            bail!("polling interval and timeout must be non-zero");
        }
        if self.polling.timeout_ms >= self.polling.interval_ms {
            bail!(
                "polling timeout ({}ms) must be shorter than the polling interval ({}ms)",
                self.polling.timeout_ms,
                self.polling.interval_ms
            );
        }
        if self.devices.is_empty() {
            bail!("station {} has no devices", self.station_id);
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("device id must not be empty");
            }
            if !seen.insert(device.id.as_str()) {
                bail!("duplicate device id {:?}", device.id);
            }
        }
        Ok(())
    }

    pub fn identity(&self) -> StationIdentity {
        StationIdentity {
            station_id: self.station_id.clone(),
            station_name: self.station_name.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.timeout_ms)
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: Option<bool>) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid {key}")),
        },
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
