pub mod backoff;
mod http;
mod log;
pub mod retry;

pub use http::HttpSender;
pub use log::LogSender;

use crate::model::Record;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a single delivery attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status code {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("delivery cancelled")]
    Cancelled,
    #[error("all {attempts} attempts failed: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: AttemptError,
    },
}

/// Outcome of the lightweight reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointHealth {
    Healthy,
    /// The endpoint could not be reached; delivery may still recover on its own.
    Degraded(String),
    /// The endpoint answered with a server error.
    Unhealthy(String),
}

pub trait Delivery: Send + Sync {
    fn send(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    fn send_batch(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;

    fn health(&self) -> impl Future<Output = EndpointHealth> + Send;
}

impl<T: Delivery> Delivery for Arc<T> {
    fn send(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        (**self).send(record, cancel)
    }

    fn send_batch(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        (**self).send_batch(records, cancel)
    }

    fn health(&self) -> impl Future<Output = EndpointHealth> + Send {
        (**self).health()
    }
}

/// Delivery backend chosen once at startup.
pub enum Sender {
    Http(HttpSender),
    Log(LogSender),
}

impl Delivery for Sender {
    async fn send(&self, record: &Record, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        match self {
            Sender::Http(sender) => sender.send(record, cancel).await,
            Sender::Log(sender) => sender.send(record, cancel).await,
        }
    }

    async fn send_batch(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        match self {
            Sender::Http(sender) => sender.send_batch(records, cancel).await,
            Sender::Log(sender) => sender.send_batch(records, cancel).await,
        }
    }

    async fn health(&self) -> EndpointHealth {
        match self {
            Sender::Http(sender) => sender.health().await,
            Sender::Log(sender) => sender.health().await,
        }
    }
}
