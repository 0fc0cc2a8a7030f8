use super::retry::RetryPolicy;
use super::{AttemptError, Delivery, DeliveryError, EndpointHealth};
use crate::model::Record;
use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Posts records as JSON to `{base_url}/{station_id}` with a bearer credential.
pub struct HttpSender {
    client: Client,
    endpoint: Url,
    token: String,
    retry: RetryPolicy,
}

impl HttpSender {
    pub fn new(
        base_url: &Url,
        station_id: &str,
        token: String,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let endpoint = station_endpoint(base_url, station_id)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build ingest HTTP client")?;
        Ok(Self {
            client,
            endpoint,
            token,
            retry,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn deliver(&self, body: Vec<u8>, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        self.retry.run(cancel, |_| self.post(&body)).await
    }

    async fn post(&self, body: &[u8]) -> Result<(), AttemptError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(AttemptError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}

impl Delivery for HttpSender {
    async fn send(&self, record: &Record, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(record)?;
        self.deliver(body, cancel).await
    }

    async fn send_batch(
        &self,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(records)?;
        self.deliver(body, cancel).await
    }

    async fn health(&self) -> EndpointHealth {
        let response = self
            .client
            .get(self.endpoint.clone())
            .bearer_auth(&self.token)
            .send()
            .await;

        match response {
            Err(err) => EndpointHealth::Degraded(format!("health check failed: {err}")),
            Ok(response) if response.status().is_server_error() => EndpointHealth::Unhealthy(
                format!("server unhealthy: status {}", response.status().as_u16()),
            ),
            Ok(_) => EndpointHealth::Healthy,
        }
    }
}

fn station_endpoint(base_url: &Url, station_id: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base_url.as_str().trim_end_matches('/'),
        station_id.trim()
    );
    Url::parse(&joined).with_context(|| format!("invalid ingest endpoint {joined}"))
}
