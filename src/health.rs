use crate::delivery::{Delivery, EndpointHealth};
use crate::queue::DurableQueue;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: Status,
    pub components: Vec<ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> BoxFuture<'_, (Status, Option<String>)>;
}

/// Reports the ingestion endpoint's reachability.
pub struct SenderCheck<D> {
    sender: Arc<D>,
}

impl<D> SenderCheck<D> {
    pub fn new(sender: Arc<D>) -> Self {
        Self { sender }
    }
}

impl<D: Delivery> HealthCheck for SenderCheck<D> {
    fn name(&self) -> &str {
        "sender"
    }

    fn check(&self) -> BoxFuture<'_, (Status, Option<String>)> {
        async move {
            match self.sender.health().await {
                EndpointHealth::Healthy => (Status::Healthy, None),
                EndpointHealth::Degraded(message) => (Status::Degraded, Some(message)),
                EndpointHealth::Unhealthy(message) => (Status::Unhealthy, Some(message)),
            }
        }
        .boxed()
    }
}

/// Reports the durable queue backlog; a large backlog means delivery is falling behind.
pub struct QueueCheck {
    queue: DurableQueue,
    degraded_threshold: u64,
}

impl QueueCheck {
    pub fn new(queue: DurableQueue, degraded_threshold: u64) -> Self {
        Self {
            queue,
            degraded_threshold,
        }
    }
}

impl HealthCheck for QueueCheck {
    fn name(&self) -> &str {
        "queue"
    }

    fn check(&self) -> BoxFuture<'_, (Status, Option<String>)> {
        async move {
            match self.queue.count().await {
                Err(err) => (Status::Unhealthy, Some(format!("{err:#}"))),
                Ok(count) if count > self.degraded_threshold => (
                    Status::Degraded,
                    Some(format!("{count} records pending")),
                ),
                Ok(_) => (Status::Healthy, None),
            }
        }
        .boxed()
    }
}

/// Unhealthy dominates degraded, which dominates healthy.
pub fn aggregate(components: &[ComponentHealth]) -> Status {
    components
        .iter()
        .map(|component| component.status)
        .fold(Status::Healthy, |overall, status| match (overall, status) {
            (Status::Unhealthy, _) | (_, Status::Unhealthy) => Status::Unhealthy,
            (Status::Degraded, _) | (_, Status::Degraded) => Status::Degraded,
            _ => Status::Healthy,
        })
}

#[derive(Clone, Default)]
pub struct HealthState {
    checks: Arc<Vec<Arc<dyn HealthCheck>>>,
}

impl HealthState {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self {
            checks: Arc::new(checks),
        }
    }

    pub async fn report(&self) -> HealthResponse {
        let mut components = Vec::with_capacity(self.checks.len());
        for check in self.checks.iter() {
            let (status, message) = match tokio::time::timeout(CHECK_TIMEOUT, check.check()).await {
                Ok(outcome) => outcome,
                Err(_) => (Status::Unhealthy, Some("check timed out".to_string())),
            };
            components.push(ComponentHealth {
                name: check.name().to_string(),
                status,
                message,
            });
        }

        HealthResponse {
            status: aggregate(&components),
            components,
            timestamp: Utc::now(),
        }
    }
}

async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let report = state.report().await;
    let code = if report.status == Status::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn ok() -> &'static str {
    "OK"
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/live", get(ok))
        .route("/ready", get(ok))
        .with_state(state)
}

/// Binds the health listener and serves it in the background until `cancel` fires.
pub async fn spawn(
    bind: &str,
    state: HealthState,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind health listener on {bind}"))?;
    tracing::info!(addr = %bind, "health server listening");

    Ok(tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router(state))
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %err, "health server failed");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sample_record, ScriptedSender};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value as JsonValue;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixed(&'static str, Status);

    impl HealthCheck for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn check(&self) -> BoxFuture<'_, (Status, Option<String>)> {
            let status = self.1;
            async move { (status, None) }.boxed()
        }
    }

    fn component(status: Status) -> ComponentHealth {
        ComponentHealth {
            name: "c".to_string(),
            status,
            message: None,
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn unhealthy_dominates_degraded_dominates_healthy() {
        assert_eq!(aggregate(&[]), Status::Healthy);
        assert_eq!(
            aggregate(&[component(Status::Healthy), component(Status::Degraded)]),
            Status::Degraded
        );
        assert_eq!(
            aggregate(&[
                component(Status::Unhealthy),
                component(Status::Degraded),
                component(Status::Healthy)
            ]),
            Status::Unhealthy
        );
    }

    #[tokio::test]
    async fn health_reports_components_and_returns_503_when_unhealthy() {
        let state = HealthState::new(vec![
            Arc::new(Fixed("sender", Status::Healthy)),
            Arc::new(Fixed("queue", Status::Unhealthy)),
        ]);

        let (code, body) = get_json(router(state), "/health").await;

        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["components"][0]["name"], "sender");
        assert_eq!(body["components"][1]["status"], "unhealthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn degraded_sender_still_answers_200() {
        let sender = Arc::new(
            ScriptedSender::accepting()
                .with_health(EndpointHealth::Degraded("connection refused".to_string())),
        );
        let state = HealthState::new(vec![Arc::new(SenderCheck::new(sender))]);

        let (code, body) = get_json(router(state), "/health").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["components"][0]["message"], "connection refused");
    }

    #[tokio::test]
    async fn queue_backlog_above_threshold_is_degraded() {
        let dir = TempDir::new().unwrap();
        let queue = DurableQueue::open(&dir.path().join("buffer.db"))
            .await
            .unwrap();
        for device in ["a", "b", "c"] {
            queue.store(&sample_record(device)).await.unwrap();
        }

        let (status, message) = QueueCheck::new(queue.clone(), 2).check().await;
        assert_eq!(status, Status::Degraded);
        assert_eq!(message.as_deref(), Some("3 records pending"));

        let (status, _) = QueueCheck::new(queue.clone(), 3).check().await;
        assert_eq!(status, Status::Healthy);

        queue.close().await;
        let (status, _) = QueueCheck::new(queue, 3).check().await;
        assert_eq!(status, Status::Unhealthy);
    }

    #[tokio::test]
    async fn live_and_ready_always_answer_ok() {
        for uri in ["/live", "/ready"] {
            let resp = router(HealthState::default())
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"OK");
        }
    }
}
