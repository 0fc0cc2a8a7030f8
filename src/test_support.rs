use crate::config::{DeviceConfig, FieldConfig, FieldType};
use crate::delivery::{AttemptError, Delivery, DeliveryError, EndpointHealth};
use crate::model::{CollectedSample, Measurement, Record, StationIdentity, Value};
use crate::source::DataSource;
use anyhow::{bail, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{HeaderName, AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub(crate) fn station() -> StationIdentity {
    StationIdentity {
        station_id: "st-1".to_string(),
        station_name: "North Substation".to_string(),
    }
}

pub(crate) fn sample_measurements() -> Vec<Measurement> {
    vec![
        Measurement::good("power_kw", Value::Float(12.5)).with_unit(Some("kW".to_string())),
        Measurement::good("energy_kwh", Value::Float(1_048_576.125)),
        Measurement::good("mode", Value::Integer(3)),
        Measurement::good("breaker_trip", Value::Boolean(false))
            .with_severity(Some("critical".to_string())),
        Measurement::good("state", Value::Text("running".to_string())),
        Measurement::bad("voltage_v").with_unit(Some("V".to_string())),
    ]
}

pub(crate) fn sample_record(device_id: &str) -> Record {
    Record::new(
        &station(),
        CollectedSample {
            device_id: device_id.to_string(),
            device_name: format!("Device {device_id}"),
            device_group: "inverters".to_string(),
            measurements: sample_measurements(),
        },
    )
}

pub(crate) fn device(id: &str) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        name: format!("Device {id}"),
        group: "inverters".to_string(),
        endpoint: format!("devices/{id}"),
        request_param: "telemetry".to_string(),
        fields: vec![FieldConfig {
            source: "P".to_string(),
            target: "power_kw".to_string(),
            unit: Some("kW".to_string()),
            field_type: FieldType::Float,
            severity: None,
        }],
    }
}

/// Scripted behaviour of one fake device.
#[derive(Debug, Clone)]
pub(crate) enum Poll {
    Sample(Vec<Measurement>),
    Empty,
    Fail,
    Hang,
}

pub(crate) struct FakeSource {
    polls: HashMap<String, Poll>,
    calls: AtomicUsize,
    closed: AtomicBool,
}

impl FakeSource {
    pub(crate) fn new<'a>(polls: impl IntoIterator<Item = (&'a str, Poll)>) -> Self {
        Self {
            polls: polls
                .into_iter()
                .map(|(id, poll)| (id.to_string(), poll))
                .collect(),
            calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn collect(&self, device: &DeviceConfig, _timeout: Duration) -> Result<CollectedSample> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let measurements = match self.polls.get(&device.id) {
            Some(Poll::Sample(measurements)) => measurements.clone(),
            Some(Poll::Empty) | None => Vec::new(),
            Some(Poll::Fail) => bail!("device {} refused the connection", device.id),
            Some(Poll::Hang) => std::future::pending().await,
        };
        Ok(CollectedSample {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            device_group: device.group.clone(),
            measurements,
        })
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Delivery fake that succeeds or fails per call from a script, then falls back to a fixed
/// outcome.
pub(crate) struct ScriptedSender {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    health: EndpointHealth,
    latency: Duration,
    attempts: AtomicUsize,
    sent: Mutex<Vec<Record>>,
}

impl ScriptedSender {
    pub(crate) fn new(script: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            health: EndpointHealth::Healthy,
            latency: Duration::ZERO,
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn accepting() -> Self {
        Self::new([], true)
    }

    pub(crate) fn failing() -> Self {
        Self::new([], false)
    }

    pub(crate) fn with_health(mut self, health: EndpointHealth) -> Self {
        self.health = health;
        self
    }

    /// Each send waits this long before answering; cancellation cuts the wait short.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<Record> {
        self.sent.lock().unwrap().clone()
    }
}

impl Delivery for ScriptedSender {
    async fn send(&self, record: &Record, cancel: &CancellationToken) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                _ = tokio::time::sleep(self.latency) => {}
            }
        }
        let accept = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if !accept {
            return Err(DeliveryError::Exhausted {
                attempts: 1,
                last: AttemptError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                },
            });
        }
        self.sent.lock().unwrap().push(record.clone());
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
        self.health.clone()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub(crate) fn ok(body: &str) -> Self {
        Self::status(200, body)
    }

    pub(crate) fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ReceivedRequest {
    pub method: Method,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: JsonValue,
}

struct ServerState {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<ReceivedRequest>>,
}

/// Local HTTP server that records every request and answers from a script.
pub(crate) struct TestServer {
    pub base_url: Url,
    state: Arc<ServerState>,
}

impl TestServer {
    pub(crate) fn requests(&self) -> Vec<ReceivedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

/// Fake ingestion endpoint: answers each request with the next scripted status, then 200.
pub(crate) async fn spawn_ingest_server(statuses: Vec<u16>) -> TestServer {
    let script = statuses
        .into_iter()
        .map(|status| Reply::status(status, "scripted failure"))
        .collect();
    spawn_server(script, Reply::ok("")).await
}

/// Fake device that always answers with `reply`.
pub(crate) async fn spawn_device_server(reply: Reply) -> TestServer {
    spawn_server(Vec::new(), reply).await
}

async fn spawn_server(script: Vec<Reply>, fallback: Reply) -> TestServer {
    let state = Arc::new(ServerState {
        script: Mutex::new(script.into()),
        fallback,
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .fallback(record_request)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        base_url: Url::parse(&format!("http://{addr}")).unwrap(),
        state,
    }
}

async fn record_request(
    State(state): State<Arc<ServerState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let request = ReceivedRequest {
        method,
        path: uri.path().to_string(),
        authorization: header(AUTHORIZATION),
        content_type: header(CONTENT_TYPE),
        body: serde_json::from_slice(&body).unwrap_or(JsonValue::Null),
    };
    state.requests.lock().unwrap().push(request);

    let reply = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| state.fallback.clone());
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, reply.body)
}
