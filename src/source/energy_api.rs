use super::DataSource;
use crate::config::{DeviceConfig, FieldConfig, FieldType};
use crate::model::{CollectedSample, Measurement, Value};
use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use url::Url;

/// Plain-text bodies some endpoints answer with when they have nothing to report.
const NO_DATA_MARKERS: [&str; 4] = ["True", "False", "true", "false"];

const PYTHON_BOOL_FIXUPS: [(&str, &str); 4] = [
    (":True,", ":true,"),
    (":True}", ":true}"),
    (":False,", ":false,"),
    (":False}", ":false}"),
];

/// Adapter for the site's HTTP "energy API": one POST per device returning a flat JSON object.
pub struct EnergyApiSource {
    client: Client,
    base_url: String,
    closed: AtomicBool,
}

impl EnergyApiSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Url::parse(base_url).with_context(|| format!("invalid device base url {base_url}"))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build device HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn device_url(&self, device: &DeviceConfig) -> String {
        format!(
            "{}/{}",
            self.base_url,
            device.endpoint.trim_start_matches('/')
        )
    }
}

impl DataSource for EnergyApiSource {
    fn name(&self) -> &str {
        "energy_api"
    }

    async fn collect(&self, device: &DeviceConfig, timeout: Duration) -> Result<CollectedSample> {
        if self.closed.load(Ordering::Acquire) {
            bail!("energy_api source is closed");
        }

        let response = self
            .client
            .post(self.device_url(device))
            .timeout(timeout)
            .json(&json!({ "parameter": device.request_param }))
            .send()
            .await
            .context("device request failed")?;

        let status = response.status();
        if status != StatusCode::OK {
            bail!("unexpected status code: {}", status.as_u16());
        }

        let body = response
            .text()
            .await
            .context("failed to read device response")?;

        let measurements = match parse_body(&body)? {
            Some(object) => transform(&object, &device.fields),
            None => {
                tracing::debug!(
                    device_id = %device.id,
                    endpoint = %device.endpoint,
                    response = body.trim(),
                    "device reported no data"
                );
                Vec::new()
            }
        };

        Ok(CollectedSample {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            device_group: device.group.clone(),
            measurements,
        })
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Returns `None` for the no-data marker, otherwise the decoded top-level object.
fn parse_body(body: &str) -> Result<Option<Map<String, JsonValue>>> {
    let trimmed = body.trim();
    if NO_DATA_MARKERS.contains(&trimmed) {
        return Ok(None);
    }

    let mut normalized = trimmed.to_string();
    for (from, to) in PYTHON_BOOL_FIXUPS {
        normalized = normalized.replace(from, to);
    }

    match serde_json::from_str(&normalized).context("failed to decode device response")? {
        JsonValue::Object(object) => Ok(Some(object)),
        other => Err(anyhow!("expected a JSON object, got {other}")),
    }
}

fn transform(object: &Map<String, JsonValue>, fields: &[FieldConfig]) -> Vec<Measurement> {
    fields
        .iter()
        .map(|field| {
            let value = match object.get(&field.source) {
                Some(raw) => convert(raw, field.field_type),
                None => {
                    tracing::debug!(source = %field.source, "field missing from device response");
                    Value::Absent
                }
            };
            let measurement = if value.is_absent() {
                Measurement::bad(field.target.clone())
            } else {
                Measurement::good(field.target.clone(), value)
            };
            measurement
                .with_unit(field.unit.clone())
                .with_severity(field.severity.clone())
        })
        .collect()
}

fn convert(raw: &JsonValue, field_type: FieldType) -> Value {
    match field_type {
        FieldType::Float => to_float(raw),
        FieldType::Int => to_int(raw),
        FieldType::Bool => to_bool(raw),
        FieldType::String => to_text(raw),
        FieldType::Raw => to_raw(raw),
    }
}

fn to_float(raw: &JsonValue) -> Value {
    let parsed = match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|f| f.is_finite())
        .map_or(Value::Absent, Value::Float)
}

fn to_int(raw: &JsonValue) -> Value {
    let parsed = match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.map_or(Value::Absent, Value::Integer)
}

fn to_bool(raw: &JsonValue) -> Value {
    match raw {
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::Number(n) => Value::Boolean(n.as_f64().is_some_and(|f| f != 0.0)),
        JsonValue::String(s) => Value::Boolean(parse_bool_text(s)),
        _ => Value::Absent,
    }
}

fn parse_bool_text(text: &str) -> bool {
    match text.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => true,
        "0" | "f" | "F" | "false" | "FALSE" | "False" => false,
        other => other == "on",
    }
}

fn to_text(raw: &JsonValue) -> Value {
    match raw {
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Number(n) => Value::Text(n.to_string()),
        JsonValue::Bool(b) => Value::Text(b.to_string()),
        _ => Value::Absent,
    }
}

fn to_raw(raw: &JsonValue) -> Value {
    match raw {
        JsonValue::Bool(b) => Value::Boolean(*b),
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => n.as_f64().map_or(Value::Absent, Value::Float),
        },
        _ => Value::Absent,
    }
}
