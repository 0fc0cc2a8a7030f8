use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Bad,
    Unknown,
}

/// Measurement value as reported on the wire: a JSON number, bool, string, or null.
///
/// `Integer` is listed before `Float` so that `5` decodes as an integer and `5.0` as a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Absent,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Text(String),
}

impl Value {
    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub quality: Quality,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl Measurement {
    pub fn good(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            unit: None,
            quality: Quality::Good,
            severity: None,
        }
    }

    /// A measurement whose source value was missing or could not be converted.
    pub fn bad(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Absent,
            unit: None,
            quality: Quality::Bad,
            severity: None,
        }
    }

    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_severity(mut self, severity: Option<String>) -> Self {
        self.severity = severity;
        self
    }
}

/// One device's poll outcome before it becomes a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedSample {
    pub device_id: String,
    pub device_name: String,
    pub device_group: String,
    pub measurements: Vec<Measurement>,
}

impl CollectedSample {
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationIdentity {
    pub station_id: String,
    pub station_name: String,
}

/// Normalized telemetry unit for one device. Identity and capture time are fixed at
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: Uuid,
    station_id: String,
    station_name: String,
    timestamp: DateTime<Utc>,
    device_id: String,
    device_name: String,
    device_group: String,
    #[serde(rename = "values")]
    measurements: Vec<Measurement>,
}

impl Record {
    pub fn new(station: &StationIdentity, sample: CollectedSample) -> Self {
        Self {
            id: Uuid::new_v4(),
            station_id: station.station_id.clone(),
            station_name: station.station_name.clone(),
            timestamp: Utc::now(),
            device_id: sample.device_id,
            device_name: sample.device_name,
            device_group: sample.device_group,
            measurements: sample.measurements,
        }
    }

    /// Rebuilds a record read back from persistent storage.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        id: Uuid,
        station_id: String,
        station_name: String,
        timestamp: DateTime<Utc>,
        device_id: String,
        device_name: String,
        device_group: String,
        measurements: Vec<Measurement>,
    ) -> Self {
        Self {
            id,
            station_id,
            station_name,
            timestamp,
            device_id,
            device_name,
            device_group,
            measurements,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_group(&self) -> &str {
        &self.device_group
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }
}

/// A record held in the durable queue, with the time it was queued.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedRecord {
    pub record: Record,
    pub created_at: DateTime<Utc>,
}
