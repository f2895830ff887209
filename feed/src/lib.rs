pub mod adapter;
pub mod connect;
pub mod fetcher;
pub mod health;

pub use adapter::{AdapterError, Event, StreamId};
pub use connect::CloseCode;
pub use health::ConnectionState;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use std::{fmt, str::FromStr};

const TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Bearer token handed to every backend call.
///
/// The token is passed verbatim as `Authorization: Bearer <token>` and as the
/// `token` query parameter of the stream URL.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} bytes>)", self.0.len())
    }
}

/// UTC instant of a reading, parsed from the backend's ISO-8601 strings.
///
/// The backend emits naive timestamps (`2024-05-01T12:00:00.123456`) for stored
/// points and offset-bearing ones for some computed values; both normalize to UTC
/// so ordering and equality compare instants rather than strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn from_naive_utc(dt: NaiveDateTime) -> Self {
        Self(dt)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Invalid timestamp: {0:?}")]
pub struct InvalidTimestamp(pub String);

impl FromStr for Timestamp {
    type Err = InvalidTimestamp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Timestamp(dt.naive_utc()));
        }

        TIMESTAMP_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(Timestamp)
            .ok_or_else(|| InvalidTimestamp(s.to_string()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%S%.f"))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse::<Timestamp>().map_err(serde::de::Error::custom)
    }
}

/// A single timestamped sensor reading.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DataPoint {
    pub id: i64,
    pub name: String,
    pub value: f64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ForecastPoint {
    pub timestamp: Timestamp,
    pub value: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnomalyRecord {
    pub timestamp: Timestamp,
    pub value: f64,
    #[serde(default = "default_is_anomaly")]
    pub is_anomaly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
}

fn default_is_anomaly() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModelInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub degree: Option<u32>,
    #[serde(default)]
    pub lookback_hours: Option<u32>,
    #[serde(default)]
    pub training_points: Option<u32>,
}

/// Predicted future values plus anomaly flags on past points.
///
/// Always replaced wholesale by the next fetch.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ForecastSnapshot {
    pub predicted: Vec<ForecastPoint>,
    #[serde(default)]
    pub anomalies: Vec<AnomalyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_interval: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_info: Option<ModelInfo>,
}

impl ForecastSnapshot {
    pub fn horizon(&self) -> Option<Timestamp> {
        self.predicted.last().map(|p| p.timestamp)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &AnomalyRecord> {
        self.anomalies.iter().filter(|a| a.is_anomaly)
    }
}
