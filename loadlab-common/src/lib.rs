// LoadLab Common - Wire model shared between the live monitor and the backend
// contract it consumes. Everything here is plain data plus serde glue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Push frame tag for rolling metrics samples
pub const FRAME_METRICS: &str = "metrics";
/// Push frame tag for per-request status updates
pub const FRAME_REQUEST_UPDATE: &str = "request_update";
/// Push frame tag for trace deliveries
pub const FRAME_TRACE_UPDATE: &str = "trace_update";
/// Keep-alive frame emitted by the backend when the socket is idle
pub const FRAME_HEARTBEAT: &str = "heartbeat";
/// Reply the backend sends for any client-originated message
pub const FRAME_PONG: &str = "pong";

/// Envelope of every frame on the push channel: `{type, data}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl WireFrame {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Rolling aggregate published by the backend once per sampling period
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSample {
    /// Unix time in seconds, fractional
    pub timestamp: f64,
    pub request_rate: f64,
    pub error_rate: f64,
    pub retry_count: u64,
    #[serde(rename = "p95_latency")]
    pub p95_latency_ms: f64,
    #[serde(rename = "p99_latency")]
    pub p99_latency_ms: f64,
    /// Only reported by newer backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_requests: Option<u64>,
}

/// Outcome of a single simulated request as listed by the request explorer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestStatusSummary {
    pub request_id: String,
    #[serde(rename = "status")]
    pub status_code: u16,
    pub latency_ms: f64,
    pub retry_count: u32,
    #[serde(with = "wall_time")]
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub endpoint: String,
}

/// One server-recorded step in a request's lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub event_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(with = "wall_time")]
    pub timestamp_wall: DateTime<Utc>,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Server-side monotonic clock reading, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_monotonic: Option<f64>,
}

/// Trace-level record owning the raw, possibly unordered, event bag
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestTrace {
    #[serde(default)]
    pub trace_id: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request_id: Option<String>,
    #[serde(default, with = "wall_time_opt")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, with = "wall_time_opt")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_latency_ms: Option<f64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default, deserialize_with = "lenient_events")]
    pub events: Vec<TraceEvent>,
    #[serde(default)]
    pub request_metadata: Map<String, Value>,
}

/// Body of `GET /v1/trace/{request_id}`
///
/// `failure_points` and `retry_attempts` are whatever the server computed;
/// consumers treat them as hints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceResponse {
    pub trace: RequestTrace,
    #[serde(default)]
    pub event_count: usize,
    #[serde(default, deserialize_with = "lenient_events")]
    pub failure_points: Vec<TraceEvent>,
    #[serde(default, deserialize_with = "lenient_events")]
    pub retry_attempts: Vec<TraceEvent>,
}

/// Entry of the simplified `GET /v1/trace/{request_id}/timeline` view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    #[serde(with = "wall_time")]
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Body of `GET /v1/trace/{request_id}/timeline`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceTimeline {
    pub request_id: String,
    #[serde(default)]
    pub total_events: usize,
    #[serde(default)]
    pub total_latency_ms: Option<f64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
}

/// Deserialize an event list, skipping entries that do not decode instead of
/// failing the whole document.
pub fn lenient_events<'de, D>(deserializer: D) -> Result<Vec<TraceEvent>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    let total = raw.len();

    let events: Vec<TraceEvent> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<TraceEvent>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Skipping malformed trace event");
                None
            }
        })
        .collect();

    if events.len() != total {
        warn!(
            kept = events.len(),
            total = total,
            "Trace contained malformed events"
        );
    }

    Ok(events)
}

/// Wall-clock timestamps as the backend emits them.
///
/// The backend writes naive ISO-8601 (`2024-05-01T10:00:00.123456`) which is
/// UTC by convention; RFC 3339 with an explicit offset is accepted too.
pub mod wall_time {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }

        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid wall timestamp: {raw}")))
    }
}

/// Optional variant of [`wall_time`]; unparseable values degrade to `None`.
pub mod wall_time_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match ts {
            Some(ts) => super::wall_time::serialize(ts, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(super::wall_time::parse))
    }
}
