use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single metric observation, keyed by (service, metric, ts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub ts: DateTime<Utc>,
    pub service: String,
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// A structured log entry ingested alongside metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub service: String,
    pub level: String,
    #[serde(default)]
    pub event: Option<String>,
    pub message: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Detector name recorded on every persisted anomaly.
pub const DETECTOR_NAME: &str = "robust_zscore";

/// A detected anomaly segment on one (service, metric) series.
/// Immutable once persisted; deduplicated on (service, metric, start_ts ± 60 s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub service: String,
    pub metric: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub score: f64,
    pub detector: String,
    pub details: serde_json::Value,
}

impl Anomaly {
    pub fn new(
        service: String,
        metric: String,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        score: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service,
            metric,
            start_ts,
            end_ts,
            score,
            detector: DETECTOR_NAME.to_string(),
            details: serde_json::json!({ "z_score": score }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(IncidentStatus::Open),
            "CLOSED" => Some(IncidentStatus::Closed),
            _ => None,
        }
    }
}

/// A group of temporally or service-wise related anomalies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub title: String,
    pub status: IncidentStatus,
    pub summary: Option<String>,
}

/// The kind of change (or fallback) suspected of causing an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuspectType {
    Deployment,
    Config,
    Flag,
    Service,
}

impl SuspectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspectType::Deployment => "DEPLOYMENT",
            SuspectType::Config => "CONFIG",
            SuspectType::Flag => "FLAG",
            SuspectType::Service => "SERVICE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEPLOYMENT" => Some(SuspectType::Deployment),
            "CONFIG" => Some(SuspectType::Config),
            "FLAG" => Some(SuspectType::Flag),
            "SERVICE" => Some(SuspectType::Service),
            _ => None,
        }
    }
}

/// A deployment recorded in the change catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub service: String,
    pub commit_sha: String,
    pub version: Option<String>,
    pub author: Option<String>,
    pub diff_summary: Option<String>,
    pub links: Option<serde_json::Value>,
}

/// A configuration change recorded in the change catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub service: String,
    pub key: String,
    pub old_value_hash: Option<String>,
    pub new_value_hash: Option<String>,
    pub diff_summary: Option<String>,
    pub source: Option<String>,
}

/// A feature-flag state change. `service` is NULL for global flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagChange {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub flag_name: String,
    pub service: Option<String>,
    pub old_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
}

/// A candidate root cause for an incident, before feature extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub suspect_type: SuspectType,
    pub suspect_key: String,
    pub ts: DateTime<Utc>,
    pub service: Option<String>,
    pub metadata: serde_json::Value,
}

/// A ranked suspect persisted for an incident. `rank` is 1..N with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspect {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub suspect_type: SuspectType,
    pub suspect_key: String,
    pub rank: i32,
    pub score: f64,
    pub evidence: serde_json::Value,
}

/// A human judgment on one suspect. The latest label per (incident, suspect)
/// wins; it is the training target for the learned ranker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub suspect_id: Uuid,
    pub label: i16,
    pub labeler: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Broker payload published on `anomalies.detected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyDetectedMsg {
    pub id: Uuid,
    pub service: String,
    pub metric: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub score: f64,
}

/// Broker payload published on `rca.requests`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaRequestMsg {
    pub incident_id: Uuid,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

/// Identifiers (service and metric names) are restricted to this charset so
/// they can never smuggle query syntax into a store.
pub fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 255
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}
