//! Activity event bus — trait for emitting progress events from any module.
//!
//! Workers and handlers accept an `Arc<dyn ActivitySink>` to emit events into
//! the activity log. The Redis-backed implementation lives in
//! `faultline-activity`; the no-op and capture sinks here serve replay mode
//! and tests.

use crate::error::PipelineResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The eight recognized activity event types. Anything else is dropped with
/// a warning at the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MetricsIngested,
    AnomalyDetected,
    IncidentCreated,
    RcaStarted,
    RcaCompleted,
    SuspectsGenerated,
    SuspectScoreUpdated,
    LabelRecorded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MetricsIngested => "metrics_ingested",
            EventType::AnomalyDetected => "anomaly_detected",
            EventType::IncidentCreated => "incident_created",
            EventType::RcaStarted => "rca_started",
            EventType::RcaCompleted => "rca_completed",
            EventType::SuspectsGenerated => "suspects_generated",
            EventType::SuspectScoreUpdated => "suspect_score_updated",
            EventType::LabelRecorded => "label_recorded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metrics_ingested" => Some(EventType::MetricsIngested),
            "anomaly_detected" => Some(EventType::AnomalyDetected),
            "incident_created" => Some(EventType::IncidentCreated),
            "rca_started" => Some(EventType::RcaStarted),
            "rca_completed" => Some(EventType::RcaCompleted),
            "suspects_generated" => Some(EventType::SuspectsGenerated),
            "suspect_score_updated" => Some(EventType::SuspectScoreUpdated),
            "label_recorded" => Some(EventType::LabelRecorded),
            _ => None,
        }
    }
}

/// A single entry in the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub service: Option<String>,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ActivityEvent {
    pub fn new(
        event_type: EventType,
        service: Option<String>,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            ts: Utc::now(),
            event_type,
            service,
            message: message.into(),
            metadata,
        }
    }
}

/// Fire-and-forget event emission. Implementations must never block the
/// caller on store I/O and must swallow store failures (degraded dependency).
pub trait ActivitySink: Send + Sync {
    fn emit(&self, event: ActivityEvent);
}

/// Read side of the activity log, served by `GET /activity/events`.
#[async_trait]
pub trait ActivityQuery: Send + Sync {
    /// Events newest-first, bounded by `since` (default: the retention
    /// horizon) and `limit`, optionally filtered by type and service.
    async fn events(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
        event_type: Option<EventType>,
        service: Option<&str>,
    ) -> PipelineResult<Vec<ActivityEvent>>;

    async fn ping(&self) -> PipelineResult<()>;
}

/// No-op sink for replay mode and modules that don't emit events.
pub struct NoOpSink;

impl ActivitySink for NoOpSink {
    fn emit(&self, _event: ActivityEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<ActivityEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn captured(&self) -> Vec<ActivityEvent> {
        self.events.lock().expect("activity mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("activity mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("activity mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl ActivitySink for CaptureSink {
    fn emit(&self, event: ActivityEvent) {
        self.events.lock().expect("activity mutex poisoned").push(event);
    }
}

#[async_trait]
impl ActivityQuery for CaptureSink {
    async fn events(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
        event_type: Option<EventType>,
        service: Option<&str>,
    ) -> PipelineResult<Vec<ActivityEvent>> {
        let mut events: Vec<ActivityEvent> = self
            .events
            .lock()
            .expect("activity mutex poisoned")
            .iter()
            .filter(|e| since.map_or(true, |s| e.ts >= s))
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| service.map_or(true, |s| e.service.as_deref() == Some(s)))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.ts.cmp(&a.ts));
        events.truncate(limit);
        Ok(events)
    }

    async fn ping(&self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Convenience: a no-op sink for modules that don't need event emission.
pub fn noop_sink() -> Arc<dyn ActivitySink> {
    Arc::new(NoOpSink)
}

/// Convenience: a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        sink.emit(ActivityEvent::new(
            EventType::AnomalyDetected,
            Some("payment".into()),
            "Anomaly detected: p95_latency_ms",
            serde_json::json!({}),
        ));
        sink.emit(ActivityEvent::new(
            EventType::IncidentCreated,
            Some("payment".into()),
            "Incident created",
            serde_json::json!({}),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::AnomalyDetected), 1);
        assert_eq!(sink.count_type(EventType::SuspectsGenerated), 0);
    }

    #[tokio::test]
    async fn test_capture_sink_query_filters() {
        let sink = capture_sink();
        sink.emit(ActivityEvent::new(
            EventType::AnomalyDetected,
            Some("order".into()),
            "a",
            serde_json::json!({}),
        ));
        sink.emit(ActivityEvent::new(
            EventType::AnomalyDetected,
            Some("payment".into()),
            "b",
            serde_json::json!({}),
        ));

        let events = sink
            .events(None, 50, Some(EventType::AnomalyDetected), Some("payment"))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].service.as_deref(), Some("payment"));
    }

    #[test]
    fn test_event_type_roundtrip() {
        for s in [
            "metrics_ingested",
            "anomaly_detected",
            "incident_created",
            "rca_started",
            "rca_completed",
            "suspects_generated",
            "suspect_score_updated",
            "label_recorded",
        ] {
            assert_eq!(EventType::parse(s).unwrap().as_str(), s);
        }
        assert!(EventType::parse("deploy_started").is_none());
    }
}
