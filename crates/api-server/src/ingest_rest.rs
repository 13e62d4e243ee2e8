//! Ingestion handlers: metrics, logs, deployments, config changes, flags.
//!
//! Each handler validates, writes to the owning store, and mirrors the
//! payload onto the raw broker topic for the streaming consumers.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use faultline_core::activity::{ActivityEvent, EventType};
use faultline_core::topics;
use faultline_core::types::{
    valid_identifier, ConfigChange, Deployment, FlagChange, LogEntry, MetricPoint,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;
use uuid::Uuid;

/// Batch size at which a metrics ingest is worth an activity event.
const ACTIVITY_BATCH_THRESHOLD: usize = 10;

#[derive(Deserialize)]
pub struct MetricPointIn {
    pub ts: String,
    pub service: String,
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct MetricsIngestRequest {
    pub points: Vec<MetricPointIn>,
}

#[derive(Deserialize)]
pub struct LogEntryIn {
    pub ts: String,
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

#[derive(Deserialize)]
pub struct LogsIngestRequest {
    pub entries: Vec<LogEntryIn>,
}

#[derive(Deserialize)]
pub struct DeploymentIngestRequest {
    pub ts: String,
    pub service: String,
    pub commit_sha: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub diff_summary: Option<String>,
    #[serde(default)]
    pub links: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ConfigChangeIngestRequest {
    pub ts: String,
    pub service: String,
    pub key: String,
    #[serde(default)]
    pub old_value_hash: Option<String>,
    #[serde(default)]
    pub new_value_hash: Option<String>,
    #[serde(default)]
    pub diff_summary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Deserialize)]
pub struct FlagChangeIngestRequest {
    pub ts: String,
    pub flag_name: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub old_state: Option<serde_json::Value>,
    #[serde(default)]
    pub new_state: Option<serde_json::Value>,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| ApiError::validation(format!("invalid timestamp: {raw}")))
}

fn check_identifier(kind: &str, value: &str) -> Result<(), ApiError> {
    if valid_identifier(value) {
        Ok(())
    } else {
        Err(ApiError::validation(format!("invalid {kind}: {value:?}")))
    }
}

/// POST /ingest/metrics
pub async fn ingest_metrics(
    State(state): State<AppState>,
    Json(request): Json<MetricsIngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.points.is_empty() {
        return Err(ApiError::validation("No points provided"));
    }

    let mut points = Vec::with_capacity(request.points.len());
    for p in &request.points {
        check_identifier("service", &p.service)?;
        check_identifier("metric", &p.metric)?;
        if !p.value.is_finite() {
            return Err(ApiError::validation(format!(
                "non-finite value for {}/{}",
                p.service, p.metric
            )));
        }
        points.push(MetricPoint {
            ts: parse_ts(&p.ts)?,
            service: p.service.clone(),
            metric: p.metric.clone(),
            value: p.value,
            tags: p.tags.clone(),
        });
    }

    state.metric_store.insert_points(&points).await?;

    for point in &points {
        if let Err(e) = state
            .broker
            .publish(topics::METRICS_RAW, serde_json::to_vec(point).map_err(faultline_core::PipelineError::from)?)
            .await
        {
            warn!(error = %e, "Failed to publish metric point");
        }
    }

    if points.len() >= ACTIVITY_BATCH_THRESHOLD {
        let services: HashSet<&str> = points.iter().map(|p| p.service.as_str()).collect();
        let service = if services.len() == 1 {
            services.iter().next().map(|s| s.to_string())
        } else {
            None
        };
        state.activity_sink.emit(ActivityEvent::new(
            EventType::MetricsIngested,
            service,
            format!("Ingested {} metric points", points.len()),
            serde_json::json!({
                "count": points.len(),
                "services": points.iter().map(|p| p.service.clone()).collect::<HashSet<_>>(),
            }),
        ));
    }

    metrics::counter!("ingest.metrics").increment(points.len() as u64);
    Ok(Json(serde_json::json!({ "status": "ok", "count": points.len() })))
}

/// POST /ingest/logs
pub async fn ingest_logs(
    State(state): State<AppState>,
    Json(request): Json<LogsIngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.entries.is_empty() {
        return Err(ApiError::validation("No entries provided"));
    }

    let mut entries = Vec::with_capacity(request.entries.len());
    for e in &request.entries {
        check_identifier("service", &e.service)?;
        entries.push(LogEntry {
            ts: parse_ts(&e.ts)?,
            service: e.service.clone(),
            level: e.level.clone(),
            event: e.event.clone(),
            message: e.message.clone(),
            fields: e.fields.clone(),
            trace_id: e.trace_id.clone(),
        });
    }

    state.metric_store.insert_logs(&entries).await?;

    for entry in &entries {
        if let Err(e) = state
            .broker
            .publish(topics::LOGS_RAW, serde_json::to_vec(entry).map_err(faultline_core::PipelineError::from)?)
            .await
        {
            warn!(error = %e, "Failed to publish log entry");
        }
    }

    metrics::counter!("ingest.logs").increment(entries.len() as u64);
    Ok(Json(serde_json::json!({ "status": "ok", "count": entries.len() })))
}

/// POST /ingest/deployments
pub async fn ingest_deployments(
    State(state): State<AppState>,
    Json(request): Json<DeploymentIngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_identifier("service", &request.service)?;
    let deployment = Deployment {
        id: Uuid::new_v4(),
        ts: parse_ts(&request.ts)?,
        service: request.service,
        commit_sha: request.commit_sha,
        version: request.version,
        author: request.author,
        diff_summary: request.diff_summary,
        links: request.links,
    };

    state.catalog.insert_deployment(&deployment).await?;
    publish_change(&state, topics::DEPLOYMENTS_RAW, &deployment).await;

    Ok(Json(serde_json::json!({ "status": "ok", "id": deployment.id })))
}

/// POST /ingest/config_changes
pub async fn ingest_config_changes(
    State(state): State<AppState>,
    Json(request): Json<ConfigChangeIngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_identifier("service", &request.service)?;
    let change = ConfigChange {
        id: Uuid::new_v4(),
        ts: parse_ts(&request.ts)?,
        service: request.service,
        key: request.key,
        old_value_hash: request.old_value_hash,
        new_value_hash: request.new_value_hash,
        diff_summary: request.diff_summary,
        source: request.source,
    };

    state.catalog.insert_config_change(&change).await?;
    publish_change(&state, topics::CONFIG_RAW, &change).await;

    Ok(Json(serde_json::json!({ "status": "ok", "id": change.id })))
}

/// POST /ingest/flag_changes
pub async fn ingest_flag_changes(
    State(state): State<AppState>,
    Json(request): Json<FlagChangeIngestRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(service) = &request.service {
        check_identifier("service", service)?;
    }
    let change = FlagChange {
        id: Uuid::new_v4(),
        ts: parse_ts(&request.ts)?,
        flag_name: request.flag_name,
        service: request.service,
        old_state: request.old_state,
        new_state: request.new_state,
    };

    state.catalog.insert_flag_change(&change).await?;
    publish_change(&state, topics::FLAGS_RAW, &change).await;

    Ok(Json(serde_json::json!({ "status": "ok", "id": change.id })))
}

async fn publish_change<T: serde::Serialize>(state: &AppState, topic: &str, record: &T) {
    match serde_json::to_vec(record) {
        Ok(payload) => {
            if let Err(e) = state.broker.publish(topic, payload).await {
                warn!(topic = topic, error = %e, "Failed to publish change event");
            }
        }
        Err(e) => warn!(topic = topic, error = %e, "Failed to encode change event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ts_accepts_rfc3339_with_zone() {
        assert!(parse_ts("2026-05-01T12:00:00Z").is_ok());
        assert!(parse_ts("2026-05-01T12:00:00+02:00").is_ok());
        assert!(parse_ts("2026-05-01 12:00:00").is_err());
        assert!(parse_ts("yesterday").is_err());
    }

    #[test]
    fn test_check_identifier_rejects_injection() {
        assert!(check_identifier("service", "payment-api").is_ok());
        assert!(check_identifier("service", "x'; DROP TABLE metrics;--").is_err());
    }
}
