//! Evidence feature extraction per candidate.
//!
//! Five independent blocks: time proximity, metric correlation, log
//! evidence, diff evidence, and historical risk. A failure in one block logs
//! a warning and zeroes only that block's features; ranking always proceeds.

use chrono::{DateTime, Duration, Utc};
use faultline_core::features::{Evidence, DIFF_LENGTH};
use faultline_core::types::{Candidate, SuspectType};
use faultline_core::PipelineResult;
use faultline_storage::{ChangeCatalog, MetricStore};
use tracing::warn;

const DIFF_KEYWORDS: [&str; 7] = [
    "timeout",
    "retry",
    "cache",
    "db",
    "database",
    "connection",
    "pool",
];

/// Pre-candidate comparison window for metric and log deltas.
const BEFORE_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Default)]
struct CorrelationBlock {
    metric_delta_count: f64,
    max_metric_delta: f64,
    avg_metric_delta: f64,
}

#[derive(Debug, Default)]
struct LogBlock {
    error_log_delta: f64,
    new_error_signature: f64,
}

#[derive(Debug, Default)]
struct DiffBlock {
    diff_length: f64,
    diff_keyword_hit: f64,
    diff_keyword_count: f64,
}

#[derive(Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the full evidence map for one candidate. Pure given its
    /// inputs; store failures degrade to zeros, never abort.
    pub async fn extract(
        &self,
        candidate: &Candidate,
        incident_start: DateTime<Utc>,
        incident_end: DateTime<Utc>,
        affected_services: &[String],
        metric_store: &dyn MetricStore,
        catalog: &dyn ChangeCatalog,
    ) -> Evidence {
        let minutes_before = (incident_start - candidate.ts).num_milliseconds() as f64 / 60_000.0;
        let is_before = if minutes_before >= 0.0 { 1.0 } else { 0.0 };
        let proximity = (1.0 - minutes_before.abs() / 60.0).max(0.0);

        let correlation = match self
            .correlation_block(candidate, incident_end, affected_services, metric_store)
            .await
        {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, suspect_key = %candidate.suspect_key, "Error extracting correlation features");
                CorrelationBlock::default()
            }
        };

        let logs = match self.log_block(candidate, incident_end, metric_store).await {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, suspect_key = %candidate.suspect_key, "Error extracting log features");
                LogBlock::default()
            }
        };

        let diff = diff_block(candidate);

        let historical = match self.historical_block(candidate, incident_start, catalog).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, suspect_key = %candidate.suspect_key, "Error extracting historical features");
                0.0
            }
        };

        let mut evidence = Evidence::new();
        evidence.set("minutes_before_incident", minutes_before);
        evidence.set("is_before_incident", is_before);
        evidence.set("time_proximity_score", proximity);
        evidence.set("metric_delta_count", correlation.metric_delta_count);
        evidence.set("max_metric_delta", correlation.max_metric_delta);
        evidence.set("avg_metric_delta", correlation.avg_metric_delta);
        evidence.set("error_log_delta", logs.error_log_delta);
        evidence.set("new_error_signature", logs.new_error_signature);
        evidence.set(DIFF_LENGTH, diff.diff_length);
        evidence.set("diff_keyword_hit", diff.diff_keyword_hit);
        evidence.set("diff_keyword_count", diff.diff_keyword_count);
        evidence.set("service_incident_rate_30d", historical);
        evidence
    }

    /// Metric shift around the candidate, for deployments on an affected
    /// service. The post-change window deliberately runs through the end of
    /// the incident (see DESIGN.md).
    async fn correlation_block(
        &self,
        candidate: &Candidate,
        incident_end: DateTime<Utc>,
        affected_services: &[String],
        metric_store: &dyn MetricStore,
    ) -> PipelineResult<CorrelationBlock> {
        if candidate.suspect_type != SuspectType::Deployment {
            return Ok(CorrelationBlock::default());
        }
        let service = match candidate.service.as_deref() {
            Some(service) if affected_services.iter().any(|s| s == service) => service,
            _ => return Ok(CorrelationBlock::default()),
        };

        let before = metric_store
            .avg_by_metric(
                service,
                candidate.ts - Duration::minutes(BEFORE_WINDOW_MINUTES),
                candidate.ts,
                false,
            )
            .await?;
        let after = metric_store
            .avg_by_metric(service, candidate.ts, incident_end, true)
            .await?;

        let mut deltas = Vec::new();
        for (metric, before_avg) in &before {
            if let Some(after_avg) = after.get(metric) {
                if *before_avg > 0.0 {
                    deltas.push((after_avg - before_avg).abs() / before_avg);
                }
            }
        }

        if deltas.is_empty() {
            return Ok(CorrelationBlock::default());
        }
        let max = deltas.iter().cloned().fold(0.0f64, f64::max);
        let avg = deltas.iter().sum::<f64>() / deltas.len() as f64;
        Ok(CorrelationBlock {
            metric_delta_count: deltas.len() as f64,
            max_metric_delta: max,
            avg_metric_delta: avg,
        })
    }

    async fn log_block(
        &self,
        candidate: &Candidate,
        incident_end: DateTime<Utc>,
        metric_store: &dyn MetricStore,
    ) -> PipelineResult<LogBlock> {
        if candidate.suspect_type != SuspectType::Deployment {
            return Ok(LogBlock::default());
        }
        let service = match candidate.service.as_deref() {
            Some(service) => service,
            None => return Ok(LogBlock::default()),
        };

        let before_errors = metric_store
            .count_logs(
                service,
                "ERROR",
                None,
                candidate.ts - Duration::minutes(BEFORE_WINDOW_MINUTES),
                candidate.ts,
                false,
            )
            .await?;
        let after_errors = metric_store
            .count_logs(service, "ERROR", None, candidate.ts, incident_end, true)
            .await?;

        let error_log_delta =
            (after_errors as f64 - before_errors as f64) / (before_errors.max(1) as f64);

        let signature_hits = metric_store
            .count_logs(
                service,
                "ERROR",
                Some("DB_TIMEOUT"),
                candidate.ts,
                incident_end,
                true,
            )
            .await?;

        Ok(LogBlock {
            error_log_delta,
            new_error_signature: if signature_hits > 0 { 1.0 } else { 0.0 },
        })
    }

    async fn historical_block(
        &self,
        candidate: &Candidate,
        incident_start: DateTime<Utc>,
        catalog: &dyn ChangeCatalog,
    ) -> PipelineResult<f64> {
        let service = match candidate.service.as_deref() {
            Some(service) => service,
            None => return Ok(0.0),
        };
        let count = catalog
            .count_service_incidents_since(service, incident_start - Duration::days(30))
            .await?;
        Ok(count as f64)
    }
}

fn diff_block(candidate: &Candidate) -> DiffBlock {
    let diff_summary = candidate
        .metadata
        .get("diff_summary")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if diff_summary.is_empty() {
        return DiffBlock::default();
    }

    let lower = diff_summary.to_lowercase();
    let hits = DIFF_KEYWORDS.iter().filter(|k| lower.contains(**k)).count();

    DiffBlock {
        diff_length: diff_summary.chars().count() as f64,
        diff_keyword_hit: if hits > 0 { 1.0 } else { 0.0 },
        diff_keyword_count: hits as f64,
    }
}
