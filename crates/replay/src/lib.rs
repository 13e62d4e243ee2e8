#![warn(clippy::unwrap_used)]

//! Offline replay and evaluation of the detect → group → rank pipeline.
//!
//! Reconstructs an incident's analysis from the persistent stores alone —
//! nothing is published to the broker and no activity events are written —
//! then scores the ranked suspects against the human-labeled true cause.

use chrono::{DateTime, Duration, Utc};
use faultline_core::config::AppConfig;
use faultline_core::types::{Anomaly, SuspectType};
use faultline_core::{PipelineError, PipelineResult};
use faultline_detector::{AnomalyDetector, DetectorConfig, IncidentGrouper};
use faultline_rca::{CandidateGenerator, FeatureExtractor, Ranker};
use faultline_storage::{ChangeCatalog, MetricStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// How much history precedes the incident when rebuilding detector buffers.
const REPLAY_LOOKBACK_HOURS: i64 = 24;

/// Metrics for one replayed incident. Ranking metrics are `None` when no
/// true cause has been labeled.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub incident_id: Uuid,
    pub precision_at_1: Option<f64>,
    pub precision_at_3: Option<f64>,
    pub mrr: Option<f64>,
    pub time_to_detect_minutes: Option<f64>,
    pub num_anomalies: usize,
    pub num_candidates: usize,
    pub num_suspects: usize,
}

/// Arithmetic means across labeled incidents, nulls skipped.
#[derive(Debug, Clone, Serialize)]
pub struct EvalSummary {
    pub incidents: usize,
    pub evaluated: usize,
    pub mean_precision_at_1: Option<f64>,
    pub mean_precision_at_3: Option<f64>,
    pub mean_mrr: Option<f64>,
    pub mean_time_to_detect_minutes: Option<f64>,
}

pub struct ReplayHarness {
    detector_config: DetectorConfig,
    grouper: IncidentGrouper,
    candidates: CandidateGenerator,
    extractor: FeatureExtractor,
    ranker: Arc<Ranker>,
}

impl ReplayHarness {
    pub fn new(config: &AppConfig, ranker: Arc<Ranker>) -> Self {
        Self {
            detector_config: DetectorConfig::from_settings(&config.detector),
            grouper: IncidentGrouper::from_settings(&config.grouper),
            candidates: CandidateGenerator::from_settings(&config.candidates),
            extractor: FeatureExtractor::new(),
            ranker,
        }
    }

    /// Replay one incident end to end and compute its evaluation metrics.
    pub async fn replay_incident(
        &self,
        incident_id: Uuid,
        catalog: &dyn ChangeCatalog,
        metric_store: &dyn MetricStore,
    ) -> PipelineResult<ReplayOutcome> {
        let incident = catalog
            .incident(incident_id)
            .await?
            .ok_or_else(|| PipelineError::Validation(format!("incident {incident_id} not found")))?;
        let truth = catalog.true_cause_suspect(incident_id).await?;
        if truth.is_none() {
            warn!(incident_id = %incident_id, "No true cause labeled for incident");
        }

        // Rebuild the detector state from stored metrics.
        let window_start = incident.start_ts - Duration::hours(REPLAY_LOOKBACK_HOURS);
        let points = metric_store
            .points_in_range(window_start, incident.end_ts)
            .await?;

        let mut detector = AnomalyDetector::new(self.detector_config.clone());
        detector.preload(&points);

        let keys: Vec<(String, String)> = detector
            .keys()
            .map(|(s, m)| (s.to_string(), m.to_string()))
            .collect();

        let mut detected: Vec<Anomaly> = Vec::new();
        for (service, metric) in &keys {
            for segment in detector.detect(service, metric) {
                detected.push(Anomaly::new(
                    service.clone(),
                    metric.clone(),
                    segment.start_ts,
                    segment.end_ts,
                    segment.max_z,
                ));
            }
        }
        info!(incident_id = %incident_id, count = detected.len(), "Replay detected anomalies");

        let time_to_detect_minutes = detected
            .iter()
            .map(|a| a.start_ts)
            .min()
            .map(|first| (first - incident.start_ts).num_milliseconds() as f64 / 60_000.0);

        let grouped = self.grouper.group(&detected);
        let Some(replayed) = grouped.first() else {
            return Ok(ReplayOutcome {
                incident_id,
                precision_at_1: truth.as_ref().map(|_| 0.0),
                precision_at_3: truth.as_ref().map(|_| 0.0),
                mrr: truth.as_ref().map(|_| 0.0),
                time_to_detect_minutes,
                num_anomalies: detected.len(),
                num_candidates: 0,
                num_suspects: 0,
            });
        };

        let affected: Vec<String> = detected
            .iter()
            .map(|a| a.service.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let candidates = self
            .candidates
            .generate(
                catalog,
                replayed.incident.start_ts,
                replayed.incident.end_ts,
                &affected,
            )
            .await?;

        let mut with_evidence = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let evidence = self
                .extractor
                .extract(
                    &candidate,
                    replayed.incident.start_ts,
                    replayed.incident.end_ts,
                    &affected,
                    metric_store,
                    catalog,
                )
                .await;
            with_evidence.push((candidate, evidence));
        }
        let num_candidates = with_evidence.len();
        let ranked = self.ranker.rank(with_evidence);

        let (precision_at_1, precision_at_3, mrr) = match &truth {
            Some(truth) => {
                let truth_rank = ranked
                    .iter()
                    .find(|r| matches_suspect(r.candidate.suspect_type, &r.candidate.suspect_key, truth.suspect_type, &truth.suspect_key))
                    .map(|r| r.rank);
                match truth_rank {
                    Some(rank) => (
                        Some(if rank == 1 { 1.0 } else { 0.0 }),
                        Some(if rank <= 3 { 1.0 } else { 0.0 }),
                        Some(1.0 / rank as f64),
                    ),
                    None => (Some(0.0), Some(0.0), Some(0.0)),
                }
            }
            None => (None, None, None),
        };

        Ok(ReplayOutcome {
            incident_id,
            precision_at_1,
            precision_at_3,
            mrr,
            time_to_detect_minutes,
            num_anomalies: detected.len(),
            num_candidates,
            num_suspects: ranked.len(),
        })
    }

    /// Replay every labeled incident and average the metrics.
    pub async fn evaluate(
        &self,
        catalog: &dyn ChangeCatalog,
        metric_store: &dyn MetricStore,
    ) -> PipelineResult<EvalSummary> {
        let incident_ids = catalog.labeled_incidents().await?;
        let mut outcomes = Vec::new();
        for incident_id in &incident_ids {
            match self.replay_incident(*incident_id, catalog, metric_store).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(incident_id = %incident_id, error = %e, "Replay failed, skipping incident");
                }
            }
        }

        Ok(EvalSummary {
            incidents: incident_ids.len(),
            evaluated: outcomes.len(),
            mean_precision_at_1: mean(outcomes.iter().filter_map(|o| o.precision_at_1)),
            mean_precision_at_3: mean(outcomes.iter().filter_map(|o| o.precision_at_3)),
            mean_mrr: mean(outcomes.iter().filter_map(|o| o.mrr)),
            mean_time_to_detect_minutes: mean(
                outcomes.iter().filter_map(|o| o.time_to_detect_minutes),
            ),
        })
    }
}

fn matches_suspect(
    candidate_type: SuspectType,
    candidate_key: &str,
    truth_type: SuspectType,
    truth_key: &str,
) -> bool {
    candidate_type == truth_type && candidate_key == truth_key
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        None
    } else {
        Some(collected.iter().sum::<f64>() / collected.len() as f64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use faultline_core::types::{Deployment, Incident, IncidentStatus, MetricPoint, Suspect};
    use faultline_storage::{MemoryCatalog, MemoryMetricStore};
    use std::collections::HashMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn point(offset_min: i64, value: f64) -> MetricPoint {
        MetricPoint {
            ts: t0() + Duration::minutes(offset_min),
            service: "payment".into(),
            metric: "p95_latency_ms".into(),
            value,
            tags: HashMap::new(),
        }
    }

    /// Seed stores with a latency spike incident caused by one deployment.
    async fn seed(catalog: &MemoryCatalog, store: &MemoryMetricStore) -> (Uuid, Uuid) {
        // Steady baseline, then 5 anomalous tail points.
        let mut points = Vec::new();
        for i in 0..60 {
            let value = if i % 2 == 0 { 49.0 } else { 51.0 };
            points.push(point(i, value));
        }
        for i in 60..65 {
            points.push(point(i, 200.0));
        }
        store.insert_points(&points).await.unwrap();

        let deployment = Deployment {
            id: Uuid::new_v4(),
            ts: t0() + Duration::minutes(45),
            service: "payment".into(),
            commit_sha: "deadbeef".into(),
            version: None,
            author: None,
            diff_summary: Some("lower db pool timeout".into()),
            links: None,
        };
        catalog.insert_deployment(&deployment).await.unwrap();

        let incident_id = Uuid::new_v4();
        let incident = Incident {
            id: incident_id,
            start_ts: t0() + Duration::minutes(60),
            end_ts: t0() + Duration::minutes(65),
            title: "Incident in payment".into(),
            status: IncidentStatus::Open,
            summary: None,
        };
        let anomaly = Anomaly::new(
            "payment".into(),
            "p95_latency_ms".into(),
            incident.start_ts,
            incident.end_ts,
            40.0,
        );
        catalog.insert_anomaly_if_new(&anomaly).await.unwrap();
        catalog
            .insert_incident_with_links(&incident, &[anomaly.id])
            .await
            .unwrap();

        // Persist the live pipeline's suspect and label it as the true cause.
        let suspect = Suspect {
            id: Uuid::new_v4(),
            incident_id,
            suspect_type: SuspectType::Deployment,
            suspect_key: deployment.id.to_string(),
            rank: 1,
            score: 5.0,
            evidence: serde_json::json!({"is_before_incident": 1.0}),
        };
        catalog
            .replace_suspects(incident_id, std::slice::from_ref(&suspect))
            .await
            .unwrap();
        catalog
            .upsert_label(incident_id, suspect.id, 1, Some("sre"), None)
            .await
            .unwrap();

        (incident_id, deployment.id)
    }

    #[tokio::test]
    async fn test_replay_finds_true_cause_at_rank_one() {
        let catalog = MemoryCatalog::new();
        let store = MemoryMetricStore::new();
        let (incident_id, _) = seed(&catalog, &store).await;

        let harness = ReplayHarness::new(&AppConfig::default(), Arc::new(Ranker::heuristic()));
        let outcome = harness
            .replay_incident(incident_id, &catalog, &store)
            .await
            .unwrap();

        assert!(outcome.num_anomalies >= 1);
        assert_eq!(outcome.num_suspects, 1);
        assert_eq!(outcome.precision_at_1, Some(1.0));
        assert_eq!(outcome.precision_at_3, Some(1.0));
        assert_eq!(outcome.mrr, Some(1.0));
        // Replay detects the same tail the live detector flagged.
        assert_eq!(outcome.time_to_detect_minutes, Some(0.0));
    }

    #[tokio::test]
    async fn test_replay_unknown_incident_is_validation_error() {
        let catalog = MemoryCatalog::new();
        let store = MemoryMetricStore::new();
        let harness = ReplayHarness::new(&AppConfig::default(), Arc::new(Ranker::heuristic()));
        let err = harness
            .replay_incident(Uuid::new_v4(), &catalog, &store)
            .await
            .expect_err("missing incident");
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_evaluate_aggregates_labeled_incidents() {
        let catalog = MemoryCatalog::new();
        let store = MemoryMetricStore::new();
        seed(&catalog, &store).await;

        let harness = ReplayHarness::new(&AppConfig::default(), Arc::new(Ranker::heuristic()));
        let summary = harness.evaluate(&catalog, &store).await.unwrap();

        assert_eq!(summary.incidents, 1);
        assert_eq!(summary.evaluated, 1);
        assert_eq!(summary.mean_precision_at_1, Some(1.0));
        assert_eq!(summary.mean_mrr, Some(1.0));
    }

    #[test]
    fn test_mean_skips_nothing_when_empty() {
        assert_eq!(mean(std::iter::empty()), None);
        assert_eq!(mean([1.0, 3.0].into_iter()), Some(2.0));
    }
}
