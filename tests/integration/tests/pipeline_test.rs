//! End-to-end pipeline tests over the in-memory store, broker, and activity
//! implementations: detect → group → candidates → features → rank → persist,
//! plus label-driven retraining and offline replay parity.

use chrono::{DateTime, Duration, Utc};
use faultline_core::activity::{capture_sink, EventType};
use faultline_core::config::AppConfig;
use faultline_core::features::MODEL_FEATURES;
use faultline_core::topics;
use faultline_core::types::{
    Anomaly, Deployment, MetricPoint, Suspect, SuspectType,
};
use faultline_detector::{AnomalyDetector, DetectorConfig, IncidentGrouper};
use faultline_rca::{train, CandidateGenerator, FeatureExtractor, Ranker, TrainOptions};
use faultline_replay::ReplayHarness;
use faultline_storage::{ChangeCatalog, MemoryCatalog, MemoryMetricStore, MetricStore};
use faultline_workers::{
    Broker, DetectorWorker, MemoryBroker, PipelineCoordinator, RcaWorker, RunRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn point(ts: DateTime<Utc>, service: &str, metric: &str, value: f64) -> MetricPoint {
    MetricPoint {
        ts,
        service: service.to_string(),
        metric: metric.to_string(),
        value,
        tags: HashMap::new(),
    }
}

/// 60 steady latency points ending `offset_end` minutes before `end`.
fn steady_series(end: DateTime<Utc>, service: &str) -> Vec<MetricPoint> {
    (0..60)
        .map(|i| {
            let value = if i % 2 == 0 { 49.0 } else { 51.0 };
            point(end - Duration::minutes(64 - i), service, "p95_latency_ms", value)
        })
        .collect()
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_streaming_detect_group_rank_with_fallback() {
    let catalog = Arc::new(MemoryCatalog::new());
    let metric_store = Arc::new(MemoryMetricStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let activity = capture_sink();
    let registry = Arc::new(RunRegistry::new());
    let config = AppConfig::default();

    // Baseline already in the store; the worker warms up from it.
    let now = Utc::now();
    metric_store
        .insert_points(&steady_series(now, "payment"))
        .await
        .expect("seed baseline");

    let detector = DetectorWorker::new(
        &config,
        catalog.clone(),
        metric_store.clone(),
        broker.clone(),
        activity.clone(),
    );
    let rca = RcaWorker::new(
        &config,
        Arc::new(Ranker::heuristic()),
        catalog.clone(),
        metric_store.clone(),
        broker.clone(),
        activity.clone(),
        registry.clone(),
    );
    let coordinator = PipelineCoordinator::start(detector, rca).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Five anomalous points over consecutive minutes.
    for i in 0..5 {
        let spike = point(
            now - Duration::minutes(4 - i),
            "payment",
            "p95_latency_ms",
            120.0,
        );
        broker
            .publish(
                topics::METRICS_RAW,
                serde_json::to_vec(&spike).expect("encode"),
            )
            .await
            .expect("publish");
    }

    // Detector persists one deduplicated anomaly and the grouper opens an
    // incident; the RCA worker then ranks the SERVICE fallback.
    wait_for("suspects to be persisted", || {
        let catalog = catalog.clone();
        async move {
            let incidents = catalog.incidents(None, 10).await.expect("incidents");
            match incidents.first() {
                Some(incident) => !catalog
                    .suspects(incident.id)
                    .await
                    .expect("suspects")
                    .is_empty(),
                None => false,
            }
        }
    })
    .await;

    let incidents = catalog.incidents(None, 10).await.expect("incidents");
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.title, "Incident in payment");

    let anomalies = catalog
        .anomalies_for_incident(incident.id)
        .await
        .expect("anomalies");
    assert_eq!(anomalies.len(), 1, "±60 s dedup must leave one anomaly");
    assert!(anomalies[0].score >= 35.0);
    assert_eq!(anomalies[0].detector, "robust_zscore");

    let suspects = catalog.suspects(incident.id).await.expect("suspects");
    assert_eq!(suspects.len(), 1);
    assert_eq!(suspects[0].suspect_type, SuspectType::Service);
    assert_eq!(suspects[0].suspect_key, "service_payment");
    assert_eq!(suspects[0].rank, 1);
    assert_eq!(
        suspects[0].evidence["minutes_before_incident"].as_f64(),
        Some(30.0)
    );

    // The run registry returns to Idle once the run is persisted; activity
    // events are all emitted by then.
    let incident_id = incident.id;
    wait_for("rca run to return to idle", || {
        let registry = registry.clone();
        async move { !registry.in_progress(incident_id) }
    })
    .await;

    assert!(activity.count_type(EventType::AnomalyDetected) >= 1);
    assert_eq!(activity.count_type(EventType::IncidentCreated), 1);
    assert_eq!(activity.count_type(EventType::SuspectsGenerated), 1);
    assert_eq!(activity.count_type(EventType::RcaCompleted), 1);

    coordinator.shutdown().await;
}

/// Run the live RCA composition directly against the stores for one
/// incident id, returning the persisted suspects.
async fn run_live_rca(
    catalog: &MemoryCatalog,
    metric_store: &MemoryMetricStore,
    ranker: &Ranker,
    incident_id: Uuid,
) -> Vec<Suspect> {
    let incident = catalog
        .incident(incident_id)
        .await
        .expect("incident read")
        .expect("incident exists");
    let affected = catalog
        .affected_services(incident_id)
        .await
        .expect("affected services");

    let generator = CandidateGenerator::new(2, 0);
    let extractor = FeatureExtractor::new();
    let candidates = generator
        .generate(catalog, incident.start_ts, incident.end_ts, &affected)
        .await
        .expect("candidates");

    let mut with_evidence = Vec::new();
    for candidate in candidates {
        let evidence = extractor
            .extract(
                &candidate,
                incident.start_ts,
                incident.end_ts,
                &affected,
                metric_store,
                catalog,
            )
            .await;
        with_evidence.push((candidate, evidence));
    }

    let suspects: Vec<Suspect> = ranker
        .rank(with_evidence)
        .into_iter()
        .map(|r| Suspect {
            id: Uuid::new_v4(),
            incident_id,
            suspect_type: r.candidate.suspect_type,
            suspect_key: r.candidate.suspect_key,
            rank: r.rank,
            score: r.score,
            evidence: r.evidence.to_json(),
        })
        .collect();
    catalog
        .replace_suspects(incident_id, &suspects)
        .await
        .expect("persist suspects");
    suspects
}

/// Detect and group from stored metrics, persisting the first incident.
async fn detect_and_persist_incident(
    catalog: &MemoryCatalog,
    metric_store: &MemoryMetricStore,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Uuid {
    let points = metric_store
        .points_in_range(window_start, window_end)
        .await
        .expect("points");
    let mut detector = AnomalyDetector::new(DetectorConfig::default());
    detector.preload(&points);

    let keys: Vec<(String, String)> = detector
        .keys()
        .map(|(s, m)| (s.to_string(), m.to_string()))
        .collect();
    let mut anomalies = Vec::new();
    for (service, metric) in keys {
        for segment in detector.detect(&service, &metric) {
            let anomaly = Anomaly::new(
                service.clone(),
                metric.clone(),
                segment.start_ts,
                segment.end_ts,
                segment.max_z,
            );
            if catalog
                .insert_anomaly_if_new(&anomaly)
                .await
                .expect("insert anomaly")
            {
                anomalies.push(anomaly);
            }
        }
    }
    assert!(!anomalies.is_empty(), "detection should find the seeded spike");

    let grouper = IncidentGrouper::new(10);
    let grouped = grouper.group(&anomalies);
    let first = grouped.first().expect("one incident");
    catalog
        .insert_incident_with_links(&first.incident, &first.anomaly_ids)
        .await
        .expect("persist incident");
    first.incident.id
}

#[tokio::test]
async fn test_ranked_deployment_and_rank_contiguity() {
    let catalog = MemoryCatalog::new();
    let metric_store = MemoryMetricStore::new();

    let now = Utc::now();
    metric_store
        .insert_points(&steady_series(now, "payment"))
        .await
        .expect("baseline");
    for i in 0..5 {
        metric_store
            .insert_points(&[point(
                now - Duration::minutes(4 - i),
                "payment",
                "p95_latency_ms",
                160.0,
            )])
            .await
            .expect("spike");
    }

    let incident_id =
        detect_and_persist_incident(&catalog, &metric_store, now - Duration::hours(2), now).await;
    let incident = catalog
        .incident(incident_id)
        .await
        .expect("read")
        .expect("exists");

    // A deployment with a suspicious diff 20 minutes before the incident,
    // plus an unrelated flag flip.
    catalog
        .insert_deployment(&Deployment {
            id: Uuid::new_v4(),
            ts: incident.start_ts - Duration::minutes(20),
            service: "payment".into(),
            commit_sha: "feedc0de".into(),
            version: Some("2.1.0".into()),
            author: Some("dev@example.com".into()),
            diff_summary: Some("shrink db connection pool, add retry".into()),
            links: None,
        })
        .await
        .expect("deployment");
    catalog
        .insert_flag_change(&faultline_core::types::FlagChange {
            id: Uuid::new_v4(),
            ts: incident.start_ts + Duration::minutes(2),
            flag_name: "dark_mode".into(),
            service: None,
            old_state: None,
            new_state: None,
        })
        .await
        .expect("flag");

    let ranker = Ranker::heuristic();
    let suspects = run_live_rca(&catalog, &metric_store, &ranker, incident_id).await;

    assert_eq!(suspects.len(), 2);
    let ranks: Vec<i32> = suspects.iter().map(|s| s.rank).collect();
    assert_eq!(ranks, vec![1, 2]);
    assert_eq!(suspects[0].suspect_type, SuspectType::Deployment);
    assert!(suspects[0].score > suspects[1].score);
    // Evidence is persisted with the suspect.
    assert_eq!(suspects[0].evidence["diff_keyword_hit"].as_f64(), Some(1.0));
}

#[tokio::test]
async fn test_rerun_rca_is_idempotent() {
    let catalog = MemoryCatalog::new();
    let metric_store = MemoryMetricStore::new();

    let now = Utc::now();
    metric_store
        .insert_points(&steady_series(now, "order"))
        .await
        .expect("baseline");
    for i in 0..5 {
        metric_store
            .insert_points(&[point(
                now - Duration::minutes(4 - i),
                "order",
                "p95_latency_ms",
                140.0,
            )])
            .await
            .expect("spike");
    }
    let incident_id =
        detect_and_persist_incident(&catalog, &metric_store, now - Duration::hours(2), now).await;

    let ranker = Ranker::heuristic();
    let first = run_live_rca(&catalog, &metric_store, &ranker, incident_id).await;
    let second = run_live_rca(&catalog, &metric_store, &ranker, incident_id).await;

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_ne!(a.id, b.id, "fresh rows on every run");
        assert_eq!(a.suspect_type, b.suspect_type);
        assert_eq!(a.suspect_key, b.suspect_key);
        assert_eq!(a.rank, b.rank);
        assert_eq!(a.score, b.score);
        assert_eq!(a.evidence, b.evidence);
    }
}

#[tokio::test]
async fn test_replay_matches_live_ranking() {
    let catalog = MemoryCatalog::new();
    let metric_store = MemoryMetricStore::new();

    let now = Utc::now();
    metric_store
        .insert_points(&steady_series(now, "payment"))
        .await
        .expect("baseline");
    for i in 0..5 {
        metric_store
            .insert_points(&[point(
                now - Duration::minutes(4 - i),
                "payment",
                "p95_latency_ms",
                150.0,
            )])
            .await
            .expect("spike");
    }
    let incident_id =
        detect_and_persist_incident(&catalog, &metric_store, now - Duration::hours(2), now).await;

    catalog
        .insert_deployment(&Deployment {
            id: Uuid::new_v4(),
            ts: now - Duration::minutes(30),
            service: "payment".into(),
            commit_sha: "0ddba11".into(),
            version: None,
            author: None,
            diff_summary: Some("raise cache ttl".into()),
            links: None,
        })
        .await
        .expect("deployment");

    let ranker = Arc::new(Ranker::heuristic());
    let live = run_live_rca(&catalog, &metric_store, &ranker, incident_id).await;

    // Label the top suspect as the true cause.
    catalog
        .upsert_label(incident_id, live[0].id, 1, Some("sre"), None)
        .await
        .expect("label");

    let harness = ReplayHarness::new(&AppConfig::default(), ranker);
    let outcome = harness
        .replay_incident(incident_id, &catalog, &metric_store)
        .await
        .expect("replay");

    assert_eq!(outcome.num_suspects, live.len());
    assert_eq!(outcome.precision_at_1, Some(1.0));
    assert_eq!(outcome.mrr, Some(1.0));

    let summary = harness
        .evaluate(&catalog, &metric_store)
        .await
        .expect("evaluate");
    assert_eq!(summary.evaluated, 1);
    assert_eq!(summary.mean_precision_at_1, Some(1.0));
}

#[tokio::test]
async fn test_label_and_retrain_switches_to_learned_scores() {
    let catalog = MemoryCatalog::new();

    // Twelve labeled suspects across twelve incidents, one positive each
    // third incident.
    for i in 0..12 {
        let incident_id = Uuid::new_v4();
        let suspect_id = Uuid::new_v4();
        let positive = i % 3 == 0;
        let evidence = if positive {
            serde_json::json!({
                "is_before_incident": 1.0,
                "time_proximity_score": 0.8,
                "minutes_before_incident": 12.0,
                "metric_delta_count": 2.0,
                "max_metric_delta": 1.5,
                "avg_metric_delta": 0.9,
                "error_log_delta": 6.0,
                "new_error_signature": 1.0,
                "diff_keyword_hit": 1.0,
                "diff_keyword_count": 3.0,
                "service_incident_rate_30d": 1.0,
            })
        } else {
            serde_json::json!({
                "is_before_incident": 0.0,
                "time_proximity_score": 0.1,
                "minutes_before_incident": -25.0,
                "metric_delta_count": 0.0,
                "max_metric_delta": 0.0,
                "avg_metric_delta": 0.0,
                "error_log_delta": 0.0,
                "new_error_signature": 0.0,
                "diff_keyword_hit": 0.0,
                "diff_keyword_count": 0.0,
                "service_incident_rate_30d": 0.0,
            })
        };
        let suspect = Suspect {
            id: suspect_id,
            incident_id,
            suspect_type: SuspectType::Deployment,
            suspect_key: format!("dep-{i}"),
            rank: 1,
            score: 0.0,
            evidence,
        };
        catalog
            .replace_suspects(incident_id, std::slice::from_ref(&suspect))
            .await
            .expect("suspect");
        catalog
            .upsert_label(incident_id, suspect_id, i16::from(positive), Some("sre"), None)
            .await
            .expect("label");
    }

    let artifact = std::env::temp_dir().join(format!("pipeline-ranker-{}.json", Uuid::new_v4()));
    let report = train(
        &catalog,
        &TrainOptions {
            artifact_path: artifact.clone(),
            ..TrainOptions::default()
        },
    )
    .await
    .expect("training");
    assert_eq!(report.rows, 12);

    // The artifact carries the 11-name contract order.
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&artifact).expect("artifact"))
            .expect("artifact json");
    assert_eq!(
        raw["feature_names"].as_array().map(Vec::len),
        Some(MODEL_FEATURES.len())
    );

    // Restarting the ranker picks the model up; learned scores live on a
    // probability scale, unlike the heuristic's 0..10 range.
    let ranker = Ranker::new(&artifact);
    assert!(ranker.is_learned());

    let candidate = faultline_core::types::Candidate {
        suspect_type: SuspectType::Deployment,
        suspect_key: "dep-fresh".into(),
        ts: Utc::now(),
        service: Some("payment".into()),
        metadata: serde_json::json!({}),
    };
    let mut evidence = faultline_core::features::Evidence::new();
    evidence.set("is_before_incident", 1.0);
    evidence.set("minutes_before_incident", 5.0);
    evidence.set("max_metric_delta", 1.5);
    evidence.set("new_error_signature", 1.0);

    let heuristic = faultline_rca::ranker::heuristic_score(&evidence);
    let learned = ranker.rank(vec![(candidate, evidence)]);
    assert!(learned[0].score > 0.0 && learned[0].score < 1.0);
    assert!(heuristic > 1.0, "heuristic scale differs from probabilities");

    std::fs::remove_file(&artifact).ok();
}
