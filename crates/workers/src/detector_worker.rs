//! Metrics consumer: drives the streaming detector and the incident grouper.
//!
//! Owns the per-key buffer map (single writer). Each message is processed to
//! completion before the next is polled; deterministic parse failures are
//! counted and skipped.

use crate::broker::Broker;
use crate::retry::with_retry;
use chrono::{Duration, Utc};
use faultline_core::activity::{ActivityEvent, ActivitySink, EventType};
use faultline_core::config::AppConfig;
use faultline_core::topics;
use faultline_core::types::{Anomaly, AnomalyDetectedMsg, MetricPoint, RcaRequestMsg};
use faultline_core::PipelineResult;
use faultline_detector::{AnomalyDetector, AnomalySegment, DetectorConfig, IncidentGrouper};
use faultline_storage::{ChangeCatalog, MetricStore};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

pub struct DetectorWorker {
    detector: AnomalyDetector,
    grouper: IncidentGrouper,
    catalog: Arc<dyn ChangeCatalog>,
    metric_store: Arc<dyn MetricStore>,
    broker: Arc<dyn Broker>,
    activity: Arc<dyn ActivitySink>,
}

impl DetectorWorker {
    pub fn new(
        config: &AppConfig,
        catalog: Arc<dyn ChangeCatalog>,
        metric_store: Arc<dyn MetricStore>,
        broker: Arc<dyn Broker>,
        activity: Arc<dyn ActivitySink>,
    ) -> Self {
        Self {
            detector: AnomalyDetector::new(DetectorConfig::from_settings(&config.detector)),
            grouper: IncidentGrouper::from_settings(&config.grouper),
            catalog,
            metric_store,
            broker,
            activity,
        }
    }

    /// Seed buffers from the last hour of stored metrics. Best-effort: on
    /// failure the detector builds state from live traffic instead.
    pub async fn warmup(&mut self) {
        let now = Utc::now();
        match self
            .metric_store
            .points_in_range(now - Duration::hours(1), now)
            .await
        {
            Ok(points) => {
                info!(count = points.len(), "Loaded historical metrics into detector buffers");
                self.detector.preload(&points);
            }
            Err(e) => {
                warn!(error = %e, "Failed to load historical metrics, starting with empty buffers");
            }
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = match self
            .broker
            .subscribe(topics::METRICS_RAW, topics::DETECTOR_GROUP)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "Detector worker failed to subscribe");
                return;
            }
        };

        info!("Detector worker started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => match msg {
                    Some(payload) => {
                        let point: MetricPoint = match serde_json::from_slice(&payload) {
                            Ok(point) => point,
                            Err(e) => {
                                // Deterministic parse failure: skip and record.
                                metrics::counter!("detector.parse_errors").increment(1);
                                warn!(error = %e, "Skipping malformed metric point");
                                continue;
                            }
                        };
                        self.handle_point(point).await;
                    }
                    None => {
                        warn!("Metrics subscription ended");
                        break;
                    }
                }
            }
        }

        info!("Detector worker stopped");
    }

    async fn handle_point(&mut self, point: MetricPoint) {
        metrics::counter!("detector.points").increment(1);
        let segments = self.detector.observe(&point);
        for segment in segments {
            if let Err(e) = self
                .persist_segment(&point.service, &point.metric, &segment)
                .await
            {
                error!(
                    service = %point.service,
                    metric = %point.metric,
                    error = %e,
                    "Failed to persist anomaly"
                );
            }
        }
    }

    async fn persist_segment(
        &self,
        service: &str,
        metric: &str,
        segment: &AnomalySegment,
    ) -> PipelineResult<()> {
        let anomaly = Anomaly::new(
            service.to_string(),
            metric.to_string(),
            segment.start_ts,
            segment.end_ts,
            segment.max_z,
        );

        let inserted = with_retry("insert_anomaly", || {
            self.catalog.insert_anomaly_if_new(&anomaly)
        })
        .await?;
        if !inserted {
            return Ok(());
        }

        metrics::counter!("detector.anomalies").increment(1);
        info!(
            service = %service,
            metric = %metric,
            start_ts = %anomaly.start_ts,
            score = anomaly.score,
            "Detected anomaly"
        );

        let msg = AnomalyDetectedMsg {
            id: anomaly.id,
            service: anomaly.service.clone(),
            metric: anomaly.metric.clone(),
            start_ts: anomaly.start_ts,
            end_ts: anomaly.end_ts,
            score: anomaly.score,
        };
        if let Err(e) = self
            .broker
            .publish(topics::ANOMALIES_DETECTED, serde_json::to_vec(&msg)?)
            .await
        {
            warn!(error = %e, "Failed to publish anomaly event");
        }

        self.activity.emit(ActivityEvent::new(
            EventType::AnomalyDetected,
            Some(service.to_string()),
            format!("Anomaly detected: {} (score: {:.2})", metric, anomaly.score),
            serde_json::json!({
                "metric": metric,
                "score": anomaly.score,
                "anomaly_id": anomaly.id,
            }),
        ));

        self.group_pass().await
    }

    /// Fold the last hour of ungrouped anomalies into incidents and enqueue
    /// an RCA request per new incident.
    async fn group_pass(&self) -> PipelineResult<()> {
        let since = Utc::now() - Duration::hours(1);
        let ungrouped = with_retry("ungrouped_anomalies", || {
            self.catalog.ungrouped_anomalies_since(since)
        })
        .await?;
        if ungrouped.is_empty() {
            return Ok(());
        }

        for grouped in self.grouper.group(&ungrouped) {
            let created = with_retry("insert_incident", || {
                self.catalog
                    .insert_incident_with_links(&grouped.incident, &grouped.anomaly_ids)
            })
            .await?;
            if !created {
                continue;
            }

            metrics::counter!("detector.incidents").increment(1);
            info!(
                incident_id = %grouped.incident.id,
                title = %grouped.incident.title,
                "Created incident"
            );

            let request = RcaRequestMsg {
                incident_id: grouped.incident.id,
                start_ts: grouped.incident.start_ts,
                end_ts: grouped.incident.end_ts,
            };
            if let Err(e) = self
                .broker
                .publish(topics::RCA_REQUESTS, serde_json::to_vec(&request)?)
                .await
            {
                warn!(error = %e, "Failed to enqueue RCA request");
            }

            let services: Vec<&String> = grouped.services.iter().collect();
            self.activity.emit(ActivityEvent::new(
                EventType::IncidentCreated,
                services.first().map(|s| s.to_string()),
                format!("Incident created: {}", grouped.incident.title),
                serde_json::json!({
                    "incident_id": grouped.incident.id,
                    "affected_services": grouped.services,
                }),
            ));
        }

        Ok(())
    }
}
