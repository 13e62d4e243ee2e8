//! In-memory store implementations backed by DashMap.
//!
//! Same API surface as the Postgres catalog and the ClickHouse store, used
//! for development and tests so the pipeline can run without live
//! dependencies.

use crate::catalog::ChangeCatalog;
use crate::metric_store::MetricStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use faultline_core::types::{
    Anomaly, ConfigChange, Deployment, FlagChange, Incident, IncidentStatus, LogEntry,
    MetricPoint, Suspect,
};
use faultline_core::PipelineResult;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct LabelRow {
    incident_id: Uuid,
    suspect_id: Uuid,
    label: i16,
    created_at: DateTime<Utc>,
}

/// Thread-safe in-memory change catalog.
#[derive(Default)]
pub struct MemoryCatalog {
    deployments: DashMap<Uuid, Deployment>,
    config_changes: DashMap<Uuid, ConfigChange>,
    flag_changes: DashMap<Uuid, FlagChange>,
    anomalies: DashMap<Uuid, Anomaly>,
    incidents: DashMap<Uuid, Incident>,
    links: Mutex<Vec<(Uuid, Uuid)>>,
    suspects: DashMap<Uuid, Suspect>,
    labels: Mutex<Vec<LabelRow>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn linked_anomaly_ids(&self) -> HashSet<Uuid> {
        self.links
            .lock()
            .expect("links mutex poisoned")
            .iter()
            .map(|(_, anomaly_id)| *anomaly_id)
            .collect()
    }

    /// Effective (latest) label per (incident, suspect) pair.
    fn effective_labels(&self) -> HashMap<(Uuid, Uuid), LabelRow> {
        let mut effective: HashMap<(Uuid, Uuid), LabelRow> = HashMap::new();
        for row in self.labels.lock().expect("labels mutex poisoned").iter() {
            let key = (row.incident_id, row.suspect_id);
            match effective.get(&key) {
                Some(existing) if existing.created_at >= row.created_at => {}
                _ => {
                    effective.insert(key, row.clone());
                }
            }
        }
        effective
    }
}

#[async_trait]
impl ChangeCatalog for MemoryCatalog {
    async fn insert_deployment(&self, deployment: &Deployment) -> PipelineResult<()> {
        self.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn insert_config_change(&self, change: &ConfigChange) -> PipelineResult<()> {
        self.config_changes.insert(change.id, change.clone());
        Ok(())
    }

    async fn insert_flag_change(&self, change: &FlagChange) -> PipelineResult<()> {
        self.flag_changes.insert(change.id, change.clone());
        Ok(())
    }

    async fn deployments_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<Deployment>> {
        let mut rows: Vec<Deployment> = self
            .deployments
            .iter()
            .filter(|e| {
                let d = e.value();
                d.ts >= start && d.ts <= end && services.contains(&d.service)
            })
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(rows)
    }

    async fn config_changes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<ConfigChange>> {
        let mut rows: Vec<ConfigChange> = self
            .config_changes
            .iter()
            .filter(|e| {
                let c = e.value();
                c.ts >= start && c.ts <= end && services.contains(&c.service)
            })
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(rows)
    }

    async fn flag_changes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<FlagChange>> {
        let mut rows: Vec<FlagChange> = self
            .flag_changes
            .iter()
            .filter(|e| {
                let f = e.value();
                f.ts >= start
                    && f.ts <= end
                    && f.service.as_ref().map_or(true, |s| services.contains(s))
            })
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(rows)
    }

    async fn insert_anomaly_if_new(&self, anomaly: &Anomaly) -> PipelineResult<bool> {
        let duplicate = self.anomalies.iter().any(|e| {
            let a = e.value();
            a.service == anomaly.service
                && a.metric == anomaly.metric
                && (a.start_ts - anomaly.start_ts).num_seconds().abs() <= 60
        });
        if duplicate {
            return Ok(false);
        }
        self.anomalies.insert(anomaly.id, anomaly.clone());
        Ok(true)
    }

    async fn ungrouped_anomalies_since(
        &self,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<Anomaly>> {
        let linked = self.linked_anomaly_ids();
        let mut rows: Vec<Anomaly> = self
            .anomalies
            .iter()
            .filter(|e| e.value().start_ts >= since && !linked.contains(&e.value().id))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| a.start_ts.cmp(&b.start_ts));
        Ok(rows)
    }

    async fn anomalies_for_incident(&self, incident_id: Uuid) -> PipelineResult<Vec<Anomaly>> {
        let ids: Vec<Uuid> = self
            .links
            .lock()
            .expect("links mutex poisoned")
            .iter()
            .filter(|(inc, _)| *inc == incident_id)
            .map(|(_, anom)| *anom)
            .collect();
        let mut rows: Vec<Anomaly> = ids
            .iter()
            .filter_map(|id| self.anomalies.get(id).map(|e| e.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.start_ts.cmp(&b.start_ts));
        Ok(rows)
    }

    async fn insert_incident_with_links(
        &self,
        incident: &Incident,
        anomaly_ids: &[Uuid],
    ) -> PipelineResult<bool> {
        if self.incidents.contains_key(&incident.id) {
            return Ok(false);
        }
        self.incidents.insert(incident.id, incident.clone());
        let mut links = self.links.lock().expect("links mutex poisoned");
        for anomaly_id in anomaly_ids {
            if !links.contains(&(incident.id, *anomaly_id)) {
                links.push((incident.id, *anomaly_id));
            }
        }
        Ok(true)
    }

    async fn incident(&self, id: Uuid) -> PipelineResult<Option<Incident>> {
        Ok(self.incidents.get(&id).map(|e| e.value().clone()))
    }

    async fn incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<Incident>> {
        let mut rows: Vec<Incident> = self
            .incidents
            .iter()
            .filter(|e| status.map_or(true, |s| e.value().status == s))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn affected_services(&self, incident_id: Uuid) -> PipelineResult<Vec<String>> {
        let anomalies = self.anomalies_for_incident(incident_id).await?;
        let mut services: Vec<String> = anomalies
            .into_iter()
            .map(|a| a.service)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        services.sort();
        Ok(services)
    }

    async fn count_service_incidents_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> PipelineResult<i64> {
        let links = self.links.lock().expect("links mutex poisoned").clone();
        let mut seen: HashSet<Uuid> = HashSet::new();
        for (incident_id, anomaly_id) in links {
            let incident_recent = self
                .incidents
                .get(&incident_id)
                .map_or(false, |i| i.value().start_ts >= since);
            let anomaly_matches = self
                .anomalies
                .get(&anomaly_id)
                .map_or(false, |a| a.value().service == service);
            if incident_recent && anomaly_matches {
                seen.insert(incident_id);
            }
        }
        Ok(seen.len() as i64)
    }

    async fn replace_suspects(
        &self,
        incident_id: Uuid,
        suspects: &[Suspect],
    ) -> PipelineResult<()> {
        self.suspects.retain(|_, s| s.incident_id != incident_id);
        for suspect in suspects {
            self.suspects.insert(suspect.id, suspect.clone());
        }
        Ok(())
    }

    async fn suspects(&self, incident_id: Uuid) -> PipelineResult<Vec<Suspect>> {
        let mut rows: Vec<Suspect> = self
            .suspects
            .iter()
            .filter(|e| e.value().incident_id == incident_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|s| s.rank);
        Ok(rows)
    }

    async fn suspect(&self, id: Uuid) -> PipelineResult<Option<Suspect>> {
        Ok(self.suspects.get(&id).map(|e| e.value().clone()))
    }

    async fn upsert_label(
        &self,
        incident_id: Uuid,
        suspect_id: Uuid,
        label: i16,
        _labeler: Option<&str>,
        _notes: Option<&str>,
    ) -> PipelineResult<()> {
        let mut labels = self.labels.lock().expect("labels mutex poisoned");
        let existing = labels
            .iter_mut()
            .filter(|l| l.incident_id == incident_id && l.suspect_id == suspect_id)
            .max_by_key(|l| l.created_at);
        match existing {
            Some(row) => {
                row.label = label;
                row.created_at = Utc::now();
            }
            None => labels.push(LabelRow {
                incident_id,
                suspect_id,
                label,
                created_at: Utc::now(),
            }),
        }
        Ok(())
    }

    async fn true_cause_suspect(&self, incident_id: Uuid) -> PipelineResult<Option<Suspect>> {
        let effective = self.effective_labels();
        for ((inc, suspect_id), row) in effective {
            if inc == incident_id && row.label == 1 {
                return Ok(self.suspects.get(&suspect_id).map(|e| e.value().clone()));
            }
        }
        Ok(None)
    }

    async fn labeled_incidents(&self) -> PipelineResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .labels
            .lock()
            .expect("labels mutex poisoned")
            .iter()
            .map(|l| l.incident_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn training_rows(&self) -> PipelineResult<Vec<(serde_json::Value, i16)>> {
        let effective = self.effective_labels();
        let mut rows = Vec::new();
        for ((_, suspect_id), label) in effective {
            if label.label != 0 && label.label != 1 {
                continue;
            }
            if let Some(suspect) = self.suspects.get(&suspect_id) {
                if !suspect.value().evidence.is_null() {
                    rows.push((suspect.value().evidence.clone(), label.label));
                }
            }
        }
        Ok(rows)
    }

    async fn ping(&self) -> PipelineResult<()> {
        Ok(())
    }
}

/// In-memory metric/log store for tests and replay fixtures.
#[derive(Default)]
pub struct MemoryMetricStore {
    points: Mutex<Vec<MetricPoint>>,
    logs: Mutex<Vec<LogEntry>>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn insert_points(&self, points: &[MetricPoint]) -> PipelineResult<()> {
        self.points
            .lock()
            .expect("points mutex poisoned")
            .extend_from_slice(points);
        Ok(())
    }

    async fn insert_logs(&self, entries: &[LogEntry]) -> PipelineResult<()> {
        self.logs
            .lock()
            .expect("logs mutex poisoned")
            .extend_from_slice(entries);
        Ok(())
    }

    async fn points_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<MetricPoint>> {
        let mut rows: Vec<MetricPoint> = self
            .points
            .lock()
            .expect("points mutex poisoned")
            .iter()
            .filter(|p| p.ts >= start && p.ts <= end)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.service.as_str(), a.metric.as_str(), a.ts).cmp(&(
                b.service.as_str(),
                b.metric.as_str(),
                b.ts,
            ))
        });
        Ok(rows)
    }

    async fn avg_by_metric(
        &self,
        service: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_end: bool,
    ) -> PipelineResult<HashMap<String, f64>> {
        let mut sums: HashMap<String, (f64, u64)> = HashMap::new();
        for p in self.points.lock().expect("points mutex poisoned").iter() {
            let in_window = p.ts >= start && if include_end { p.ts <= end } else { p.ts < end };
            if p.service == service && in_window {
                let entry = sums.entry(p.metric.clone()).or_insert((0.0, 0));
                entry.0 += p.value;
                entry.1 += 1;
            }
        }
        Ok(sums
            .into_iter()
            .map(|(metric, (sum, count))| (metric, sum / count as f64))
            .collect())
    }

    async fn count_logs(
        &self,
        service: &str,
        level: &str,
        event: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_end: bool,
    ) -> PipelineResult<u64> {
        let count = self
            .logs
            .lock()
            .expect("logs mutex poisoned")
            .iter()
            .filter(|e| {
                let in_window =
                    e.ts >= start && if include_end { e.ts <= end } else { e.ts < end };
                e.service == service
                    && e.level == level
                    && in_window
                    && event.map_or(true, |ev| e.event.as_deref() == Some(ev))
            })
            .count();
        Ok(count as u64)
    }

    async fn ping(&self) -> PipelineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn anomaly_at(service: &str, metric: &str, start: DateTime<Utc>) -> Anomaly {
        Anomaly::new(
            service.to_string(),
            metric.to_string(),
            start,
            start + Duration::minutes(4),
            10.0,
        )
    }

    #[tokio::test]
    async fn test_anomaly_dedup_within_60s() {
        let catalog = MemoryCatalog::new();
        let t0 = Utc::now();

        let first = anomaly_at("payment", "p95_latency_ms", t0);
        assert!(catalog.insert_anomaly_if_new(&first).await.unwrap());

        let near = anomaly_at("payment", "p95_latency_ms", t0 + Duration::seconds(45));
        assert!(!catalog.insert_anomaly_if_new(&near).await.unwrap());

        let far = anomaly_at("payment", "p95_latency_ms", t0 + Duration::seconds(120));
        assert!(catalog.insert_anomaly_if_new(&far).await.unwrap());

        let other_metric = anomaly_at("payment", "error_rate", t0);
        assert!(catalog.insert_anomaly_if_new(&other_metric).await.unwrap());
    }

    #[tokio::test]
    async fn test_ungrouped_excludes_linked() {
        let catalog = MemoryCatalog::new();
        let t0 = Utc::now();

        let a = anomaly_at("order", "error_rate", t0);
        let b = anomaly_at("order", "qps", t0 + Duration::minutes(2));
        catalog.insert_anomaly_if_new(&a).await.unwrap();
        catalog.insert_anomaly_if_new(&b).await.unwrap();

        let incident = Incident {
            id: Uuid::new_v4(),
            start_ts: a.start_ts,
            end_ts: a.end_ts,
            title: "Incident in order".into(),
            status: IncidentStatus::Open,
            summary: None,
        };
        catalog
            .insert_incident_with_links(&incident, &[a.id])
            .await
            .unwrap();

        let ungrouped = catalog
            .ungrouped_anomalies_since(t0 - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(ungrouped.len(), 1);
        assert_eq!(ungrouped[0].id, b.id);
    }

    #[tokio::test]
    async fn test_incident_insert_is_idempotent() {
        let catalog = MemoryCatalog::new();
        let t0 = Utc::now();
        let a = anomaly_at("order", "error_rate", t0);
        catalog.insert_anomaly_if_new(&a).await.unwrap();

        let incident = Incident {
            id: Uuid::new_v4(),
            start_ts: a.start_ts,
            end_ts: a.end_ts,
            title: "Incident in order".into(),
            status: IncidentStatus::Open,
            summary: None,
        };
        assert!(catalog
            .insert_incident_with_links(&incident, &[a.id])
            .await
            .unwrap());
        assert!(!catalog
            .insert_incident_with_links(&incident, &[a.id])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_replace_suspects_is_atomic_swap() {
        let catalog = MemoryCatalog::new();
        let incident_id = Uuid::new_v4();

        let make = |rank: i32, key: &str| Suspect {
            id: Uuid::new_v4(),
            incident_id,
            suspect_type: faultline_core::types::SuspectType::Deployment,
            suspect_key: key.to_string(),
            rank,
            score: 5.0 - rank as f64,
            evidence: serde_json::json!({"is_before_incident": 1.0}),
        };

        catalog
            .replace_suspects(incident_id, &[make(1, "dep-a"), make(2, "dep-b")])
            .await
            .unwrap();
        catalog
            .replace_suspects(incident_id, &[make(1, "dep-c")])
            .await
            .unwrap();

        let suspects = catalog.suspects(incident_id).await.unwrap();
        assert_eq!(suspects.len(), 1);
        assert_eq!(suspects[0].suspect_key, "dep-c");
    }

    #[tokio::test]
    async fn test_latest_label_wins() {
        let catalog = MemoryCatalog::new();
        let incident_id = Uuid::new_v4();
        let suspect = Suspect {
            id: Uuid::new_v4(),
            incident_id,
            suspect_type: faultline_core::types::SuspectType::Config,
            suspect_key: "cfg-1".into(),
            rank: 1,
            score: 3.0,
            evidence: serde_json::json!({"is_before_incident": 1.0}),
        };
        catalog
            .replace_suspects(incident_id, std::slice::from_ref(&suspect))
            .await
            .unwrap();

        catalog
            .upsert_label(incident_id, suspect.id, 0, Some("sre"), None)
            .await
            .unwrap();
        assert!(catalog.true_cause_suspect(incident_id).await.unwrap().is_none());

        catalog
            .upsert_label(incident_id, suspect.id, 1, Some("sre"), None)
            .await
            .unwrap();
        let cause = catalog.true_cause_suspect(incident_id).await.unwrap();
        assert_eq!(cause.map(|s| s.id), Some(suspect.id));

        let rows = catalog.training_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, 1);
    }

    #[tokio::test]
    async fn test_avg_by_metric_window_bounds() {
        let store = MemoryMetricStore::new();
        let t0 = Utc::now();
        let mk = |offset: i64, value: f64| MetricPoint {
            ts: t0 + Duration::minutes(offset),
            service: "payment".into(),
            metric: "p95_latency_ms".into(),
            value,
            tags: HashMap::new(),
        };
        store
            .insert_points(&[mk(0, 10.0), mk(5, 20.0), mk(10, 90.0)])
            .await
            .unwrap();

        // Half-open: excludes the point at the end bound.
        let avgs = store
            .avg_by_metric("payment", t0, t0 + Duration::minutes(10), false)
            .await
            .unwrap();
        assert_eq!(avgs["p95_latency_ms"], 15.0);

        // Inclusive end picks up the last point.
        let avgs = store
            .avg_by_metric("payment", t0, t0 + Duration::minutes(10), true)
            .await
            .unwrap();
        assert_eq!(avgs["p95_latency_ms"], 40.0);
    }
}
