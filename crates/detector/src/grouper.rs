//! Temporal grouping of anomalies into incidents.

use chrono::Duration;
use faultline_core::config::GrouperSettings;
use faultline_core::types::{Anomaly, Incident, IncidentStatus};
use std::collections::BTreeSet;
use uuid::Uuid;

/// An incident assembled from a fold over time-ordered anomalies, before it
/// is persisted.
#[derive(Debug, Clone)]
pub struct GroupedIncident {
    pub incident: Incident,
    pub anomaly_ids: Vec<Uuid>,
    pub services: BTreeSet<String>,
}

pub struct IncidentGrouper {
    gap_minutes: i64,
}

impl IncidentGrouper {
    pub fn new(gap_minutes: i64) -> Self {
        Self { gap_minutes }
    }

    pub fn from_settings(settings: &GrouperSettings) -> Self {
        Self::new(settings.gap_minutes)
    }

    /// Fold anomalies (ascending by start_ts) into incidents. An anomaly
    /// joins the open incident when it starts within `gap_minutes` of the
    /// incident's end, or when its service is already represented
    /// (cross-metric extension). The incident's end only ever grows.
    pub fn group(&self, anomalies: &[Anomaly]) -> Vec<GroupedIncident> {
        if anomalies.is_empty() {
            return Vec::new();
        }

        let mut sorted: Vec<&Anomaly> = anomalies.iter().collect();
        sorted.sort_by_key(|a| a.start_ts);

        let gap = Duration::minutes(self.gap_minutes);
        let mut incidents: Vec<GroupedIncident> = Vec::new();
        let mut open: Option<GroupedIncident> = None;

        for anomaly in sorted {
            let joins_open = match open.as_mut() {
                None => false,
                Some(current) => {
                    let within_gap = anomaly.start_ts - current.incident.end_ts <= gap;
                    let known_service = current.services.contains(&anomaly.service);

                    if within_gap || known_service {
                        current.incident.end_ts =
                            current.incident.end_ts.max(anomaly.end_ts);
                        current.anomaly_ids.push(anomaly.id);
                        current.services.insert(anomaly.service.clone());
                        if current.services.len() > 1 {
                            current.incident.title = format!(
                                "Incident affecting {}",
                                current
                                    .services
                                    .iter()
                                    .cloned()
                                    .collect::<Vec<_>>()
                                    .join(", ")
                            );
                        }
                        true
                    } else {
                        false
                    }
                }
            };

            if !joins_open {
                if let Some(closed) = open.take() {
                    incidents.push(closed);
                }
                open = Some(seed(anomaly));
            }
        }

        if let Some(current) = open {
            incidents.push(current);
        }
        incidents
    }
}

fn seed(anomaly: &Anomaly) -> GroupedIncident {
    GroupedIncident {
        incident: Incident {
            id: Uuid::new_v4(),
            start_ts: anomaly.start_ts,
            end_ts: anomaly.end_ts,
            title: format!("Incident in {}", anomaly.service),
            status: IncidentStatus::Open,
            summary: None,
        },
        anomaly_ids: vec![anomaly.id],
        services: BTreeSet::from([anomaly.service.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).single().expect("valid ts")
    }

    fn anomaly(service: &str, start_min: i64, end_min: i64) -> Anomaly {
        Anomaly::new(
            service.to_string(),
            "p95_latency_ms".to_string(),
            t0() + Duration::minutes(start_min),
            t0() + Duration::minutes(end_min),
            8.0,
        )
    }

    #[test]
    fn test_gap_within_limit_merges() {
        let grouper = IncidentGrouper::new(10);
        // ends at t+5, next starts at t+13 (gap 8 min) -> one incident;
        // third at t+38 (gap > 10 from t+18) -> second incident
        let anomalies = vec![
            anomaly("payment", 0, 5),
            anomaly("payment", 13, 18),
            anomaly("payment", 38, 40),
        ];
        let incidents = grouper.group(&anomalies);
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].anomaly_ids.len(), 2);
        assert_eq!(incidents[0].incident.end_ts, t0() + Duration::minutes(18));
        assert_eq!(incidents[1].anomaly_ids.len(), 1);
    }

    #[test]
    fn test_cross_service_title() {
        let grouper = IncidentGrouper::new(10);
        let anomalies = vec![anomaly("order", 0, 4), anomaly("payment", 2, 6)];
        let incidents = grouper.group(&anomalies);
        assert_eq!(incidents.len(), 1);
        assert_eq!(
            incidents[0].incident.title,
            "Incident affecting order, payment"
        );
    }

    #[test]
    fn test_same_service_joins_across_large_gap() {
        let grouper = IncidentGrouper::new(10);
        // 30 min gap, but same service extends the open incident.
        let anomalies = vec![anomaly("payment", 0, 5), anomaly("payment", 35, 40)];
        let incidents = grouper.group(&anomalies);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident.end_ts, t0() + Duration::minutes(40));
    }

    #[test]
    fn test_end_ts_never_decreases() {
        let grouper = IncidentGrouper::new(10);
        // Second anomaly ends before the incident's current end.
        let anomalies = vec![anomaly("order", 0, 20), anomaly("payment", 5, 10)];
        let incidents = grouper.group(&anomalies);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident.end_ts, t0() + Duration::minutes(20));
    }

    #[test]
    fn test_single_service_title() {
        let grouper = IncidentGrouper::new(10);
        let incidents = grouper.group(&[anomaly("checkout", 0, 5)]);
        assert_eq!(incidents[0].incident.title, "Incident in checkout");
        assert_eq!(incidents[0].incident.status, IncidentStatus::Open);
    }

    #[test]
    fn test_empty_input() {
        let grouper = IncidentGrouper::new(10);
        assert!(grouper.group(&[]).is_empty());
    }
}
