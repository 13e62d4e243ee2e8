//! Candidate-change enumeration for an incident window.

use chrono::{DateTime, Duration, Utc};
use faultline_core::config::CandidateSettings;
use faultline_core::types::{Candidate, SuspectType};
use faultline_core::PipelineResult;
use faultline_storage::ChangeCatalog;
use tracing::info;

pub struct CandidateGenerator {
    lookback_hours: i64,
    lookforward_hours: i64,
}

impl CandidateGenerator {
    pub fn new(lookback_hours: i64, lookforward_hours: i64) -> Self {
        Self {
            lookback_hours,
            lookforward_hours,
        }
    }

    pub fn from_settings(settings: &CandidateSettings) -> Self {
        Self::new(settings.lookback_hours, settings.lookforward_hours)
    }

    /// Enumerate deployments, config changes, and flag flips in the incident
    /// window. When the catalog yields nothing, synthesize one SERVICE
    /// candidate per affected service so ranking always has a subject.
    pub async fn generate(
        &self,
        catalog: &dyn ChangeCatalog,
        incident_start: DateTime<Utc>,
        incident_end: DateTime<Utc>,
        affected_services: &[String],
    ) -> PipelineResult<Vec<Candidate>> {
        let window_start = incident_start - Duration::hours(self.lookback_hours);
        let window_end = incident_end + Duration::hours(self.lookforward_hours);

        let mut candidates = Vec::new();

        for d in catalog
            .deployments_in_window(window_start, window_end, affected_services)
            .await?
        {
            candidates.push(Candidate {
                suspect_type: SuspectType::Deployment,
                suspect_key: d.id.to_string(),
                ts: d.ts,
                service: Some(d.service.clone()),
                metadata: serde_json::json!({
                    "commit_sha": d.commit_sha,
                    "version": d.version,
                    "author": d.author,
                    "diff_summary": d.diff_summary,
                    "links": d.links,
                }),
            });
        }

        for c in catalog
            .config_changes_in_window(window_start, window_end, affected_services)
            .await?
        {
            candidates.push(Candidate {
                suspect_type: SuspectType::Config,
                suspect_key: c.id.to_string(),
                ts: c.ts,
                service: Some(c.service.clone()),
                metadata: serde_json::json!({
                    "key": c.key,
                    "old_value_hash": c.old_value_hash,
                    "new_value_hash": c.new_value_hash,
                    "diff_summary": c.diff_summary,
                    "source": c.source,
                }),
            });
        }

        for f in catalog
            .flag_changes_in_window(window_start, window_end, affected_services)
            .await?
        {
            candidates.push(Candidate {
                suspect_type: SuspectType::Flag,
                suspect_key: f.id.to_string(),
                ts: f.ts,
                service: f.service.clone(),
                metadata: serde_json::json!({
                    "flag_name": f.flag_name,
                    "old_state": f.old_state,
                    "new_state": f.new_state,
                }),
            });
        }

        if candidates.is_empty() && !affected_services.is_empty() {
            for service in affected_services {
                candidates.push(Candidate {
                    suspect_type: SuspectType::Service,
                    suspect_key: format!("service_{service}"),
                    ts: incident_start - Duration::minutes(30),
                    service: Some(service.clone()),
                    metadata: serde_json::json!({
                        "reason": "No deployments/config changes found, analyzing service behavior",
                    }),
                });
            }
            info!(
                count = candidates.len(),
                "No change candidates found, created SERVICE fallbacks"
            );
        }

        info!(count = candidates.len(), "Generated candidates for incident");
        Ok(candidates)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use faultline_core::types::{ConfigChange, Deployment, FlagChange};
    use faultline_storage::MemoryCatalog;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 10, 0, 0).single().unwrap()
    }

    fn deployment(service: &str, ts: DateTime<Utc>) -> Deployment {
        Deployment {
            id: Uuid::new_v4(),
            ts,
            service: service.into(),
            commit_sha: "abc1234".into(),
            version: Some("1.4.2".into()),
            author: Some("dev@example.com".into()),
            diff_summary: Some("tune db connection pool".into()),
            links: None,
        }
    }

    #[tokio::test]
    async fn test_window_filters_by_service_and_time() {
        let catalog = MemoryCatalog::new();
        // In window, affected service.
        catalog
            .insert_deployment(&deployment("payment", t0() - Duration::minutes(30)))
            .await
            .unwrap();
        // In window, unrelated service.
        catalog
            .insert_deployment(&deployment("search", t0() - Duration::minutes(30)))
            .await
            .unwrap();
        // Out of window.
        catalog
            .insert_deployment(&deployment("payment", t0() - Duration::hours(5)))
            .await
            .unwrap();

        let generator = CandidateGenerator::new(2, 0);
        let candidates = generator
            .generate(
                &catalog,
                t0(),
                t0() + Duration::minutes(10),
                &["payment".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].suspect_type, SuspectType::Deployment);
        assert_eq!(candidates[0].metadata["commit_sha"], "abc1234");
    }

    #[tokio::test]
    async fn test_global_flag_included_without_service() {
        let catalog = MemoryCatalog::new();
        catalog
            .insert_flag_change(&FlagChange {
                id: Uuid::new_v4(),
                ts: t0() - Duration::minutes(20),
                flag_name: "new_checkout_flow".into(),
                service: None,
                old_state: Some(serde_json::json!({"enabled": false})),
                new_state: Some(serde_json::json!({"enabled": true})),
            })
            .await
            .unwrap();
        catalog
            .insert_config_change(&ConfigChange {
                id: Uuid::new_v4(),
                ts: t0() - Duration::minutes(15),
                service: "payment".into(),
                key: "db.pool_size".into(),
                old_value_hash: Some("aa".into()),
                new_value_hash: Some("bb".into()),
                diff_summary: Some("pool 10 -> 2".into()),
                source: Some("gitops".into()),
            })
            .await
            .unwrap();

        let generator = CandidateGenerator::new(2, 0);
        let candidates = generator
            .generate(
                &catalog,
                t0(),
                t0() + Duration::minutes(5),
                &["payment".to_string()],
            )
            .await
            .unwrap();

        let types: Vec<SuspectType> = candidates.iter().map(|c| c.suspect_type).collect();
        assert!(types.contains(&SuspectType::Flag));
        assert!(types.contains(&SuspectType::Config));
    }

    #[tokio::test]
    async fn test_service_fallback_when_catalog_is_empty() {
        let catalog = MemoryCatalog::new();
        let generator = CandidateGenerator::new(2, 0);
        let candidates = generator
            .generate(
                &catalog,
                t0(),
                t0() + Duration::minutes(10),
                &["mock-service".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(candidates.len(), 1);
        let fallback = &candidates[0];
        assert_eq!(fallback.suspect_type, SuspectType::Service);
        assert_eq!(fallback.suspect_key, "service_mock-service");
        assert_eq!(fallback.ts, t0() - Duration::minutes(30));
    }

    #[tokio::test]
    async fn test_no_fallback_without_affected_services() {
        let catalog = MemoryCatalog::new();
        let generator = CandidateGenerator::new(2, 0);
        let candidates = generator
            .generate(&catalog, t0(), t0() + Duration::minutes(10), &[])
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }
}
