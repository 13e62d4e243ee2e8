//! RCA consumer: candidates → features → rank → persist, per incident.
//!
//! At most one run executes per incident id at a time; runs for different
//! incidents proceed concurrently on spawned tasks. A fatal step leaves the
//! run Idle with no partial writes (suspects replace is transactional).

use crate::broker::Broker;
use crate::retry::with_retry;
use dashmap::DashMap;
use faultline_core::activity::{ActivityEvent, ActivitySink, EventType};
use faultline_core::config::AppConfig;
use faultline_core::topics;
use faultline_core::types::{RcaRequestMsg, Suspect};
use faultline_core::PipelineResult;
use faultline_rca::{CandidateGenerator, FeatureExtractor, Ranker};
use faultline_storage::{ChangeCatalog, MetricStore};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How long shutdown waits for in-flight RCA runs to drain.
const DRAIN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcaPhase {
    Generating,
    Extracting,
    Ranking,
    Persisted,
}

/// Tracks which incidents have an RCA run in flight, and its phase. The API
/// consults this for `rca_status=in_progress`.
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<Uuid, RcaPhase>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the incident for a run. Returns false if one is already active.
    pub fn begin(&self, incident_id: Uuid) -> bool {
        match self.runs.entry(incident_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(RcaPhase::Generating);
                true
            }
        }
    }

    pub fn set_phase(&self, incident_id: Uuid, phase: RcaPhase) {
        if let Some(mut entry) = self.runs.get_mut(&incident_id) {
            *entry = phase;
        }
    }

    /// Back to Idle.
    pub fn finish(&self, incident_id: Uuid) {
        self.runs.remove(&incident_id);
    }

    pub fn in_progress(&self, incident_id: Uuid) -> bool {
        self.runs.contains_key(&incident_id)
    }
}

struct RcaInner {
    candidates: CandidateGenerator,
    extractor: FeatureExtractor,
    ranker: Arc<Ranker>,
    catalog: Arc<dyn ChangeCatalog>,
    metric_store: Arc<dyn MetricStore>,
    activity: Arc<dyn ActivitySink>,
    registry: Arc<RunRegistry>,
}

pub struct RcaWorker {
    inner: Arc<RcaInner>,
    broker: Arc<dyn Broker>,
}

impl RcaWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &AppConfig,
        ranker: Arc<Ranker>,
        catalog: Arc<dyn ChangeCatalog>,
        metric_store: Arc<dyn MetricStore>,
        broker: Arc<dyn Broker>,
        activity: Arc<dyn ActivitySink>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(RcaInner {
                candidates: CandidateGenerator::from_settings(&config.candidates),
                extractor: FeatureExtractor::new(),
                ranker,
                catalog,
                metric_store,
                activity,
                registry,
            }),
            broker,
        }
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        self.inner.registry.clone()
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut rx = match self
            .broker
            .subscribe(topics::RCA_REQUESTS, topics::RCA_GROUP)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "RCA worker failed to subscribe");
                return;
            }
        };

        info!(mode = self.inner.ranker.mode(), "RCA worker started");

        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                msg = rx.recv() => match msg {
                    Some(payload) => {
                        let request: RcaRequestMsg = match serde_json::from_slice(&payload) {
                            Ok(request) => request,
                            Err(e) => {
                                metrics::counter!("rca.parse_errors").increment(1);
                                warn!(error = %e, "Skipping malformed RCA request");
                                continue;
                            }
                        };

                        if !self.inner.registry.begin(request.incident_id) {
                            info!(incident_id = %request.incident_id, "RCA run already in flight, skipping");
                            continue;
                        }

                        let inner = self.inner.clone();
                        in_flight.spawn(async move {
                            let incident_id = request.incident_id;
                            if let Err(e) = inner.process(request).await {
                                error!(incident_id = %incident_id, error = %e, "RCA run failed");
                            }
                            inner.registry.finish(incident_id);
                        });
                    }
                    None => {
                        warn!("RCA subscription ended");
                        break;
                    }
                }
            }
        }

        // Drain in-flight runs with a bounded wait.
        let drained = tokio::time::timeout(
            std::time::Duration::from_secs(DRAIN_TIMEOUT_SECS),
            async {
                while in_flight.join_next().await.is_some() {}
            },
        )
        .await;
        if drained.is_err() {
            warn!("Timed out draining in-flight RCA runs");
            in_flight.abort_all();
        }

        info!("RCA worker stopped");
    }
}

impl RcaInner {
    async fn process(&self, request: RcaRequestMsg) -> PipelineResult<()> {
        let incident_id = request.incident_id;
        info!(incident_id = %incident_id, "Processing RCA request");
        metrics::counter!("rca.runs").increment(1);

        self.activity.emit(ActivityEvent::new(
            EventType::RcaStarted,
            None,
            format!("RCA analysis started for incident {incident_id}"),
            serde_json::json!({ "incident_id": incident_id }),
        ));

        let affected = with_retry("affected_services", || {
            self.catalog.affected_services(incident_id)
        })
        .await?;

        self.registry.set_phase(incident_id, RcaPhase::Generating);
        let candidates = self
            .candidates
            .generate(
                self.catalog.as_ref(),
                request.start_ts,
                request.end_ts,
                &affected,
            )
            .await?;
        if candidates.is_empty() {
            warn!(incident_id = %incident_id, "No candidates found for incident");
            return Ok(());
        }

        self.registry.set_phase(incident_id, RcaPhase::Extracting);
        let mut with_evidence = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let evidence = self
                .extractor
                .extract(
                    &candidate,
                    request.start_ts,
                    request.end_ts,
                    &affected,
                    self.metric_store.as_ref(),
                    self.catalog.as_ref(),
                )
                .await;
            with_evidence.push((candidate, evidence));
        }

        self.registry.set_phase(incident_id, RcaPhase::Ranking);
        let ranked = self.ranker.rank(with_evidence);

        let suspects: Vec<Suspect> = ranked
            .iter()
            .map(|r| Suspect {
                id: Uuid::new_v4(),
                incident_id,
                suspect_type: r.candidate.suspect_type,
                suspect_key: r.candidate.suspect_key.clone(),
                rank: r.rank,
                score: r.score,
                evidence: r.evidence.to_json(),
            })
            .collect();

        with_retry("replace_suspects", || {
            self.catalog.replace_suspects(incident_id, &suspects)
        })
        .await?;
        self.registry.set_phase(incident_id, RcaPhase::Persisted);

        metrics::counter!("rca.suspects").increment(suspects.len() as u64);
        info!(
            incident_id = %incident_id,
            count = suspects.len(),
            mode = self.ranker.mode(),
            "Generated ranked suspects"
        );

        let top_suspects: Vec<&str> = suspects
            .iter()
            .take(3)
            .map(|s| s.suspect_key.as_str())
            .collect();
        self.activity.emit(ActivityEvent::new(
            EventType::SuspectsGenerated,
            affected.first().cloned(),
            format!("Generated {} suspects for incident {incident_id}", suspects.len()),
            serde_json::json!({
                "incident_id": incident_id,
                "suspect_count": suspects.len(),
                "top_suspects": top_suspects,
            }),
        ));
        self.activity.emit(ActivityEvent::new(
            EventType::RcaCompleted,
            affected.first().cloned(),
            format!("RCA analysis completed for incident {incident_id}"),
            serde_json::json!({ "incident_id": incident_id }),
        ));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_single_run_per_incident() {
        let registry = RunRegistry::new();
        let id = Uuid::new_v4();

        assert!(registry.begin(id));
        assert!(!registry.begin(id));
        assert!(registry.in_progress(id));

        // A different incident runs concurrently.
        assert!(registry.begin(Uuid::new_v4()));

        registry.finish(id);
        assert!(!registry.in_progress(id));
        assert!(registry.begin(id));
    }

    #[test]
    fn test_registry_phase_tracking() {
        let registry = RunRegistry::new();
        let id = Uuid::new_v4();
        registry.begin(id);
        registry.set_phase(id, RcaPhase::Ranking);
        assert!(registry.in_progress(id));
        registry.finish(id);
        // Phase updates after finish are no-ops.
        registry.set_phase(id, RcaPhase::Persisted);
        assert!(!registry.in_progress(id));
    }
}
