//! Transactional change-catalog interface.
//!
//! Backed by PostgreSQL in production ([`crate::PostgresCatalog`]) and by an
//! in-memory store for tests and development ([`crate::MemoryCatalog`]).
//! All reads are bounded (time-windowed or limit-capped); all timestamps are
//! UTC.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_core::types::{
    Anomaly, ConfigChange, Deployment, FlagChange, Incident, IncidentStatus, Suspect,
};
use faultline_core::PipelineResult;
use uuid::Uuid;

#[async_trait]
pub trait ChangeCatalog: Send + Sync {
    // ─── Change ingestion ───────────────────────────────────────────────

    async fn insert_deployment(&self, deployment: &Deployment) -> PipelineResult<()>;
    async fn insert_config_change(&self, change: &ConfigChange) -> PipelineResult<()>;
    async fn insert_flag_change(&self, change: &FlagChange) -> PipelineResult<()>;

    // ─── Candidate window reads ─────────────────────────────────────────

    /// Deployments with `service ∈ services` and `ts ∈ [start, end]`, newest first.
    async fn deployments_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<Deployment>>;

    /// Config changes with `service ∈ services` and `ts ∈ [start, end]`, newest first.
    async fn config_changes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<ConfigChange>>;

    /// Flag changes with `ts ∈ [start, end]` and (`service ∈ services` OR
    /// service IS NULL), newest first.
    async fn flag_changes_in_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        services: &[String],
    ) -> PipelineResult<Vec<FlagChange>>;

    // ─── Anomalies ──────────────────────────────────────────────────────

    /// Insert unless a prior anomaly for the same (service, metric) has
    /// `start_ts` within ±60 s. Returns whether a row was written.
    async fn insert_anomaly_if_new(&self, anomaly: &Anomaly) -> PipelineResult<bool>;

    /// Anomalies with `start_ts >= since` not yet linked to any incident,
    /// ascending by start_ts.
    async fn ungrouped_anomalies_since(
        &self,
        since: DateTime<Utc>,
    ) -> PipelineResult<Vec<Anomaly>>;

    /// Anomalies linked to an incident, ascending by start_ts.
    async fn anomalies_for_incident(&self, incident_id: Uuid) -> PipelineResult<Vec<Anomaly>>;

    // ─── Incidents ──────────────────────────────────────────────────────

    /// Insert an incident and its anomaly links in one transaction. Links use
    /// insert-or-noop semantics so re-runs are idempotent. Returns false if
    /// the incident id already exists (nothing written).
    async fn insert_incident_with_links(
        &self,
        incident: &Incident,
        anomaly_ids: &[Uuid],
    ) -> PipelineResult<bool>;

    async fn incident(&self, id: Uuid) -> PipelineResult<Option<Incident>>;

    /// Incidents newest-first, optionally filtered by status, capped at `limit`.
    async fn incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<Incident>>;

    /// Distinct services of the incident's linked anomalies.
    async fn affected_services(&self, incident_id: Uuid) -> PipelineResult<Vec<String>>;

    /// Distinct incidents since `since` that involved an anomaly for `service`.
    async fn count_service_incidents_since(
        &self,
        service: &str,
        since: DateTime<Utc>,
    ) -> PipelineResult<i64>;

    // ─── Suspects ───────────────────────────────────────────────────────

    /// Atomically delete all prior suspects for the incident and insert the
    /// new ranked list, in one transaction.
    async fn replace_suspects(
        &self,
        incident_id: Uuid,
        suspects: &[Suspect],
    ) -> PipelineResult<()>;

    /// Suspects for an incident ordered by rank ascending.
    async fn suspects(&self, incident_id: Uuid) -> PipelineResult<Vec<Suspect>>;

    async fn suspect(&self, id: Uuid) -> PipelineResult<Option<Suspect>>;

    // ─── Labels & training ──────────────────────────────────────────────

    /// Record a human label. If a label for (incident, suspect) exists, the
    /// latest one is updated in place; otherwise a new row is inserted.
    async fn upsert_label(
        &self,
        incident_id: Uuid,
        suspect_id: Uuid,
        label: i16,
        labeler: Option<&str>,
        notes: Option<&str>,
    ) -> PipelineResult<()>;

    /// The suspect whose effective (latest) label for this incident is 1.
    async fn true_cause_suspect(&self, incident_id: Uuid) -> PipelineResult<Option<Suspect>>;

    /// Ids of all incidents that carry at least one label.
    async fn labeled_incidents(&self) -> PipelineResult<Vec<Uuid>>;

    /// (evidence, label) pairs for training: the effective label per
    /// (incident, suspect) where label ∈ {0,1} and evidence is non-null.
    async fn training_rows(&self) -> PipelineResult<Vec<(serde_json::Value, i16)>>;

    async fn ping(&self) -> PipelineResult<()>;
}
