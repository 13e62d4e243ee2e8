//! Incident read surface, labeling, and RCA re-runs.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use faultline_core::activity::{ActivityEvent, EventType};
use faultline_core::topics;
use faultline_core::types::{IncidentStatus, RcaRequestMsg};
use serde::Deserialize;
use uuid::Uuid;

const LIST_LIMIT: i64 = 250;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// GET /incidents
pub async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            IncidentStatus::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };

    let incidents = state.catalog.incidents(status, LIST_LIMIT).await?;
    Ok(Json(serde_json::json!({ "incidents": incidents })))
}

/// GET /incidents/{id}
pub async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let incident = state
        .catalog
        .incident(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Incident not found"))?;
    Ok(Json(serde_json::to_value(incident).map_err(faultline_core::PipelineError::from)?))
}

/// GET /incidents/{id}/anomalies
pub async fn get_incident_anomalies(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_incident(&state, id).await?;
    let anomalies = state.catalog.anomalies_for_incident(id).await?;
    Ok(Json(serde_json::json!({ "anomalies": anomalies })))
}

/// GET /incidents/{id}/suspects
pub async fn get_incident_suspects(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ensure_incident(&state, id).await?;
    let suspects = state.catalog.suspects(id).await?;
    Ok(Json(serde_json::json!({ "suspects": suspects })))
}

/// GET /incidents/{id}/status
///
/// `rca_status` reflects the explicit run state machine; `suspects_count`
/// keeps the legacy suspects-derived view for wire compatibility.
pub async fn get_incident_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let incident = state
        .catalog
        .incident(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Incident not found"))?;

    let suspects = state.catalog.suspects(id).await?;
    let rca_status = if state.rca_registry.in_progress(id) {
        "in_progress"
    } else if suspects.is_empty() {
        "not_started"
    } else {
        "completed"
    };

    Ok(Json(serde_json::json!({
        "incident_id": id,
        "rca_status": rca_status,
        "suspects_count": suspects.len(),
        "last_updated": if suspects.is_empty() { incident.start_ts } else { Utc::now() },
    })))
}

/// POST /incidents/{id}/rerun_rca
pub async fn rerun_rca(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let incident = state
        .catalog
        .incident(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Incident not found"))?;

    let request = RcaRequestMsg {
        incident_id: incident.id,
        start_ts: incident.start_ts,
        end_ts: incident.end_ts,
    };
    state
        .broker
        .publish(
            topics::RCA_REQUESTS,
            serde_json::to_vec(&request).map_err(faultline_core::PipelineError::from)?,
        )
        .await?;

    Ok(Json(serde_json::json!({ "status": "ok", "message": "RCA rerun triggered" })))
}

#[derive(Deserialize)]
pub struct LabelQuery {
    pub suspect_id: Uuid,
    pub label: i16,
    #[serde(default)]
    pub labeler: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// POST /incidents/{id}/label
pub async fn label_suspect(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LabelQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.label != 0 && query.label != 1 {
        return Err(ApiError::validation("label must be 0 or 1"));
    }
    ensure_incident(&state, id).await?;

    let suspect = state
        .catalog
        .suspect(query.suspect_id)
        .await?
        .filter(|s| s.incident_id == id)
        .ok_or_else(|| ApiError::not_found("Suspect not found"))?;

    state
        .catalog
        .upsert_label(
            id,
            suspect.id,
            query.label,
            query.labeler.as_deref(),
            query.notes.as_deref(),
        )
        .await?;

    state.activity_sink.emit(ActivityEvent::new(
        EventType::LabelRecorded,
        None,
        format!("Label {} recorded for suspect {}", query.label, suspect.suspect_key),
        serde_json::json!({
            "incident_id": id,
            "suspect_id": suspect.id,
            "label": query.label,
        }),
    ));

    Ok(Json(serde_json::json!({ "status": "ok", "message": "Label recorded" })))
}

async fn ensure_incident(state: &AppState, id: Uuid) -> Result<(), ApiError> {
    state
        .catalog
        .incident(id)
        .await?
        .map(|_| ())
        .ok_or_else(|| ApiError::not_found("Incident not found"))
}
