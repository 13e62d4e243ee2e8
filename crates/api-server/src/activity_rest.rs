//! Activity log read surface.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use faultline_core::activity::EventType;
use serde::Deserialize;

const DEFAULT_LIMIT: usize = 250;
const RECENT_LIMIT: usize = 50;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

/// GET /activity/events
pub async fn get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let activity = state
        .activity_query
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("Activity logger not initialized"))?;

    let since = match &query.since {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|_| {
                    ApiError::validation("Invalid timestamp format. Use ISO format.")
                })?,
        ),
        None => None,
    };
    let event_type = match &query.event_type {
        Some(raw) => Some(
            EventType::parse(raw)
                .ok_or_else(|| ApiError::validation(format!("unknown event type: {raw}")))?,
        ),
        None => None,
    };

    let events = activity
        .events(
            since,
            query.limit.unwrap_or(DEFAULT_LIMIT),
            event_type,
            query.service.as_deref(),
        )
        .await?;

    let count = events.len();
    Ok(Json(serde_json::json!({ "events": events, "count": count })))
}

#[derive(Deserialize)]
pub struct RecentQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /activity/events/recent
pub async fn get_recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let activity = state
        .activity_query
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("Activity logger not initialized"))?;

    let events = activity
        .events(None, query.limit.unwrap_or(RECENT_LIMIT), None, None)
        .await?;

    let count = events.len();
    Ok(Json(serde_json::json!({ "events": events, "count": count })))
}
