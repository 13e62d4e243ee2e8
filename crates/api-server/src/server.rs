//! Router assembly, health probe, and the metrics exporter.

use crate::state::AppState;
use crate::{activity_rest, incident_rest, ingest_rest};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use faultline_core::config::AppConfig;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the full ingestion + query router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest/metrics", post(ingest_rest::ingest_metrics))
        .route("/ingest/logs", post(ingest_rest::ingest_logs))
        .route("/ingest/deployments", post(ingest_rest::ingest_deployments))
        .route(
            "/ingest/config_changes",
            post(ingest_rest::ingest_config_changes),
        )
        .route(
            "/ingest/flag_changes",
            post(ingest_rest::ingest_flag_changes),
        )
        .route("/incidents", get(incident_rest::list_incidents))
        .route("/incidents/:id", get(incident_rest::get_incident))
        .route(
            "/incidents/:id/anomalies",
            get(incident_rest::get_incident_anomalies),
        )
        .route(
            "/incidents/:id/suspects",
            get(incident_rest::get_incident_suspects),
        )
        .route(
            "/incidents/:id/status",
            get(incident_rest::get_incident_status),
        )
        .route("/incidents/:id/rerun_rca", post(incident_rest::rerun_rca))
        .route("/incidents/:id/label", post(incident_rest::label_suspect))
        .route("/activity/events", get(activity_rest::get_events))
        .route(
            "/activity/events/recent",
            get(activity_rest::get_recent_events),
        )
        .route("/health", get(health_check))
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// GET /health — per-dependency probe; 503 when anything is degraded.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut checks: BTreeMap<&'static str, String> = BTreeMap::new();
    let mut healthy = true;

    match state.metric_store.ping().await {
        Ok(()) => checks.insert("clickhouse", "ok".into()),
        Err(e) => {
            healthy = false;
            checks.insert("clickhouse", format!("error: {e}"))
        }
    };
    match state.catalog.ping().await {
        Ok(()) => checks.insert("postgres", "ok".into()),
        Err(e) => {
            healthy = false;
            checks.insert("postgres", format!("error: {e}"))
        }
    };
    match &state.activity_query {
        Some(activity) => match activity.ping().await {
            Ok(()) => checks.insert("redis", "ok".into()),
            Err(e) => {
                healthy = false;
                checks.insert("redis", format!("error: {e}"))
            }
        },
        None => {
            healthy = false;
            checks.insert("redis", "not initialized".into())
        }
    };
    match state.broker.ping().await {
        Ok(()) => checks.insert("nats", "ok".into()),
        Err(e) => {
            healthy = false;
            checks.insert("nats", format!("error: {e}"))
        }
    };

    let status = if healthy { "healthy" } else { "unhealthy" };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": status,
            "node_id": state.node_id,
            "uptime_secs": state.start_time.elapsed().as_secs(),
            "checks": checks,
        })),
    )
}

/// HTTP server wrapper binding config to the router.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn into_router(self) -> Router {
        router(self.state)
    }

    /// Start the Prometheus exporter on its side port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}
