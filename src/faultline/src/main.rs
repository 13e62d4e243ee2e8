//! Faultline — streaming anomaly detection and root-cause ranking pipeline.
//!
//! Main entry point that initializes all subsystems, spawns the two worker
//! loops, and serves the ingestion API.

use faultline_activity::RedisActivityLog;
use faultline_api::{ApiServer, AppState};
use faultline_core::activity::{ActivityQuery, ActivitySink, NoOpSink};
use faultline_core::config::AppConfig;
use faultline_rca::Ranker;
use faultline_storage::{ChangeCatalog, ClickHouseStore, MetricStore, PostgresCatalog};
use faultline_workers::{
    Broker, DetectorWorker, NatsBroker, PipelineCoordinator, RcaWorker, RunRegistry,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "faultline")]
#[command(about = "Streaming anomaly detection and root-cause ranking pipeline")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "FAULTLINE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "FAULTLINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Model artifact path (overrides config)
    #[arg(long, env = "FAULTLINE__MODEL__ARTIFACT_PATH")]
    model_path: Option<String>,

    /// Serve the API without the detector/RCA workers
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faultline=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Faultline starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(path) = cli.model_path {
        config.model.artifact_path = path;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        model_path = %config.model.artifact_path,
        "Configuration loaded"
    );

    // Required stores: startup fails (non-zero exit) if unreachable after retry.
    let metric_store: Arc<dyn MetricStore> = Arc::new(
        connect_with_retry("ClickHouse", || ClickHouseStore::new(&config.clickhouse)).await?,
    );
    let catalog: Arc<dyn ChangeCatalog> = Arc::new(
        connect_with_retry("Postgres", || PostgresCatalog::connect(&config.postgres)).await?,
    );
    let broker: Arc<dyn Broker> =
        Arc::new(connect_with_retry("NATS", || NatsBroker::connect(&config.nats)).await?);

    // The activity store is optional: without it the pipeline runs degraded,
    // silently dropping activity events.
    let (activity_sink, activity_query): (Arc<dyn ActivitySink>, Option<Arc<dyn ActivityQuery>>) =
        match RedisActivityLog::new(&config.redis).await {
            Ok(log) => {
                let log = Arc::new(log);
                (log.clone(), Some(log))
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, activity logging disabled");
                (Arc::new(NoOpSink), None)
            }
        };

    let ranker = Arc::new(Ranker::new(config.model.artifact_path.clone()));
    info!(mode = ranker.mode(), "Ranker initialized");

    let registry = Arc::new(RunRegistry::new());

    let coordinator = if cli.api_only {
        info!("Running in API-only mode (no pipeline workers)");
        None
    } else {
        let detector = DetectorWorker::new(
            &config,
            catalog.clone(),
            metric_store.clone(),
            broker.clone(),
            activity_sink.clone(),
        );
        let rca = RcaWorker::new(
            &config,
            ranker.clone(),
            catalog.clone(),
            metric_store.clone(),
            broker.clone(),
            activity_sink.clone(),
            registry.clone(),
        );
        Some(PipelineCoordinator::start(detector, rca).await)
    };

    let state = AppState {
        catalog,
        metric_store,
        broker,
        activity_sink,
        activity_query,
        rca_registry: registry,
        node_id: config.node_id.clone(),
        start_time: Instant::now(),
    };

    let api_server = ApiServer::new(config.clone(), state);
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT, shutting down");
        }
    };

    let addr = std::net::SocketAddr::new(config.api.host.parse()?, config.api.http_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting HTTP server");
    axum::serve(listener, api_server.into_router())
        .with_graceful_shutdown(shutdown)
        .await?;

    // Stop accepting work, then drain in-flight RCA runs.
    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
    }

    info!("Faultline shut down cleanly");
    Ok(())
}

/// Connect to an external service with exponential backoff (3 attempts).
async fn connect_with_retry<T, F, Fut>(service_name: &str, connect_fn: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let delays = [
        std::time::Duration::from_secs(0),
        std::time::Duration::from_secs(2),
        std::time::Duration::from_secs(4),
    ];
    let mut last_err = None;
    for (attempt, delay) in delays.iter().enumerate() {
        if attempt > 0 {
            warn!(service = service_name, attempt, "Retrying connection after {}s", delay.as_secs());
            tokio::time::sleep(*delay).await;
        }
        match connect_fn().await {
            Ok(conn) => {
                info!(service = service_name, "Connected successfully");
                return Ok(conn);
            }
            Err(e) => {
                error!(service = service_name, attempt, error = %e, "Connection failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} connection failed", service_name)))
}
