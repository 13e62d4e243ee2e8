//! Faultline Train CLI — fit the ranking model from labeled suspects.

use clap::Parser;
use faultline_core::config::AppConfig;
use faultline_rca::{train, TrainOptions};
use faultline_storage::PostgresCatalog;
use std::path::PathBuf;
use tracing::info;

/// Hard ceiling for one training run.
const TRAIN_DEADLINE_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "faultline-train")]
#[command(about = "Train the suspect-ranking model from labeled incidents")]
#[command(version)]
struct Cli {
    /// Output artifact path (overrides config)
    #[arg(long, env = "FAULTLINE__MODEL__ARTIFACT_PATH")]
    model_path: Option<String>,

    /// Gradient-descent epochs
    #[arg(long, default_value_t = 500)]
    epochs: usize,

    /// Gradient-descent learning rate
    #[arg(long, default_value_t = 0.1)]
    learning_rate: f64,

    /// Shuffle seed for the stratified split
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "faultline_train=info,faultline_rca=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load().unwrap_or_default();

    let artifact_path = cli
        .model_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&config.model.artifact_path));

    info!("Connecting to Postgres");
    let catalog = PostgresCatalog::connect(&config.postgres).await?;

    let options = TrainOptions {
        artifact_path,
        epochs: cli.epochs,
        learning_rate: cli.learning_rate,
        seed: cli.seed,
    };

    let report = tokio::time::timeout(
        std::time::Duration::from_secs(TRAIN_DEADLINE_SECS),
        train(&catalog, &options),
    )
    .await
    .map_err(|_| anyhow::anyhow!("training exceeded the {TRAIN_DEADLINE_SECS}s deadline"))??;

    println!(
        "{}",
        serde_json::json!({
            "rows": report.rows,
            "train_size": report.train_size,
            "test_size": report.test_size,
            "precision": report.precision,
            "recall": report.recall,
            "f1": report.f1,
            "roc_auc": report.roc_auc,
            "artifact": report.artifact_path,
        })
    );

    Ok(())
}
