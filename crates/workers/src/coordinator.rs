//! Pipeline coordinator — spawns and supervises the two consumer loops.

use crate::detector_worker::DetectorWorker;
use crate::rca_worker::RcaWorker;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct PipelineCoordinator {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl PipelineCoordinator {
    /// Warm up the detector and spawn both workers.
    pub async fn start(mut detector: DetectorWorker, rca: RcaWorker) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        detector.warmup().await;

        let mut handles = Vec::new();
        handles.push(tokio::spawn(detector.run(shutdown_rx.clone())));
        handles.push(tokio::spawn(rca.run(shutdown_rx)));

        info!("Pipeline coordinator started");
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Stop accepting work, drain, and join the workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Pipeline workers drained");
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}
