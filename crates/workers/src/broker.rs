//! Broker abstraction over NATS pub/sub.
//!
//! Each process holds one long-lived client shared by every worker and
//! handler; queue-group subscriptions give consumer-group semantics. The
//! in-memory implementation backs tests and offline runs.

use async_trait::async_trait;
use dashmap::DashMap;
use faultline_core::config::NatsConfig;
use faultline_core::{PipelineError, PipelineResult};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{info, warn};

const SUBSCRIBER_BUFFER: usize = 10_000;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> PipelineResult<()>;

    /// Subscribe within a queue group; messages arrive on the returned
    /// channel until the connection or the broker goes away.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> PipelineResult<mpsc::Receiver<Vec<u8>>>;

    async fn ping(&self) -> PipelineResult<()>;
}

/// NATS-backed broker holding a single long-lived client.
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    pub async fn connect(config: &NatsConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "nats://localhost:4222".to_string());

        info!(url = %url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(config.max_reconnects))
            .connect(&url)
            .await?;

        info!("NATS connection established");
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> PipelineResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| PipelineError::Broker(format!("publish {subject}: {e}")))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> PipelineResult<mpsc::Receiver<Vec<u8>>> {
        let mut subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| PipelineError::Broker(format!("subscribe {subject}: {e}")))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let subject = subject.to_string();
        tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                if tx.send(msg.payload.to_vec()).await.is_err() {
                    break;
                }
            }
            warn!(subject = %subject, "NATS subscription ended");
        });

        Ok(rx)
    }

    async fn ping(&self) -> PipelineResult<()> {
        match self.client.connection_state() {
            async_nats::connection::State::Connected => Ok(()),
            state => Err(PipelineError::Broker(format!(
                "nats connection state: {state:?}"
            ))),
        }
    }
}

/// In-process broker for tests: every subscriber on a subject receives every
/// message (queue groups collapse to one subscriber per subject in tests).
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> PipelineResult<()> {
        let senders: Vec<mpsc::Sender<Vec<u8>>> = self
            .topics
            .get(subject)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        for sender in senders {
            // A full or closed subscriber drops the message, like a slow
            // core-NATS consumer would.
            let _ = sender.try_send(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        _queue_group: &str,
    ) -> PipelineResult<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.topics.entry(subject.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn ping(&self) -> PipelineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_broker_delivers_to_subscriber() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe("metrics.raw", "detector-worker").await.unwrap();

        broker
            .publish("metrics.raw", b"{\"v\":1}".to_vec())
            .await
            .unwrap();
        broker.publish("rca.requests", b"other".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, b"{\"v\":1}".to_vec());
        assert!(rx.try_recv().is_err());
    }
}
