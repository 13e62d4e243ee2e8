#![warn(clippy::unwrap_used)]

//! Redis-backed activity event log.
//!
//! Append-only ring over one sorted set (`activity:events`) scored by UTC
//! epoch seconds, JSON-encoded values, 1-hour TTL refreshed on every append.
//! Appends go through an mpsc channel to a background writer so emitting is
//! non-blocking; a Redis outage degrades the log, never the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_core::activity::{ActivityEvent, ActivityQuery, ActivitySink};
use faultline_core::config::RedisConfig;
use faultline_core::{PipelineError, PipelineResult};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const EVENTS_KEY: &str = "activity:events";

/// Activity log with a background Redis writer.
pub struct RedisActivityLog {
    sender: mpsc::Sender<ActivityEvent>,
    client: redis::Client,
    ttl_secs: u64,
}

impl RedisActivityLog {
    /// Connect to Redis, verify connectivity, and spawn the writer task.
    pub async fn new(config: &RedisConfig) -> anyhow::Result<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "redis://localhost:6379".to_string());

        info!(url = %url, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(response = %pong, "Redis connection established");

        let (sender, receiver) = mpsc::channel::<ActivityEvent>(10_000);
        let ttl_secs = config.activity_ttl_secs;

        tokio::spawn(write_loop(conn, receiver, ttl_secs));

        Ok(Self {
            sender,
            client,
            ttl_secs,
        })
    }
}

async fn write_loop(
    mut conn: redis::aio::MultiplexedConnection,
    mut receiver: mpsc::Receiver<ActivityEvent>,
    ttl_secs: u64,
) {
    while let Some(event) = receiver.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode activity event");
                continue;
            }
        };
        let score = event.ts.timestamp() as f64;

        let appended: Result<(), redis::RedisError> = async {
            let _: () = conn.zadd(EVENTS_KEY, &json, score).await?;
            let _: () = conn.expire(EVENTS_KEY, ttl_secs as i64).await?;
            Ok(())
        }
        .await;

        match appended {
            Ok(()) => {
                metrics::counter!("activity.appended").increment(1);
                debug!(event_type = event.event_type.as_str(), "Activity event appended");
            }
            Err(e) => {
                // Degraded dependency: drop the event, keep the pipeline moving.
                metrics::counter!("activity.dropped").increment(1);
                warn!(error = %e, "Failed to append activity event, dropping");
            }
        }
    }
}

impl ActivitySink for RedisActivityLog {
    fn emit(&self, event: ActivityEvent) {
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("activity.dropped").increment(1);
            warn!("Activity event dropped: {}", e);
        }
    }
}

#[async_trait]
impl ActivityQuery for RedisActivityLog {
    async fn events(
        &self,
        since: Option<DateTime<Utc>>,
        limit: usize,
        event_type: Option<faultline_core::activity::EventType>,
        service: Option<&str>,
    ) -> PipelineResult<Vec<ActivityEvent>> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PipelineError::TransientStore(format!("redis: {e}")))?;

        let now = Utc::now().timestamp() as f64;
        let min = since
            .map(|s| s.timestamp() as f64)
            .unwrap_or(now - self.ttl_secs as f64);

        // Over-fetch so post-filters can still fill the limit.
        let raw: Vec<String> = conn
            .zrangebyscore_limit(EVENTS_KEY, min, now, 0, (limit * 2) as isize)
            .await
            .map_err(|e| PipelineError::TransientStore(format!("redis: {e}")))?;

        let mut events = Vec::with_capacity(limit);
        for json in raw {
            let event: ActivityEvent = match serde_json::from_str(&json) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Failed to parse activity event, skipping");
                    continue;
                }
            };
            if let Some(t) = event_type {
                if event.event_type != t {
                    continue;
                }
            }
            if let Some(s) = service {
                if event.service.as_deref() != Some(s) {
                    continue;
                }
            }
            events.push(event);
            if events.len() >= limit {
                break;
            }
        }

        events.sort_by(|a, b| b.ts.cmp(&a.ts));
        Ok(events)
    }

    async fn ping(&self) -> PipelineResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| PipelineError::TransientStore(format!("redis: {e}")))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| PipelineError::TransientStore(format!("redis: {e}")))?;
        Ok(())
    }
}
