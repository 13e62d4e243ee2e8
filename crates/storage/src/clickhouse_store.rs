//! ClickHouse-backed metric and log store.
//!
//! Inserts go through `FORMAT JSONEachRow` batches; reads are RowBinary
//! fetches with millisecond timestamps, always bounded by a time window and
//! capped by a deadline.

use crate::metric_store::MetricStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_core::config::ClickHouseConfig;
use faultline_core::types::{LogEntry, MetricPoint};
use faultline_core::{PipelineError, PipelineResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

pub struct ClickHouseStore {
    client: clickhouse::Client,
    query_timeout: Duration,
}

#[derive(clickhouse::Row, Deserialize)]
struct PointRow {
    ts_ms: i64,
    service: String,
    metric: String,
    value: f64,
}

#[derive(clickhouse::Row, Deserialize)]
struct AvgRow {
    metric: String,
    avg_value: f64,
}

#[derive(clickhouse::Row, Deserialize)]
struct CountRow {
    cnt: u64,
}

/// DateTime64(3) literal format accepted by ClickHouse.
fn ch_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn ch_err(e: clickhouse::error::Error) -> PipelineError {
    PipelineError::TransientStore(format!("clickhouse: {e}"))
}

impl ClickHouseStore {
    /// Connect and verify the schema.
    pub async fn new(config: &ClickHouseConfig) -> anyhow::Result<Self> {
        let client = clickhouse::Client::default()
            .with_url(&config.url)
            .with_database(&config.database);

        Self::ensure_schema(&client).await?;

        Ok(Self {
            client,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        })
    }

    async fn ensure_schema(client: &clickhouse::Client) -> anyhow::Result<()> {
        client
            .query(
                "CREATE TABLE IF NOT EXISTS metrics_timeseries (
                    ts DateTime64(3),
                    service String,
                    metric String,
                    value Float64,
                    tags Map(String, String)
                ) ENGINE = MergeTree()
                ORDER BY (service, metric, ts)
                PARTITION BY toYYYYMM(ts)
                TTL toDateTime(ts) + INTERVAL 90 DAY",
            )
            .execute()
            .await?;

        client
            .query(
                "CREATE TABLE IF NOT EXISTS logs (
                    ts DateTime64(3),
                    service String,
                    level String,
                    event String,
                    message String,
                    fields Map(String, String),
                    trace_id String
                ) ENGINE = MergeTree()
                ORDER BY (service, level, ts)
                PARTITION BY toYYYYMM(ts)
                TTL toDateTime(ts) + INTERVAL 90 DAY",
            )
            .execute()
            .await?;

        info!("ClickHouse schema verified");
        Ok(())
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, clickhouse::error::Error>>,
    ) -> PipelineResult<T> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(result) => result.map_err(ch_err),
            Err(_) => Err(PipelineError::TransientStore(
                "clickhouse: query deadline exceeded".to_string(),
            )),
        }
    }
}

#[async_trait]
impl MetricStore for ClickHouseStore {
    async fn insert_points(&self, points: &[MetricPoint]) -> PipelineResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut json_rows = Vec::with_capacity(points.len());
        for p in points {
            json_rows.push(
                serde_json::json!({
                    "ts": ch_ts(p.ts),
                    "service": p.service,
                    "metric": p.metric,
                    "value": p.value,
                    "tags": p.tags,
                })
                .to_string(),
            );
        }

        let insert_sql = format!(
            "INSERT INTO metrics_timeseries FORMAT JSONEachRow {}",
            json_rows.join("\n")
        );
        self.bounded(self.client.query(&insert_sql).execute()).await?;
        metrics::counter!("store.points_inserted").increment(points.len() as u64);
        Ok(())
    }

    async fn insert_logs(&self, entries: &[LogEntry]) -> PipelineResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut json_rows = Vec::with_capacity(entries.len());
        for e in entries {
            json_rows.push(
                serde_json::json!({
                    "ts": ch_ts(e.ts),
                    "service": e.service,
                    "level": e.level,
                    "event": e.event.clone().unwrap_or_default(),
                    "message": e.message,
                    "fields": e.fields,
                    "trace_id": e.trace_id.clone().unwrap_or_default(),
                })
                .to_string(),
            );
        }

        let insert_sql = format!("INSERT INTO logs FORMAT JSONEachRow {}", json_rows.join("\n"));
        self.bounded(self.client.query(&insert_sql).execute()).await?;
        metrics::counter!("store.logs_inserted").increment(entries.len() as u64);
        Ok(())
    }

    async fn points_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<MetricPoint>> {
        let rows = self
            .bounded(
                self.client
                    .query(
                        "SELECT toUnixTimestamp64Milli(ts) AS ts_ms, service, metric, value
                         FROM metrics_timeseries
                         WHERE ts >= toDateTime64(?, 3) AND ts <= toDateTime64(?, 3)
                         ORDER BY service, metric, ts",
                    )
                    .bind(ch_ts(start))
                    .bind(ch_ts(end))
                    .fetch_all::<PointRow>(),
            )
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                DateTime::<Utc>::from_timestamp_millis(r.ts_ms).map(|ts| MetricPoint {
                    ts,
                    service: r.service,
                    metric: r.metric,
                    value: r.value,
                    tags: HashMap::new(),
                })
            })
            .collect())
    }

    async fn avg_by_metric(
        &self,
        service: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_end: bool,
    ) -> PipelineResult<HashMap<String, f64>> {
        let sql = if include_end {
            "SELECT metric, avg(value) AS avg_value
             FROM metrics_timeseries
             WHERE service = ? AND ts >= toDateTime64(?, 3) AND ts <= toDateTime64(?, 3)
             GROUP BY metric"
        } else {
            "SELECT metric, avg(value) AS avg_value
             FROM metrics_timeseries
             WHERE service = ? AND ts >= toDateTime64(?, 3) AND ts < toDateTime64(?, 3)
             GROUP BY metric"
        };

        let rows = self
            .bounded(
                self.client
                    .query(sql)
                    .bind(service)
                    .bind(ch_ts(start))
                    .bind(ch_ts(end))
                    .fetch_all::<AvgRow>(),
            )
            .await?;

        Ok(rows.into_iter().map(|r| (r.metric, r.avg_value)).collect())
    }

    async fn count_logs(
        &self,
        service: &str,
        level: &str,
        event: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_end: bool,
    ) -> PipelineResult<u64> {
        let end_op = if include_end { "<=" } else { "<" };
        let sql = match event {
            Some(_) => format!(
                "SELECT count() AS cnt FROM logs
                 WHERE service = ? AND level = ? AND event = ?
                 AND ts >= toDateTime64(?, 3) AND ts {end_op} toDateTime64(?, 3)"
            ),
            None => format!(
                "SELECT count() AS cnt FROM logs
                 WHERE service = ? AND level = ?
                 AND ts >= toDateTime64(?, 3) AND ts {end_op} toDateTime64(?, 3)"
            ),
        };

        let mut query = self.client.query(&sql).bind(service).bind(level);
        if let Some(event) = event {
            query = query.bind(event);
        }
        let rows = self
            .bounded(query.bind(ch_ts(start)).bind(ch_ts(end)).fetch_all::<CountRow>())
            .await?;

        Ok(rows.first().map(|r| r.cnt).unwrap_or(0))
    }

    async fn ping(&self) -> PipelineResult<()> {
        self.bounded(self.client.query("SELECT 1").execute()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_clickhouse_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 4, 12, 30, 45).single().expect("valid ts");
        assert_eq!(ch_ts(ts), "2026-03-04 12:30:45.000");
    }
}
