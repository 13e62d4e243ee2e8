//! Metric and log store interface (wide, time-partitioned tables).
//!
//! Backed by ClickHouse in production ([`crate::ClickHouseStore`]) and by an
//! in-memory store for tests ([`crate::MemoryMetricStore`]). Every read is
//! time-bucketed; there are no full scans.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faultline_core::types::{LogEntry, MetricPoint};
use faultline_core::PipelineResult;
use std::collections::HashMap;

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn insert_points(&self, points: &[MetricPoint]) -> PipelineResult<()>;

    async fn insert_logs(&self, entries: &[LogEntry]) -> PipelineResult<()>;

    /// All points with `ts ∈ [start, end]`, ordered by (service, metric, ts).
    /// Used for detector warmup and offline replay.
    async fn points_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> PipelineResult<Vec<MetricPoint>>;

    /// Per-metric mean value for one service over `[start, end)`; when
    /// `include_end` the window is `[start, end]`.
    async fn avg_by_metric(
        &self,
        service: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_end: bool,
    ) -> PipelineResult<HashMap<String, f64>>;

    /// Count of log entries for a service at a level (optionally with a
    /// specific `event` signature) over `[start, end)` / `[start, end]`.
    async fn count_logs(
        &self,
        service: &str,
        level: &str,
        event: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        include_end: bool,
    ) -> PipelineResult<u64>;

    async fn ping(&self) -> PipelineResult<()>;
}
