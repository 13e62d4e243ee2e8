//! Streaming robust z-score anomaly detection over per-(service, metric)
//! time-series buffers.

use crate::baseline::RobustBaseline;
use chrono::{DateTime, Duration, Utc};
use faultline_core::config::DetectorSettings;
use faultline_core::types::MetricPoint;
use std::collections::HashMap;
use tracing::warn;

/// Buffer retention horizon.
const RETENTION_HOURS: i64 = 24;

/// A key needs this many points before detection runs at all.
const MIN_BUFFER_POINTS: usize = 20;

/// Which deviation from baseline is undesirable for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub z_threshold: f64,
    pub min_points: usize,
    pub window_minutes: usize,
    pub required_anomalies: usize,
    pub lookback_days: i64,
    pub bad_directions: HashMap<String, Direction>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            z_threshold: 3.0,
            min_points: 10,
            window_minutes: 5,
            required_anomalies: 3,
            lookback_days: 7,
            bad_directions: default_bad_directions(),
        }
    }
}

fn default_bad_directions() -> HashMap<String, Direction> {
    HashMap::from([
        ("p95_latency_ms".to_string(), Direction::Up),
        ("p99_latency_ms".to_string(), Direction::Up),
        ("error_rate".to_string(), Direction::Up),
        ("qps".to_string(), Direction::Down),
    ])
}

impl DetectorConfig {
    pub fn from_settings(settings: &DetectorSettings) -> Self {
        Self {
            z_threshold: settings.z_threshold,
            min_points: settings.min_points,
            window_minutes: settings.window_minutes,
            required_anomalies: settings.required_anomalies,
            lookback_days: settings.lookback_days,
            bad_directions: default_bad_directions(),
        }
    }
}

/// A run of consecutive bad-direction deviations that qualified as an anomaly.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalySegment {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub max_z: f64,
}

/// Per-key streaming detector. The buffer map has a single writer: the
/// metrics consumer that owns this value.
pub struct AnomalyDetector {
    config: DetectorConfig,
    buffers: HashMap<(String, String), Vec<(DateTime<Utc>, f64)>>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            buffers: HashMap::new(),
        }
    }

    pub fn buffer_len(&self, service: &str, metric: &str) -> usize {
        self.buffers
            .get(&(service.to_string(), metric.to_string()))
            .map_or(0, Vec::len)
    }

    /// Seed buffers from historical points without running detection.
    pub fn preload(&mut self, points: &[MetricPoint]) {
        for point in points {
            if !point.value.is_finite() {
                continue;
            }
            self.buffers
                .entry((point.service.clone(), point.metric.clone()))
                .or_default()
                .push((point.ts, point.value));
        }
        for buffer in self.buffers.values_mut() {
            buffer.sort_by_key(|(ts, _)| *ts);
            prune(buffer);
        }
    }

    /// Ingest one point and sweep its key's evaluation window.
    pub fn observe(&mut self, point: &MetricPoint) -> Vec<AnomalySegment> {
        if !point.value.is_finite() {
            warn!(
                service = %point.service,
                metric = %point.metric,
                "Dropping non-finite metric value"
            );
            return Vec::new();
        }

        let key = (point.service.clone(), point.metric.clone());
        let buffer = self.buffers.entry(key.clone()).or_default();

        // Near-sorted in practice; restore order only when a point arrives late.
        let out_of_order = buffer.last().map_or(false, |(last, _)| point.ts < *last);
        buffer.push((point.ts, point.value));
        if out_of_order {
            buffer.sort_by_key(|(ts, _)| *ts);
        }
        prune(buffer);

        if buffer.len() < MIN_BUFFER_POINTS {
            return Vec::new();
        }
        self.sweep(&key.1, &self.buffers[&key])
    }

    /// Run the window sweep for one key's current buffer. Used by `observe`
    /// and directly by the replay harness after a bulk preload.
    pub fn detect(&self, service: &str, metric: &str) -> Vec<AnomalySegment> {
        match self.buffers.get(&(service.to_string(), metric.to_string())) {
            Some(buffer) if buffer.len() >= MIN_BUFFER_POINTS => self.sweep(metric, buffer),
            _ => Vec::new(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.buffers.keys().map(|(s, m)| (s.as_str(), m.as_str()))
    }

    fn sweep(&self, metric: &str, buffer: &[(DateTime<Utc>, f64)]) -> Vec<AnomalySegment> {
        let window = self.config.window_minutes;
        if buffer.len() <= window {
            return Vec::new();
        }

        // Baseline prefix excludes the evaluation window and is capped at
        // lookback_days worth of minutely points.
        let cap = (self.config.lookback_days * 1440).max(0) as usize;
        let baseline_size = (buffer.len() - window).min(cap);
        let baseline_values: Vec<f64> =
            buffer[..baseline_size].iter().map(|(_, v)| *v).collect();

        let baseline = match RobustBaseline::compute(&baseline_values, self.config.min_points) {
            Some(baseline) => baseline,
            None => return Vec::new(),
        };

        let direction = self
            .config
            .bad_directions
            .get(metric)
            .copied()
            .unwrap_or(Direction::Up);

        let mut segments = Vec::new();
        let mut run_len = 0usize;
        let mut run_start: Option<DateTime<Utc>> = None;
        let mut run_end: Option<DateTime<Utc>> = None;
        let mut run_max_z = 0.0f64;

        let flush = |len: usize,
                         start: Option<DateTime<Utc>>,
                         end: Option<DateTime<Utc>>,
                         max_z: f64,
                         segments: &mut Vec<AnomalySegment>| {
            if len >= self.config.required_anomalies {
                if let (Some(start_ts), Some(end_ts)) = (start, end) {
                    segments.push(AnomalySegment {
                        start_ts,
                        end_ts,
                        max_z,
                    });
                }
            }
        };

        for &(ts, value) in &buffer[buffer.len() - window..] {
            let z = baseline.z_score(value);
            let bad_direction = match direction {
                Direction::Up => value > baseline.median,
                Direction::Down => value < baseline.median,
            };
            let is_bad = z > self.config.z_threshold && bad_direction;

            if is_bad {
                if run_start.is_none() {
                    run_start = Some(ts);
                }
                run_end = Some(ts);
                run_len += 1;
                run_max_z = run_max_z.max(z);
            } else {
                flush(run_len, run_start, run_end, run_max_z, &mut segments);
                run_len = 0;
                run_start = None;
                run_end = None;
                run_max_z = 0.0;
            }
        }
        flush(run_len, run_start, run_end, run_max_z, &mut segments);

        segments
    }
}

fn prune(buffer: &mut Vec<(DateTime<Utc>, f64)>) {
    if let Some(&(latest, _)) = buffer.last() {
        let cutoff = latest - Duration::hours(RETENTION_HOURS);
        buffer.retain(|(ts, _)| *ts >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap as StdHashMap;

    fn point(ts: DateTime<Utc>, metric: &str, value: f64) -> MetricPoint {
        MetricPoint {
            ts,
            service: "payment".into(),
            metric: metric.into(),
            value,
            tags: StdHashMap::new(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).single().expect("valid ts")
    }

    /// 60-point baseline around 50 ms with scaled MAD ≈ 2 ms.
    fn steady_baseline() -> Vec<MetricPoint> {
        (0..60)
            .map(|i| {
                // Alternate 48.65/50/51.35 so MAD = 1.35, scaled ≈ 2.0.
                let value = match i % 4 {
                    0 => 48.65,
                    1 => 50.0,
                    2 => 51.35,
                    _ => 50.0,
                };
                point(t0() + Duration::minutes(i), "p95_latency_ms", value)
            })
            .collect()
    }

    #[test]
    fn test_latency_spike_emits_one_segment() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.preload(&steady_baseline());

        let mut segments = Vec::new();
        for i in 0..5 {
            let p = point(t0() + Duration::minutes(60 + i), "p95_latency_ms", 120.0);
            segments = detector.observe(&p);
        }

        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        // |120 - 50| / ~2 = ~35
        assert!(segment.max_z >= 35.0, "z was {}", segment.max_z);
        assert_eq!(segment.start_ts, t0() + Duration::minutes(60));
        assert_eq!(segment.end_ts, t0() + Duration::minutes(64));
    }

    #[test]
    fn test_down_deviation_on_up_is_bad_metric_is_ignored() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.preload(&steady_baseline());

        let mut segments = Vec::new();
        for i in 0..5 {
            let p = point(t0() + Duration::minutes(60 + i), "p95_latency_ms", 10.0);
            segments = detector.observe(&p);
        }
        assert!(segments.is_empty());
    }

    #[test]
    fn test_qps_drop_is_bad() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        let baseline: Vec<MetricPoint> = (0..60)
            .map(|i| {
                let value = if i % 2 == 0 { 990.0 } else { 1010.0 };
                point(t0() + Duration::minutes(i), "qps", value)
            })
            .collect();
        detector.preload(&baseline);

        let mut segments = Vec::new();
        for i in 0..5 {
            let p = point(t0() + Duration::minutes(60 + i), "qps", 100.0);
            segments = detector.observe(&p);
        }
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_short_run_does_not_qualify() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.preload(&steady_baseline());

        // spike, spike, normal, spike, normal: longest run = 2 < required 3
        let values = [120.0, 120.0, 50.0, 120.0, 50.0];
        let mut segments = Vec::new();
        for (i, v) in values.iter().enumerate() {
            let p = point(t0() + Duration::minutes(60 + i as i64), "p95_latency_ms", *v);
            segments = detector.observe(&p);
        }
        assert!(segments.is_empty());
    }

    #[test]
    fn test_quiet_window_emits_nothing() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.preload(&steady_baseline());

        let mut segments = Vec::new();
        for i in 0..5 {
            let p = point(t0() + Duration::minutes(60 + i), "p95_latency_ms", 51.0);
            segments = detector.observe(&p);
        }
        assert!(segments.is_empty());
    }

    #[test]
    fn test_all_equal_baseline_stays_quiet_on_equal_values() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        let flat: Vec<MetricPoint> = (0..40)
            .map(|i| point(t0() + Duration::minutes(i), "p95_latency_ms", 50.0))
            .collect();
        detector.preload(&flat);

        let p = point(t0() + Duration::minutes(40), "p95_latency_ms", 50.0);
        assert!(detector.observe(&p).is_empty());
    }

    #[test]
    fn test_buffer_too_small_aborts() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        for i in 0..10 {
            let p = point(t0() + Duration::minutes(i), "p95_latency_ms", 500.0);
            assert!(detector.observe(&p).is_empty());
        }
    }

    #[test]
    fn test_retention_prunes_old_points() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.observe(&point(t0(), "p95_latency_ms", 50.0));
        detector.observe(&point(t0() + Duration::hours(25), "p95_latency_ms", 50.0));
        assert_eq!(detector.buffer_len("payment", "p95_latency_ms"), 1);
    }

    #[test]
    fn test_non_finite_values_are_dropped() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.observe(&point(t0(), "p95_latency_ms", f64::NAN));
        detector.observe(&point(t0(), "p95_latency_ms", f64::INFINITY));
        assert_eq!(detector.buffer_len("payment", "p95_latency_ms"), 0);
    }

    #[test]
    fn test_late_point_restores_order() {
        let mut detector = AnomalyDetector::new(DetectorConfig::default());
        detector.observe(&point(t0() + Duration::minutes(2), "p95_latency_ms", 50.0));
        detector.observe(&point(t0(), "p95_latency_ms", 50.0));
        assert_eq!(detector.buffer_len("payment", "p95_latency_ms"), 2);
    }
}
