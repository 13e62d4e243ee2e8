//! Broker subject names and consumer-group identifiers.

pub const METRICS_RAW: &str = "metrics.raw";
pub const LOGS_RAW: &str = "logs.raw";
pub const DEPLOYMENTS_RAW: &str = "deployments.raw";
pub const CONFIG_RAW: &str = "config.raw";
pub const FLAGS_RAW: &str = "flags.raw";
pub const ANOMALIES_DETECTED: &str = "anomalies.detected";
pub const RCA_REQUESTS: &str = "rca.requests";

pub const DETECTOR_GROUP: &str = "detector-worker";
pub const RCA_GROUP: &str = "rca-worker";
