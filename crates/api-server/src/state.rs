//! Shared application state for REST handlers.
//!
//! One explicit dependencies value constructed at startup and cloned into
//! every handler; no global client singletons.

use faultline_core::activity::{ActivityQuery, ActivitySink};
use faultline_storage::{ChangeCatalog, MetricStore};
use faultline_workers::{Broker, RunRegistry};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<dyn ChangeCatalog>,
    pub metric_store: Arc<dyn MetricStore>,
    pub broker: Arc<dyn Broker>,
    pub activity_sink: Arc<dyn ActivitySink>,
    /// Read side of the activity log; absent when the activity store was
    /// unreachable at startup (degraded mode).
    pub activity_query: Option<Arc<dyn ActivityQuery>>,
    pub rca_registry: Arc<RunRegistry>,
    pub node_id: String,
    pub start_time: Instant,
}
