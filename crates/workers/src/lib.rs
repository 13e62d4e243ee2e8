#![warn(clippy::unwrap_used)]

pub mod broker;
pub mod coordinator;
pub mod detector_worker;
pub mod rca_worker;
pub mod retry;

pub use broker::{Broker, MemoryBroker, NatsBroker};
pub use coordinator::PipelineCoordinator;
pub use detector_worker::DetectorWorker;
pub use rca_worker::{RcaPhase, RcaWorker, RunRegistry};
pub use retry::with_retry;
