#![warn(clippy::unwrap_used)]

pub mod activity_rest;
pub mod error;
pub mod incident_rest;
pub mod ingest_rest;
pub mod server;
pub mod state;

pub use error::ApiError;
pub use server::{router, ApiServer};
pub use state::AppState;
