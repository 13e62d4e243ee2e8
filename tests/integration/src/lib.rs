//! Integration test crate for the faultline pipeline. All tests live under
//! `tests/` and run against the in-memory store, broker, and activity
//! implementations.
