//! Observability setup for keystep: structured logging via `tracing` with an
//! optional OpenTelemetry bridge.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
