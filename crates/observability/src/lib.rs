//! Observability: tracing/logging initialization.

pub mod tracing;
