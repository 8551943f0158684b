//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Inbound frame decoding and outbound message encoding.
pub mod codec;

/// Configuration loading.
pub mod config;

/// Connection endpoint and reconnection policy.
pub mod endpoint;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Deferred task scheduling.
pub mod scheduler;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Transport adapters.
pub mod transport;
