//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the subscription services and the port interfaces
//! they use to reach the feed endpoint and the task scheduler.

/// Port interfaces for the endpoint, transport and scheduler.
pub mod ports;

/// Application services for feeds, subscriptions and market data.
pub mod services;
