//! Port Interfaces
//!
//! Defines the interfaces (ports) between the subscription engine and the
//! systems around it, following the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `Transport`: Raw bidirectional messaging capability
//! - `FeedEndpoint`: What the registry needs from the connection endpoint
//! - `Scheduler`: Deferred task execution after the current call unwinds
//!
//! ## Driver Ports (Inbound)
//!
//! - `EndpointListener`: Upward notifications from the endpoint
//! - `EventListener`: Registry to handle fan-out

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::domain::event::EventRecord;

// =============================================================================
// Transport
// =============================================================================

/// Transport adapter errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Opening the connection failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Sending a message failed.
    #[error("send failed: {0}")]
    Send(String),

    /// The transport is closed.
    #[error("transport closed")]
    Closed,
}

/// Raw messaging capability underneath the endpoint.
///
/// Connection outcomes are reported asynchronously through the adapter's
/// event channel; `open` only starts the attempt.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Begin connecting to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt cannot be started.
    fn open(&self, url: &str) -> Result<(), TransportError>;

    /// Send a message on a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be sent.
    fn send(&self, channel: &str, message: Value) -> Result<(), TransportError>;

    /// Tear the connection down.
    fn close(&self);
}

// =============================================================================
// Endpoint
// =============================================================================

/// Upward notifications from the endpoint to the registry.
pub trait EndpointListener: Send + Sync {
    /// An inbound data frame arrived.
    fn on_data(&self, frame: Value, time_series: bool);

    /// The endpoint transitioned to connected.
    fn on_reconnect(&self);
}

/// What the registry and handles need from the connection endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait FeedEndpoint: Send + Sync {
    /// Check if the endpoint is connected.
    fn is_connected(&self) -> bool;

    /// Start the first connection attempt if `connect` was never called.
    fn connect_if_needed(&self);

    /// Publish a message to a service; dropped while disconnected.
    fn publish(&self, service: &str, message: Value);

    /// Report a warning on the endpoint's warning channel.
    fn warn(&self, message: &str);

    /// Attach the listener that receives data and reconnect notifications.
    fn attach(&self, listener: Weak<dyn EndpointListener>);
}

// =============================================================================
// Event Delivery
// =============================================================================

/// Receives records routed by the registry.
pub trait EventListener: Send + Sync {
    /// A record for an interest this listener registered.
    fn on_event(&self, event: Arc<EventRecord>);
}

// =============================================================================
// Scheduling
// =============================================================================

/// A deferred unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after the current call stack unwinds.
pub trait Scheduler: Send + Sync {
    /// Defer a task.
    fn defer(&self, task: Task);
}
