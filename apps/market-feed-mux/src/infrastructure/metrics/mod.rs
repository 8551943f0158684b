//! Prometheus Metrics Module
//!
//! Exposes feed metrics via the `metrics` facade. Recording is a no-op until
//! `init_metrics` installs the Prometheus recorder.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound data frames by subscription kind
//! - **Events**: Records dispatched to listeners or dropped, by reason
//! - **Subscriptions**: Outbound subscription messages and active interest items
//! - **Connection**: Reconnects and warning-channel reports

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::event::SubscriptionKind;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "market_feed_frames_received_total",
        "Total data frames received from the endpoint"
    );
    describe_counter!(
        "market_feed_events_dispatched_total",
        "Total records delivered to at least one listener"
    );
    describe_counter!(
        "market_feed_events_dropped_total",
        "Total records dropped before reaching a listener"
    );
    describe_counter!(
        "market_feed_subscription_messages_total",
        "Total subscription messages published"
    );
    describe_counter!(
        "market_feed_reconnects_total",
        "Total transitions to connected"
    );
    describe_counter!(
        "market_feed_warnings_total",
        "Total reports on the warning channel"
    );
    describe_gauge!(
        "market_feed_interest_items",
        "Number of active interest items"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reasons a record never reached a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No interest item for (type, symbol).
    NoInterest,
    /// The frame could not be decoded.
    DecodeError,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NoInterest => "no_interest",
            Self::DecodeError => "decode_error",
        }
    }
}

/// Record an inbound data frame.
pub fn record_frame_received(kind: SubscriptionKind) {
    counter!(
        "market_feed_frames_received_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record records delivered to listeners.
pub fn record_events_dispatched(kind: SubscriptionKind, count: u64) {
    counter!(
        "market_feed_events_dispatched_total",
        "kind" => kind.as_str()
    )
    .increment(count);
}

/// Record dropped records.
pub fn record_events_dropped(reason: DropReason, count: u64) {
    counter!(
        "market_feed_events_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Record a published subscription message.
pub fn record_subscription_message(reset: bool) {
    counter!(
        "market_feed_subscription_messages_total",
        "reset" => if reset { "true" } else { "false" }
    )
    .increment(1);
}

/// Record a transition to connected.
pub fn record_reconnect() {
    counter!("market_feed_reconnects_total").increment(1);
}

/// Record a warning-channel report.
pub fn record_warning() {
    counter!("market_feed_warnings_total").increment(1);
}

/// Update the active interest item count for a kind.
#[allow(clippy::cast_precision_loss)]
pub fn set_interest_items(kind: SubscriptionKind, count: usize) {
    gauge!(
        "market_feed_interest_items",
        "kind" => kind.as_str()
    )
    .set(count as f64);
}

// =============================================================================
// Tests
// =============================================================================
