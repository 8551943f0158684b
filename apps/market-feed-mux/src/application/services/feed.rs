//! Subscription Registry
//!
//! `Feed` is the single owner of total interest per (event type, symbol).
//! Handles register and deregister listeners through it; the resulting
//! upstream diff is coalesced into one deferred flush per mutation burst.
//! Inbound frames from the endpoint are decoded and fanned out to the
//! registered listeners.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::application::ports::{EndpointListener, EventListener, FeedEndpoint, Scheduler, Task};
use crate::domain::event::{EventRecord, SubscriptionKind};
use crate::domain::subscription::{InterestKey, InterestStats, InterestTable, ListenerToken, Registration};
use crate::infrastructure::codec::FrameCodec;
use crate::infrastructure::metrics::{self, DropReason};
use crate::infrastructure::scheduler::SingleFlight;

use super::subscription::Subscription;

/// Service name subscription messages are published to.
pub const SUBSCRIPTION_SERVICE: &str = "sub";

type SharedListener = Arc<dyn EventListener>;

/// The subscription registry.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Feed {
    /// Create a registry on an endpoint and attach to its notifications.
    ///
    /// No network activity happens until the first flush.
    #[must_use]
    pub fn new(endpoint: Arc<dyn FeedEndpoint>, scheduler: Arc<dyn Scheduler>) -> Self {
        let inner = Arc::new_cyclic(|me| FeedInner {
            me: me.clone(),
            endpoint,
            scheduler,
            codec: FrameCodec::new(),
            table: Mutex::new(InterestTable::new()),
            flush: SingleFlight::new(),
        });

        let listener: Weak<FeedInner> = Arc::downgrade(&inner);
        inner.endpoint.attach(listener);

        Self { inner }
    }

    /// Create a snapshot subscription over the given event types.
    #[must_use]
    pub fn create_subscription<I, S>(&self, event_types: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::new(
            Arc::clone(&self.inner),
            SubscriptionKind::Snapshot,
            event_types.into_iter().map(Into::into).collect(),
        )
    }

    /// Create a time-series subscription over the given event types.
    #[must_use]
    pub fn create_time_series_subscription<I, S>(&self, event_types: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::new(
            Arc::clone(&self.inner),
            SubscriptionKind::TimeSeries,
            event_types.into_iter().map(Into::into).collect(),
        )
    }

    /// Decode an inbound frame and fan its records out to listeners.
    pub fn dispatch(&self, frame: Value, time_series: bool) {
        self.inner.dispatch(frame, time_series);
    }

    /// Check if a flush is scheduled.
    #[must_use]
    pub fn is_flush_pending(&self) -> bool {
        self.inner.flush.is_armed()
    }

    /// Number of listeners registered for a key.
    #[must_use]
    pub fn listener_count(&self, key: &InterestKey) -> usize {
        self.inner.table.lock().listener_count(key)
    }

    /// Current watermark of a time-series interest item.
    #[must_use]
    pub fn watermark(&self, key: &InterestKey) -> Option<i64> {
        self.inner.table.lock().watermark(key)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> InterestStats {
        self.inner.table.lock().stats()
    }
}

// =============================================================================
// Registry Internals
// =============================================================================

pub(crate) struct FeedInner {
    me: Weak<Self>,
    endpoint: Arc<dyn FeedEndpoint>,
    scheduler: Arc<dyn Scheduler>,
    codec: FrameCodec,
    table: Mutex<InterestTable<SharedListener>>,
    flush: SingleFlight,
}

impl FeedInner {
    /// Register a listener, scheduling a flush if the upstream view changed.
    pub(crate) fn register(
        &self,
        key: InterestKey,
        listener: SharedListener,
        from_time: i64,
    ) -> Registration {
        let registration = {
            let mut table = self.table.lock();
            let registration = table.register(key, listener, from_time);
            if registration.changed {
                publish_gauges(&table);
            }
            registration
        };
        if registration.changed {
            self.schedule_flush();
        }
        registration
    }

    /// Deregister a listener, scheduling a flush if the upstream view changed.
    pub(crate) fn deregister(&self, key: &InterestKey, token: ListenerToken) {
        let changed = {
            let mut table = self.table.lock();
            let changed = table.deregister(key, token);
            if changed {
                publish_gauges(&table);
            }
            changed
        };
        if changed {
            self.schedule_flush();
        }
    }

    /// Report on the endpoint's warning channel.
    pub(crate) fn warn(&self, message: &str) {
        self.endpoint.warn(message);
    }

    /// Defer a task on the registry's scheduler.
    pub(crate) fn defer(&self, task: Task) {
        self.scheduler.defer(task);
    }

    fn schedule_flush(&self) {
        if !self.flush.arm() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.flush.disarm();
            return;
        };
        self.scheduler.defer(Box::new(move || me.flush()));
    }

    fn flush(&self) {
        self.flush.disarm();
        self.endpoint.connect_if_needed();

        if !self.endpoint.is_connected() {
            trace!("Endpoint not connected, keeping pending subscription changes");
            return;
        }

        let Some(message) = self.table.lock().take_message() else {
            return;
        };

        match self.codec.encode(&message) {
            Ok(value) => {
                debug!(
                    reset = message.reset,
                    entries = message.entry_count(),
                    "Publishing subscription message"
                );
                self.endpoint.publish(SUBSCRIPTION_SERVICE, value);
                metrics::record_subscription_message(message.reset);
            }
            Err(e) => {
                error!(error = %e, "Failed to encode subscription message");
            }
        }
    }

    fn dispatch(&self, frame: Value, time_series: bool) {
        let kind = if time_series {
            SubscriptionKind::TimeSeries
        } else {
            SubscriptionKind::Snapshot
        };
        metrics::record_frame_received(kind);

        let batch = match self.codec.decode(frame) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, %kind, "Dropping undecodable frame");
                metrics::record_events_dropped(DropReason::DecodeError, 1);
                return;
            }
        };

        if batch.trailing_values > 0 {
            warn!(
                event_type = %batch.event_type,
                trailing = batch.trailing_values,
                "Dropping partial record at end of frame"
            );
        }
        if batch.missing_symbol > 0 {
            warn!(
                event_type = %batch.event_type,
                skipped = batch.missing_symbol,
                "Skipping records without eventSymbol"
            );
        }

        let total = batch.records.len();
        let deliveries: Vec<(Arc<EventRecord>, Vec<SharedListener>)> = {
            let mut table = self.table.lock();
            batch
                .records
                .into_iter()
                .filter_map(|record| {
                    let record = Arc::new(record);
                    let listeners = table.route(kind, &record);
                    (!listeners.is_empty()).then_some((record, listeners))
                })
                .collect()
        };

        let dropped = total - deliveries.len();
        if dropped > 0 {
            trace!(event_type = %batch.event_type, dropped, "No interest for records");
            metrics::record_events_dropped(DropReason::NoInterest, dropped as u64);
        }
        metrics::record_events_dispatched(kind, deliveries.len() as u64);

        // Listeners run outside the table lock so they may call back in.
        for (record, listeners) in deliveries {
            for listener in listeners {
                listener.on_event(Arc::clone(&record));
            }
        }
    }
}

impl EndpointListener for FeedInner {
    fn on_data(&self, frame: Value, time_series: bool) {
        self.dispatch(frame, time_series);
    }

    fn on_reconnect(&self) {
        debug!("Endpoint connected, resending full subscription");
        self.table.lock().mark_reset();
        self.schedule_flush();
    }
}

fn publish_gauges(table: &InterestTable<SharedListener>) {
    let stats = table.stats();
    metrics::set_interest_items(SubscriptionKind::Snapshot, stats.snapshot_items);
    metrics::set_interest_items(SubscriptionKind::TimeSeries, stats.time_series_items);
}
