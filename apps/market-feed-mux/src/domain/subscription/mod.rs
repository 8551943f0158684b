//! Subscription Interest Tracking
//!
//! Domain types for tracking total interest in (event type, symbol) pairs
//! across many overlapping consumer subscriptions.
//!
//! # Design
//!
//! The interest table tracks:
//! - One `InterestItem` per (kind, event type, symbol) with at least one listener
//! - Listener registrations keyed by an opaque `ListenerToken`
//! - The last snapshot record, or the cached time series and its watermark
//! - A `PendingDiff` of upstream adds/removes awaiting the next flush
//!
//! This allows many consumers to share one upstream subscription, with the
//! server told only about first-listener adds, last-listener removes and
//! watermark moves.

mod message;

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::event::{EventRecord, SubscriptionKind};

pub use message::{SubscriptionMessage, TimeSeriesSubscription};

// =============================================================================
// Types
// =============================================================================

/// A symbol string (e.g. `AAPL` or `AAPL{=d}`).
pub type Symbol = String;

/// Opaque token identifying one listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(u64);

/// Identity of an interest item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterestKey {
    /// Snapshot or time-series.
    pub kind: SubscriptionKind,
    /// Event type name.
    pub event_type: String,
    /// Symbol.
    pub symbol: Symbol,
}

impl InterestKey {
    /// Create a key.
    #[must_use]
    pub fn new(
        kind: SubscriptionKind,
        event_type: impl Into<String>,
        symbol: impl Into<Symbol>,
    ) -> Self {
        Self {
            kind,
            event_type: event_type.into(),
            symbol: symbol.into(),
        }
    }

    /// Create a snapshot key.
    #[must_use]
    pub fn snapshot(event_type: impl Into<String>, symbol: impl Into<Symbol>) -> Self {
        Self::new(SubscriptionKind::Snapshot, event_type, symbol)
    }

    /// Create a time-series key.
    #[must_use]
    pub fn time_series(event_type: impl Into<String>, symbol: impl Into<Symbol>) -> Self {
        Self::new(SubscriptionKind::TimeSeries, event_type, symbol)
    }
}

// =============================================================================
// Pending Diff
// =============================================================================

/// Upstream changes accumulated since the last flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDiff {
    add: BTreeMap<InterestKey, i64>,
    remove: BTreeSet<InterestKey>,
}

impl PendingDiff {
    fn mark_add(&mut self, key: InterestKey, from_time: i64) {
        self.remove.remove(&key);
        self.add.insert(key, from_time);
    }

    fn mark_remove(&mut self, key: InterestKey) {
        self.add.remove(&key);
        self.remove.insert(key);
    }

    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Pending add for a key, with the watermark to request.
    #[must_use]
    pub fn pending_add(&self, key: &InterestKey) -> Option<i64> {
        self.add.get(key).copied()
    }

    /// Check if a key is pending removal.
    #[must_use]
    pub fn is_pending_remove(&self, key: &InterestKey) -> bool {
        self.remove.contains(key)
    }

    fn to_message(&self) -> SubscriptionMessage {
        SubscriptionMessage::build(
            false,
            self.add.iter().map(|(key, from_time)| (key, *from_time)),
            &self.remove,
        )
    }
}

// =============================================================================
// Interest Item
// =============================================================================

/// Retained events for an interest item.
#[derive(Debug)]
enum EventCache {
    Snapshot(Option<Arc<EventRecord>>),
    TimeSeries {
        events: BTreeMap<i64, Arc<EventRecord>>,
        watermark: i64,
    },
}

#[derive(Debug)]
struct Holder<L> {
    listener: L,
    from_time: i64,
}

/// Total interest in one (kind, event type, symbol).
#[derive(Debug)]
struct InterestItem<L> {
    holders: BTreeMap<ListenerToken, Holder<L>>,
    cache: EventCache,
}

impl<L> InterestItem<L> {
    const fn new(kind: SubscriptionKind) -> Self {
        let cache = match kind {
            SubscriptionKind::Snapshot => EventCache::Snapshot(None),
            SubscriptionKind::TimeSeries => EventCache::TimeSeries {
                events: BTreeMap::new(),
                watermark: crate::domain::event::NO_HISTORY,
            },
        };
        Self {
            holders: BTreeMap::new(),
            cache,
        }
    }

    /// Watermark to request upstream (0 for snapshot items).
    const fn requested_from(&self) -> i64 {
        match &self.cache {
            EventCache::Snapshot(_) => 0,
            EventCache::TimeSeries { watermark, .. } => *watermark,
        }
    }

    fn min_from_time(&self) -> i64 {
        self.holders
            .values()
            .map(|holder| holder.from_time)
            .min()
            .unwrap_or(crate::domain::event::NO_HISTORY)
    }

    fn cached_since(&self, from_time: i64) -> Vec<Arc<EventRecord>> {
        match &self.cache {
            EventCache::Snapshot(event) => event.iter().cloned().collect(),
            EventCache::TimeSeries { events, .. } => events
                .values()
                .filter(|event| event.time_or_epoch() >= from_time)
                .cloned()
                .collect(),
        }
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Outcome of registering a listener.
#[derive(Debug)]
pub struct Registration {
    /// Token used to deregister.
    pub token: ListenerToken,
    /// Cached records the new listener should receive immediately.
    pub cached: Vec<Arc<EventRecord>>,
    /// Whether the upstream subscription changed (flush needed).
    pub changed: bool,
}

/// Statistics for the interest table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterestStats {
    /// Number of snapshot interest items.
    pub snapshot_items: usize,
    /// Number of time-series interest items.
    pub time_series_items: usize,
    /// Number of listener registrations across all items.
    pub listeners: usize,
}

// =============================================================================
// Interest Table
// =============================================================================

/// Total interest across all listeners, plus the pending upstream diff.
///
/// Generic over the listener type so the bookkeeping can be exercised
/// without any delivery machinery.
///
/// # Example
///
/// ```rust
/// use market_feed_mux::domain::subscription::{InterestKey, InterestTable};
///
/// let mut table = InterestTable::new();
/// let key = InterestKey::snapshot("Quote", "AAPL");
///
/// // First listener - upstream add needed
/// let first = table.register(key.clone(), "a", 0);
/// assert!(first.changed);
///
/// // Second listener - no upstream change
/// let second = table.register(key.clone(), "b", 0);
/// assert!(!second.changed);
///
/// // First listener leaves - still held by the second
/// assert!(!table.deregister(&key, first.token));
///
/// // Last listener leaves - upstream remove needed
/// assert!(table.deregister(&key, second.token));
/// assert!(!table.contains(&key));
/// ```
#[derive(Debug)]
pub struct InterestTable<L> {
    items: HashMap<InterestKey, InterestItem<L>>,
    pending: PendingDiff,
    reset: bool,
    next_token: u64,
}

impl<L: Clone> Default for InterestTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Clone> InterestTable<L> {
    /// Create an empty table.
    ///
    /// The reset flag starts set: the first flush always sends the full state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            pending: PendingDiff::default(),
            reset: true,
            next_token: 0,
        }
    }

    /// Register a listener for a key.
    ///
    /// `from_time` is the listener's requested watermark (ignored for
    /// snapshot keys). A new item is marked pending-add; an existing
    /// time-series item is re-marked only when its watermark drops.
    pub fn register(&mut self, key: InterestKey, listener: L, from_time: i64) -> Registration {
        let token = ListenerToken(self.next_token);
        self.next_token += 1;

        let mut changed = false;
        let item = match self.items.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                changed = true;
                entry.insert(InterestItem::new(key.kind))
            }
        };

        item.holders.insert(token, Holder { listener, from_time });

        if let EventCache::TimeSeries { watermark, .. } = &mut item.cache
            && from_time < *watermark
        {
            *watermark = from_time;
            changed = true;
        }

        let cached = item.cached_since(from_time);
        let requested_from = item.requested_from();

        if changed {
            self.pending.mark_add(key, requested_from);
        }

        Registration {
            token,
            cached,
            changed,
        }
    }

    /// Deregister a listener.
    ///
    /// Returns `true` when the upstream subscription changed: the item lost
    /// its last listener, or a time-series watermark rose (stale cached
    /// records are pruned).
    pub fn deregister(&mut self, key: &InterestKey, token: ListenerToken) -> bool {
        let Some(item) = self.items.get_mut(key) else {
            return false;
        };

        if item.holders.remove(&token).is_none() {
            return false;
        }

        if item.holders.is_empty() {
            self.items.remove(key);
            self.pending.mark_remove(key.clone());
            return true;
        }

        let new_watermark = item.min_from_time();
        if let EventCache::TimeSeries { events, watermark } = &mut item.cache
            && new_watermark != *watermark
        {
            *watermark = new_watermark;
            events.retain(|_, event| event.time_or_epoch() >= new_watermark);
            self.pending.mark_add(key.clone(), new_watermark);
            return true;
        }

        false
    }

    /// Route an inbound record.
    ///
    /// Updates the item's cache and returns the listeners to invoke, in
    /// registration order. Returns an empty list when nobody is interested.
    pub fn route(&mut self, kind: SubscriptionKind, event: &Arc<EventRecord>) -> Vec<L> {
        let key = InterestKey::new(kind, event.event_type(), event.event_symbol());
        let Some(item) = self.items.get_mut(&key) else {
            return Vec::new();
        };

        match &mut item.cache {
            EventCache::Snapshot(latest) => *latest = Some(Arc::clone(event)),
            EventCache::TimeSeries { events, watermark } => {
                if event.time_or_epoch() >= *watermark {
                    events.insert(event.series_key(), Arc::clone(event));
                }
            }
        }

        item.holders
            .values()
            .map(|holder| holder.listener.clone())
            .collect()
    }

    /// Force the next message to carry the full interest set.
    pub const fn mark_reset(&mut self) {
        self.reset = true;
    }

    /// Check if the next message will be a reset.
    #[must_use]
    pub const fn is_reset_pending(&self) -> bool {
        self.reset
    }

    /// Take the next message to publish, clearing the pending diff.
    ///
    /// After a reset condition the message enumerates every item and the
    /// pending diff is discarded as superseded. Returns `None` when there is
    /// nothing to send.
    pub fn take_message(&mut self) -> Option<SubscriptionMessage> {
        let pending = std::mem::take(&mut self.pending);

        let message = if self.reset {
            self.reset = false;
            let all: BTreeMap<&InterestKey, i64> = self
                .items
                .iter()
                .map(|(key, item)| (key, item.requested_from()))
                .collect();
            SubscriptionMessage::build(true, all, std::iter::empty())
        } else {
            pending.to_message()
        };

        (!message.is_empty()).then_some(message)
    }

    /// The diff accumulated since the last message.
    #[must_use]
    pub const fn pending(&self) -> &PendingDiff {
        &self.pending
    }

    /// Check if an item exists for a key.
    #[must_use]
    pub fn contains(&self, key: &InterestKey) -> bool {
        self.items.contains_key(key)
    }

    /// Number of listeners registered for a key.
    #[must_use]
    pub fn listener_count(&self, key: &InterestKey) -> usize {
        self.items.get(key).map_or(0, |item| item.holders.len())
    }

    /// Current watermark of a time-series item.
    #[must_use]
    pub fn watermark(&self, key: &InterestKey) -> Option<i64> {
        match &self.items.get(key)?.cache {
            EventCache::Snapshot(_) => None,
            EventCache::TimeSeries { watermark, .. } => Some(*watermark),
        }
    }

    /// Number of cached records for a key.
    #[must_use]
    pub fn cached_count(&self, key: &InterestKey) -> usize {
        self.items
            .get(key)
            .map_or(0, |item| match &item.cache {
                EventCache::Snapshot(event) => usize::from(event.is_some()),
                EventCache::TimeSeries { events, .. } => events.len(),
            })
    }

    /// Number of interest items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the table has no interest items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get table statistics.
    #[must_use]
    pub fn stats(&self) -> InterestStats {
        self.items
            .iter()
            .fold(InterestStats::default(), |mut stats, (key, item)| {
                match key.kind {
                    SubscriptionKind::Snapshot => stats.snapshot_items += 1,
                    SubscriptionKind::TimeSeries => stats.time_series_items += 1,
                }
                stats.listeners += item.holders.len();
                stats
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
