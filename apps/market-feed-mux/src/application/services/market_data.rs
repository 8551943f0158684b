//! Market Data Service
//!
//! Per-symbol convenience surface over four snapshot event kinds. One
//! subscription handle is kept per kind; listeners registered with `on`
//! receive every delivered record of that kind.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::event::EventRecord;

use super::feed::Feed;
use super::subscription::Subscription;

/// Listener for one event kind.
pub type MarketDataListener = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Snapshot event kinds served by `MarketData`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Best bid/ask.
    Quote,
    /// Last trade.
    Trade,
    /// Daily summary.
    Summary,
    /// Instrument profile.
    Profile,
}

impl EventKind {
    /// All kinds, in subscription order.
    pub const ALL: [Self; 4] = [Self::Quote, Self::Trade, Self::Summary, Self::Profile];

    /// Wire event type name.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::Quote => "Quote",
            Self::Trade => "Trade",
            Self::Summary => "Summary",
            Self::Profile => "Profile",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Quote => 0,
            Self::Trade => 1,
            Self::Summary => 2,
            Self::Profile => 3,
        }
    }

    /// Look up a kind by wire event type name, ignoring case.
    #[must_use]
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.event_type().eq_ignore_ascii_case(event_type))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

type ListenerMap = HashMap<EventKind, Vec<MarketDataListener>>;

/// Per-symbol subscribe/unsubscribe across a fixed set of event kinds.
///
/// Cheap to clone; clones share subscriptions and listeners.
#[derive(Clone)]
pub struct MarketData {
    subscriptions: Arc<[Subscription; 4]>,
    listeners: Arc<RwLock<ListenerMap>>,
}

impl fmt::Debug for MarketData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketData")
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl MarketData {
    /// Create one snapshot subscription per kind on a feed.
    #[must_use]
    pub fn new(feed: &Feed) -> Self {
        let listeners: Arc<RwLock<ListenerMap>> = Arc::default();

        let subscriptions = EventKind::ALL.map(|kind| {
            let subscription = feed.create_subscription([kind.event_type()]);
            let listeners = Arc::clone(&listeners);
            subscription.set_on_event(move |event| {
                let targets = listeners.read().get(&kind).cloned().unwrap_or_default();
                for listener in targets {
                    listener(event);
                }
            });
            subscription
        });

        Self {
            subscriptions: Arc::new(subscriptions),
            listeners,
        }
    }

    /// The handle serving a kind.
    #[must_use]
    pub fn subscription(&self, kind: EventKind) -> &Subscription {
        &self.subscriptions[kind.index()]
    }

    /// Register a listener for every delivered record of a kind.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Subscribe symbols to one kind.
    pub fn subscribe<I, S>(&self, kind: EventKind, symbols: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription(kind).add_symbols(symbols);
        self
    }

    /// Unsubscribe symbols from one kind.
    pub fn unsubscribe<I, S>(&self, kind: EventKind, symbols: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscription(kind).remove_symbols(symbols);
        self
    }

    /// Subscribe a symbol to every kind.
    pub fn subscribe_to_all(&self, symbol: &str) -> &Self {
        for subscription in self.subscriptions.iter() {
            subscription.add_symbols([symbol]);
        }
        self
    }

    /// Unsubscribe a symbol from every kind.
    pub fn unsubscribe_to_all(&self, symbol: &str) -> &Self {
        for subscription in self.subscriptions.iter() {
            subscription.remove_symbols([symbol]);
        }
        self
    }

    /// Close every handle.
    pub fn close(&self) {
        for subscription in self.subscriptions.iter() {
            subscription.close();
        }
    }
}
