//! Consumer Subscription Handle
//!
//! A `Subscription` is one consumer's view over a fixed set of event types
//! and a mutable set of symbols. It registers one listener per
//! (type, symbol) with the registry, buffers routed records, and hands them
//! to its `on_event` callback in one deferred batch.
//!
//! # Locking
//!
//! Handle state is always locked before the registry table. Callbacks run
//! with no locks held, so they may call any handle method, including
//! `close`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::application::ports::EventListener;
use crate::domain::event::{EventRecord, FromTime, NO_HISTORY, SubscriptionKind};
use crate::domain::subscription::{InterestKey, ListenerToken, Symbol};
use crate::infrastructure::scheduler::SingleFlight;

use super::feed::FeedInner;

/// Consumer callback, invoked once per delivered record.
pub type EventCallback = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// A consumer subscription handle.
///
/// Cheap to clone; clones share the same interest set. The handle stays
/// registered until `close` is called.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.inner.kind)
            .field("event_types", &self.inner.event_types)
            .field("symbols", &self.symbols())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(feed: Arc<FeedInner>, kind: SubscriptionKind, event_types: Vec<String>) -> Self {
        let from_time = match kind {
            SubscriptionKind::Snapshot => 0,
            SubscriptionKind::TimeSeries => NO_HISTORY,
        };

        let inner = Arc::new_cyclic(|me| SubscriptionInner {
            me: me.clone(),
            feed,
            kind,
            event_types,
            state: Mutex::new(HandleState {
                interest: BTreeMap::new(),
                from_time,
            }),
            queue: Mutex::new(DeliveryQueue::default()),
            on_event: RwLock::new(None),
            closed: AtomicBool::new(false),
            delivery: Mutex::new(()),
            delivery_flag: SingleFlight::new(),
        });

        Self { inner }
    }

    /// Subscription kind.
    #[must_use]
    pub fn kind(&self) -> SubscriptionKind {
        self.inner.kind
    }

    /// Event types this handle was created for.
    #[must_use]
    pub fn event_types(&self) -> &[String] {
        &self.inner.event_types
    }

    /// Symbols currently in the interest set, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.inner.state.lock().interest.keys().cloned().collect()
    }

    /// Requested watermark of a time-series handle.
    ///
    /// `NO_HISTORY` until `set_from_time` succeeds; `None` for snapshot handles.
    #[must_use]
    pub fn from_time(&self) -> Option<i64> {
        self.inner
            .kind
            .is_time_series()
            .then(|| self.inner.state.lock().from_time)
    }

    /// Check if the handle is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of records waiting for delivery.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Set the consumer callback.
    ///
    /// Records already buffered are delivered on the next delivery pass.
    pub fn set_on_event<F>(&self, callback: F)
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        *self.inner.on_event.write() = Some(Arc::new(callback));
        if !self.inner.queue.lock().is_empty() {
            self.inner.schedule_delivery();
        }
    }

    /// Remove the consumer callback. Records keep buffering.
    pub fn clear_on_event(&self) {
        *self.inner.on_event.write() = None;
    }

    /// Add symbols to the interest set.
    pub fn add_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let symbols: Vec<Symbol> = symbols.into_iter().map(Into::into).collect();
        let fire = {
            let mut state = self.inner.state.lock();
            if self.inner.is_closed() {
                return;
            }
            self.inner.add_locked(&mut state, symbols)
        };
        if fire {
            self.inner.schedule_delivery();
        }
    }

    /// Remove symbols from the interest set.
    ///
    /// Buffered records for removed symbols are discarded.
    pub fn remove_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let symbols: Vec<Symbol> = symbols.into_iter().map(Into::into).collect();
        let mut state = self.inner.state.lock();
        if self.inner.is_closed() {
            return;
        }
        self.inner.remove_locked(&mut state, &symbols);
    }

    /// Replace the interest set.
    ///
    /// Removals are applied before additions; symbols in both the old and
    /// the new set are left untouched.
    pub fn set_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let mut wanted: Vec<Symbol> = Vec::new();
        let mut seen = BTreeSet::new();
        for symbol in symbols {
            let symbol = symbol.into();
            if seen.insert(symbol.clone()) {
                wanted.push(symbol);
            }
        }

        let fire = {
            let mut state = self.inner.state.lock();
            if self.inner.is_closed() {
                return;
            }
            let removals: Vec<Symbol> = state
                .interest
                .keys()
                .filter(|symbol| !seen.contains(*symbol))
                .cloned()
                .collect();
            let additions: Vec<Symbol> = wanted
                .into_iter()
                .filter(|symbol| !state.interest.contains_key(symbol))
                .collect();

            self.inner.remove_locked(&mut state, &removals);
            self.inner.add_locked(&mut state, additions)
        };
        if fire {
            self.inner.schedule_delivery();
        }
    }

    /// Set the watermark of a time-series handle.
    ///
    /// Accepts epoch milliseconds, date strings and date-time values. All
    /// current symbols are removed and re-added under the new watermark.
    /// Invalid input is reported on the endpoint's warning channel and
    /// ignored.
    pub fn set_from_time(&self, time: impl Into<FromTime>) {
        if !self.inner.kind.is_time_series() {
            self.inner
                .feed
                .warn("setFromTime is ignored for snapshot subscriptions");
            return;
        }

        let millis = match time.into().to_millis() {
            Ok(millis) => millis,
            Err(e) => {
                self.inner
                    .feed
                    .warn(&format!("setFromTime is ignored because of {e}"));
                return;
            }
        };

        let fire = {
            let mut state = self.inner.state.lock();
            if self.inner.is_closed() {
                return;
            }
            let symbols: Vec<Symbol> = state.interest.keys().cloned().collect();
            self.inner.remove_locked(&mut state, &symbols);
            state.from_time = millis;
            self.inner.add_locked(&mut state, symbols)
        };
        if fire {
            self.inner.schedule_delivery();
        }
    }

    /// Close the handle.
    ///
    /// Deregisters every symbol and drops buffered records. Idempotent, and
    /// safe to call from inside the `on_event` callback; every later call on
    /// the handle is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.inner.state.lock();
        let symbols: Vec<Symbol> = state.interest.keys().cloned().collect();
        self.inner.remove_locked(&mut state, &symbols);
        drop(state);

        self.inner.queue.lock().clear();
        debug!(kind = %self.inner.kind, symbols = symbols.len(), "Subscription closed");
    }
}

// =============================================================================
// Handle Internals
// =============================================================================

struct HandleState {
    /// Symbol to one token per event type, in `event_types` order.
    interest: BTreeMap<Symbol, Vec<ListenerToken>>,
    from_time: i64,
}

struct SubscriptionInner {
    me: Weak<Self>,
    feed: Arc<FeedInner>,
    kind: SubscriptionKind,
    event_types: Vec<String>,
    state: Mutex<HandleState>,
    queue: Mutex<DeliveryQueue>,
    on_event: RwLock<Option<EventCallback>>,
    closed: AtomicBool,
    delivery: Mutex<()>,
    delivery_flag: SingleFlight,
}

impl SubscriptionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn key(&self, event_type: &str, symbol: &str) -> InterestKey {
        InterestKey::new(self.kind, event_type, symbol)
    }

    /// Register new symbols. Returns `true` if cached records were queued.
    fn add_locked(&self, state: &mut HandleState, symbols: Vec<Symbol>) -> bool {
        let listener: Arc<dyn EventListener> = match self.me.upgrade() {
            Some(me) => me,
            None => return false,
        };

        let mut fire = false;
        for symbol in symbols {
            if state.interest.contains_key(&symbol) {
                continue;
            }

            let mut tokens = Vec::with_capacity(self.event_types.len());
            for event_type in &self.event_types {
                let registration = self.feed.register(
                    self.key(event_type, &symbol),
                    Arc::clone(&listener),
                    state.from_time,
                );
                tokens.push(registration.token);

                if !registration.cached.is_empty() {
                    let mut queue = self.queue.lock();
                    for event in registration.cached {
                        queue.push(self.kind, event);
                    }
                    fire = true;
                }
            }
            state.interest.insert(symbol, tokens);
        }
        fire
    }

    fn remove_locked(&self, state: &mut HandleState, symbols: &[Symbol]) {
        for symbol in symbols {
            let Some(tokens) = state.interest.remove(symbol) else {
                continue;
            };
            self.queue.lock().discard_symbol(symbol);
            for (event_type, token) in self.event_types.iter().zip(tokens) {
                self.feed.deregister(&self.key(event_type, symbol), token);
            }
        }
    }

    fn schedule_delivery(&self) {
        if !self.delivery_flag.arm() {
            return;
        }
        let Some(me) = self.me.upgrade() else {
            self.delivery_flag.disarm();
            return;
        };
        self.feed.defer(Box::new(move || me.deliver()));
    }

    fn deliver(&self) {
        let _guard = self.delivery.lock();
        self.delivery_flag.disarm();

        if self.is_closed() {
            self.queue.lock().clear();
            return;
        }

        let Some(callback) = self.on_event.read().clone() else {
            return;
        };

        let batch = self.queue.lock().drain();
        for event in batch {
            if self.is_closed() {
                return;
            }
            if !self.state.lock().interest.contains_key(event.event_symbol()) {
                continue;
            }
            callback(&event);
        }
    }
}

impl EventListener for SubscriptionInner {
    fn on_event(&self, event: Arc<EventRecord>) {
        if self.is_closed() {
            return;
        }

        {
            let state = self.state.lock();
            if !state.interest.contains_key(event.event_symbol()) {
                return;
            }
            if self.kind.is_time_series() && event.time_or_epoch() < state.from_time {
                return;
            }
            self.queue.lock().push(self.kind, event);
        }

        self.schedule_delivery();
    }
}

// =============================================================================
// Delivery Queue
// =============================================================================

enum Queued {
    Latest(Arc<EventRecord>),
    Series(BTreeMap<i64, Arc<EventRecord>>),
}

/// Records awaiting delivery, grouped by (type, symbol).
///
/// Snapshot records conflate to the newest; time-series records keep one
/// record per series key.
#[derive(Default)]
struct DeliveryQueue {
    pending: BTreeMap<(String, Symbol), Queued>,
}

impl DeliveryQueue {
    fn push(&mut self, kind: SubscriptionKind, event: Arc<EventRecord>) {
        let key = (
            event.event_type().to_string(),
            event.event_symbol().to_string(),
        );
        match kind {
            SubscriptionKind::Snapshot => {
                self.pending.insert(key, Queued::Latest(event));
            }
            SubscriptionKind::TimeSeries => {
                let entry = self
                    .pending
                    .entry(key)
                    .or_insert_with(|| Queued::Series(BTreeMap::new()));
                if let Queued::Series(series) = entry {
                    series.insert(event.series_key(), event);
                }
            }
        }
    }

    fn discard_symbol(&mut self, symbol: &str) {
        self.pending.retain(|(_, queued_symbol), _| queued_symbol != symbol);
    }

    fn drain(&mut self) -> Vec<Arc<EventRecord>> {
        std::mem::take(&mut self.pending)
            .into_values()
            .flat_map(|queued| match queued {
                Queued::Latest(event) => vec![event],
                Queued::Series(series) => series.into_values().collect(),
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.pending
            .values()
            .map(|queued| match queued {
                Queued::Latest(_) => 1,
                Queued::Series(series) => series.len(),
            })
            .sum()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}
