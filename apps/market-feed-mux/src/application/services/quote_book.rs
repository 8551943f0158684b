//! Quote Book
//!
//! Reference-counted registry of one shared quote model per symbol. The
//! first `subscribe` for a symbol subscribes it to every market data kind;
//! the last `unsubscribe` drops the model and unsubscribes the symbol.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::domain::event::EventRecord;

use super::market_data::{EventKind, MarketData};

/// Field values copied from market data records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteSnapshot {
    /// Instrument description (Profile).
    pub description: Option<String>,
    /// Best bid (Quote).
    pub bid_price: Option<f64>,
    /// Best ask (Quote).
    pub ask_price: Option<f64>,
    /// Last trade price (Trade).
    pub price: Option<f64>,
    /// Session open (Summary).
    pub day_open_price: Option<f64>,
    /// Session high (Summary).
    pub day_high_price: Option<f64>,
    /// Session low (Summary).
    pub day_low_price: Option<f64>,
    /// Previous session close (Summary).
    pub prev_day_close_price: Option<f64>,
}

impl QuoteSnapshot {
    /// Copy the fields a record of the given kind carries.
    ///
    /// Fields absent from the record are left unchanged.
    fn apply(&mut self, kind: EventKind, event: &EventRecord) {
        fn set(slot: &mut Option<f64>, value: Option<f64>) {
            if value.is_some() {
                *slot = value;
            }
        }

        match kind {
            EventKind::Profile => {
                if let Some(description) = event.get_str("description") {
                    self.description = Some(description.to_string());
                }
            }
            EventKind::Quote => {
                set(&mut self.bid_price, event.get_f64("bidPrice"));
                set(&mut self.ask_price, event.get_f64("askPrice"));
            }
            EventKind::Trade => set(&mut self.price, event.get_f64("price")),
            EventKind::Summary => {
                set(&mut self.day_open_price, event.get_f64("dayOpenPrice"));
                set(&mut self.day_high_price, event.get_f64("dayHighPrice"));
                set(&mut self.day_low_price, event.get_f64("dayLowPrice"));
                set(
                    &mut self.prev_day_close_price,
                    event.get_f64("prevDayClosePrice"),
                );
            }
        }
    }
}

/// The shared model for one symbol.
#[derive(Debug)]
pub struct QuoteModel {
    symbol: String,
    snapshot: RwLock<QuoteSnapshot>,
}

impl QuoteModel {
    fn new(symbol: String) -> Self {
        Self {
            symbol,
            snapshot: RwLock::new(QuoteSnapshot::default()),
        }
    }

    /// Symbol this model tracks.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Current field values.
    #[must_use]
    pub fn snapshot(&self) -> QuoteSnapshot {
        self.snapshot.read().clone()
    }
}

struct Entry {
    model: Arc<QuoteModel>,
    refs: usize,
}

/// Symbol to shared model registry.
#[derive(Clone)]
pub struct QuoteBook {
    market_data: MarketData,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl std::fmt::Debug for QuoteBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuoteBook")
            .field("symbols", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl QuoteBook {
    /// Create a book fed by a market data service.
    #[must_use]
    pub fn new(market_data: MarketData) -> Self {
        let entries: Arc<Mutex<HashMap<String, Entry>>> = Arc::default();

        for kind in EventKind::ALL {
            let entries = Arc::clone(&entries);
            market_data.on(kind, move |event| {
                let model = entries
                    .lock()
                    .get(event.event_symbol())
                    .map(|entry| Arc::clone(&entry.model));
                if let Some(model) = model {
                    model.snapshot.write().apply(kind, event);
                }
            });
        }

        Self {
            market_data,
            entries,
        }
    }

    /// Get the shared model for a symbol, subscribing on first use.
    pub fn subscribe(&self, symbol: &str) -> Arc<QuoteModel> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(symbol) {
            entry.refs += 1;
            return Arc::clone(&entry.model);
        }

        let model = Arc::new(QuoteModel::new(symbol.to_string()));
        entries.insert(
            symbol.to_string(),
            Entry {
                model: Arc::clone(&model),
                refs: 1,
            },
        );
        self.market_data.subscribe_to_all(symbol);
        debug!(symbol, "Quote model created");
        model
    }

    /// Release one reference to a symbol's model.
    ///
    /// Returns `true` when this was the last reference and the symbol was
    /// unsubscribed. Unknown symbols are ignored.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(symbol) else {
            return false;
        };

        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }

        entries.remove(symbol);
        self.market_data.unsubscribe_to_all(symbol);
        debug!(symbol, "Quote model released");
        true
    }

    /// Get the model for a symbol without taking a reference.
    #[must_use]
    pub fn model(&self, symbol: &str) -> Option<Arc<QuoteModel>> {
        self.entries
            .lock()
            .get(symbol)
            .map(|entry| Arc::clone(&entry.model))
    }

    /// Number of references held for a symbol.
    #[must_use]
    pub fn ref_count(&self, symbol: &str) -> usize {
        self.entries.lock().get(symbol).map_or(0, |entry| entry.refs)
    }

    /// Symbols with a live model, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.entries.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockFeedEndpoint;
    use crate::application::services::Feed;
    use crate::infrastructure::scheduler::TaskQueue;
    use serde_json::{Value, json};
    use test_case::test_case;

    struct Harness {
        feed: Feed,
        queue: Arc<TaskQueue>,
        published: Arc<Mutex<Vec<Value>>>,
        book: QuoteBook,
    }

    fn harness() -> Harness {
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        let mut endpoint = MockFeedEndpoint::new();
        endpoint.expect_attach().return_const(());
        endpoint.expect_connect_if_needed().return_const(());
        endpoint.expect_is_connected().return_const(true);
        endpoint
            .expect_publish()
            .returning(move |_, message| sink.lock().push(message));

        let queue = Arc::new(TaskQueue::new());
        let feed = Feed::new(Arc::new(endpoint), queue.clone());
        let book = QuoteBook::new(MarketData::new(&feed));
        Harness {
            feed,
            queue,
            published,
            book,
        }
    }

    #[test]
    fn models_are_shared_and_reference_counted() {
        let h = harness();

        let first = h.book.subscribe("AAPL");
        let second = h.book.subscribe("AAPL");
        h.queue.run_until_idle();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.book.ref_count("AAPL"), 2);
        assert_eq!(
            *h.published.lock(),
            vec![json!({
                "reset": true,
                "add": {"Profile": ["AAPL"], "Quote": ["AAPL"], "Summary": ["AAPL"], "Trade": ["AAPL"]}
            })]
        );

        assert!(!h.book.unsubscribe("AAPL"));
        assert!(h.book.model("AAPL").is_some());
        assert!(h.book.unsubscribe("AAPL"));
        assert!(h.book.model("AAPL").is_none());
        assert!(!h.book.unsubscribe("AAPL"));
        h.queue.run_until_idle();

        assert_eq!(
            h.published.lock().last(),
            Some(&json!({
                "remove": {"Profile": ["AAPL"], "Quote": ["AAPL"], "Summary": ["AAPL"], "Trade": ["AAPL"]}
            }))
        );
    }

    #[test]
    fn delivered_events_update_model() {
        let h = harness();
        let model = h.book.subscribe("AAPL");
        h.queue.run_until_idle();

        h.feed.dispatch(
            json!([["Quote", ["eventSymbol", "bidPrice", "askPrice"]], ["AAPL", 189.5, 189.7]]),
            false,
        );
        h.feed.dispatch(
            json!([["Trade", ["eventSymbol", "price"]], ["AAPL", 189.6]]),
            false,
        );
        h.queue.run_until_idle();

        let snapshot = model.snapshot();
        assert_eq!(model.symbol(), "AAPL");
        assert_eq!(snapshot.bid_price, Some(189.5));
        assert_eq!(snapshot.ask_price, Some(189.7));
        assert_eq!(snapshot.price, Some(189.6));
        assert_eq!(snapshot.description, None);
        assert_eq!(h.book.symbols(), vec!["AAPL".to_string()]);
    }

    fn record(event_type: &str) -> EventRecord {
        EventRecord::new(event_type, "AAPL")
            .with_field("description", "Apple Inc.")
            .with_field("bidPrice", 1.0)
            .with_field("askPrice", 1.1)
            .with_field("price", 1.05)
            .with_field("dayOpenPrice", 0.9)
            .with_field("dayHighPrice", 1.2)
            .with_field("dayLowPrice", 0.8)
            .with_field("prevDayClosePrice", 0.95)
    }

    #[test_case(EventKind::Profile, QuoteSnapshot { description: Some("Apple Inc.".to_string()), ..QuoteSnapshot::default() } ; "profile")]
    #[test_case(EventKind::Quote, QuoteSnapshot { bid_price: Some(1.0), ask_price: Some(1.1), ..QuoteSnapshot::default() } ; "quote")]
    #[test_case(EventKind::Trade, QuoteSnapshot { price: Some(1.05), ..QuoteSnapshot::default() } ; "trade")]
    #[test_case(
        EventKind::Summary,
        QuoteSnapshot {
            day_open_price: Some(0.9),
            day_high_price: Some(1.2),
            day_low_price: Some(0.8),
            prev_day_close_price: Some(0.95),
            ..QuoteSnapshot::default()
        } ;
        "summary"
    )]
    fn apply_copies_kind_fields(kind: EventKind, expected: QuoteSnapshot) {
        let mut snapshot = QuoteSnapshot::default();
        snapshot.apply(kind, &record(kind.event_type()));
        assert_eq!(snapshot, expected);
    }

    #[test]
    fn apply_keeps_values_missing_from_record() {
        let mut snapshot = QuoteSnapshot {
            bid_price: Some(5.0),
            ask_price: Some(5.5),
            ..QuoteSnapshot::default()
        };

        snapshot.apply(
            EventKind::Quote,
            &EventRecord::new("Quote", "AAPL").with_field("askPrice", 6.0),
        );

        assert_eq!(snapshot.bid_price, Some(5.0));
        assert_eq!(snapshot.ask_price, Some(6.0));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snapshot = QuoteSnapshot {
            prev_day_close_price: Some(1.0),
            ..QuoteSnapshot::default()
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["prevDayClosePrice"], 1.0);
    }
}
