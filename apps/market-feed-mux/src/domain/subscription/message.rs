//! Outbound subscription message.
//!
//! Wire shape published on the `sub` service:
//!
//! ```json
//! {
//!   "reset": true,
//!   "add": {"Quote": ["AAPL", "MSFT"]},
//!   "remove": {"Quote": ["IBM"]},
//!   "addTimeSeries": {"Candle": [{"eventSymbol": "AAPL", "fromTime": 1690000000000}]},
//!   "removeTimeSeries": {"Candle": ["IBM"]}
//! }
//! ```
//!
//! Empty sections and a false `reset` are omitted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::InterestKey;
use crate::domain::event::{NO_HISTORY, SubscriptionKind};

/// Time-series subscription entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesSubscription {
    /// Subscribed symbol.
    pub event_symbol: String,
    /// Watermark requested from the server, epoch milliseconds.
    ///
    /// `None` (serialized as `null`) when the handle requested no history.
    pub from_time: Option<i64>,
}

/// A batched subscription diff (or full reset) for the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMessage {
    /// The add sections describe the complete desired state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reset: bool,
    /// Snapshot subscriptions to add, by event type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, Vec<String>>,
    /// Snapshot subscriptions to remove, by event type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remove: BTreeMap<String, Vec<String>>,
    /// Time-series subscriptions to add or re-watermark, by event type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add_time_series: BTreeMap<String, Vec<TimeSeriesSubscription>>,
    /// Time-series subscriptions to remove, by event type.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remove_time_series: BTreeMap<String, Vec<String>>,
}

impl SubscriptionMessage {
    /// Build a message from add entries (key and watermark) and removals.
    ///
    /// The watermark is ignored for snapshot keys.
    pub(crate) fn build<'a>(
        reset: bool,
        add: impl IntoIterator<Item = (&'a InterestKey, i64)>,
        remove: impl IntoIterator<Item = &'a InterestKey>,
    ) -> Self {
        let mut message = Self {
            reset,
            ..Self::default()
        };

        for (key, from_time) in add {
            match key.kind {
                SubscriptionKind::Snapshot => message
                    .add
                    .entry(key.event_type.clone())
                    .or_default()
                    .push(key.symbol.clone()),
                SubscriptionKind::TimeSeries => message
                    .add_time_series
                    .entry(key.event_type.clone())
                    .or_default()
                    .push(TimeSeriesSubscription {
                        event_symbol: key.symbol.clone(),
                        from_time: (from_time != NO_HISTORY).then_some(from_time),
                    }),
            }
        }

        for key in remove {
            let section = match key.kind {
                SubscriptionKind::Snapshot => &mut message.remove,
                SubscriptionKind::TimeSeries => &mut message.remove_time_series,
            };
            section
                .entry(key.event_type.clone())
                .or_default()
                .push(key.symbol.clone());
        }

        message
    }

    /// Check if the message carries nothing worth publishing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.reset
            && self.add.is_empty()
            && self.remove.is_empty()
            && self.add_time_series.is_empty()
            && self.remove_time_series.is_empty()
    }

    /// Total number of (type, symbol) entries across all sections.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.add.values().map(Vec::len).sum::<usize>()
            + self.remove.values().map(Vec::len).sum::<usize>()
            + self.add_time_series.values().map(Vec::len).sum::<usize>()
            + self.remove_time_series.values().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_only_populated_sections() {
        let quote = InterestKey::snapshot("Quote", "AAPL");
        let candle = InterestKey::time_series("Candle", "IBM");
        let gone = InterestKey::time_series("Candle", "MSFT");

        let message =
            SubscriptionMessage::build(false, [(&quote, 0), (&candle, 1_000)], [&gone]);

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "add": {"Quote": ["AAPL"]},
                "addTimeSeries": {"Candle": [{"eventSymbol": "IBM", "fromTime": 1000}]},
                "removeTimeSeries": {"Candle": ["MSFT"]}
            })
        );
    }

    #[test]
    fn no_history_watermark_serializes_as_null() {
        let candle = InterestKey::time_series("Candle", "AAPL");

        let message = SubscriptionMessage::build(
            false,
            [(&candle, NO_HISTORY)],
            Vec::<&InterestKey>::new(),
        );

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"addTimeSeries": {"Candle": [{"eventSymbol": "AAPL", "fromTime": null}]}})
        );
    }

    #[test]
    fn bare_reset_is_not_empty() {
        let message = SubscriptionMessage::build(
            true,
            Vec::<(&InterestKey, i64)>::new(),
            Vec::<&InterestKey>::new(),
        );

        assert!(!message.is_empty());
        assert_eq!(serde_json::to_value(&message).unwrap(), json!({"reset": true}));
    }

    #[test]
    fn default_is_empty() {
        let message = SubscriptionMessage::default();
        assert!(message.is_empty());
        assert_eq!(message.entry_count(), 0);
    }

    #[test]
    fn deserializes_wire_shape() {
        let message: SubscriptionMessage = serde_json::from_value(json!({
            "remove": {"Trade": ["AAPL", "MSFT"]}
        }))
        .unwrap();

        assert!(!message.reset);
        assert_eq!(message.remove["Trade"], vec!["AAPL", "MSFT"]);
        assert_eq!(message.entry_count(), 2);
    }
}
