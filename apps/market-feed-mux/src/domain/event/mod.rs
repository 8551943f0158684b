//! Market Data Event Types
//!
//! Decoded event records and the two subscription kinds they flow through.
//!
//! # Record Shape
//!
//! Every record carries its event type (stamped from the frame header) and
//! its symbol. Time-series records also carry `eventId` and `time`, which
//! drive ordering, de-duplication and watermark filtering. All remaining
//! fields are kept as raw JSON scalars keyed by field name.

mod time;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use time::{FromTime, InvalidFromTime, NO_HISTORY};

// =============================================================================
// Subscription Kind
// =============================================================================

/// How events of a subscription are retained and requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    /// Only the latest record per (type, symbol) matters.
    Snapshot,
    /// Ordered records keyed by event id, requested from a `fromTime`.
    TimeSeries,
}

impl SubscriptionKind {
    /// Get the kind name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::TimeSeries => "time_series",
        }
    }

    /// Check if this is the time-series kind.
    #[must_use]
    pub const fn is_time_series(self) -> bool {
        matches!(self, Self::TimeSeries)
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event Record
// =============================================================================

/// A single decoded market data event.
///
/// Records are immutable once decoded and are shared between the registry
/// cache and every interested subscription behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    event_type: String,
    event_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<i64>,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl EventRecord {
    /// Create a record with no fields besides its type and symbol.
    #[must_use]
    pub fn new(event_type: impl Into<String>, event_symbol: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            event_symbol: event_symbol.into(),
            event_id: None,
            time: None,
            fields: Map::new(),
        }
    }

    /// Build a record from decoded field values.
    ///
    /// `eventSymbol` must be present and a string; `eventId` and `time` are
    /// lifted into typed slots when numeric. Returns `None` when the symbol
    /// is missing.
    #[must_use]
    pub fn from_fields(event_type: impl Into<String>, mut fields: Map<String, Value>) -> Option<Self> {
        let event_symbol = match fields.remove("eventSymbol") {
            Some(Value::String(symbol)) => symbol,
            _ => return None,
        };
        fields.remove("eventType");
        let event_id = fields.remove("eventId").as_ref().and_then(as_millis);
        let time = fields.remove("time").as_ref().and_then(as_millis);

        Some(Self {
            event_type: event_type.into(),
            event_symbol,
            event_id,
            time,
            fields,
        })
    }

    /// Set the event id.
    #[must_use]
    pub fn with_event_id(mut self, event_id: i64) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Set the event time in epoch milliseconds.
    #[must_use]
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    /// Add a field value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Event type name, e.g. `Quote`.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Event symbol, e.g. `AAPL`.
    #[must_use]
    pub fn event_symbol(&self) -> &str {
        &self.event_symbol
    }

    /// Event id (time-series records).
    #[must_use]
    pub const fn event_id(&self) -> Option<i64> {
        self.event_id
    }

    /// Event time in epoch milliseconds (time-series records).
    #[must_use]
    pub const fn time(&self) -> Option<i64> {
        self.time
    }

    /// Event time, treating a missing time as the epoch.
    #[must_use]
    pub fn time_or_epoch(&self) -> i64 {
        self.time.unwrap_or(0)
    }

    /// Key identifying this record within its time series.
    ///
    /// Falls back to `time` when the server omits `eventId`.
    #[must_use]
    pub fn series_key(&self) -> i64 {
        self.event_id.or(self.time).unwrap_or(0)
    }

    /// Get a raw field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a numeric field value.
    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    /// Get a string field value.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// All fields besides type, symbol, id and time.
    #[must_use]
    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

#[allow(clippy::cast_possible_truncation)]
fn as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}
