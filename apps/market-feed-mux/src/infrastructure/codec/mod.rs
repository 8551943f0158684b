//! Feed Codec Module
//!
//! Decoding of compact inbound data frames and encoding of outbound
//! subscription messages.
//!
//! # Inbound Frame Format
//!
//! A frame is a two-element JSON array. The header is either a known event
//! type name or a `[type, fields]` pair that (re)defines the field schema:
//!
//! ```json
//! [["Trade", ["eventSymbol", "price"]], ["AAPL", 101.5, "MSFT", 305.2]]
//! ["Trade", ["IBM", 140.1]]
//! ```
//!
//! The value list is flat, one group of `fields.len()` scalars per record.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::domain::event::EventRecord;
use crate::domain::subscription::SubscriptionMessage;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame references a type whose schema has not been defined yet.
    #[error("unknown schema for event type: {0}")]
    UnknownSchema(String),

    /// Frame does not have the `[header, values]` shape.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

// =============================================================================
// Inbound Frame
// =============================================================================

/// A parsed but not yet decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Header names a type whose schema was sent earlier.
    Referencing {
        /// Event type name.
        event_type: String,
        /// Flat value list.
        values: Vec<Value>,
    },
    /// Header carries the schema for the type.
    Defining {
        /// Event type name.
        event_type: String,
        /// Ordered field names.
        fields: Vec<String>,
        /// Flat value list.
        values: Vec<Value>,
    },
}

impl InboundFrame {
    /// Parse the frame shape.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the frame is not `[header, [values...]]`.
    pub fn parse(frame: Value) -> Result<Self, CodecError> {
        let Value::Array(parts) = frame else {
            return Err(CodecError::InvalidFormat("expected JSON array".to_string()));
        };
        let [header, values]: [Value; 2] = parts.try_into().map_err(|parts: Vec<Value>| {
            CodecError::InvalidFormat(format!("expected 2 elements, got {}", parts.len()))
        })?;
        let Value::Array(values) = values else {
            return Err(CodecError::InvalidFormat(
                "expected value array".to_string(),
            ));
        };

        match header {
            Value::String(event_type) => Ok(Self::Referencing { event_type, values }),
            Value::Array(schema) => {
                let mut schema = schema.into_iter();
                let event_type = match schema.next() {
                    Some(Value::String(event_type)) => event_type,
                    _ => {
                        return Err(CodecError::InvalidFormat(
                            "schema header must start with the type name".to_string(),
                        ));
                    }
                };
                let fields = match schema.next() {
                    Some(Value::Array(fields)) => fields
                        .into_iter()
                        .map(|field| match field {
                            Value::String(name) => Ok(name),
                            other => Err(CodecError::InvalidFormat(format!(
                                "field name must be a string, got {other}"
                            ))),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => {
                        return Err(CodecError::InvalidFormat(
                            "schema header must carry a field list".to_string(),
                        ));
                    }
                };
                if fields.is_empty() {
                    return Err(CodecError::InvalidFormat(format!(
                        "empty schema for event type: {event_type}"
                    )));
                }
                Ok(Self::Defining {
                    event_type,
                    fields,
                    values,
                })
            }
            other => Err(CodecError::InvalidFormat(format!(
                "unexpected frame header: {other}"
            ))),
        }
    }

    /// Event type named by the header.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::Referencing { event_type, .. } | Self::Defining { event_type, .. } => event_type,
        }
    }
}

// =============================================================================
// Decoded Batch
// =============================================================================

/// Records decoded from one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBatch {
    /// Event type of every record in the batch.
    pub event_type: String,
    /// Decoded records, in frame order.
    pub records: Vec<EventRecord>,
    /// Trailing values that did not fill a whole record.
    pub trailing_values: usize,
    /// Records skipped because they had no string `eventSymbol`.
    pub missing_symbol: usize,
}

// =============================================================================
// Frame Codec
// =============================================================================

/// Schema-caching codec for one feed.
///
/// The schema cache is keyed by event type name and lives as long as the
/// codec, so it survives reconnects.
#[derive(Debug, Default)]
pub struct FrameCodec {
    schemas: RwLock<HashMap<String, Arc<[String]>>>,
}

impl FrameCodec {
    /// Create a codec with an empty schema cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a raw inbound frame into records.
    ///
    /// A defining frame updates the schema cache before its values are
    /// decoded, even if nobody is interested in the type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for malformed frames and `UnknownSchema` when
    /// a referencing frame names a type with no cached schema.
    pub fn decode(&self, frame: Value) -> Result<DecodedBatch, CodecError> {
        let (event_type, fields, values) = match InboundFrame::parse(frame)? {
            InboundFrame::Defining {
                event_type,
                fields,
                values,
            } => {
                let fields: Arc<[String]> = fields.into();
                self.schemas
                    .write()
                    .insert(event_type.clone(), Arc::clone(&fields));
                (event_type, fields, values)
            }
            InboundFrame::Referencing { event_type, values } => {
                let fields = self
                    .schemas
                    .read()
                    .get(&event_type)
                    .cloned()
                    .ok_or_else(|| CodecError::UnknownSchema(event_type.clone()))?;
                (event_type, fields, values)
            }
        };

        Ok(decode_values(event_type, &fields, values))
    }

    /// Get the cached schema for a type.
    #[must_use]
    pub fn schema(&self, event_type: &str) -> Option<Arc<[String]>> {
        self.schemas.read().get(event_type).cloned()
    }

    /// Encode a subscription message for publishing.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode(&self, message: &SubscriptionMessage) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(message)?)
    }
}

fn decode_values(event_type: String, fields: &[String], values: Vec<Value>) -> DecodedBatch {
    let width = fields.len();
    let trailing_values = values.len() % width;
    let mut batch = DecodedBatch {
        records: Vec::with_capacity(values.len() / width),
        trailing_values,
        ..DecodedBatch::default()
    };

    let mut values = values.into_iter();
    for _ in 0..values.len() / width {
        let record: Map<String, Value> = fields.iter().cloned().zip(values.by_ref()).collect();
        match EventRecord::from_fields(event_type.as_str(), record) {
            Some(record) => batch.records.push(record),
            None => batch.missing_symbol += 1,
        }
    }

    batch.event_type = event_type;
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn defining_frame_decodes_records() {
        let codec = FrameCodec::new();

        let batch = codec
            .decode(json!([["trade", ["eventSymbol", "price"]], ["AAPL", 101.5, "MSFT", 305.2]]))
            .unwrap();

        assert_eq!(batch.event_type, "trade");
        assert_eq!(batch.records.len(), 2);
        assert_eq!(
            serde_json::to_value(&batch.records[0]).unwrap(),
            json!({"eventType": "trade", "eventSymbol": "AAPL", "price": 101.5})
        );
        assert_eq!(
            serde_json::to_value(&batch.records[1]).unwrap(),
            json!({"eventType": "trade", "eventSymbol": "MSFT", "price": 305.2})
        );
    }

    #[test]
    fn referencing_frame_uses_cached_schema() {
        let codec = FrameCodec::new();
        codec
            .decode(json!([["Quote", ["bidPrice", "askPrice", "eventSymbol"]], []]))
            .unwrap();

        let batch = codec.decode(json!(["Quote", [1.0, 1.1, "SYM1", 2.0, 2.1, "SYM2"]])).unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[1].event_symbol(), "SYM2");
        assert_eq!(batch.records[1].get_f64("askPrice"), Some(2.1));
    }

    #[test]
    fn unknown_schema_is_reported() {
        let codec = FrameCodec::new();

        let err = codec.decode(json!(["Quote", [1.0, "AAPL"]])).unwrap_err();

        assert!(matches!(err, CodecError::UnknownSchema(ref t) if t == "Quote"));
    }

    #[test]
    fn redefinition_replaces_schema() {
        let codec = FrameCodec::new();
        codec.decode(json!([["Trade", ["eventSymbol", "price"]], []])).unwrap();
        codec
            .decode(json!([["Trade", ["price", "size", "eventSymbol"]], []]))
            .unwrap();

        let batch = codec.decode(json!(["Trade", [10.0, 5, "IBM"]])).unwrap();

        assert_eq!(batch.records[0].event_symbol(), "IBM");
        assert_eq!(batch.records[0].get("size"), Some(&json!(5)));
        assert_eq!(codec.schema("Trade").unwrap().len(), 3);
    }

    #[test]
    fn trailing_partial_record_is_dropped() {
        let codec = FrameCodec::new();

        let batch = codec
            .decode(json!([["Trade", ["eventSymbol", "price"]], ["AAPL", 1.0, "MSFT"]]))
            .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.trailing_values, 1);
    }

    #[test]
    fn records_without_symbol_are_skipped() {
        let codec = FrameCodec::new();

        let batch = codec
            .decode(json!([["Trade", ["eventSymbol", "price"]], [null, 1.0, "MSFT", 2.0]]))
            .unwrap();

        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.missing_symbol, 1);
    }

    #[test]
    fn time_series_fields_are_lifted() {
        let codec = FrameCodec::new();

        let batch = codec
            .decode(json!([
                ["Candle", ["eventSymbol", "eventId", "time", "close"]],
                ["AAPL{=d}", 42, 1_690_000_000_000_i64, 191.2]
            ]))
            .unwrap();

        assert_eq!(batch.records[0].event_id(), Some(42));
        assert_eq!(batch.records[0].time(), Some(1_690_000_000_000));
    }

    #[test_case(json!({"Quote": []}) ; "object frame")]
    #[test_case(json!(["Quote"]) ; "missing values")]
    #[test_case(json!(["Quote", [], []]) ; "extra element")]
    #[test_case(json!(["Quote", {}]) ; "values not array")]
    #[test_case(json!([42, []]) ; "numeric header")]
    #[test_case(json!([["Quote"], []]) ; "schema without fields")]
    #[test_case(json!([["Quote", []], []]) ; "empty schema")]
    #[test_case(json!([["Quote", ["eventSymbol", 1]], []]) ; "non string field")]
    fn malformed_frames_rejected(frame: Value) {
        let codec = FrameCodec::new();
        assert!(matches!(codec.decode(frame), Err(CodecError::InvalidFormat(_))));
    }

    #[test]
    fn parse_reports_header_type() {
        let frame = InboundFrame::parse(json!([["Quote", ["eventSymbol"]], []])).unwrap();
        assert_eq!(frame.event_type(), "Quote");
        assert!(matches!(frame, InboundFrame::Defining { .. }));

        let frame = InboundFrame::parse(json!(["Quote", []])).unwrap();
        assert!(matches!(frame, InboundFrame::Referencing { .. }));
    }

    #[test]
    fn encode_subscription_message() {
        let codec = FrameCodec::new();
        let mut message = SubscriptionMessage::default();
        message.remove.insert("Quote".to_string(), vec!["AAPL".to_string()]);

        let value = codec.encode(&message).unwrap();

        assert_eq!(value, json!({"remove": {"Quote": ["AAPL"]}}));
    }
}
