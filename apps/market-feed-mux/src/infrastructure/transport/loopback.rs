//! In-memory transport.
//!
//! Reports every `open` as an immediate successful connect, records what the
//! endpoint sends and lets the host inject inbound messages and disconnects.
//! Events flow to the endpoint over the same channel a network adapter
//! would use.

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::ports::{Transport, TransportError};
use crate::infrastructure::endpoint::TransportEvent;

/// A message the endpoint sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Channel name.
    pub channel: String,
    /// Payload.
    pub message: Value,
}

/// In-memory `Transport`.
#[derive(Debug)]
pub struct LoopbackTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<SentMessage>>,
    opened: Mutex<Vec<String>>,
}

impl LoopbackTransport {
    /// Create a transport and the receiver to hand to `Endpoint::run`.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            events,
            sent: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
        };
        (transport, rx)
    }

    /// Deliver an inbound message on a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint stopped listening.
    pub fn inject(&self, channel: &str, data: Value) -> Result<(), TransportError> {
        self.emit(TransportEvent::Message {
            channel: channel.to_string(),
            data,
        })
    }

    /// Simulate losing the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint stopped listening.
    pub fn drop_connection(&self, reason: &str) -> Result<(), TransportError> {
        self.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
    }

    /// Messages sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Take and clear the messages sent so far.
    #[must_use]
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// URLs passed to `open`, in order.
    #[must_use]
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }

    fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.events.send(event).map_err(|_| TransportError::Closed)
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, url: &str) -> Result<(), TransportError> {
        debug!(url, "Loopback open");
        self.opened.lock().push(url.to_string());
        self.emit(TransportEvent::Connected)
    }

    fn send(&self, channel: &str, message: Value) -> Result<(), TransportError> {
        self.sent.lock().push(SentMessage {
            channel: channel.to_string(),
            message,
        });
        Ok(())
    }

    fn close(&self) {
        debug!("Loopback close");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_reports_connected() {
        let (transport, mut rx) = LoopbackTransport::new();

        transport.open("wss://feed.test/ws").unwrap();

        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Connected);
        assert_eq!(transport.opened(), vec!["wss://feed.test/ws".to_string()]);
    }

    #[test]
    fn inject_and_drop_emit_events() {
        let (transport, mut rx) = LoopbackTransport::new();

        transport.inject("/service/data", json!(["Quote", []])).unwrap();
        transport.drop_connection("gone").unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Message {
                channel: "/service/data".to_string(),
                data: json!(["Quote", []]),
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Disconnected {
                reason: "gone".to_string()
            }
        );
    }

    #[test]
    fn send_records_and_take_clears() {
        let (transport, _rx) = LoopbackTransport::new();

        transport.send("/service/sub", json!({"reset": true})).unwrap();

        assert_eq!(transport.sent().len(), 1);
        let taken = transport.take_sent();
        assert_eq!(taken[0].channel, "/service/sub");
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn emit_after_receiver_dropped_is_closed() {
        let (transport, rx) = LoopbackTransport::new();
        drop(rx);

        assert_eq!(
            transport.inject("/service/data", json!([])),
            Err(TransportError::Closed)
        );
    }
}
