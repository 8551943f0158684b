//! Feed Endpoint
//!
//! Connection state machine between a `Transport` adapter and the
//! subscription registry. The endpoint owns connectivity: it opens the
//! transport lazily, drops outbound messages while disconnected, routes
//! inbound channels to the registry and re-opens after unexpected
//! disconnects with exponential backoff.
//!
//! Transport failures never propagate past this type. They show up only as
//! `is_connected()` returning `false`.

pub mod reconnect;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::ports::{EndpointListener, FeedEndpoint, Transport, TransportError};
use crate::infrastructure::config::FeedConfig;
use crate::infrastructure::metrics;

pub use reconnect::ReconnectPolicy;

/// Inbound snapshot data channel.
pub const DATA_CHANNEL: &str = "/service/data";

/// Inbound time-series data channel.
pub const TIME_SERIES_DATA_CHANNEL: &str = "/service/timeSeriesData";

/// Prefix of outbound service channels.
pub const SERVICE_CHANNEL_PREFIX: &str = "/service/";

/// Endpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// No URL is configured.
    #[error("no URL configured")]
    MissingUrl,

    /// The transport refused the attempt.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Reconnection gave up.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttempts(u32),
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and no attempt in flight.
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// Connected.
    Connected,
}

/// Events reported by a transport adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is established.
    Connected,
    /// The connection was lost or could not be established.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
    /// A message arrived on a channel.
    Message {
        /// Channel name.
        channel: String,
        /// Message payload.
        data: Value,
    },
}

struct EndpointState {
    connection: ConnectionState,
    url: Option<String>,
    /// `connect` was called at least once; survives `disconnect`.
    connect_called: bool,
    /// Reconnection is wanted; cleared by `disconnect` and on giving up.
    requested: bool,
    policy: ReconnectPolicy,
    /// Backoff outcome of a failed open, picked up by `run`.
    pending_retry: Option<Result<Duration, EndpointError>>,
    connected_once: bool,
    reconnects: u32,
}

impl EndpointState {
    /// Next backoff delay, or give up when attempts are exhausted.
    fn next_retry(&mut self) -> Result<Duration, EndpointError> {
        if let Some(delay) = self.policy.next_delay() {
            warn!(
                attempt = self.policy.attempts(),
                delay_ms = delay.as_millis(),
                "Scheduling reconnect"
            );
            return Ok(delay);
        }

        let attempts = self.policy.attempts();
        self.requested = false;
        error!(attempts, "Giving up reconnecting");
        Err(EndpointError::MaxReconnectAttempts(attempts))
    }
}

/// Connection endpoint shared by a feed and its handles.
pub struct Endpoint {
    transport: Arc<dyn Transport>,
    state: Mutex<EndpointState>,
    listener: RwLock<Option<Weak<dyn EndpointListener>>>,
    retry_ready: Notify,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Endpoint")
            .field("connection", &state.connection)
            .field("url", &state.url)
            .field("requested", &state.requested)
            .field("reconnects", &state.reconnects)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Create an endpoint over a transport using the feed configuration.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: &FeedConfig) -> Self {
        Self::with_policy(
            transport,
            config.url.clone(),
            ReconnectPolicy::new(config.reconnect.clone()),
        )
    }

    /// Create an endpoint with an explicit URL and backoff policy.
    #[must_use]
    pub fn with_policy(
        transport: Arc<dyn Transport>,
        url: Option<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            transport,
            state: Mutex::new(EndpointState {
                connection: ConnectionState::Disconnected,
                url,
                connect_called: false,
                requested: false,
                policy,
                pending_retry: None,
                connected_once: false,
                reconnects: 0,
            }),
            listener: RwLock::new(None),
            retry_ready: Notify::new(),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    /// Configured URL.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.state.lock().url.clone()
    }

    /// Number of transitions to connected after the first one.
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.state.lock().reconnects
    }

    /// Begin connecting, optionally switching to a new URL.
    ///
    /// While an attempt is in flight or the endpoint is connected only the
    /// URL is updated.
    pub fn connect(&self, url: Option<String>) {
        {
            let mut state = self.state.lock();
            state.connect_called = true;
            state.requested = true;
            if url.is_some() {
                state.url = url;
            }
            if state.connection != ConnectionState::Disconnected {
                return;
            }
        }
        self.open_or_warn();
    }

    /// Tear the connection down and stop reconnecting.
    ///
    /// `connect_if_needed` stays a no-op afterwards; only `connect` opens
    /// the transport again.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            state.requested = false;
            state.pending_retry = None;
            state.connection = ConnectionState::Disconnected;
            state.policy.reset();
        }
        info!("Disconnecting");
        self.transport.close();
    }

    /// Re-open after a backoff delay, unless disconnected or connected since.
    pub fn reconnect(&self) {
        {
            let state = self.state.lock();
            if !state.requested || state.connection != ConnectionState::Disconnected {
                return;
            }
        }
        self.open_or_warn();
    }

    /// Apply one transport event.
    ///
    /// Returns the delay before the next re-open attempt when the event was
    /// an unexpected disconnect.
    ///
    /// # Errors
    ///
    /// Returns an error when reconnect attempts are exhausted.
    pub fn handle_event(&self, event: TransportEvent) -> Result<Option<Duration>, EndpointError> {
        match event {
            TransportEvent::Connected => {
                let reconnected = {
                    let mut state = self.state.lock();
                    if state.connection == ConnectionState::Connected {
                        return Ok(None);
                    }
                    state.connection = ConnectionState::Connected;
                    state.policy.reset();
                    let reconnected = state.connected_once;
                    state.connected_once = true;
                    if reconnected {
                        state.reconnects += 1;
                    }
                    reconnected
                };
                info!(reconnected, "Connection established");
                if reconnected {
                    metrics::record_reconnect();
                }
                if let Some(listener) = self.listener() {
                    listener.on_reconnect();
                }
                Ok(None)
            }
            TransportEvent::Disconnected { reason } => {
                let mut state = self.state.lock();
                state.connection = ConnectionState::Disconnected;
                info!(%reason, "Connection lost");

                if !state.requested {
                    return Ok(None);
                }
                state.next_retry().map(Some)
            }
            TransportEvent::Message { channel, data } => {
                debug!(%channel, %data, "Received message");
                let time_series = match channel.as_str() {
                    DATA_CHANNEL => false,
                    TIME_SERIES_DATA_CHANNEL => true,
                    _ => {
                        debug!(%channel, "Ignoring message on unknown channel");
                        return Ok(None);
                    }
                };
                if let Some(listener) = self.listener() {
                    listener.on_data(data, time_series);
                }
                Ok(None)
            }
        }
    }

    /// Pump transport events until cancelled or the channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error when reconnect attempts are exhausted.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<(), EndpointError> {
        let mut reconnect_at: Option<Instant> = None;

        loop {
            let deadline = reconnect_at.unwrap_or_else(Instant::now);
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Endpoint cancelled");
                    self.disconnect();
                    return Ok(());
                }
                () = tokio::time::sleep_until(deadline), if reconnect_at.is_some() => {
                    reconnect_at = None;
                    self.reconnect();
                }
                () = self.retry_ready.notified() => {
                    let pending = self.state.lock().pending_retry.take();
                    if let Some(next) = pending {
                        reconnect_at = Some(Instant::now() + next?);
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("Transport event channel closed");
                        return Ok(());
                    };
                    if let Some(delay) = self.handle_event(event)? {
                        reconnect_at = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }

    fn listener(&self) -> Option<Arc<dyn EndpointListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    fn open_or_warn(&self) {
        match self.open() {
            Ok(()) => {}
            Err(EndpointError::MissingUrl) => self.warn("No URL, working without connection"),
            Err(e) => {
                warn!(error = %e, "Failed to start connection attempt");
                self.schedule_retry();
            }
        }
    }

    /// Hand the backoff for a failed open to `run`.
    fn schedule_retry(&self) {
        {
            let mut state = self.state.lock();
            if !state.requested {
                return;
            }
            let next = state.next_retry();
            state.pending_retry = Some(next);
        }
        self.retry_ready.notify_one();
    }

    fn open(&self) -> Result<(), EndpointError> {
        let url = {
            let mut state = self.state.lock();
            let url = state.url.clone().ok_or(EndpointError::MissingUrl)?;
            state.connection = ConnectionState::Connecting;
            url
        };

        info!(%url, "Connecting");
        if let Err(e) = self.transport.open(&url) {
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Connecting {
                state.connection = ConnectionState::Disconnected;
            }
            return Err(e.into());
        }
        Ok(())
    }
}

impl FeedEndpoint for Endpoint {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn connect_if_needed(&self) {
        let connect_called = self.state.lock().connect_called;
        if !connect_called {
            self.connect(None);
        }
    }

    fn publish(&self, service: &str, message: Value) {
        if !self.is_connected() {
            debug!(service, "Dropping message while disconnected");
            return;
        }

        let channel = format!("{SERVICE_CHANNEL_PREFIX}{service}");
        debug!(%channel, %message, "Publishing message");
        if let Err(e) = self.transport.send(&channel, message) {
            warn!(error = %e, %channel, "Failed to publish message");
        }
    }

    fn warn(&self, message: &str) {
        warn!(message, "Feed warning");
        metrics::record_warning();
    }

    fn attach(&self, listener: Weak<dyn EndpointListener>) {
        *self.listener.write() = Some(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockTransport;
    use crate::infrastructure::config::ReconnectSettings;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        data: Mutex<Vec<(Value, bool)>>,
        reconnects: Mutex<usize>,
    }

    impl EndpointListener for Recorder {
        fn on_data(&self, frame: Value, time_series: bool) {
            self.data.lock().push((frame, time_series));
        }

        fn on_reconnect(&self) {
            *self.reconnects.lock() += 1;
        }
    }

    fn settings(max_attempts: u32) -> ReconnectSettings {
        ReconnectSettings {
            reconnect_delay_initial: Duration::from_millis(10),
            reconnect_delay_max: Duration::from_millis(40),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: max_attempts,
        }
    }

    fn endpoint(transport: MockTransport, url: Option<&str>, max_attempts: u32) -> Endpoint {
        Endpoint::with_policy(
            Arc::new(transport),
            url.map(str::to_string),
            ReconnectPolicy::with_jitter(settings(max_attempts), 0.0),
        )
    }

    fn attach(endpoint: &Endpoint) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<Recorder> = Arc::downgrade(&recorder);
        endpoint.attach(weak);
        recorder
    }

    #[test]
    fn connect_if_needed_opens_once() {
        let mut transport = MockTransport::new();
        transport.expect_open().times(1).returning(|url| {
            assert_eq!(url, "wss://feed.test/ws");
            Ok(())
        });
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.connect_if_needed();
        endpoint.connect_if_needed();

        assert_eq!(endpoint.state(), ConnectionState::Connecting);
    }

    #[test]
    fn connect_without_url_stays_disconnected() {
        let mut transport = MockTransport::new();
        transport.expect_open().never();
        let endpoint = endpoint(transport, None, 0);

        endpoint.connect_if_needed();

        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
        assert!(!endpoint.is_connected());
    }

    #[test]
    fn failed_open_marks_disconnected() {
        let mut transport = MockTransport::new();
        transport
            .expect_open()
            .returning(|_| Err(TransportError::Connect("refused".to_string())));
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.connect(None);

        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn publish_drops_while_disconnected() {
        let mut transport = MockTransport::new();
        transport.expect_send().never();
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.publish("sub", json!({"reset": true}));
    }

    #[test]
    fn publish_uses_service_channel() {
        let mut transport = MockTransport::new();
        transport.expect_open().returning(|_| Ok(()));
        transport
            .expect_send()
            .times(1)
            .returning(|channel, message| {
                assert_eq!(channel, "/service/sub");
                assert_eq!(message, json!({"reset": true}));
                Ok(())
            });
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.connect(None);
        endpoint.handle_event(TransportEvent::Connected).unwrap();
        endpoint.publish("sub", json!({"reset": true}));
    }

    #[test]
    fn connected_notifies_reconnect_once_per_transition() {
        let mut transport = MockTransport::new();
        transport.expect_open().returning(|_| Ok(()));
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);
        let recorder = attach(&endpoint);

        endpoint.connect(None);
        endpoint.handle_event(TransportEvent::Connected).unwrap();
        endpoint.handle_event(TransportEvent::Connected).unwrap();
        assert_eq!(*recorder.reconnects.lock(), 1);
        assert_eq!(endpoint.reconnect_count(), 0);

        let delay = endpoint
            .handle_event(TransportEvent::Disconnected {
                reason: "reset by peer".to_string(),
            })
            .unwrap();
        assert_eq!(delay, Some(Duration::from_millis(10)));
        assert!(!endpoint.is_connected());

        endpoint.reconnect();
        endpoint.handle_event(TransportEvent::Connected).unwrap();
        assert_eq!(*recorder.reconnects.lock(), 2);
        assert_eq!(endpoint.reconnect_count(), 1);
    }

    #[test]
    fn connect_if_needed_after_disconnect_stays_closed() {
        let mut transport = MockTransport::new();
        transport.expect_open().times(1).returning(|_| Ok(()));
        transport.expect_close().times(1).return_const(());
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.connect(None);
        endpoint.disconnect();
        endpoint.connect_if_needed();

        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn connect_after_disconnect_reopens() {
        let mut transport = MockTransport::new();
        transport.expect_open().times(2).returning(|_| Ok(()));
        transport.expect_close().times(1).return_const(());
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.connect(None);
        endpoint.disconnect();
        endpoint.connect(None);

        assert_eq!(endpoint.state(), ConnectionState::Connecting);
    }

    #[test]
    fn messages_route_by_channel() {
        let endpoint = endpoint(MockTransport::new(), None, 0);
        let recorder = attach(&endpoint);

        for (channel, data) in [
            (DATA_CHANNEL, json!(["Quote", [1]])),
            (TIME_SERIES_DATA_CHANNEL, json!(["Candle", [2]])),
            ("/service/other", json!(["Ignored", [3]])),
        ] {
            endpoint
                .handle_event(TransportEvent::Message {
                    channel: channel.to_string(),
                    data,
                })
                .unwrap();
        }

        let data = recorder.data.lock();
        assert_eq!(
            *data,
            vec![
                (json!(["Quote", [1]]), false),
                (json!(["Candle", [2]]), true)
            ]
        );
    }

    #[test]
    fn disconnect_after_request_stops_reconnecting() {
        let mut transport = MockTransport::new();
        transport.expect_open().times(1).returning(|_| Ok(()));
        transport.expect_close().times(1).return_const(());
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 0);

        endpoint.connect(None);
        endpoint.disconnect();

        let delay = endpoint
            .handle_event(TransportEvent::Disconnected {
                reason: "closed".to_string(),
            })
            .unwrap();
        assert_eq!(delay, None);

        endpoint.reconnect();
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn backoff_exhaustion_is_an_error() {
        let mut transport = MockTransport::new();
        transport.expect_open().returning(|_| Ok(()));
        let endpoint = endpoint(transport, Some("wss://feed.test/ws"), 1);

        endpoint.connect(None);
        let lost = || TransportEvent::Disconnected {
            reason: "timeout".to_string(),
        };

        assert!(endpoint.handle_event(lost()).unwrap().is_some());
        endpoint.reconnect();
        let err = endpoint.handle_event(lost()).unwrap_err();

        assert!(matches!(err, EndpointError::MaxReconnectAttempts(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_reopens_after_backoff() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut transport = MockTransport::new();
        transport.expect_open().times(2).returning(|_| Ok(()));
        transport.expect_close().return_const(());
        let endpoint = Arc::new(endpoint(transport, Some("wss://feed.test/ws"), 0));
        let cancel = CancellationToken::new();

        endpoint.connect(None);
        let task = tokio::spawn(Arc::clone(&endpoint).run(rx, cancel.clone()));

        tx.send(TransportEvent::Connected).unwrap();
        tx.send(TransportEvent::Disconnected {
            reason: "dropped".to_string(),
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(endpoint.state(), ConnectionState::Connecting);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_after_failed_reopen() {
        let (tx, rx) = mpsc::unbounded_channel();
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opens);
        let mut transport = MockTransport::new();
        transport.expect_open().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                Err(TransportError::Connect("refused".to_string()))
            } else {
                Ok(())
            }
        });
        transport.expect_close().return_const(());
        let endpoint = Arc::new(endpoint(transport, Some("wss://feed.test/ws"), 0));
        let recorder = attach(&endpoint);
        let cancel = CancellationToken::new();

        endpoint.connect(None);
        let task = tokio::spawn(Arc::clone(&endpoint).run(rx, cancel.clone()));

        tx.send(TransportEvent::Connected).unwrap();
        tx.send(TransportEvent::Disconnected {
            reason: "dropped".to_string(),
        })
        .unwrap();

        // Re-open at 10 ms fails; the next attempt is due at 30 ms.
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(endpoint.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert_eq!(endpoint.state(), ConnectionState::Connecting);

        tx.send(TransportEvent::Connected).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(endpoint.is_connected());
        assert_eq!(*recorder.reconnects.lock(), 2);
        assert_eq!(endpoint.reconnect_count(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_when_failed_opens_exhaust_attempts() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut transport = MockTransport::new();
        transport
            .expect_open()
            .returning(|_| Err(TransportError::Connect("refused".to_string())));
        let endpoint = Arc::new(endpoint(transport, Some("wss://feed.test/ws"), 2));

        endpoint.connect(None);
        let err = Arc::clone(&endpoint)
            .run(rx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EndpointError::MaxReconnectAttempts(2)));
    }
}
