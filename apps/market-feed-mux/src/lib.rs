#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Feed Mux - Market Data Subscription Multiplexer
//!
//! Keeps one upstream subscription to a market data feed and multiplexes it
//! across any number of local subscription handles. Local interest is
//! reference counted per (event type, symbol); bursts of changes collapse
//! into one outbound diff, and every delivered record reaches each handle
//! in one batch per delivery cycle.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Event records and interest bookkeeping
//!   - `event`: `EventRecord`, subscription kinds, `FromTime`
//!   - `subscription`: Interest table, pending diff, outbound message
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, endpoint, listener and scheduler interfaces
//!   - `services`: `Feed`, `Subscription`, `MarketData`, `QuoteBook`
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `codec`: Schema-caching frame decoder and message encoder
//!   - `endpoint`: Connection state machine with reconnect backoff
//!   - `scheduler`: Tokio and manually drained task schedulers
//!   - `transport`: In-memory loopback transport
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                 /service/data        ┌──────────┐  on_event  ┌──────────────┐
//! Transport ──► Endpoint ──on_data──►  │   Feed   │ ─────────► │ Subscription │ ──► callback
//!     ▲            │                   │ (table)  │            │   (queue)    │
//!     └── publish ─┘ ◄──── "sub" diff ─└──────────┘ ◄─ add/remove ─┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Event records and interest bookkeeping.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::event::{EventRecord, FromTime, InvalidFromTime, NO_HISTORY, SubscriptionKind};
pub use domain::subscription::{
    InterestKey, InterestStats, ListenerToken, SubscriptionMessage, Symbol, TimeSeriesSubscription,
};

// Ports
pub use application::ports::{
    EndpointListener, EventListener, FeedEndpoint, Scheduler, Task, Transport, TransportError,
};

// Services
pub use application::services::{
    EventCallback, EventKind, Feed, MarketData, MarketDataListener, QuoteBook, QuoteModel,
    QuoteSnapshot, SUBSCRIPTION_SERVICE, Subscription,
};

// Codec
pub use infrastructure::codec::{CodecError, DecodedBatch, FrameCodec, InboundFrame};

// Endpoint
pub use infrastructure::endpoint::{
    ConnectionState, DATA_CHANNEL, Endpoint, EndpointError, ReconnectPolicy,
    TIME_SERIES_DATA_CHANNEL, TransportEvent,
};

// Scheduling
pub use infrastructure::scheduler::{SchedulerError, SingleFlight, TaskQueue, TokioScheduler};

// Transport
pub use infrastructure::transport::{LoopbackTransport, SentMessage};

// Config
pub use infrastructure::config::{ConfigError, FeedConfig, ReconnectSettings};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
