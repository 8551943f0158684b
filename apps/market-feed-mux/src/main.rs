//! Market Feed Mux Binary
//!
//! Replays feed frames through the subscription multiplexer.
//!
//! Each stdin line is a JSON value. A bare frame is delivered on the
//! snapshot data channel; `{"channel": "...", "data": ...}` names the
//! channel explicitly. Subscription messages the feed publishes and the
//! final quote models are logged.
//!
//! # Usage
//!
//! ```bash
//! FEED_SYMBOLS=AAPL,MSFT cargo run --bin market-feed-mux < frames.jsonl
//! ```
//!
//! # Environment Variables
//!
//! - `FEED_URL`: Endpoint URL (fallback `DXFEED_URL`, default: loopback)
//! - `FEED_SYMBOLS`: Comma-separated symbols to subscribe
//! - `FEED_RECONNECT_DELAY_INITIAL_MS`: Initial reconnect delay (default: 500)
//! - `FEED_RECONNECT_DELAY_MAX_SECS`: Maximum reconnect delay (default: 30)
//! - `FEED_RECONNECT_DELAY_MULTIPLIER`: Backoff multiplier (default: 2.0)
//! - `FEED_MAX_RECONNECT_ATTEMPTS`: Attempt limit, 0 = unlimited (default: 0)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-feed-mux)
//! - `RUST_LOG`: Log filter (default: `market_feed_mux=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_feed_mux::infrastructure::telemetry;
use market_feed_mux::{
    DATA_CHANNEL, Endpoint, Feed, FeedConfig, FeedEndpoint, LoopbackTransport, MarketData,
    QuoteBook, ReconnectPolicy, TokioScheduler, Transport, init_metrics,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// URL used when none is configured; the loopback transport ignores it.
const LOOPBACK_URL: &str = "ws://localhost/loopback";

/// Time allowed for replayed frames to be dispatched after input ends.
const DRAIN_DELAY: Duration = Duration::from_millis(200);

// Deferred flushes rely on a single-threaded runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialise telemetry")?;

    tracing::info!("Starting Market Feed Mux replay");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = FeedConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let (transport, events) = LoopbackTransport::new();
    let transport = Arc::new(transport);
    let url = config.url.clone().unwrap_or_else(|| LOOPBACK_URL.to_string());
    let endpoint = Arc::new(Endpoint::with_policy(
        transport.clone() as Arc<dyn Transport>,
        Some(url),
        ReconnectPolicy::new(config.reconnect.clone()),
    ));

    let scheduler = Arc::new(TokioScheduler::current()?);
    let feed = Feed::new(endpoint.clone() as Arc<dyn FeedEndpoint>, scheduler);
    let market_data = MarketData::new(&feed);
    let quote_book = QuoteBook::new(market_data.clone());

    for symbol in &config.symbols {
        let _model = quote_book.subscribe(symbol);
    }

    let endpoint_task = tokio::spawn(Arc::clone(&endpoint).run(events, shutdown_token.clone()));

    tracing::info!(symbols = config.symbols.len(), "Replay ready");

    tokio::select! {
        () = await_shutdown() => {}
        () = replay_stdin(&transport) => {
            tokio::time::sleep(DRAIN_DELAY).await;
        }
    }

    log_quotes(&quote_book);
    for sent in transport.sent() {
        tracing::info!(channel = %sent.channel, message = %sent.message, "Published");
    }

    market_data.close();
    shutdown_token.cancel();

    match endpoint_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Endpoint stopped with error"),
        Err(e) => tracing::error!(error = %e, "Endpoint task failed"),
    }

    tracing::info!(feed = ?feed, "Market Feed Mux stopped");
    Ok(())
}

/// Feed stdin lines to the transport until EOF.
async fn replay_stdin(transport: &LoopbackTransport) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => replay_line(transport, &line),
            Ok(None) => {
                tracing::info!("Input exhausted");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read input");
                return;
            }
        }
    }
}

fn replay_line(transport: &LoopbackTransport, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed input line");
            return;
        }
    };

    let (channel, data) = split_envelope(value);
    if let Err(e) = transport.inject(&channel, data) {
        tracing::warn!(error = %e, "Failed to inject frame");
    }
}

/// Split `{"channel", "data"}` envelopes; anything else is snapshot data.
fn split_envelope(value: Value) -> (String, Value) {
    if let Value::Object(envelope) = &value {
        if let (Some(Value::String(channel)), Some(data)) =
            (envelope.get("channel"), envelope.get("data"))
        {
            return (channel.clone(), data.clone());
        }
    }
    (DATA_CHANNEL.to_string(), value)
}

fn log_quotes(quote_book: &QuoteBook) {
    for symbol in quote_book.symbols() {
        if let Some(model) = quote_book.model(&symbol) {
            match serde_json::to_string(&model.snapshot()) {
                Ok(snapshot) => tracing::info!(%symbol, %snapshot, "Quote"),
                Err(e) => tracing::warn!(%symbol, error = %e, "Failed to render quote"),
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        url = config.url.as_deref().unwrap_or("<none>"),
        symbols = config.symbols.len(),
        max_reconnect_attempts = config.reconnect.max_reconnect_attempts,
        "Configuration loaded"
    );
}

/// Wait for Ctrl+C or SIGTERM.
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
