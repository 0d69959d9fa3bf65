//! Bybit WebSocket transport for real-time ticker data
//!
//! Connects to the public linear stream, subscribes to the ticker topic of
//! the active symbol on every (re)connect and forwards last-price updates as
//! [`StreamEvent`]s. A supervising loop reconnects according to the
//! configured [`ReconnectPolicy`] while the transport is started.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use terminal_core::{
    normalize_symbol, ticker_topic, ConnectionState, PriceQuote, QuoteSource, StreamRequest,
    TerminalError, TerminalResult,
};

use crate::types::parse_decimal;

/// Bybit public linear WebSocket URL
pub const BYBIT_LINEAR_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
pub const BYBIT_TESTNET_LINEAR_WS_URL: &str = "wss://stream-testnet.bybit.com/v5/public/linear";

/// Bybit drops connections that stay silent for longer than this
const PING_INTERVAL: Duration = Duration::from_secs(20);

const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Inbound Message Types (matching Bybit's protocol)
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum InboundMessage {
    Topic(TopicMessage),
    Control(ControlMessage),
}

/// Data pushed on a subscribed topic
#[derive(Debug, Clone, Deserialize)]
struct TopicMessage {
    topic: String,
    /// "snapshot" or "delta"
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    ts: Option<i64>,
    data: serde_json::Value,
}

/// Reply to subscribe/unsubscribe/ping
#[derive(Debug, Clone, Deserialize)]
struct ControlMessage {
    op: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    ret_msg: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    symbol: String,
    #[serde(default)]
    last_price: Option<String>,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Ticker(PriceQuote),
    Ack {
        op: String,
        success: bool,
        message: String,
    },
    /// Valid but carries nothing for us (other topics, deltas without a price)
    Ignored,
}

/// Decode a text frame from the stream
pub fn parse_frame(text: &str) -> TerminalResult<StreamFrame> {
    let message: InboundMessage = serde_json::from_str(text)
        .map_err(|e| TerminalError::parse(format!("Invalid stream message: {}", e)))?;

    match message {
        InboundMessage::Control(control) => Ok(StreamFrame::Ack {
            op: control.op,
            success: control.success.unwrap_or(true),
            message: control.ret_msg.unwrap_or_default(),
        }),
        InboundMessage::Topic(topic) => {
            if !topic.topic.starts_with("tickers.") {
                return Ok(StreamFrame::Ignored);
            }

            let data: TickerData = serde_json::from_value(topic.data)
                .map_err(|e| TerminalError::parse(format!("Invalid ticker data: {}", e)))?;

            let Some(last_price) = data.last_price.filter(|p| !p.is_empty()) else {
                return Ok(StreamFrame::Ignored);
            };
            let price = parse_decimal("lastPrice", &last_price)?;

            let timestamp = topic
                .ts
                .and_then(DateTime::<Utc>::from_timestamp_millis)
                .unwrap_or_else(Utc::now);

            debug!(
                "[Bybit WS] {} {} @ {}",
                topic.kind.as_deref().unwrap_or("update"),
                data.symbol,
                price
            );

            Ok(StreamFrame::Ticker(PriceQuote::new(
                data.symbol,
                price,
                timestamp,
                QuoteSource::Stream,
            )))
        }
    }
}

// ============================================================================
// Normalized Events
// ============================================================================

/// Event emitted by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Last traded price for a symbol
    Ticker(PriceQuote),
    /// Connection state change
    ConnectionChanged {
        state: ConnectionState,
        error: Option<String>,
    },
}

// ============================================================================
// Configuration
// ============================================================================

/// How long to wait before reconnecting after a drop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    FixedInterval(Duration),
    ExponentialBackoff { base: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::FixedInterval(interval) => interval,
            ReconnectPolicy::ExponentialBackoff { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::FixedInterval(RECONNECT_INTERVAL)
    }
}

/// Configuration for StreamTransport
#[derive(Debug, Clone)]
pub struct BybitStreamConfig {
    pub url: String,
    pub reconnect: ReconnectPolicy,
    pub ping_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for BybitStreamConfig {
    fn default() -> Self {
        let testnet = std::env::var("BYBIT_TESTNET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            url: if testnet {
                BYBIT_TESTNET_LINEAR_WS_URL
            } else {
                BYBIT_LINEAR_WS_URL
            }
            .to_string(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: PING_INTERVAL,
            event_capacity: 1024,
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Command sent to the connection task
#[derive(Debug, Clone)]
enum TransportCommand {
    Resubscribe {
        previous: Option<String>,
        next: String,
    },
}

/// Why a connected session ended
enum SessionEnd {
    Dropped(String),
    Stopped,
    Shutdown,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bybit ticker stream client
pub struct StreamTransport {
    config: BybitStreamConfig,
    event_tx: broadcast::Sender<StreamEvent>,
    state: Arc<RwLock<ConnectionState>>,
    active_symbol: Arc<RwLock<Option<String>>>,
    /// Command sender to the connection task
    command_tx: Option<mpsc::UnboundedSender<TransportCommand>>,
    /// Whether the connection task should hold a connection
    target_tx: watch::Sender<bool>,
}

impl StreamTransport {
    /// Create a new transport; nothing connects until [`start`](Self::start)
    pub fn new(config: BybitStreamConfig) -> (Self, broadcast::Receiver<StreamEvent>) {
        let (event_tx, event_rx) = broadcast::channel(config.event_capacity);
        let (target_tx, _) = watch::channel(false);

        (
            Self {
                config,
                event_tx,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                active_symbol: Arc::new(RwLock::new(None)),
                command_tx: None,
                target_tx,
            },
            event_rx,
        )
    }

    /// Start the connection task
    pub fn start(&mut self) -> TerminalResult<()> {
        if self.command_tx.is_some() {
            self.target_tx.send_replace(true);
            return Ok(());
        }

        let url = url::Url::parse(&self.config.url)
            .map_err(|e| TerminalError::config(format!("Invalid stream URL: {}", e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(TerminalError::config(format!(
                "Stream URL must be ws:// or wss://, got {}",
                self.config.url
            )));
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.command_tx = Some(command_tx);
        self.target_tx.send_replace(true);

        let config = self.config.clone();
        let event_tx = self.event_tx.clone();
        let state = Arc::clone(&self.state);
        let active_symbol = Arc::clone(&self.active_symbol);
        let target_rx = self.target_tx.subscribe();

        tokio::spawn(async move {
            Self::connection_loop(config, event_tx, state, active_symbol, command_rx, target_rx)
                .await;
        });

        Ok(())
    }

    /// Drop the connection and stop reconnecting; `start` resumes
    pub fn stop(&self) {
        info!("[Bybit WS] Stop requested");
        self.target_tx.send_replace(false);
    }

    /// Switch the ticker subscription to `symbol`
    ///
    /// The previous topic is unsubscribed first. Before the transport is
    /// started this only records the symbol for the first connect.
    pub fn set_symbol(&self, symbol: &str) {
        let next = normalize_symbol(symbol);
        let previous = self.active_symbol.write().replace(next.clone());
        if previous.as_deref() == Some(next.as_str()) {
            return;
        }

        if let Some(command_tx) = &self.command_tx {
            if command_tx
                .send(TransportCommand::Resubscribe { previous, next })
                .is_err()
            {
                warn!("[Bybit WS] Connection task has exited, subscription not updated");
            }
        }
    }

    pub fn active_symbol(&self) -> Option<String> {
        self.active_symbol.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Additional receiver for transport events
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    /// Main connection loop with reconnection logic
    async fn connection_loop(
        config: BybitStreamConfig,
        event_tx: broadcast::Sender<StreamEvent>,
        state: Arc<RwLock<ConnectionState>>,
        active_symbol: Arc<RwLock<Option<String>>>,
        mut command_rx: mpsc::UnboundedReceiver<TransportCommand>,
        mut target_rx: watch::Receiver<bool>,
    ) {
        let mut attempt = 0u32;

        loop {
            if !*target_rx.borrow() {
                Self::set_state(&state, &event_tx, ConnectionState::Disconnected, None);
                if target_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            Self::set_state(&state, &event_tx, ConnectionState::Connecting, None);
            info!("[Bybit WS] Connecting to {}", config.url);

            let end = match connect_async(config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!("[Bybit WS] Connected successfully");
                    attempt = 0;
                    Self::set_state(&state, &event_tx, ConnectionState::Connected, None);

                    Self::run_session(
                        ws_stream,
                        &config,
                        &event_tx,
                        &active_symbol,
                        &mut command_rx,
                        &mut target_rx,
                    )
                    .await
                }
                Err(tungstenite::Error::Url(e)) => {
                    error!("[Bybit WS] Unusable URL {}: {}", config.url, e);
                    Self::set_state(
                        &state,
                        &event_tx,
                        ConnectionState::Failed,
                        Some(e.to_string()),
                    );
                    // Not retryable; wait until the transport is stopped
                    loop {
                        if target_rx.changed().await.is_err() {
                            return;
                        }
                        if !*target_rx.borrow() {
                            break;
                        }
                    }
                    continue;
                }
                Err(e) => SessionEnd::Dropped(format!("Connection failed: {}", e)),
            };

            match end {
                SessionEnd::Shutdown => {
                    Self::set_state(&state, &event_tx, ConnectionState::Disconnected, None);
                    return;
                }
                SessionEnd::Stopped => {
                    info!("[Bybit WS] Disconnected on request");
                    continue;
                }
                SessionEnd::Dropped(cause) => {
                    warn!("[Bybit WS] {}", cause);
                    Self::set_state(
                        &state,
                        &event_tx,
                        ConnectionState::Disconnected,
                        Some(cause),
                    );
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = config.reconnect.delay(attempt);
            info!(
                "[Bybit WS] Reconnecting in {:?} (attempt {})",
                delay, attempt
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = target_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Drive one connected session until it drops or is stopped
    async fn run_session(
        ws_stream: WsStream,
        config: &BybitStreamConfig,
        event_tx: &broadcast::Sender<StreamEvent>,
        active_symbol: &RwLock<Option<String>>,
        command_rx: &mut mpsc::UnboundedReceiver<TransportCommand>,
        target_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        // Switches queued while offline are covered by the subscribe below
        while command_rx.try_recv().is_ok() {}

        let symbol = active_symbol.read().clone();
        if let Some(symbol) = symbol {
            if let Err(e) = Self::send_request(&mut write, &StreamRequest::subscribe_ticker(&symbol)).await {
                return SessionEnd::Dropped(format!("Failed to subscribe: {}", e));
            }
            info!("[Bybit WS] Subscribed to {}", ticker_topic(&symbol));
        }

        let mut heartbeat = interval_at(Instant::now() + config.ping_interval, config.ping_interval);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_message(&text, event_tx);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return SessionEnd::Dropped(format!("Failed to send pong: {}", e));
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Dropped(format!("Connection closed by server: {:?}", frame));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return SessionEnd::Dropped(format!("Stream error: {}", e));
                        }
                        None => {
                            return SessionEnd::Dropped("Stream ended".to_string());
                        }
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(TransportCommand::Resubscribe { previous, next }) => {
                            if let Some(previous) = previous {
                                if let Err(e) = Self::send_request(&mut write, &StreamRequest::unsubscribe_ticker(&previous)).await {
                                    return SessionEnd::Dropped(format!("Failed to unsubscribe: {}", e));
                                }
                                info!("[Bybit WS] Unsubscribed from {}", ticker_topic(&previous));
                            }
                            if let Err(e) = Self::send_request(&mut write, &StreamRequest::subscribe_ticker(&next)).await {
                                return SessionEnd::Dropped(format!("Failed to subscribe: {}", e));
                            }
                            info!("[Bybit WS] Subscribed to {}", ticker_topic(&next));
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    debug!("[Bybit WS] Heartbeat ping");
                    if let Err(e) = Self::send_request(&mut write, &StreamRequest::ping()).await {
                        return SessionEnd::Dropped(format!("Failed to send ping: {}", e));
                    }
                }

                changed = target_rx.changed() => {
                    if changed.is_err() {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                    if !*target_rx.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Stopped;
                    }
                }
            }
        }
    }

    async fn send_request<S>(write: &mut S, request: &StreamRequest) -> Result<(), String>
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let json = serde_json::to_string(request).map_err(|e| e.to_string())?;
        write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| e.to_string())
    }

    /// Handle an incoming message from the WebSocket
    fn handle_message(text: &str, event_tx: &broadcast::Sender<StreamEvent>) {
        match parse_frame(text) {
            Ok(StreamFrame::Ticker(quote)) => {
                let _ = event_tx.send(StreamEvent::Ticker(quote));
            }
            Ok(StreamFrame::Ack {
                op,
                success: false,
                message,
            }) => {
                warn!("[Bybit WS] {} rejected: {}", op, message);
            }
            Ok(StreamFrame::Ack { op, .. }) => {
                debug!("[Bybit WS] {} acknowledged", op);
            }
            Ok(StreamFrame::Ignored) => {}
            Err(e) => {
                warn!("[Bybit WS] Dropping malformed message: {} ({})", text, e);
            }
        }
    }

    fn set_state(
        state: &RwLock<ConnectionState>,
        event_tx: &broadcast::Sender<StreamEvent>,
        next: ConnectionState,
        error: Option<String>,
    ) {
        {
            let mut current = state.write();
            if *current == next {
                return;
            }
            if !current.can_transition_to(next) {
                debug!("[Bybit WS] Unexpected transition {:?} -> {:?}", *current, next);
            }
            *current = next;
        }

        let _ = event_tx.send(StreamEvent::ConnectionChanged { state: next, error });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const TICKER_SNAPSHOT: &str = r#"{"topic":"tickers.BTCUSDT","type":"snapshot","data":{"symbol":"BTCUSDT","lastPrice":"65000.50","markPrice":"65001.00"},"cs":24987956059,"ts":1700000000000}"#;

    #[test]
    fn test_parse_ticker_snapshot() {
        let frame = parse_frame(TICKER_SNAPSHOT).unwrap();
        let StreamFrame::Ticker(quote) = frame else {
            panic!("expected ticker, got {:?}", frame);
        };
        assert_eq!(quote.symbol, "BTCUSDT");
        assert_eq!(quote.price, dec!(65000.5));
        assert_eq!(quote.source, QuoteSource::Stream);
        assert_eq!(quote.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_delta_without_last_price_is_ignored() {
        let text = r#"{"topic":"tickers.BTCUSDT","type":"delta","data":{"symbol":"BTCUSDT","markPrice":"65002.10"},"ts":1700000000100}"#;
        assert_eq!(parse_frame(text).unwrap(), StreamFrame::Ignored);
    }

    #[test]
    fn test_other_topics_are_ignored() {
        let text = r#"{"topic":"orderbook.50.BTCUSDT","type":"delta","data":{"s":"BTCUSDT","b":[],"a":[]}}"#;
        assert_eq!(parse_frame(text).unwrap(), StreamFrame::Ignored);
    }

    #[test]
    fn test_control_replies() {
        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"abc","op":"ping"}"#;
        assert_eq!(
            parse_frame(pong).unwrap(),
            StreamFrame::Ack {
                op: "ping".to_string(),
                success: true,
                message: "pong".to_string(),
            }
        );

        let failed = r#"{"success":false,"ret_msg":"error:handler not found,topic:tickers.NOPE","conn_id":"abc","op":"subscribe"}"#;
        assert!(matches!(
            parse_frame(failed).unwrap(),
            StreamFrame::Ack { success: false, .. }
        ));
    }

    #[test]
    fn test_malformed_message_is_error() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"hello":"world"}"#).is_err());
    }

    #[test]
    fn test_reconnect_policy_delays() {
        let fixed = ReconnectPolicy::default();
        assert_eq!(fixed.delay(1), Duration::from_secs(2));
        assert_eq!(fixed.delay(7), Duration::from_secs(2));

        let backoff = ReconnectPolicy::ExponentialBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_start_rejects_non_websocket_url() {
        let config = BybitStreamConfig {
            url: "https://stream.bybit.com".to_string(),
            ..BybitStreamConfig::default()
        };
        let (mut transport, _events) = StreamTransport::new(config);
        assert!(matches!(transport.start(), Err(TerminalError::Config(_))));
    }

    #[test]
    fn test_set_symbol_before_start() {
        let (transport, _events) = StreamTransport::new(BybitStreamConfig::default());
        transport.set_symbol(" ethusdt ");
        assert_eq!(transport.active_symbol().as_deref(), Some("ETHUSDT"));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribes_on_connect_and_switches_topic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let mut frames = Vec::new();
            let first = ws.next().await.unwrap().unwrap();
            frames.push(first.to_text().unwrap().to_string());

            ws.send(Message::Text(TICKER_SNAPSHOT.to_string().into())).await.unwrap();

            for _ in 0..2 {
                let frame = ws.next().await.unwrap().unwrap();
                frames.push(frame.to_text().unwrap().to_string());
            }
            frames
        });

        let config = BybitStreamConfig {
            url: format!("ws://{}", addr),
            ..BybitStreamConfig::default()
        };
        let (mut transport, mut events) = StreamTransport::new(config);
        transport.set_symbol("BTCUSDT");
        transport.start().unwrap();

        let quote = timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(StreamEvent::Ticker(quote)) => return quote,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {}", e),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(quote.price, dec!(65000.5));
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.set_symbol("ETHUSDT");

        let frames = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(
            frames,
            vec![
                r#"{"op":"subscribe","args":["tickers.BTCUSDT"]}"#.to_string(),
                r#"{"op":"unsubscribe","args":["tickers.BTCUSDT"]}"#.to_string(),
                r#"{"op":"subscribe","args":["tickers.ETHUSDT"]}"#.to_string(),
            ]
        );

        transport.stop();
    }

    #[tokio::test]
    async fn test_resubscribes_after_server_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut frames = Vec::new();
            for _ in 0..2 {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let first = ws.next().await.unwrap().unwrap();
                frames.push(first.to_text().unwrap().to_string());
                // Drop the session from the server side
                ws.close(None).await.ok();
            }
            frames
        });

        let config = BybitStreamConfig {
            url: format!("ws://{}", addr),
            reconnect: ReconnectPolicy::FixedInterval(Duration::from_millis(50)),
            ..BybitStreamConfig::default()
        };
        let (mut transport, _events) = StreamTransport::new(config);
        transport.set_symbol("SOLUSDT");
        transport.start().unwrap();

        let frames = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        let subscribe = r#"{"op":"subscribe","args":["tickers.SOLUSDT"]}"#.to_string();
        assert_eq!(frames, vec![subscribe.clone(), subscribe]);

        transport.stop();
    }
}
