//! Streaming protocol types
//!
//! Outbound control frames for the public ticker stream and the connection
//! state reported by the transport.

use serde::{Deserialize, Serialize};

/// Connection state of the streaming transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Connected and receiving data
    Connected,
    /// Attempting to connect
    Connecting,
    /// Disconnected, will attempt reconnect while the target is "connected"
    Disconnected,
    /// Connection failed, not retrying
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Failed)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Failed, Disconnected)
        )
    }
}

/// Control frame sent to the stream: `{"op": ..., "args": [...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl StreamRequest {
    /// Subscribe to the ticker topic of `symbol`
    pub fn subscribe_ticker(symbol: &str) -> Self {
        Self {
            op: "subscribe".to_string(),
            args: vec![ticker_topic(symbol)],
        }
    }

    /// Unsubscribe from the ticker topic of `symbol`
    pub fn unsubscribe_ticker(symbol: &str) -> Self {
        Self {
            op: "unsubscribe".to_string(),
            args: vec![ticker_topic(symbol)],
        }
    }

    /// Application-level heartbeat
    pub fn ping() -> Self {
        Self {
            op: "ping".to_string(),
            args: Vec::new(),
        }
    }
}

/// Ticker topic name for a symbol (`tickers.BTCUSDT`)
pub fn ticker_topic(symbol: &str) -> String {
    format!("tickers.{}", symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_wire_format() {
        let json = serde_json::to_string(&StreamRequest::subscribe_ticker("BTCUSDT")).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","args":["tickers.BTCUSDT"]}"#);
    }

    #[test]
    fn test_ping_wire_format() {
        let json = serde_json::to_string(&StreamRequest::ping()).unwrap();
        assert_eq!(json, r#"{"op":"ping"}"#);
    }

    #[test]
    fn test_connection_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
    }
}
