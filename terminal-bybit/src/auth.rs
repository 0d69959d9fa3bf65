//! Request signing for the Bybit v5 private API
//!
//! Each private request carries an HMAC-SHA256 signature over
//! `timestamp + api_key + recv_window + payload`, where the payload is the
//! raw query string for GET and the JSON body for POST. The signature is
//! hex encoded and sent in the `X-BAPI-*` headers.

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use terminal_core::{TerminalError, TerminalResult};

type HmacSha256 = Hmac<Sha256>;

const HEADER_API_KEY: &str = "X-BAPI-API-KEY";
const HEADER_SIGNATURE: &str = "X-BAPI-SIGN";
const HEADER_TIMESTAMP: &str = "X-BAPI-TIMESTAMP";
const HEADER_RECV_WINDOW: &str = "X-BAPI-RECV-WINDOW";

/// API key pair for private endpoints
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Read `BYBIT_API_KEY` / `BYBIT_API_SECRET`; `None` unless both are set
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("BYBIT_API_KEY").ok()?;
        let api_secret = std::env::var("BYBIT_API_SECRET").ok()?;
        if api_key.is_empty() || api_secret.is_empty() {
            return None;
        }
        Some(Self::new(api_key, api_secret))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Current time in milliseconds, as Bybit expects in `X-BAPI-TIMESTAMP`
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hex-encoded HMAC-SHA256 signature of a request
pub fn sign(
    credentials: &Credentials,
    timestamp: i64,
    recv_window: u64,
    payload: &str,
) -> TerminalResult<String> {
    let message = format!(
        "{}{}{}{}",
        timestamp, credentials.api_key, recv_window, payload
    );

    let mut mac = HmacSha256::new_from_slice(credentials.api_secret.as_bytes())
        .map_err(|e| TerminalError::auth(format!("Failed to create HMAC: {}", e)))?;
    mac.update(message.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signed headers for a private request
pub fn auth_headers(
    credentials: &Credentials,
    timestamp: i64,
    recv_window: u64,
    payload: &str,
) -> TerminalResult<HeaderMap> {
    let signature = sign(credentials, timestamp, recv_window, payload)?;

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_API_KEY, header_value(&credentials.api_key)?);
    headers.insert(HEADER_SIGNATURE, header_value(&signature)?);
    headers.insert(HEADER_TIMESTAMP, header_value(&timestamp.to_string())?);
    headers.insert(HEADER_RECV_WINDOW, header_value(&recv_window.to_string())?);
    Ok(headers)
}

fn header_value(value: &str) -> TerminalResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TerminalError::auth(format!("Invalid header value: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("api-key", "secret-key")
    }

    #[test]
    fn test_sign_query_string() {
        let signature = sign(
            &credentials(),
            1_700_000_000_000,
            5000,
            "category=linear&symbol=BTCUSDT",
        )
        .unwrap();
        assert_eq!(
            signature,
            "75bf690e5767c0ad0ef942e996bbab5c3d8d9e3987cde7f69eb0f95cd7196ae4"
        );
    }

    #[test]
    fn test_sign_json_body() {
        let signature = sign(
            &credentials(),
            1_700_000_000_000,
            5000,
            r#"{"category":"linear"}"#,
        )
        .unwrap();
        assert_eq!(
            signature,
            "9727f5d9060fc4faa7d0bfa1aade7632ee6d1fd62d3df8126807ac22d894f604"
        );
    }

    #[test]
    fn test_auth_headers() {
        let headers = auth_headers(&credentials(), 1_700_000_000_000, 5000, "").unwrap();
        assert_eq!(headers.get(HEADER_API_KEY).unwrap(), "api-key");
        assert_eq!(headers.get(HEADER_TIMESTAMP).unwrap(), "1700000000000");
        assert_eq!(headers.get(HEADER_RECV_WINDOW).unwrap(), "5000");
        assert_eq!(headers.get(HEADER_SIGNATURE).unwrap().len(), 64);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let debug = format!("{:?}", credentials());
        assert!(debug.contains("api-key"));
        assert!(!debug.contains("secret-key"));
    }
}
