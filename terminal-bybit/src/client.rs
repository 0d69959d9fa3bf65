//! Bybit API client
//!
//! Provides signed access to the Bybit v5 REST API for linear perpetuals
//! and implements the terminal-core API traits on top of it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use terminal_core::{
    AccountApi, AmendOrderRequest, ApiResponse, CancelOrderRequest, InstrumentApi, Order,
    OrderAck, OrderId, PlaceOrderRequest, Position, PriceQuote, SymbolInfo, TerminalError,
    TerminalResult, TradingApi, TradingStopRequest,
};

use crate::auth::{self, Credentials};
use crate::types::{
    coin_balance, decode_envelope, AmendOrderBody, BybitInstrument, BybitOrder, BybitPosition,
    BybitTicker, CancelOrderBody, CreateOrderBody, ListResult, OrderAckResult, TradingStopBody,
    WalletAccount, CATEGORY_LINEAR,
};

/// Base URL for the Bybit API
pub const BYBIT_API_BASE: &str = "https://api.bybit.com";
pub const BYBIT_TESTNET_API_BASE: &str = "https://api-testnet.bybit.com";

const DEFAULT_RECV_WINDOW: u64 = 5000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Instruments per page and the most pages fetched in one listing
const INSTRUMENT_PAGE_LIMIT: u32 = 1000;
const MAX_INSTRUMENT_PAGES: usize = 20;

/// Configuration for BybitClient
#[derive(Debug, Clone)]
pub struct BybitClientConfig {
    pub base_url: String,
    pub credentials: Option<Credentials>,
    /// Validity window of a signed request, in milliseconds
    pub recv_window: u64,
    pub timeout: Duration,
    pub account_type: String,
    /// Coin whose wallet balance is reported
    pub quote_coin: String,
}

impl Default for BybitClientConfig {
    fn default() -> Self {
        let testnet = std::env::var("BYBIT_TESTNET")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let recv_window = std::env::var("BYBIT_RECV_WINDOW")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RECV_WINDOW);

        Self {
            base_url: if testnet {
                BYBIT_TESTNET_API_BASE
            } else {
                BYBIT_API_BASE
            }
            .to_string(),
            credentials: Credentials::from_env(),
            recv_window,
            timeout: DEFAULT_TIMEOUT,
            account_type: "UNIFIED".to_string(),
            quote_coin: "USDT".to_string(),
        }
    }
}

impl BybitClientConfig {
    /// Load `.env` (if present) and read the configuration from the environment
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::default()
    }
}

/// Bybit API client
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    config: BybitClientConfig,
}

impl BybitClient {
    /// Create a new Bybit client
    pub fn new(config: BybitClientConfig) -> TerminalResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TerminalError::config(format!("Failed to create HTTP client: {}", e)))?;

        if config.credentials.is_none() {
            warn!("[Bybit] No API credentials configured, private endpoints will fail");
        }

        Ok(Self { client, config })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.config.credentials.is_some()
    }

    fn credentials(&self) -> TerminalResult<&Credentials> {
        self.config
            .credentials
            .as_ref()
            .ok_or_else(|| TerminalError::auth("BYBIT_API_KEY / BYBIT_API_SECRET not set"))
    }

    /// GET request; private requests are signed over the query string
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
        signed: bool,
    ) -> TerminalResult<ApiResponse<T>> {
        let query = serde_urlencoded::to_string(params)
            .map_err(|e| TerminalError::internal(format!("Failed to encode query: {}", e)))?;
        let url = format!("{}{}?{}", self.config.base_url, path, query);

        debug!("[Bybit] GET {}", url);

        let mut request = self.client.get(&url);
        if signed {
            let headers = auth::auth_headers(
                self.credentials()?,
                auth::timestamp_ms(),
                self.config.recv_window,
                &query,
            )?;
            request = request.headers(headers);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TerminalError::network(format!("GET {} failed: {}", path, e)))?;

        Self::read_response(path, response).await
    }

    /// Signed POST with a JSON body
    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> TerminalResult<ApiResponse<T>> {
        let payload = serde_json::to_string(body)
            .map_err(|e| TerminalError::internal(format!("Failed to encode body: {}", e)))?;
        let headers = auth::auth_headers(
            self.credentials()?,
            auth::timestamp_ms(),
            self.config.recv_window,
            &payload,
        )?;

        debug!("[Bybit] POST {} {}", path, payload);

        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, path))
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| TerminalError::network(format!("POST {} failed: {}", path, e)))?;

        Self::read_response(path, response).await
    }

    async fn read_response<T: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> TerminalResult<ApiResponse<T>> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TerminalError::network(format!("Failed to read {} body: {}", path, e)))?;

        match decode_envelope(&body) {
            Ok(decoded) => Ok(decoded),
            Err(_) if status == StatusCode::UNAUTHORIZED => Err(TerminalError::auth(format!(
                "Bybit rejected credentials on {}",
                path
            ))),
            Err(_) if !status.is_success() => Err(TerminalError::network(format!(
                "Bybit API error ({}) on {}: {}",
                status, path, body
            ))),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AccountApi for BybitClient {
    #[instrument(skip(self))]
    async fn get_positions(&self, symbol: &str) -> TerminalResult<ApiResponse<Vec<Position>>> {
        let params = [("category", CATEGORY_LINEAR), ("symbol", symbol)];
        let response: ApiResponse<ListResult<BybitPosition>> =
            self.get("/v5/position/list", &params, true).await?;

        response.try_map(|page| {
            page.list
                .iter()
                .filter_map(|p| p.to_position().transpose())
                .collect()
        })
    }

    #[instrument(skip(self))]
    async fn get_open_orders(&self, symbol: &str) -> TerminalResult<ApiResponse<Vec<Order>>> {
        let params = [("category", CATEGORY_LINEAR), ("symbol", symbol)];
        let response: ApiResponse<ListResult<BybitOrder>> =
            self.get("/v5/order/realtime", &params, true).await?;

        response.try_map(|page| page.list.iter().map(BybitOrder::to_order).collect())
    }

    #[instrument(skip(self))]
    async fn get_wallet_balance(&self) -> TerminalResult<ApiResponse<Decimal>> {
        let params = [
            ("accountType", self.config.account_type.as_str()),
            ("coin", self.config.quote_coin.as_str()),
        ];
        let response: ApiResponse<ListResult<WalletAccount>> =
            self.get("/v5/account/wallet-balance", &params, true).await?;

        response.try_map(|page| coin_balance(&page.list, &self.config.quote_coin))
    }

    #[instrument(skip(self))]
    async fn get_ticker(&self, symbol: &str) -> TerminalResult<ApiResponse<PriceQuote>> {
        let params = [("category", CATEGORY_LINEAR), ("symbol", symbol)];
        let response: ApiResponse<ListResult<BybitTicker>> =
            self.get("/v5/market/tickers", &params, false).await?;

        response.try_map(|page| match page.list.first() {
            Some(ticker) => ticker.to_quote(),
            None => Err(TerminalError::not_found(format!("No ticker for {}", symbol))),
        })
    }
}

#[async_trait]
impl TradingApi for BybitClient {
    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    async fn place_order(
        &self,
        request: &PlaceOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>> {
        info!(
            "[Bybit] Placing {} {} {} @ {:?}",
            request.side.as_str(),
            request.qty,
            request.symbol,
            request.price
        );
        let response: ApiResponse<OrderAckResult> = self
            .post("/v5/order/create", &CreateOrderBody::from(request))
            .await?;
        Ok(response.map(to_ack))
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    async fn cancel_order(
        &self,
        request: &CancelOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>> {
        info!("[Bybit] Cancelling order {}", request.order_id);
        let response: ApiResponse<OrderAckResult> = self
            .post("/v5/order/cancel", &CancelOrderBody::from(request))
            .await?;
        Ok(response.map(to_ack))
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    async fn amend_order(
        &self,
        request: &AmendOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>> {
        info!(
            "[Bybit] Amending order {} price={:?} qty={:?}",
            request.order_id, request.price, request.qty
        );
        let response: ApiResponse<OrderAckResult> = self
            .post("/v5/order/amend", &AmendOrderBody::from(request))
            .await?;
        Ok(response.map(to_ack))
    }

    #[instrument(skip(self, request), fields(symbol = %request.symbol))]
    async fn set_trading_stop(
        &self,
        request: &TradingStopRequest,
    ) -> TerminalResult<ApiResponse<()>> {
        info!(
            "[Bybit] Setting trading stop tp={:?} sl={:?}",
            request.take_profit, request.stop_loss
        );
        let response: ApiResponse<IgnoredAny> = self
            .post("/v5/position/trading-stop", &TradingStopBody::from(request))
            .await?;
        Ok(response.map(|_| ()))
    }
}

#[async_trait]
impl InstrumentApi for BybitClient {
    #[instrument(skip(self))]
    async fn list_instruments(&self) -> TerminalResult<ApiResponse<Vec<SymbolInfo>>> {
        let limit = INSTRUMENT_PAGE_LIMIT.to_string();
        let mut instruments = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_INSTRUMENT_PAGES {
            let mut params = vec![("category", CATEGORY_LINEAR), ("limit", limit.as_str())];
            if let Some(c) = cursor.as_deref() {
                params.push(("cursor", c));
            }

            let response: ApiResponse<ListResult<BybitInstrument>> = self
                .get("/v5/market/instruments-info", &params, false)
                .await?;

            if !response.is_success() {
                return Ok(ApiResponse::rejected(response.code, response.message));
            }
            let Some(page) = response.result else {
                break;
            };

            for instrument in &page.list {
                instruments.push(instrument.to_symbol_info()?);
            }

            match page.cursor() {
                Some(next) => cursor = Some(next.to_string()),
                None => break,
            }
        }

        debug!("[Bybit] Loaded {} instruments", instruments.len());
        Ok(ApiResponse::success(instruments))
    }
}

fn to_ack(result: OrderAckResult) -> OrderAck {
    OrderAck {
        order_id: OrderId::new(result.order_id),
        order_link_id: Some(result.order_link_id).filter(|id| !id.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(credentials: Option<Credentials>) -> BybitClientConfig {
        BybitClientConfig {
            base_url: BYBIT_TESTNET_API_BASE.to_string(),
            credentials,
            recv_window: DEFAULT_RECV_WINDOW,
            timeout: Duration::from_secs(1),
            account_type: "UNIFIED".to_string(),
            quote_coin: "USDT".to_string(),
        }
    }

    #[test]
    fn test_client_creation() {
        let client = BybitClient::new(config(None)).unwrap();
        assert_eq!(client.base_url(), BYBIT_TESTNET_API_BASE);
        assert!(!client.has_credentials());
    }

    #[tokio::test]
    async fn test_private_call_without_credentials_is_auth_error() {
        let client = BybitClient::new(config(None)).unwrap();
        let result = client.get_positions("BTCUSDT").await;
        assert!(matches!(result, Err(TerminalError::Auth(_))));
    }

    #[test]
    fn test_config_debug_redacts_secret() {
        let config = config(Some(Credentials::new("key", "very-secret")));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_ack_drops_empty_link_id() {
        let ack = to_ack(OrderAckResult {
            order_id: "abc".to_string(),
            order_link_id: String::new(),
        });
        assert_eq!(ack.order_id, OrderId::new("abc"));
        assert_eq!(ack.order_link_id, None);
    }
}
