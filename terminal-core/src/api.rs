//! Remote API seams
//!
//! The engine talks to the exchange only through these traits, so the
//! polling loop and the order coordinator can run against the Bybit REST
//! client or a scripted exchange alike.
//!
//! Every call returns `Err` when no usable response arrived (network error,
//! timeout, unparseable body) and `Ok(ApiResponse)` otherwise. A response
//! with a non-zero `code` is a remote rejection.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{TerminalError, TerminalResult};
use crate::market::{PriceQuote, SymbolInfo};
use crate::order::{Order, OrderId, OrderSide, OrderType};
use crate::position::Position;

/// Status code the exchange uses for success
pub const SUCCESS_CODE: i64 = 0;

/// Response envelope: status code, human-readable message, payload
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub code: i64,
    pub message: String,
    pub result: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(result: T) -> Self {
        Self {
            code: SUCCESS_CODE,
            message: "OK".to_string(),
            result: Some(result),
        }
    }

    pub fn rejected(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Transform the payload, keeping code and message
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            code: self.code,
            message: self.message,
            result: self.result.map(f),
        }
    }

    /// Transform the payload with a fallible conversion
    pub fn try_map<U>(
        self,
        f: impl FnOnce(T) -> TerminalResult<U>,
    ) -> TerminalResult<ApiResponse<U>> {
        let result = self.result.map(f).transpose()?;
        Ok(ApiResponse {
            code: self.code,
            message: self.message,
            result,
        })
    }

    /// Convert into a plain result; a non-zero code becomes `TerminalError::Api`
    /// carrying the remote message verbatim
    pub fn into_result(self) -> TerminalResult<T> {
        if !self.is_success() {
            return Err(TerminalError::api(self.code, self.message));
        }
        self.result
            .ok_or_else(|| TerminalError::parse("Successful response without a result"))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Create a new order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub qty: Decimal,
    /// Required for limit orders, ignored for market orders
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    /// Client-side id echoed back by the exchange
    pub order_link_id: Option<String>,
}

/// Cancel a working order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOrderRequest {
    pub symbol: String,
    pub order_id: OrderId,
}

/// Amend a working order; unset fields stay as they are on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmendOrderRequest {
    pub symbol: String,
    pub order_id: OrderId,
    pub price: Option<Decimal>,
    pub qty: Option<Decimal>,
}

/// Set take-profit and/or stop-loss on a position
///
/// An unset level is omitted from the request, never sent as zero, so the
/// exchange leaves the existing level untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingStopRequest {
    pub symbol: String,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub position_idx: u8,
}

/// Acknowledgement of an order mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub order_link_id: Option<String>,
}

// ============================================================================
// Traits
// ============================================================================

/// Authoritative account state
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Positions on `symbol` (zero-size entries may be included)
    async fn get_positions(&self, symbol: &str) -> TerminalResult<ApiResponse<Vec<Position>>>;

    /// Working orders on `symbol`
    async fn get_open_orders(&self, symbol: &str) -> TerminalResult<ApiResponse<Vec<Order>>>;

    /// Wallet balance in the quote coin
    async fn get_wallet_balance(&self) -> TerminalResult<ApiResponse<Decimal>>;

    /// Last traded price, used when the stream is silent
    async fn get_ticker(&self, symbol: &str) -> TerminalResult<ApiResponse<PriceQuote>>;
}

/// Order and position mutations
#[async_trait]
pub trait TradingApi: Send + Sync {
    async fn place_order(&self, request: &PlaceOrderRequest)
        -> TerminalResult<ApiResponse<OrderAck>>;

    async fn cancel_order(
        &self,
        request: &CancelOrderRequest,
    ) -> TerminalResult<ApiResponse<OrderAck>>;

    async fn amend_order(&self, request: &AmendOrderRequest)
        -> TerminalResult<ApiResponse<OrderAck>>;

    async fn set_trading_stop(
        &self,
        request: &TradingStopRequest,
    ) -> TerminalResult<ApiResponse<()>>;
}

/// Tradable instrument list
#[async_trait]
pub trait InstrumentApi: Send + Sync {
    async fn list_instruments(&self) -> TerminalResult<ApiResponse<Vec<SymbolInfo>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_into_result() {
        let response = ApiResponse::success(42u32);
        assert!(response.is_success());
        assert_eq!(response.into_result(), Ok(42));
    }

    #[test]
    fn test_rejection_keeps_message_verbatim() {
        let response: ApiResponse<()> =
            ApiResponse::rejected(110007, "ab not enough for new order");
        assert!(!response.is_success());
        assert_eq!(
            response.into_result(),
            Err(TerminalError::api(110007, "ab not enough for new order"))
        );
    }

    #[test]
    fn test_success_without_result_is_parse_error() {
        let response: ApiResponse<u32> = ApiResponse {
            code: SUCCESS_CODE,
            message: "OK".to_string(),
            result: None,
        };
        assert!(matches!(response.into_result(), Err(TerminalError::Parse(_))));
    }
}
