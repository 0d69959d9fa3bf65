//! Bybit v5 REST wire types
//!
//! These types mirror the Bybit API payloads and are converted to
//! terminal-core types for use by the services. Bybit encodes every number
//! as a string and uses `""` (or `"0"` for TP/SL) for "not set".

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use terminal_core::{
    ApiResponse, Order, OrderId, OrderSide, OrderStatus, OrderType, Position, PositionSide,
    PriceQuote, SymbolInfo, TerminalError, TerminalResult, SUCCESS_CODE,
};

/// Product category for USDT linear perpetuals
pub const CATEGORY_LINEAR: &str = "linear";

// ============================================================================
// Envelope
// ============================================================================

/// Raw `{retCode, retMsg, result}` envelope
///
/// `result` is kept untyped: rejections often carry `{}` which would not
/// deserialize into the success payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: serde_json::Value,
}

/// Decode a response body into an [`ApiResponse`]
///
/// A non-zero `retCode` yields a rejected response with `retMsg` kept
/// verbatim; only a successful envelope has its `result` typed.
pub fn decode_envelope<T: DeserializeOwned>(body: &str) -> TerminalResult<ApiResponse<T>> {
    let raw: RawEnvelope = serde_json::from_str(body)
        .map_err(|e| TerminalError::parse(format!("Invalid response envelope: {}", e)))?;

    if raw.ret_code != SUCCESS_CODE {
        return Ok(ApiResponse::rejected(raw.ret_code, raw.ret_msg));
    }

    let result = T::deserialize(raw.result)
        .map_err(|e| TerminalError::parse(format!("Invalid response result: {}", e)))?;

    Ok(ApiResponse {
        code: raw.ret_code,
        message: raw.ret_msg,
        result: Some(result),
    })
}

/// Paged `{list, nextPageCursor}` result
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
    #[serde(default)]
    pub next_page_cursor: Option<String>,
}

impl<T> ListResult<T> {
    /// Cursor for the next page, if there is one
    pub fn cursor(&self) -> Option<&str> {
        self.next_page_cursor.as_deref().filter(|c| !c.is_empty())
    }
}

// ============================================================================
// Positions
// ============================================================================

/// A position from GET /v5/position/list
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// "Buy", "Sell", or "" for an empty slot
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default)]
    pub unrealised_pnl: String,
    #[serde(default, rename = "positionIM")]
    pub position_im: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub take_profit: String,
    #[serde(default)]
    pub stop_loss: String,
    #[serde(default)]
    pub position_idx: u8,
}

impl BybitPosition {
    /// Convert to a core position; `None` for an empty slot
    pub fn to_position(&self) -> TerminalResult<Option<Position>> {
        let side = match self.side.as_str() {
            "Buy" => PositionSide::Long,
            "Sell" => PositionSide::Short,
            "" | "None" => return Ok(None),
            other => {
                return Err(TerminalError::parse(format!(
                    "Unknown position side: {}",
                    other
                )))
            }
        };

        let size = parse_decimal("size", &self.size)?;
        let entry_price = parse_decimal("avgPrice", &self.avg_price)?;
        let unrealized_pnl = parse_decimal("unrealisedPnl", &self.unrealised_pnl)?;

        let mut initial_margin = parse_decimal("positionIM", &self.position_im)?;
        if initial_margin.is_zero() {
            let leverage = parse_decimal("leverage", &self.leverage)?;
            if !leverage.is_zero() {
                initial_margin = entry_price * size / leverage;
            }
        }

        Ok(Some(Position {
            symbol: self.symbol.clone(),
            side,
            size,
            entry_price,
            mark_price: parse_decimal("markPrice", &self.mark_price)?,
            unrealized_pnl,
            roe: Position::roe_for_margin(unrealized_pnl, initial_margin),
            take_profit: parse_level("takeProfit", &self.take_profit)?,
            stop_loss: parse_level("stopLoss", &self.stop_loss)?,
            position_idx: self.position_idx,
        }))
    }
}

// ============================================================================
// Orders
// ============================================================================

/// A working order from GET /v5/order/realtime
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitOrder {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub qty: String,
    pub order_status: String,
    #[serde(default)]
    pub reduce_only: bool,
    /// Milliseconds since epoch
    #[serde(default)]
    pub created_time: String,
}

impl BybitOrder {
    /// Convert to a core order; expected profit is left for the state store
    pub fn to_order(&self) -> TerminalResult<Order> {
        let created_at = self
            .created_time
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Order {
            id: OrderId::new(self.order_id.clone()),
            symbol: self.symbol.clone(),
            side: parse_side(&self.side)?,
            order_type: parse_order_type(&self.order_type)?,
            price: parse_decimal("price", &self.price)?,
            qty: parse_decimal("qty", &self.qty)?,
            expected_profit: Decimal::ZERO,
            status: parse_order_status(&self.order_status)?,
            reduce_only: self.reduce_only,
            created_at,
        })
    }
}

/// Result of order create/cancel/amend
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAckResult {
    pub order_id: String,
    #[serde(default)]
    pub order_link_id: String,
}

// ============================================================================
// Wallet
// ============================================================================

/// Account entry from GET /v5/account/wallet-balance
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    #[serde(default)]
    pub account_type: String,
    #[serde(default)]
    pub coin: Vec<WalletCoin>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletCoin {
    pub coin: String,
    #[serde(default)]
    pub wallet_balance: String,
}

/// Wallet balance of `coin` in the first account; zero when the coin is absent
pub fn coin_balance(accounts: &[WalletAccount], coin: &str) -> TerminalResult<Decimal> {
    let entry = accounts
        .first()
        .and_then(|account| account.coin.iter().find(|c| c.coin == coin));

    match entry {
        Some(entry) => parse_decimal("walletBalance", &entry.wallet_balance),
        None => Ok(Decimal::ZERO),
    }
}

// ============================================================================
// Market
// ============================================================================

/// Ticker from GET /v5/market/tickers
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitTicker {
    pub symbol: String,
    #[serde(default)]
    pub last_price: String,
}

impl BybitTicker {
    pub fn to_quote(&self) -> TerminalResult<PriceQuote> {
        let price = parse_decimal("lastPrice", &self.last_price)?;
        if price.is_zero() {
            return Err(TerminalError::parse(format!(
                "Ticker for {} has no last price",
                self.symbol
            )));
        }
        Ok(PriceQuote::from_poll(self.symbol.clone(), price))
    }
}

/// Instrument from GET /v5/market/instruments-info
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitInstrument {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub price_filter: Option<PriceFilter>,
    #[serde(default)]
    pub lot_size_filter: Option<LotSizeFilter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFilter {
    #[serde(default)]
    pub tick_size: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSizeFilter {
    #[serde(default)]
    pub qty_step: String,
    #[serde(default)]
    pub min_order_qty: String,
}

impl BybitInstrument {
    pub fn to_symbol_info(&self) -> TerminalResult<SymbolInfo> {
        let mut info = SymbolInfo::new(self.symbol.clone());
        if !self.status.is_empty() {
            info.status = Some(self.status.clone());
        }
        if let Some(filter) = &self.price_filter {
            info.tick_size = parse_level("tickSize", &filter.tick_size)?;
        }
        if let Some(filter) = &self.lot_size_filter {
            info.qty_step = parse_level("qtyStep", &filter.qty_step)?;
            info.min_order_qty = parse_level("minOrderQty", &filter.min_order_qty)?;
        }
        Ok(info)
    }
}

// ============================================================================
// Request bodies
// ============================================================================

/// Body of POST /v5/order/create
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderBody {
    pub category: &'static str,
    pub symbol: String,
    pub side: &'static str,
    pub order_type: &'static str,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_link_id: Option<String>,
    pub position_idx: u8,
}

impl From<&terminal_core::PlaceOrderRequest> for CreateOrderBody {
    fn from(request: &terminal_core::PlaceOrderRequest) -> Self {
        let is_limit = request.order_type == OrderType::Limit;
        Self {
            category: CATEGORY_LINEAR,
            symbol: request.symbol.clone(),
            side: request.side.as_str(),
            order_type: request.order_type.as_str(),
            qty: decimal_string(request.qty),
            price: request.price.filter(|_| is_limit).map(decimal_string),
            time_in_force: is_limit.then_some("GTC"),
            reduce_only: request.reduce_only.then_some(true),
            order_link_id: request.order_link_id.clone(),
            position_idx: 0,
        }
    }
}

/// Body of POST /v5/order/cancel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderBody {
    pub category: &'static str,
    pub symbol: String,
    pub order_id: String,
}

impl From<&terminal_core::CancelOrderRequest> for CancelOrderBody {
    fn from(request: &terminal_core::CancelOrderRequest) -> Self {
        Self {
            category: CATEGORY_LINEAR,
            symbol: request.symbol.clone(),
            order_id: request.order_id.to_string(),
        }
    }
}

/// Body of POST /v5/order/amend
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmendOrderBody {
    pub category: &'static str,
    pub symbol: String,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

impl From<&terminal_core::AmendOrderRequest> for AmendOrderBody {
    fn from(request: &terminal_core::AmendOrderRequest) -> Self {
        Self {
            category: CATEGORY_LINEAR,
            symbol: request.symbol.clone(),
            order_id: request.order_id.to_string(),
            qty: request.qty.map(decimal_string),
            price: request.price.map(decimal_string),
        }
    }
}

/// Body of POST /v5/position/trading-stop
///
/// Unset levels are omitted so the exchange keeps the current value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingStopBody {
    pub category: &'static str,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    pub position_idx: u8,
}

impl From<&terminal_core::TradingStopRequest> for TradingStopBody {
    fn from(request: &terminal_core::TradingStopRequest) -> Self {
        Self {
            category: CATEGORY_LINEAR,
            symbol: request.symbol.clone(),
            take_profit: request.take_profit.map(decimal_string),
            stop_loss: request.stop_loss.map(decimal_string),
            position_idx: request.position_idx,
        }
    }
}

// ============================================================================
// Field parsing
// ============================================================================

/// Parse a numeric string field; empty means zero
pub fn parse_decimal(field: &str, value: &str) -> TerminalResult<Decimal> {
    if value.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(value)
        .map_err(|e| TerminalError::parse(format!("Invalid {} '{}': {}", field, value, e)))
}

/// Parse an optional level (TP, SL, filters); empty or zero means unset
pub fn parse_level(field: &str, value: &str) -> TerminalResult<Option<Decimal>> {
    let level = parse_decimal(field, value)?;
    Ok((!level.is_zero()).then_some(level))
}

fn parse_side(value: &str) -> TerminalResult<OrderSide> {
    match value {
        "Buy" => Ok(OrderSide::Buy),
        "Sell" => Ok(OrderSide::Sell),
        other => Err(TerminalError::parse(format!("Unknown order side: {}", other))),
    }
}

fn parse_order_type(value: &str) -> TerminalResult<OrderType> {
    match value {
        "Market" => Ok(OrderType::Market),
        "Limit" => Ok(OrderType::Limit),
        other => Err(TerminalError::parse(format!("Unknown order type: {}", other))),
    }
}

fn parse_order_status(value: &str) -> TerminalResult<OrderStatus> {
    match value {
        "New" | "Created" | "Untriggered" | "Triggered" => Ok(OrderStatus::New),
        "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
        "Filled" => Ok(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Ok(OrderStatus::Cancelled),
        "Rejected" => Ok(OrderStatus::Rejected),
        other => Err(TerminalError::parse(format!("Unknown order status: {}", other))),
    }
}

/// Decimal as Bybit expects it: plain notation without trailing zeros
pub fn decimal_string(value: Decimal) -> String {
    value.normalize().to_string()
}
