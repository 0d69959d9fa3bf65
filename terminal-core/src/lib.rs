//! Core types for the Bybit Trading Terminal
//!
//! This crate defines the shared data structures used across the terminal
//! engine: market quotes, positions, orders, the remote API seams and the
//! streaming protocol.

pub mod api;
pub mod error;
pub mod market;
pub mod order;
pub mod position;
pub mod websocket;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use api::{
    AccountApi, AmendOrderRequest, ApiResponse, CancelOrderRequest, InstrumentApi, OrderAck,
    PlaceOrderRequest, TradingApi, TradingStopRequest, SUCCESS_CODE,
};
pub use error::{TerminalError, TerminalResult};
pub use market::{normalize_symbol, PriceQuote, QuoteSource, SymbolInfo};
pub use order::{Order, OrderId, OrderSide, OrderStatus, OrderType};
pub use position::{Position, PositionSide};
pub use websocket::{ticker_topic, ConnectionState, StreamRequest};
