//! Order structures

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::position::{Position, PositionSide};

/// Exchange-assigned order identifier
///
/// Opaque and never reused: once an id has been retired it stays retired.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OrderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "Market",
            OrderType::Limit => "Limit",
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Filled, Cancelled and Rejected orders never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// A working or recently finished order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Limit price (zero for market orders)
    pub price: Decimal,
    pub qty: Decimal,
    /// Profit if this order closes against the current position
    pub expected_profit: Decimal,
    pub status: OrderStatus,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Expected profit of this order against `position`
    ///
    /// Only orders on the position's closing side produce a profit; the
    /// closed quantity is capped at the position size.
    pub fn expected_profit_against(
        &self,
        position: Option<&Position>,
        fallback_price: Option<Decimal>,
    ) -> Decimal {
        let Some(position) = position.filter(|p| p.is_open() && p.symbol == self.symbol) else {
            return Decimal::ZERO;
        };

        if self.side != position.side.closing_side() {
            return Decimal::ZERO;
        }

        let price = if self.price.is_zero() {
            match fallback_price {
                Some(p) => p,
                None => return Decimal::ZERO,
            }
        } else {
            self.price
        };

        let qty = self.qty.min(position.size);
        match position.side {
            PositionSide::Long => (price - position.entry_price) * qty,
            PositionSide::Short => (position.entry_price - price) * qty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            size: dec!(1),
            entry_price: dec!(60000),
            mark_price: dec!(61000),
            unrealized_pnl: dec!(1000),
            roe: dec!(16.67),
            take_profit: None,
            stop_loss: None,
            position_idx: 0,
        }
    }

    fn order(side: OrderSide, price: Decimal, qty: Decimal) -> Order {
        Order {
            id: OrderId::new("o-1"),
            symbol: "BTCUSDT".to_string(),
            side,
            order_type: OrderType::Limit,
            price,
            qty,
            expected_profit: Decimal::ZERO,
            status: OrderStatus::New,
            reduce_only: true,
            created_at: None,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_expected_profit_closing_long() {
        let position = long_position();
        let tp = order(OrderSide::Sell, dec!(62000), dec!(0.5));
        assert_eq!(tp.expected_profit_against(Some(&position), None), dec!(1000));
    }

    #[test]
    fn test_expected_profit_caps_at_position_size() {
        let position = long_position();
        let tp = order(OrderSide::Sell, dec!(61000), dec!(3));
        assert_eq!(tp.expected_profit_against(Some(&position), None), dec!(1000));
    }

    #[test]
    fn test_expected_profit_ignores_opening_orders() {
        let position = long_position();
        let add = order(OrderSide::Buy, dec!(59000), dec!(1));
        assert_eq!(add.expected_profit_against(Some(&position), None), Decimal::ZERO);
        assert_eq!(add.expected_profit_against(None, None), Decimal::ZERO);
    }

    #[test]
    fn test_expected_profit_market_order_uses_fallback_price() {
        let position = long_position();
        let close = order(OrderSide::Sell, Decimal::ZERO, dec!(1));
        assert_eq!(
            close.expected_profit_against(Some(&position), Some(dec!(60500))),
            dec!(500)
        );
        assert_eq!(close.expected_profit_against(Some(&position), None), Decimal::ZERO);
    }

    #[test]
    fn test_order_id_display() {
        let id = OrderId::from("abc-123");
        assert_eq!(id.to_string(), "abc-123");
        assert_eq!(id.as_str(), "abc-123");
    }
}
