//! Position tracking structures

use crate::order::OrderSide;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that reduces this position
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

/// An open position on a linear perpetual
///
/// One-way mode is assumed, so the symbol alone identifies a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Instrument identifier
    pub symbol: String,

    /// Long or short
    pub side: PositionSide,

    /// Contracts held (never negative; zero means closed)
    pub size: Decimal,

    /// Average entry price
    pub entry_price: Decimal,

    /// Current mark price
    pub mark_price: Decimal,

    /// Unrealized profit/loss in the quote coin
    pub unrealized_pnl: Decimal,

    /// Return on equity in percent
    pub roe: Decimal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,

    /// Exchange position index (0 in one-way mode)
    pub position_idx: u8,
}

impl Position {
    /// Whether the position still has exposure
    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO
    }

    /// ROE in percent given the initial margin backing the position
    pub fn roe_for_margin(unrealized_pnl: Decimal, initial_margin: Decimal) -> Decimal {
        if initial_margin.is_zero() {
            Decimal::ZERO
        } else {
            (unrealized_pnl / initial_margin * Decimal::ONE_HUNDRED).round_dp(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_closing_side() {
        assert_eq!(PositionSide::Long.closing_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_side(), OrderSide::Buy);
    }

    #[test]
    fn test_roe_for_margin() {
        assert_eq!(Position::roe_for_margin(dec!(25), dec!(100)), dec!(25.00));
        assert_eq!(Position::roe_for_margin(dec!(-3.333), dec!(10)), dec!(-33.33));
        assert_eq!(Position::roe_for_margin(dec!(5), Decimal::ZERO), Decimal::ZERO);
    }
}
