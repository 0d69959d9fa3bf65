//! Typed trading actions
//!
//! Every user action is a value handed to
//! [`OrderCoordinator::execute`](crate::OrderCoordinator::execute), whatever
//! triggered it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use terminal_core::{Order, OrderId, OrderSide, OrderType};

use crate::types::TakeProfitReport;

/// One target of a multi-target take-profit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: Decimal,
    /// Quantity closed at this price, in contracts
    pub portion: Decimal,
}

impl TakeProfitTarget {
    pub fn new(price: Decimal, portion: Decimal) -> Self {
        Self { price, portion }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TradeCommand {
    PlaceOrder {
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        qty: Decimal,
    },
    CancelOrder {
        symbol: String,
        order_id: OrderId,
    },
    EditOrder {
        symbol: String,
        order_id: OrderId,
        price: Option<Decimal>,
        qty: Option<Decimal>,
    },
    ClosePosition {
        symbol: String,
        size: Decimal,
    },
    SetProtectiveLevels {
        symbol: String,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    },
    SetMultipleTakeProfits {
        symbol: String,
        size: Decimal,
        targets: Vec<TakeProfitTarget>,
    },
}

impl TradeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            TradeCommand::PlaceOrder { .. } => "place_order",
            TradeCommand::CancelOrder { .. } => "cancel_order",
            TradeCommand::EditOrder { .. } => "edit_order",
            TradeCommand::ClosePosition { .. } => "close_position",
            TradeCommand::SetProtectiveLevels { .. } => "set_protective_levels",
            TradeCommand::SetMultipleTakeProfits { .. } => "set_multiple_take_profits",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            TradeCommand::PlaceOrder { symbol, .. }
            | TradeCommand::CancelOrder { symbol, .. }
            | TradeCommand::EditOrder { symbol, .. }
            | TradeCommand::ClosePosition { symbol, .. }
            | TradeCommand::SetProtectiveLevels { symbol, .. }
            | TradeCommand::SetMultipleTakeProfits { symbol, .. } => symbol,
        }
    }
}

/// What a successful command produced
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    OrderPlaced(Order),
    OrderCancelled(OrderId),
    OrderEdited(Order),
    /// Id of the closing market order
    PositionClosed(OrderId),
    ProtectiveLevelsSet,
    TakeProfitsPlaced(TakeProfitReport),
}
