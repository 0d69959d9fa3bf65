//! Order lifecycle coordination
//!
//! Runs user actions against the trading API. Nothing is written to the
//! store before the exchange confirms: a rejection leaves local state as it
//! was and comes back as a [`TradingError`] carrying the remote code and
//! message. Confirmed mutations are recorded locally and followed by a
//! targeted re-sync.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use terminal_core::{
    normalize_symbol, AmendOrderRequest, CancelOrderRequest, Order, OrderId, OrderSide,
    OrderStatus, OrderType, PlaceOrderRequest, Position, TradingApi, TradingStopRequest,
};
use terminal_services::{RefreshScope, StateStore, SyncHandle, TerminalEngine};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{CommandOutcome, TakeProfitTarget, TradeCommand};
use crate::types::{LegFailure, LegOutcome, Notice, Result, TakeProfitReport, TradingError};

const NOTICE_CAPACITY: usize = 64;

/// Allowed gap between the sum of take-profit portions and the position size
fn portion_tolerance() -> Decimal {
    Decimal::new(1, 8)
}

pub struct OrderCoordinator {
    api: Arc<dyn TradingApi>,
    store: Arc<StateStore>,
    sync: SyncHandle,
    notices: broadcast::Sender<Notice>,
}

impl OrderCoordinator {
    pub fn new(api: Arc<dyn TradingApi>, store: Arc<StateStore>, sync: SyncHandle) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            api,
            store,
            sync,
            notices,
        }
    }

    /// Coordinator sharing the engine's store and polling task
    pub fn for_engine(api: Arc<dyn TradingApi>, engine: &TerminalEngine) -> Self {
        Self::new(api, Arc::clone(engine.store()), engine.sync_handle())
    }

    /// Receiver for user-facing notices
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Run a typed command
    pub async fn execute(&self, command: TradeCommand) -> Result<CommandOutcome> {
        debug!("[OrderCoordinator] {} on {}", command.name(), command.symbol());

        match command {
            TradeCommand::PlaceOrder {
                symbol,
                side,
                order_type,
                price,
                qty,
            } => self
                .place_order(&symbol, side, order_type, price, qty)
                .await
                .map(CommandOutcome::OrderPlaced),
            TradeCommand::CancelOrder { symbol, order_id } => self
                .cancel_order(&symbol, &order_id)
                .await
                .map(CommandOutcome::OrderCancelled),
            TradeCommand::EditOrder {
                symbol,
                order_id,
                price,
                qty,
            } => self
                .edit_order(&symbol, &order_id, price, qty)
                .await
                .map(CommandOutcome::OrderEdited),
            TradeCommand::ClosePosition { symbol, size } => self
                .close_position(&symbol, size)
                .await
                .map(CommandOutcome::PositionClosed),
            TradeCommand::SetProtectiveLevels {
                symbol,
                take_profit,
                stop_loss,
            } => self
                .set_protective_levels(&symbol, take_profit, stop_loss)
                .await
                .map(|()| CommandOutcome::ProtectiveLevelsSet),
            TradeCommand::SetMultipleTakeProfits {
                symbol,
                size,
                targets,
            } => self
                .set_multiple_take_profits(&symbol, size, &targets)
                .await
                .map(CommandOutcome::TakeProfitsPlaced),
        }
    }

    // ========================================================================
    // Orders
    // ========================================================================

    /// Submit a new order
    ///
    /// Limit orders need a positive price; a price given with a market order
    /// is ignored.
    pub async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        qty: Decimal,
    ) -> Result<Order> {
        let symbol = normalize_symbol(symbol);
        let result = self
            .submit_order(&symbol, side, order_type, price, qty, false)
            .await;

        match result {
            Ok(order) => {
                self.sync.refresh(match order_type {
                    OrderType::Market => RefreshScope::Account,
                    OrderType::Limit => RefreshScope::Orders,
                });
                self.notify(Notice::success(
                    "Order placed",
                    format!("{} {} {} {}", side.as_str(), order.qty, symbol, order_type.as_str()),
                ));
                Ok(order)
            }
            Err(e) => Err(self.fail("Order failed", e)),
        }
    }

    /// Cancel a working order
    pub async fn cancel_order(&self, symbol: &str, order_id: &OrderId) -> Result<OrderId> {
        let request = CancelOrderRequest {
            symbol: normalize_symbol(symbol),
            order_id: order_id.clone(),
        };

        let result = self
            .api
            .cancel_order(&request)
            .await
            .and_then(|response| response.into_result());

        match result {
            Ok(_) => {
                self.store.retire_order(order_id);
                self.sync.refresh(RefreshScope::Orders);
                info!("[OrderCoordinator] Cancelled {} on {}", order_id, request.symbol);
                self.notify(Notice::success("Order cancelled", order_id.to_string()));
                Ok(order_id.clone())
            }
            Err(e) => Err(self.fail("Cancel failed", e.into())),
        }
    }

    /// Change price and/or quantity of a tracked order
    ///
    /// Only fields that differ from the current order are sent.
    pub async fn edit_order(
        &self,
        symbol: &str,
        order_id: &OrderId,
        price: Option<Decimal>,
        qty: Option<Decimal>,
    ) -> Result<Order> {
        let symbol = normalize_symbol(symbol);
        let current = match self.store.order(order_id).filter(|o| o.symbol == symbol) {
            Some(order) => order,
            None => {
                return Err(self.fail(
                    "Edit failed",
                    TradingError::NotFound(format!("Order {} on {}", order_id, symbol)),
                ))
            }
        };

        let price = price.filter(|p| *p != current.price);
        let qty = qty.filter(|q| *q != current.qty);

        let checked = if price.is_none() && qty.is_none() {
            Err(TradingError::Validation("Nothing to change".to_string()))
        } else if price.is_some_and(|p| p <= Decimal::ZERO) {
            Err(TradingError::Validation("Price must be positive".to_string()))
        } else if qty.is_some_and(|q| q <= Decimal::ZERO) {
            Err(TradingError::Validation("Quantity must be positive".to_string()))
        } else {
            Ok(())
        };
        if let Err(e) = checked {
            return Err(self.fail("Edit failed", e));
        }

        let request = AmendOrderRequest {
            symbol,
            order_id: order_id.clone(),
            price,
            qty,
        };
        let result = self
            .api
            .amend_order(&request)
            .await
            .and_then(|response| response.into_result());

        match result {
            Ok(_) => {
                self.store.amend_order(order_id, price, qty);
                self.sync.refresh(RefreshScope::Orders);

                let mut edited = current;
                if let Some(price) = price {
                    edited.price = price;
                }
                if let Some(qty) = qty {
                    edited.qty = qty;
                }
                let edited = self.store.order(order_id).unwrap_or(edited);

                self.notify(Notice::success(
                    "Order modified",
                    format!("{} @ {} x {}", order_id, edited.price, edited.qty),
                ));
                Ok(edited)
            }
            Err(e) => Err(self.fail("Edit failed", e.into())),
        }
    }

    // ========================================================================
    // Positions
    // ========================================================================

    /// Close `size` of the position with a reduce-only market order
    pub async fn close_position(&self, symbol: &str, size: Decimal) -> Result<OrderId> {
        let symbol = normalize_symbol(symbol);
        if size <= Decimal::ZERO {
            return Err(self.fail(
                "Close failed",
                TradingError::Validation("Close size must be positive".to_string()),
            ));
        }

        let position = match self.open_position(&symbol) {
            Ok(position) => position,
            Err(e) => return Err(self.fail("Close failed", e)),
        };

        let result = self
            .submit_order(
                &symbol,
                position.side.closing_side(),
                OrderType::Market,
                None,
                size,
                true,
            )
            .await;

        match result {
            Ok(order) => {
                self.sync.refresh(RefreshScope::Account);
                info!("[OrderCoordinator] Closing {} {}", size, symbol);
                self.notify(Notice::success(
                    "Position closed",
                    format!("Closed {} {}", size, symbol),
                ));
                Ok(order.id)
            }
            Err(e) => Err(self.fail("Close failed", e)),
        }
    }

    /// Set take-profit and/or stop-loss on the position
    ///
    /// Only the levels given are sent; the other stays as it is on the
    /// exchange.
    pub async fn set_protective_levels(
        &self,
        symbol: &str,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<()> {
        let symbol = normalize_symbol(symbol);
        let checked = if take_profit.is_none() && stop_loss.is_none() {
            Err(TradingError::Validation(
                "Take-profit or stop-loss required".to_string(),
            ))
        } else if take_profit
            .into_iter()
            .chain(stop_loss)
            .any(|level| level <= Decimal::ZERO)
        {
            Err(TradingError::Validation("Levels must be positive".to_string()))
        } else {
            Ok(())
        };
        if let Err(e) = checked {
            return Err(self.fail("TP/SL failed", e));
        }

        let request = TradingStopRequest {
            position_idx: self
                .store
                .position(&symbol)
                .map(|p| p.position_idx)
                .unwrap_or(0),
            symbol,
            take_profit,
            stop_loss,
        };

        let result = self
            .api
            .set_trading_stop(&request)
            .await
            .and_then(|response| response.into_result());

        match result {
            Ok(()) => {
                self.sync.refresh(RefreshScope::Positions);
                let levels = [("TP", take_profit), ("SL", stop_loss)]
                    .into_iter()
                    .filter_map(|(name, level)| level.map(|l| format!("{} {}", name, l)))
                    .collect::<Vec<_>>()
                    .join(", ");
                self.notify(Notice::success("TP/SL set", format!("{} {}", request.symbol, levels)));
                Ok(())
            }
            Err(e) => Err(self.fail("TP/SL failed", e.into())),
        }
    }

    /// Split the position into reduce-only limit orders, one per target
    ///
    /// Legs are submitted in order and independently. If any leg fails the
    /// error is [`TradingError::PartialBatch`] listing every leg; placed legs
    /// stay on the exchange and in the store.
    pub async fn set_multiple_take_profits(
        &self,
        symbol: &str,
        size: Decimal,
        targets: &[TakeProfitTarget],
    ) -> Result<TakeProfitReport> {
        let symbol = normalize_symbol(symbol);
        if let Err(e) = validate_targets(size, targets) {
            return Err(self.fail("Take-profit failed", e));
        }

        let position = match self.open_position(&symbol) {
            Ok(position) => position,
            Err(e) => return Err(self.fail("Take-profit failed", e)),
        };
        if (size - position.size).abs() > portion_tolerance() {
            let e = TradingError::Validation(format!(
                "Size {} does not match position size {}",
                size, position.size
            ));
            return Err(self.fail("Take-profit failed", e));
        }
        let side = position.side.closing_side();

        let mut legs = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let result = self
                .submit_order(
                    &symbol,
                    side,
                    OrderType::Limit,
                    Some(target.price),
                    target.portion,
                    true,
                )
                .await
                .map(|order| order.id)
                .map_err(|e| {
                    warn!("[OrderCoordinator] Take-profit leg {} failed: {}", index + 1, e);
                    LegFailure {
                        code: e.code(),
                        message: leg_message(e),
                    }
                });

            legs.push(LegOutcome {
                index,
                price: target.price,
                qty: target.portion,
                result,
            });
        }

        let report = TakeProfitReport { symbol, legs };
        if !report.placed().is_empty() {
            self.sync.refresh(RefreshScope::Orders);
        }

        if report.is_complete() {
            self.notify(Notice::success(
                "Take-profits set",
                format!("{} targets on {}", report.legs.len(), report.symbol),
            ));
            Ok(report)
        } else {
            Err(self.fail("Take-profit incomplete", TradingError::PartialBatch(report)))
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Send one create request and record the confirmed order
    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        price: Option<Decimal>,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<Order> {
        if qty <= Decimal::ZERO {
            return Err(TradingError::Validation("Quantity must be positive".to_string()));
        }
        let price = match order_type {
            OrderType::Limit => match price {
                Some(p) if p > Decimal::ZERO => Some(p),
                _ => {
                    return Err(TradingError::Validation(
                        "Limit orders need a positive price".to_string(),
                    ))
                }
            },
            OrderType::Market => None,
        };

        let request = PlaceOrderRequest {
            symbol: symbol.to_string(),
            side,
            order_type,
            qty,
            price,
            reduce_only,
            order_link_id: Some(Uuid::new_v4().to_string()),
        };

        let ack = self.api.place_order(&request).await?.into_result()?;
        info!(
            "[OrderCoordinator] Placed {} {} {} {} -> {}",
            side.as_str(),
            order_type.as_str(),
            qty,
            symbol,
            ack.order_id
        );

        let order = Order {
            id: ack.order_id,
            symbol: request.symbol,
            side,
            order_type,
            price: price.unwrap_or(Decimal::ZERO),
            qty,
            expected_profit: Decimal::ZERO,
            status: OrderStatus::New,
            reduce_only,
            created_at: Some(Utc::now()),
        };

        // Market orders fill immediately; only resting orders are tracked
        if order_type == OrderType::Limit && !self.store.record_order(order.clone()).is_accepted()
        {
            debug!("[OrderCoordinator] {} not recorded, {} is not active", order.id, symbol);
        }

        Ok(order)
    }

    fn open_position(&self, symbol: &str) -> Result<Position> {
        self.store
            .position(symbol)
            .filter(Position::is_open)
            .ok_or_else(|| TradingError::NotFound(format!("No open position on {}", symbol)))
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }

    /// Log and announce a failure, handing the error back
    fn fail(&self, title: &str, error: TradingError) -> TradingError {
        warn!("[OrderCoordinator] {}: {}", title, error);
        self.notify(Notice::error(title, error.to_string()));
        error
    }
}

fn validate_targets(size: Decimal, targets: &[TakeProfitTarget]) -> Result<()> {
    if size <= Decimal::ZERO {
        return Err(TradingError::Validation("Size must be positive".to_string()));
    }
    if targets.is_empty() {
        return Err(TradingError::Validation("At least one target required".to_string()));
    }
    if let Some(i) = targets
        .iter()
        .position(|t| t.price <= Decimal::ZERO || t.portion <= Decimal::ZERO)
    {
        return Err(TradingError::Validation(format!(
            "Target {} needs a positive price and portion",
            i + 1
        )));
    }

    let total: Decimal = targets.iter().map(|t| t.portion).sum();
    if (total - size).abs() > portion_tolerance() {
        return Err(TradingError::Validation(format!(
            "Portions add up to {}, position size is {}",
            total, size
        )));
    }
    Ok(())
}

/// Remote message verbatim for rejections, the error text otherwise
fn leg_message(error: TradingError) -> String {
    match error {
        TradingError::Api { message, .. } => message,
        other => other.to_string(),
    }
}
