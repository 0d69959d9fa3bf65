//! In-memory market and account state
//!
//! Holds the last known price per symbol and the positions, orders and
//! balance of the active symbol. Every mutation happens under one write lock
//! and every read returns an owned snapshot.
//!
//! Authority is split by field: positions, orders and balance come from
//! polling, price comes from the stream. A poll-sourced price only fills in
//! while the stream is silent. Poll results are tagged with a
//! [`SyncContext`]; after a symbol switch, results for the previous epoch
//! are discarded.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use terminal_core::{normalize_symbol, Order, OrderId, Position, PriceQuote, QuoteSource};
use tracing::{debug, info, warn};

/// Consecutive snapshots an order may be missing from before it is dropped
pub const DEFAULT_ORDER_ABSENCE_TOLERANCE: u32 = 2;

/// Age after which a stream quote no longer blocks poll-sourced prices
pub const DEFAULT_PRICE_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub order_absence_tolerance: u32,
    pub price_stale_after: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            order_absence_tolerance: DEFAULT_ORDER_ABSENCE_TOLERANCE,
            price_stale_after: DEFAULT_PRICE_STALE_AFTER,
        }
    }
}

/// Symbol and epoch a poll was issued for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncContext {
    pub symbol: String,
    pub epoch: u64,
}

/// Result of applying a value to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store changed
    Applied,
    /// Accepted, but identical to what was held
    Unchanged,
    /// Issued for a previous symbol or epoch; discarded
    Stale,
    /// Poll-sourced price ignored because a fresh stream quote exists
    Superseded,
}

impl ApplyOutcome {
    /// Whether the value was accepted (changed or not)
    pub fn is_accepted(&self) -> bool {
        matches!(self, ApplyOutcome::Applied | ApplyOutcome::Unchanged)
    }
}

#[derive(Debug, Clone)]
struct TrackedOrder {
    order: Order,
    /// Consecutive snapshots this order was absent from
    missed: u32,
}

#[derive(Debug, Default)]
struct StoreInner {
    active_symbol: Option<String>,
    epoch: u64,
    prices: HashMap<String, PriceQuote>,
    positions: HashMap<String, Position>,
    orders: HashMap<OrderId, TrackedOrder>,
    /// Ids reported terminal or cancelled; never accepted again
    retired: HashSet<OrderId>,
    balance: Option<Decimal>,
}

impl StoreInner {
    fn is_current(&self, ctx: &SyncContext) -> bool {
        self.epoch == ctx.epoch && self.active_symbol.as_deref() == Some(ctx.symbol.as_str())
    }

    fn orders_snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.orders.values().map(|t| t.order.clone()).collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        orders
    }

    fn positions_snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    fn refresh_expected_profits(&mut self) {
        let StoreInner {
            orders,
            positions,
            prices,
            ..
        } = self;
        for tracked in orders.values_mut() {
            let order = &mut tracked.order;
            order.expected_profit = order.expected_profit_against(
                positions.get(&order.symbol),
                prices.get(&order.symbol).map(|q| q.price),
            );
        }
    }
}

/// Thread-safe state store
pub struct StateStore {
    inner: RwLock<StoreInner>,
    config: StoreConfig,
}

impl StateStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            config,
        }
    }

    // ========================================================================
    // Symbol scoping
    // ========================================================================

    /// Make `symbol` the active symbol
    ///
    /// Bumps the epoch and clears positions and orders, so polls issued
    /// for the previous symbol are discarded when they complete. Selecting
    /// the already active symbol changes nothing.
    pub fn set_active_symbol(&self, symbol: &str) -> SyncContext {
        let symbol = normalize_symbol(symbol);
        let mut inner = self.inner.write();

        if inner.active_symbol.as_deref() == Some(symbol.as_str()) {
            return SyncContext {
                symbol,
                epoch: inner.epoch,
            };
        }

        inner.epoch += 1;
        inner.active_symbol = Some(symbol.clone());
        inner.positions.clear();
        inner.orders.clear();

        info!("[StateStore] Active symbol {} (epoch {})", symbol, inner.epoch);
        SyncContext {
            symbol,
            epoch: inner.epoch,
        }
    }

    pub fn active_symbol(&self) -> Option<String> {
        self.inner.read().active_symbol.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    /// Context to tag a poll with; `None` before a symbol is selected
    pub fn sync_context(&self) -> Option<SyncContext> {
        let inner = self.inner.read();
        inner.active_symbol.as_ref().map(|symbol| SyncContext {
            symbol: symbol.clone(),
            epoch: inner.epoch,
        })
    }

    pub fn is_current(&self, ctx: &SyncContext) -> bool {
        self.inner.read().is_current(ctx)
    }

    // ========================================================================
    // Apply
    // ========================================================================

    /// Apply a price quote
    pub fn apply_price(&self, quote: PriceQuote) -> ApplyOutcome {
        let now = Utc::now();
        let mut inner = self.inner.write();

        if let Some(existing) = inner.prices.get_mut(&quote.symbol) {
            if quote.source == QuoteSource::Poll
                && existing.source == QuoteSource::Stream
                && !self.is_stale(existing, now)
            {
                return ApplyOutcome::Superseded;
            }
            if existing.price == quote.price && existing.source == quote.source {
                existing.timestamp = quote.timestamp;
                return ApplyOutcome::Unchanged;
            }
        }

        inner.prices.insert(quote.symbol.clone(), quote);
        inner.refresh_expected_profits();
        ApplyOutcome::Applied
    }

    /// Replace the positions of the context's symbol
    ///
    /// Zero-size entries and entries for other symbols are dropped.
    pub fn apply_positions(&self, ctx: &SyncContext, positions: Vec<Position>) -> ApplyOutcome {
        let mut inner = self.inner.write();
        if !inner.is_current(ctx) {
            debug!("[StateStore] Discarding positions for {:?}", ctx);
            return ApplyOutcome::Stale;
        }

        let next: HashMap<String, Position> = positions
            .into_iter()
            .filter(|p| p.is_open() && p.symbol == ctx.symbol)
            .map(|p| (p.symbol.clone(), p))
            .collect();

        if next == inner.positions {
            return ApplyOutcome::Unchanged;
        }

        inner.positions = next;
        inner.refresh_expected_profits();
        ApplyOutcome::Applied
    }

    /// Reconcile working orders with an authoritative snapshot
    ///
    /// Terminal orders are retired. Orders missing from the snapshot are
    /// kept until they have been absent `order_absence_tolerance` times in a
    /// row. Retired ids showing up again are ignored.
    pub fn apply_orders(&self, ctx: &SyncContext, orders: Vec<Order>) -> ApplyOutcome {
        let mut inner = self.inner.write();
        if !inner.is_current(ctx) {
            debug!("[StateStore] Discarding orders for {:?}", ctx);
            return ApplyOutcome::Stale;
        }

        let before = inner.orders_snapshot();
        let mut seen = HashSet::new();

        for order in orders {
            if order.symbol != ctx.symbol {
                continue;
            }
            if inner.retired.contains(&order.id) {
                warn!("[StateStore] Ignoring retired order {}", order.id);
                continue;
            }
            if order.status.is_terminal() {
                inner.orders.remove(&order.id);
                inner.retired.insert(order.id);
                continue;
            }

            seen.insert(order.id.clone());
            inner
                .orders
                .insert(order.id.clone(), TrackedOrder { order, missed: 0 });
        }

        let tolerance = self.config.order_absence_tolerance;
        inner.orders.retain(|id, tracked| {
            if seen.contains(id) {
                return true;
            }
            tracked.missed += 1;
            if tracked.missed >= tolerance {
                debug!("[StateStore] Order {} absent {} times, dropping", id, tracked.missed);
                false
            } else {
                true
            }
        });

        inner.refresh_expected_profits();

        if inner.orders_snapshot() == before {
            ApplyOutcome::Unchanged
        } else {
            ApplyOutcome::Applied
        }
    }

    pub fn apply_balance(&self, balance: Decimal) -> ApplyOutcome {
        let mut inner = self.inner.write();
        if inner.balance == Some(balance) {
            return ApplyOutcome::Unchanged;
        }
        inner.balance = Some(balance);
        ApplyOutcome::Applied
    }

    // ========================================================================
    // Local feedback
    // ========================================================================

    /// Track an order the exchange just accepted
    pub fn record_order(&self, order: Order) -> ApplyOutcome {
        let mut inner = self.inner.write();
        if inner.retired.contains(&order.id) {
            warn!("[StateStore] Not recording retired order {}", order.id);
            return ApplyOutcome::Stale;
        }
        if inner.active_symbol.as_deref() != Some(order.symbol.as_str()) {
            return ApplyOutcome::Stale;
        }

        inner
            .orders
            .insert(order.id.clone(), TrackedOrder { order, missed: 0 });
        inner.refresh_expected_profits();
        ApplyOutcome::Applied
    }

    /// Drop an order whose cancel was confirmed; the id is never accepted again
    pub fn retire_order(&self, id: &OrderId) -> Option<Order> {
        let mut inner = self.inner.write();
        inner.retired.insert(id.clone());
        inner.orders.remove(id).map(|t| t.order)
    }

    /// Apply a confirmed edit; returns whether the order was tracked
    pub fn amend_order(&self, id: &OrderId, price: Option<Decimal>, qty: Option<Decimal>) -> bool {
        let mut inner = self.inner.write();
        let Some(tracked) = inner.orders.get_mut(id) else {
            return false;
        };

        if let Some(price) = price {
            tracked.order.price = price;
        }
        if let Some(qty) = qty {
            tracked.order.qty = qty;
        }
        tracked.missed = 0;
        inner.refresh_expected_profits();
        true
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    pub fn price(&self, symbol: &str) -> Option<PriceQuote> {
        self.inner.read().prices.get(symbol).cloned()
    }

    /// Price of the active symbol
    pub fn active_price(&self) -> Option<PriceQuote> {
        let inner = self.inner.read();
        inner
            .active_symbol
            .as_ref()
            .and_then(|symbol| inner.prices.get(symbol))
            .cloned()
    }

    /// Whether `symbol` needs a poll-sourced price: nothing from the stream,
    /// or the stream quote has gone stale
    pub fn needs_price_fallback(&self, symbol: &str) -> bool {
        let inner = self.inner.read();
        match inner.prices.get(symbol) {
            None => true,
            Some(quote) => quote.source == QuoteSource::Poll || self.is_stale(quote, Utc::now()),
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        self.inner.read().positions_snapshot()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.inner.read().orders_snapshot()
    }

    pub fn order(&self, id: &OrderId) -> Option<Order> {
        self.inner.read().orders.get(id).map(|t| t.order.clone())
    }

    pub fn is_retired(&self, id: &OrderId) -> bool {
        self.inner.read().retired.contains(id)
    }

    pub fn balance(&self) -> Option<Decimal> {
        self.inner.read().balance
    }

    fn is_stale(&self, quote: &PriceQuote, now: chrono::DateTime<Utc>) -> bool {
        quote
            .age(now)
            .to_std()
            .map(|age| age >= self.config.price_stale_after)
            .unwrap_or(false)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use terminal_core::{OrderSide, OrderStatus, OrderType, PositionSide};

    fn position(symbol: &str, size: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            size,
            entry_price: dec!(60000),
            mark_price: dec!(60500),
            unrealized_pnl: dec!(500),
            roe: dec!(8.33),
            take_profit: None,
            stop_loss: None,
            position_idx: 0,
        }
    }

    fn order(id: &str, status: OrderStatus) -> Order {
        Order {
            id: OrderId::from(id),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            price: dec!(62000),
            qty: dec!(0.5),
            expected_profit: Decimal::ZERO,
            status,
            reduce_only: true,
            created_at: None,
        }
    }

    fn store() -> (StateStore, SyncContext) {
        let store = StateStore::default();
        let ctx = store.set_active_symbol("BTCUSDT");
        (store, ctx)
    }

    #[test]
    fn test_zero_size_positions_are_never_exposed() {
        let (store, ctx) = store();

        store.apply_positions(&ctx, vec![position("BTCUSDT", dec!(1))]);
        assert_eq!(store.positions().len(), 1);

        let outcome = store.apply_positions(&ctx, vec![position("BTCUSDT", Decimal::ZERO)]);
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(store.positions().is_empty());
        assert!(store.position("BTCUSDT").is_none());
    }

    #[test]
    fn test_old_epoch_results_are_discarded() {
        let (store, old_ctx) = store();
        let new_ctx = store.set_active_symbol("ETHUSDT");
        assert_eq!(new_ctx.epoch, old_ctx.epoch + 1);

        let outcome = store.apply_positions(&old_ctx, vec![position("BTCUSDT", dec!(1))]);
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(
            store.apply_orders(&old_ctx, vec![order("a", OrderStatus::New)]),
            ApplyOutcome::Stale
        );
        assert!(store.positions().is_empty());
        assert!(store.orders().is_empty());
    }

    #[test]
    fn test_reselecting_active_symbol_keeps_epoch() {
        let (store, ctx) = store();
        store.apply_positions(&ctx, vec![position("BTCUSDT", dec!(1))]);

        let again = store.set_active_symbol("btcusdt");
        assert_eq!(again, ctx);
        assert_eq!(store.positions().len(), 1);
    }

    #[test]
    fn test_orders_survive_single_absence() {
        let (store, ctx) = store();
        store.apply_orders(&ctx, vec![order("a", OrderStatus::New)]);

        store.apply_orders(&ctx, Vec::new());
        assert!(store.order(&OrderId::from("a")).is_some());

        store.apply_orders(&ctx, Vec::new());
        assert!(store.order(&OrderId::from("a")).is_none());
    }

    #[test]
    fn test_terminal_orders_are_retired_for_good() {
        let (store, ctx) = store();
        store.apply_orders(&ctx, vec![order("a", OrderStatus::New)]);
        store.apply_orders(&ctx, vec![order("a", OrderStatus::Filled)]);
        assert!(store.orders().is_empty());
        assert!(store.is_retired(&OrderId::from("a")));

        // A lagging snapshot still listing the order does not resurrect it
        store.apply_orders(&ctx, vec![order("a", OrderStatus::New)]);
        assert!(store.orders().is_empty());
    }

    #[test]
    fn test_retire_and_amend() {
        let (store, _ctx) = store();
        store.record_order(order("a", OrderStatus::New));
        store.record_order(order("b", OrderStatus::New));

        assert!(store.amend_order(&OrderId::from("a"), Some(dec!(63000)), None));
        assert_eq!(store.order(&OrderId::from("a")).unwrap().price, dec!(63000));

        assert!(store.retire_order(&OrderId::from("b")).is_some());
        assert!(!store.amend_order(&OrderId::from("b"), None, Some(dec!(1))));
        assert_eq!(
            store.record_order(order("b", OrderStatus::New)),
            ApplyOutcome::Stale
        );
    }

    #[test]
    fn test_expected_profit_follows_position() {
        let (store, ctx) = store();
        store.apply_orders(&ctx, vec![order("a", OrderStatus::New)]);
        assert_eq!(store.orders()[0].expected_profit, Decimal::ZERO);

        store.apply_positions(&ctx, vec![position("BTCUSDT", dec!(1))]);
        // (62000 - 60000) * 0.5
        assert_eq!(store.orders()[0].expected_profit, dec!(1000));
    }

    #[test]
    fn test_poll_price_only_fills_in_for_silent_stream() {
        let (store, _ctx) = store();

        let poll = PriceQuote::from_poll("BTCUSDT", dec!(64000));
        assert_eq!(store.apply_price(poll), ApplyOutcome::Applied);
        assert!(store.needs_price_fallback("BTCUSDT"));

        let stream = PriceQuote::from_stream("BTCUSDT", dec!(64010));
        assert_eq!(store.apply_price(stream), ApplyOutcome::Applied);
        assert!(!store.needs_price_fallback("BTCUSDT"));

        let late_poll = PriceQuote::from_poll("BTCUSDT", dec!(63990));
        assert_eq!(store.apply_price(late_poll), ApplyOutcome::Superseded);
        assert_eq!(store.active_price().unwrap().price, dec!(64010));

        let old_stream = PriceQuote::new(
            "BTCUSDT",
            dec!(64020),
            Utc::now() - chrono::Duration::seconds(30),
            QuoteSource::Stream,
        );
        store.apply_price(old_stream);
        assert!(store.needs_price_fallback("BTCUSDT"));
        assert_eq!(
            store.apply_price(PriceQuote::from_poll("BTCUSDT", dec!(63000))),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_balance_unchanged() {
        let store = StateStore::default();
        assert_eq!(store.apply_balance(dec!(100)), ApplyOutcome::Applied);
        assert_eq!(store.apply_balance(dec!(100)), ApplyOutcome::Unchanged);
        assert_eq!(store.balance(), Some(dec!(100)));
    }
}
