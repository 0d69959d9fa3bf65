//! Polling synchronization
//!
//! Re-fetches authoritative account state on a fixed cadence, applies it to
//! the [`StateStore`] and publishes the resulting snapshots. The calls of one
//! cycle run concurrently and fail independently: a failed fetch keeps the
//! previous value.

use std::sync::Arc;
use std::time::Duration;

use terminal_core::{AccountApi, TerminalResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dispatcher::{Update, UpdateDispatcher};
use crate::state_store::{ApplyOutcome, StateStore, SyncContext};

pub const DEFAULT_ACCOUNT_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_BALANCE_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Cadence for positions and orders
    pub account_interval: Duration,
    pub balance_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            account_interval: DEFAULT_ACCOUNT_INTERVAL,
            balance_interval: DEFAULT_BALANCE_INTERVAL,
        }
    }
}

/// What a cycle re-fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshScope {
    Positions,
    Orders,
    Balance,
    /// Positions and orders
    Account,
    All,
}

impl RefreshScope {
    fn positions(&self) -> bool {
        matches!(
            self,
            RefreshScope::Positions | RefreshScope::Account | RefreshScope::All
        )
    }

    fn orders(&self) -> bool {
        matches!(
            self,
            RefreshScope::Orders | RefreshScope::Account | RefreshScope::All
        )
    }

    fn balance(&self) -> bool {
        matches!(self, RefreshScope::Balance | RefreshScope::All)
    }

    /// Price fallback rides along with the account cadence
    fn price(&self) -> bool {
        matches!(self, RefreshScope::Account | RefreshScope::All)
    }
}

/// Control message for the polling task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCommand {
    /// The active symbol changed: run a full cycle now
    SymbolChanged,
    /// Targeted re-sync, e.g. after an order mutation
    Refresh(RefreshScope),
    Shutdown,
}

/// Cloneable sender side of the polling task
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn symbol_changed(&self) {
        self.send(SyncCommand::SymbolChanged);
    }

    pub fn refresh(&self, scope: RefreshScope) {
        self.send(SyncCommand::Refresh(scope));
    }

    pub fn shutdown(&self) {
        self.send(SyncCommand::Shutdown);
    }

    fn send(&self, command: SyncCommand) {
        if self.tx.send(command.clone()).is_err() {
            debug!("[PollingSync] Not running, dropped {:?}", command);
        }
    }
}

/// Outcome of one fetch within a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not part of this cycle
    Skipped,
    Applied(ApplyOutcome),
    /// Error text; the previous value was kept
    Failed(String),
}

impl FetchOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub positions: FetchOutcome,
    pub orders: FetchOutcome,
    pub balance: FetchOutcome,
    pub price: FetchOutcome,
}

/// Periodic account re-sync
pub struct PollingSync {
    api: Arc<dyn AccountApi>,
    store: Arc<StateStore>,
    dispatcher: Arc<UpdateDispatcher>,
    config: PollingConfig,
}

impl PollingSync {
    pub fn new(
        api: Arc<dyn AccountApi>,
        store: Arc<StateStore>,
        dispatcher: Arc<UpdateDispatcher>,
        config: PollingConfig,
    ) -> Self {
        Self {
            api,
            store,
            dispatcher,
            config,
        }
    }

    /// Spawn the polling task
    pub fn spawn(self, commands: mpsc::UnboundedReceiver<SyncCommand>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(commands).await })
    }

    /// Poll until `Shutdown` arrives or every handle is dropped
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<SyncCommand>) {
        info!(
            "[PollingSync] Started (account every {:?}, balance every {:?})",
            self.config.account_interval, self.config.balance_interval
        );

        let mut account_tick = tokio::time::interval(self.config.account_interval);
        account_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut balance_tick = tokio::time::interval(self.config.balance_interval);
        balance_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = account_tick.tick() => {
                    self.sync_once(RefreshScope::Account).await;
                }
                _ = balance_tick.tick() => {
                    self.sync_once(RefreshScope::Balance).await;
                }
                command = commands.recv() => {
                    match command {
                        Some(SyncCommand::SymbolChanged) => {
                            debug!("[PollingSync] Symbol changed, running full cycle");
                            self.sync_once(RefreshScope::All).await;
                            account_tick.reset();
                            balance_tick.reset();
                        }
                        Some(SyncCommand::Refresh(scope)) => {
                            debug!("[PollingSync] Refresh {:?}", scope);
                            self.sync_once(scope).await;
                        }
                        Some(SyncCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        info!("[PollingSync] Stopped");
    }

    /// Run one cycle for `scope`
    pub async fn sync_once(&self, scope: RefreshScope) -> CycleReport {
        let ctx = self.store.sync_context();

        let positions_ctx = ctx.as_ref().filter(|_| scope.positions());
        let orders_ctx = ctx.as_ref().filter(|_| scope.orders());
        let price_ctx = ctx
            .as_ref()
            .filter(|c| scope.price() && self.store.needs_price_fallback(&c.symbol));

        let (positions, orders, balance, price) = tokio::join!(
            async {
                match positions_ctx {
                    Some(c) => Some(self.api.get_positions(&c.symbol).await),
                    None => None,
                }
            },
            async {
                match orders_ctx {
                    Some(c) => Some(self.api.get_open_orders(&c.symbol).await),
                    None => None,
                }
            },
            async {
                if scope.balance() {
                    Some(self.api.get_wallet_balance().await)
                } else {
                    None
                }
            },
            async {
                match price_ctx {
                    Some(c) => Some(self.api.get_ticker(&c.symbol).await),
                    None => None,
                }
            },
        );

        // Positions first so order expected profit sees the new position
        let positions = match (positions, positions_ctx) {
            (Some(result), Some(c)) => self.finish("positions", result, |list| {
                let outcome = self.store.apply_positions(c, list);
                self.publish_if_current(c, outcome, || Update::Positions(self.store.positions()));
                outcome
            }),
            _ => FetchOutcome::Skipped,
        };

        let orders = match (orders, orders_ctx) {
            (Some(result), Some(c)) => self.finish("orders", result, |list| {
                let outcome = self.store.apply_orders(c, list);
                self.publish_if_current(c, outcome, || Update::Orders(self.store.orders()));
                outcome
            }),
            _ => FetchOutcome::Skipped,
        };

        let balance = match balance {
            Some(result) => self.finish("balance", result, |value| {
                let outcome = self.store.apply_balance(value);
                self.dispatcher.publish(Update::Balance(value));
                outcome
            }),
            None => FetchOutcome::Skipped,
        };

        let price = match (price, price_ctx) {
            (Some(result), Some(c)) => self.finish("ticker", result, |quote| {
                let update = Update::price(&quote);
                let outcome = self.store.apply_price(quote);
                self.publish_if_current(c, outcome, || update);
                outcome
            }),
            _ => FetchOutcome::Skipped,
        };

        CycleReport {
            positions,
            orders,
            balance,
            price,
        }
    }

    fn finish<T>(
        &self,
        what: &str,
        result: TerminalResult<terminal_core::ApiResponse<T>>,
        apply: impl FnOnce(T) -> ApplyOutcome,
    ) -> FetchOutcome {
        match result.and_then(|response| response.into_result()) {
            Ok(value) => FetchOutcome::Applied(apply(value)),
            Err(e) => {
                warn!("[PollingSync] {} fetch failed, keeping previous: {}", what, e);
                FetchOutcome::Failed(e.to_string())
            }
        }
    }

    fn publish_if_current(
        &self,
        ctx: &SyncContext,
        outcome: ApplyOutcome,
        update: impl FnOnce() -> Update,
    ) {
        if outcome.is_accepted() && self.store.is_current(ctx) {
            self.dispatcher.publish(update());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Topic;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use terminal_core::mock::MockExchange;
    use terminal_core::{Position, PositionSide, TerminalError};

    fn btc_position() -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Short,
            size: dec!(2),
            entry_price: dec!(61000),
            mark_price: dec!(60000),
            unrealized_pnl: dec!(2000),
            roe: dec!(32.79),
            take_profit: None,
            stop_loss: Some(dec!(63000)),
            position_idx: 0,
        }
    }

    fn setup() -> (Arc<MockExchange>, Arc<StateStore>, Arc<UpdateDispatcher>, PollingSync) {
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(StateStore::default());
        let dispatcher = Arc::new(UpdateDispatcher::new());
        store.set_active_symbol("BTCUSDT");
        let sync = PollingSync::new(
            exchange.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            PollingConfig::default(),
        );
        (exchange, store, dispatcher, sync)
    }

    #[tokio::test]
    async fn test_failed_orders_fetch_keeps_previous_snapshot() {
        let (exchange, store, dispatcher, sync) = setup();
        exchange.set_positions(vec![btc_position()]);
        exchange.set_balance(dec!(2500));
        exchange.set_ticker(dec!(60000));

        sync.sync_once(RefreshScope::All).await;
        assert_eq!(store.orders().len(), 0);
        assert_eq!(store.balance(), Some(dec!(2500)));

        exchange.fail_orders(TerminalError::network("timeout"));
        exchange.set_balance(dec!(2600));
        let report = sync.sync_once(RefreshScope::All).await;

        assert!(report.orders.is_failed());
        assert_eq!(report.positions, FetchOutcome::Applied(ApplyOutcome::Unchanged));
        assert_eq!(report.balance, FetchOutcome::Applied(ApplyOutcome::Applied));
        assert_eq!(store.balance(), Some(dec!(2600)));
        assert_eq!(store.positions(), vec![btc_position()]);

        dispatcher.flush();
        assert_eq!(
            dispatcher.last_delivered(Topic::Balance),
            Some(Update::Balance(dec!(2600)))
        );
    }

    #[tokio::test]
    async fn test_price_fallback_only_when_stream_is_silent() {
        let (exchange, store, _dispatcher, sync) = setup();
        exchange.set_ticker(dec!(60100));

        let report = sync.sync_once(RefreshScope::Account).await;
        assert_eq!(report.price, FetchOutcome::Applied(ApplyOutcome::Applied));
        assert_eq!(store.active_price().unwrap().price, dec!(60100));

        store.apply_price(terminal_core::PriceQuote::from_stream("BTCUSDT", dec!(60200)));
        let report = sync.sync_once(RefreshScope::Account).await;
        assert_eq!(report.price, FetchOutcome::Skipped);
        assert_eq!(store.active_price().unwrap().price, dec!(60200));
    }

    #[tokio::test]
    async fn test_balance_scope_touches_only_balance() {
        let (exchange, _store, _dispatcher, sync) = setup();
        exchange.set_balance(Decimal::ONE);

        let report = sync.sync_once(RefreshScope::Balance).await;
        assert_eq!(report.positions, FetchOutcome::Skipped);
        assert_eq!(report.orders, FetchOutcome::Skipped);
        assert_eq!(report.price, FetchOutcome::Skipped);
        assert_eq!(exchange.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_results_for_previous_symbol_are_not_published() {
        let (exchange, store, dispatcher, sync) = setup();
        exchange.set_positions(vec![btc_position()]);

        let ctx = store.sync_context().unwrap();
        store.set_active_symbol("ETHUSDT");

        let outcome = store.apply_positions(&ctx, vec![btc_position()]);
        sync.publish_if_current(&ctx, outcome, || Update::Positions(vec![btc_position()]));
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(dispatcher.flush().delivered.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_cadence_until_shutdown() {
        let (exchange, _store, _dispatcher, sync) = setup();
        let (handle, commands) = SyncHandle::channel();
        let task = sync.spawn(commands);

        // Immediate first ticks: one account cycle and one balance cycle
        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = exchange.calls().len();
        assert!(first >= 3);

        tokio::time::sleep(DEFAULT_ACCOUNT_INTERVAL).await;
        assert!(exchange.calls().len() > first);

        handle.shutdown();
        task.await.unwrap();
    }
}
