//! Terminal engine
//!
//! Wires the catalog, store, dispatcher, polling task and ticker stream
//! together and owns their lifecycle. Symbol selection goes through here so
//! every component switches in the same order.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use terminal_bybit::{
    BybitClient, BybitClientConfig, BybitStreamConfig, StreamEvent, StreamTransport,
};
use terminal_core::{
    normalize_symbol, AccountApi, InstrumentApi, TerminalError, TerminalResult,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::{Topic, UpdateDispatcher};
use crate::polling::{PollingSync, SyncHandle};
use crate::settings::{resolve_initial_symbol, JsonFileSettings, SymbolSettings};
use crate::state_store::{StateStore, SyncContext};
use crate::stream_bridge::spawn_stream_bridge;
use crate::symbol_catalog::SymbolCatalog;

pub struct TerminalEngine {
    store: Arc<StateStore>,
    dispatcher: Arc<UpdateDispatcher>,
    catalog: Arc<SymbolCatalog>,
    settings: Arc<dyn SymbolSettings>,
    sync: SyncHandle,
    transport: Option<StreamTransport>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    filter_quiet: Duration,
}

impl TerminalEngine {
    /// Start every component for the initial symbol
    ///
    /// A catalog that fails to load is logged and left empty; selection is
    /// then unrestricted until a later [`refresh_catalog`](Self::refresh_catalog).
    pub async fn start<A>(
        config: EngineConfig,
        api: Arc<A>,
        settings: Arc<dyn SymbolSettings>,
        transport: Option<(StreamTransport, broadcast::Receiver<StreamEvent>)>,
    ) -> TerminalResult<Self>
    where
        A: AccountApi + InstrumentApi + 'static,
    {
        let catalog = Arc::new(SymbolCatalog::new(api.clone()));
        if let Err(e) = catalog.load().await {
            warn!("[Engine] Symbol catalog unavailable: {}", e);
        }

        let symbol = resolve_initial_symbol(settings.as_ref(), &catalog);
        info!("[Engine] Starting on {}", symbol);

        let store = Arc::new(StateStore::new(config.store.clone()));
        let dispatcher = Arc::new(UpdateDispatcher::new());
        store.set_active_symbol(&symbol);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![dispatcher.spawn_flush_loop(config.flush_interval, shutdown_rx)];

        let (sync, commands) = SyncHandle::channel();
        let polling = PollingSync::new(
            api,
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            config.polling.clone(),
        );
        tasks.push(polling.spawn(commands));
        sync.symbol_changed();

        let transport = match transport {
            Some((mut transport, events)) => {
                transport.set_symbol(&symbol);
                transport.start()?;
                tasks.push(spawn_stream_bridge(
                    events,
                    Arc::clone(&store),
                    Arc::clone(&dispatcher),
                ));
                Some(transport)
            }
            None => {
                info!("[Engine] No ticker stream, prices come from polling");
                None
            }
        };

        Ok(Self {
            store,
            dispatcher,
            catalog,
            settings,
            sync,
            transport,
            shutdown_tx,
            tasks,
            filter_quiet: config.filter_quiet,
        })
    }

    /// Engine against Bybit mainnet/testnet as configured in the environment
    pub async fn bybit(config: EngineConfig) -> TerminalResult<Self> {
        let client = Arc::new(BybitClient::new(BybitClientConfig::from_env())?);
        if !client.has_credentials() {
            warn!("[Engine] BYBIT_API_KEY/BYBIT_API_SECRET not set, account calls will fail");
        }

        let settings: Arc<dyn SymbolSettings> = Arc::new(JsonFileSettings::new(
            &config.settings_path,
            &config.default_symbol,
        ));
        let transport = StreamTransport::new(BybitStreamConfig::default());

        Self::start(config, client, settings, Some(transport)).await
    }

    /// Switch the active symbol
    ///
    /// Order matters: the store moves to a new epoch before anything else so
    /// in-flight polls for the old symbol are discarded, then the stream
    /// resubscribes and an immediate poll cycle runs.
    pub fn select_symbol(&self, symbol: &str) -> TerminalResult<SyncContext> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(TerminalError::validation("Symbol must not be empty"));
        }
        if !self.catalog.is_empty() && !self.catalog.contains(&symbol) {
            return Err(TerminalError::validation(format!(
                "{} is not a tradable symbol",
                symbol
            )));
        }

        if self.store.active_symbol().as_deref() == Some(symbol.as_str()) {
            return self
                .store
                .sync_context()
                .ok_or_else(|| TerminalError::internal("Active symbol without sync context"));
        }

        let ctx = self.store.set_active_symbol(&symbol);
        let symbol_topics = [Topic::Price, Topic::Positions, Topic::Orders];
        // Queued values still describe the previous symbol
        self.dispatcher.discard_pending(&symbol_topics);
        for topic in symbol_topics {
            self.dispatcher.reset_topic(topic);
        }

        if let Some(transport) = &self.transport {
            transport.set_symbol(&symbol);
        }
        self.sync.symbol_changed();

        if let Err(e) = self.settings.save_selected_symbol(&symbol) {
            warn!("[Engine] Failed to save selected symbol: {}", e);
        }

        info!("[Engine] Selected {}", symbol);
        Ok(ctx)
    }

    /// Reload the instrument list
    pub async fn refresh_catalog(&self) -> TerminalResult<usize> {
        self.catalog.load().await
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<UpdateDispatcher> {
        &self.dispatcher
    }

    pub fn catalog(&self) -> &Arc<SymbolCatalog> {
        &self.catalog
    }

    /// Debounced symbol search over the catalog
    ///
    /// The search task ends when the returned sender is dropped.
    pub fn symbol_filter(&self) -> (mpsc::UnboundedSender<String>, watch::Receiver<Vec<String>>) {
        self.catalog.spawn_debounced_filter(self.filter_quiet)
    }

    /// Handle for requesting targeted re-syncs
    pub fn sync_handle(&self) -> SyncHandle {
        self.sync.clone()
    }

    pub fn transport(&self) -> Option<&StreamTransport> {
        self.transport.as_ref()
    }

    /// Stop every task and wait for them to exit
    ///
    /// The dispatcher flushes once more on the way out.
    pub async fn shutdown(self) {
        info!("[Engine] Shutting down");
        self.sync.shutdown();
        self.shutdown_tx.send_replace(true);
        if let Some(transport) = &self.transport {
            transport.stop();
        }

        // The bridge ends when the transport's event sender goes away
        drop(self.transport);

        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!("[Engine] Task ended abnormally: {}", e);
            }
        }
        info!("[Engine] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Update;
    use crate::settings::InMemorySettings;
    use crate::symbol_catalog::DEFAULT_FILTER_QUIET;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use terminal_core::mock::MockExchange;
    use terminal_core::{Position, PositionSide, SymbolInfo};

    fn exchange() -> Arc<MockExchange> {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_instruments(vec![SymbolInfo::new("BTCUSDT"), SymbolInfo::new("ETHUSDT")]);
        exchange.set_ticker(dec!(60000));
        exchange.set_balance(dec!(1000));
        exchange
    }

    fn config() -> EngineConfig {
        EngineConfig {
            flush_interval: Duration::from_millis(50),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_restores_last_symbol() {
        let settings = Arc::new(InMemorySettings::default().with_last_symbol("ETHUSDT"));
        let engine = TerminalEngine::start(config(), exchange(), settings, None)
            .await
            .unwrap();

        assert_eq!(engine.store().active_symbol().as_deref(), Some("ETHUSDT"));
        assert_eq!(engine.catalog().len(), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_last_symbol_falls_back_to_default() {
        let settings = Arc::new(InMemorySettings::default().with_last_symbol("DOGEUSDT"));
        let engine = TerminalEngine::start(config(), exchange(), settings, None)
            .await
            .unwrap();

        assert_eq!(engine.store().active_symbol().as_deref(), Some("BTCUSDT"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_select_symbol_validates_and_persists() {
        let settings = Arc::new(InMemorySettings::default());
        let engine = TerminalEngine::start(config(), exchange(), settings.clone(), None)
            .await
            .unwrap();
        let before = engine.store().epoch();

        let err = engine.select_symbol("DOGEUSDT").unwrap_err();
        assert!(matches!(err, TerminalError::Validation(_)));
        assert_eq!(engine.store().epoch(), before);

        let ctx = engine.select_symbol("ethusdt").unwrap();
        assert_eq!(ctx.symbol, "ETHUSDT");
        assert_eq!(ctx.epoch, before + 1);
        assert_eq!(settings.last_symbol().as_deref(), Some("ETHUSDT"));

        // Reselecting is a no-op
        assert_eq!(engine.select_symbol("ETHUSDT").unwrap(), ctx);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_handlers_receive_polled_state() {
        let engine = TerminalEngine::start(
            config(),
            exchange(),
            Arc::new(InMemorySettings::default()),
            None,
        )
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.dispatcher().register(Topic::Balance, move |update| {
            sink.lock().push(update.clone());
            Ok(())
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        engine.shutdown().await;

        assert_eq!(seen.lock().first(), Some(&Update::Balance(dec!(1000))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_symbol_filter_uses_configured_quiet_period() {
        let config = EngineConfig {
            filter_quiet: Duration::from_millis(40),
            ..config()
        };
        let engine = TerminalEngine::start(
            config,
            exchange(),
            Arc::new(InMemorySettings::default()),
            None,
        )
        .await
        .unwrap();

        let (input, mut results) = engine.symbol_filter();
        assert_eq!(results.borrow().len(), 2);

        let start = tokio::time::Instant::now();
        input.send("eth".to_string()).unwrap();
        results.changed().await.unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(40));
        assert!(waited < DEFAULT_FILTER_QUIET);
        assert_eq!(*results.borrow(), vec!["ETHUSDT".to_string()]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_symbol_switch_drops_queued_updates() {
        let engine = TerminalEngine::start(
            config(),
            exchange(),
            Arc::new(InMemorySettings::default()),
            None,
        )
        .await
        .unwrap();

        let btc = Position {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            size: dec!(0.5),
            entry_price: dec!(60000),
            mark_price: dec!(60500),
            unrealized_pnl: dec!(250),
            roe: dec!(8.33),
            take_profit: None,
            stop_loss: None,
            position_idx: 0,
        };
        engine.dispatcher().publish(Update::Positions(vec![btc]));
        engine.dispatcher().publish(Update::Balance(dec!(1000)));
        engine.select_symbol("ETHUSDT").unwrap();

        let report = engine.dispatcher().flush();
        assert!(!report.delivered.contains(&Topic::Positions));
        assert!(report.delivered.contains(&Topic::Balance));
        assert_eq!(engine.dispatcher().last_delivered(Topic::Positions), None);
        engine.shutdown().await;
    }
}
