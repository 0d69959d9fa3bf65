//! Tradable instrument catalog
//!
//! Loads the instrument list once (or on manual refresh) and answers
//! membership and filter queries against a sorted, deduplicated snapshot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use terminal_core::{normalize_symbol, InstrumentApi, SymbolInfo, TerminalResult};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Quiet period before a filter query is evaluated
pub const DEFAULT_FILTER_QUIET: Duration = Duration::from_millis(300);

pub struct SymbolCatalog {
    api: Arc<dyn InstrumentApi>,
    symbols: RwLock<Arc<Vec<SymbolInfo>>>,
}

impl SymbolCatalog {
    pub fn new(api: Arc<dyn InstrumentApi>) -> Self {
        Self {
            api,
            symbols: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Fetch the instrument list and replace the snapshot
    ///
    /// On failure the previous snapshot is kept.
    pub async fn load(&self) -> TerminalResult<usize> {
        let mut instruments = self.api.list_instruments().await?.into_result()?;

        let listed = instruments.len();
        instruments.retain(SymbolInfo::is_trading);
        if instruments.len() < listed {
            debug!(
                "[SymbolCatalog] Skipped {} non-trading instruments",
                listed - instruments.len()
            );
        }

        instruments.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        instruments.dedup_by(|a, b| a.symbol == b.symbol);

        let count = instruments.len();
        *self.symbols.write() = Arc::new(instruments);
        info!("[SymbolCatalog] Loaded {} symbols", count);
        Ok(count)
    }

    /// Current snapshot
    pub fn symbols(&self) -> Arc<Vec<SymbolInfo>> {
        self.symbols.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.symbols().iter().map(|s| s.symbol.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        self.symbols
            .read()
            .binary_search_by(|s| s.symbol.as_str().cmp(symbol.as_str()))
            .is_ok()
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolInfo> {
        let symbol = normalize_symbol(symbol);
        let symbols = self.symbols.read();
        symbols
            .binary_search_by(|s| s.symbol.as_str().cmp(symbol.as_str()))
            .ok()
            .map(|i| symbols[i].clone())
    }

    /// Symbols containing `query`, case-insensitive, in catalog order
    pub fn filter(&self, query: &str) -> Vec<String> {
        filter_symbols(&self.symbols(), query)
    }

    /// Debounced filtering
    ///
    /// Queries sent on the returned sender are evaluated only once no new
    /// query has arrived for `quiet`; results land in the watch receiver,
    /// which starts out holding the full list.
    pub fn spawn_debounced_filter(
        self: &Arc<Self>,
        quiet: Duration,
    ) -> (mpsc::UnboundedSender<String>, watch::Receiver<Vec<String>>) {
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<String>();
        let (result_tx, result_rx) = watch::channel(self.names());
        let catalog = Arc::clone(self);

        tokio::spawn(async move {
            let mut pending: Option<String> = None;
            loop {
                match pending.take() {
                    None => match input_rx.recv().await {
                        Some(query) => pending = Some(query),
                        None => break,
                    },
                    Some(query) => {
                        tokio::select! {
                            next = input_rx.recv() => match next {
                                Some(next) => pending = Some(next),
                                None => {
                                    let _ = result_tx.send(catalog.filter(&query));
                                    break;
                                }
                            },
                            _ = tokio::time::sleep(quiet) => {
                                debug!("[SymbolCatalog] Filtering on {:?}", query);
                                if result_tx.send(catalog.filter(&query)).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        (input_tx, result_rx)
    }
}

/// Case-insensitive substring filter preserving input order
pub fn filter_symbols(symbols: &[SymbolInfo], query: &str) -> Vec<String> {
    let needle = normalize_symbol(query);
    symbols
        .iter()
        .filter(|s| s.symbol.to_uppercase().contains(&needle))
        .map(|s| s.symbol.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use terminal_core::mock::MockExchange;
    use terminal_core::TerminalError;
    use tokio::time::Instant;

    fn exchange() -> Arc<MockExchange> {
        let exchange = Arc::new(MockExchange::new());
        exchange.set_instruments(
            ["SOLUSDT", "BTCUSDT", "ETHUSDT", "BTCUSDT", "ETHBTC"]
                .into_iter()
                .map(SymbolInfo::new)
                .collect(),
        );
        exchange
    }

    #[tokio::test]
    async fn test_load_sorts_and_dedups() {
        let catalog = SymbolCatalog::new(exchange());
        assert_eq!(catalog.load().await.unwrap(), 4);
        assert_eq!(catalog.names(), vec!["BTCUSDT", "ETHBTC", "ETHUSDT", "SOLUSDT"]);
        assert!(catalog.contains("ethusdt"));
        assert!(!catalog.contains("DOGEUSDT"));
        assert_eq!(catalog.get("SOLUSDT").unwrap().symbol, "SOLUSDT");
    }

    #[tokio::test]
    async fn test_load_skips_non_trading_instruments() {
        let exchange = exchange();
        let mut delisted = SymbolInfo::new("LUNAUSDT");
        delisted.status = Some("Closed".to_string());
        let mut trading = SymbolInfo::new("ADAUSDT");
        trading.status = Some("Trading".to_string());
        exchange.set_instruments(vec![SymbolInfo::new("BTCUSDT"), delisted, trading]);

        let catalog = SymbolCatalog::new(exchange);
        assert_eq!(catalog.load().await.unwrap(), 2);
        assert_eq!(catalog.names(), vec!["ADAUSDT", "BTCUSDT"]);
        assert!(!catalog.contains("LUNAUSDT"));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_list() {
        let exchange = exchange();
        let catalog = SymbolCatalog::new(exchange.clone());
        catalog.load().await.unwrap();

        exchange.fail_instruments(TerminalError::network("connection reset"));
        assert!(catalog.load().await.is_err());
        assert_eq!(catalog.len(), 4);
    }

    #[tokio::test]
    async fn test_filter_is_case_insensitive_substring() {
        let catalog = SymbolCatalog::new(exchange());
        catalog.load().await.unwrap();

        assert_eq!(catalog.filter("btc"), vec!["BTCUSDT", "ETHBTC"]);
        assert_eq!(catalog.filter(""), catalog.names());
        assert!(catalog.filter("xyz").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_filter_waits_for_quiet_period() {
        let catalog = Arc::new(SymbolCatalog::new(exchange()));
        catalog.load().await.unwrap();

        let (input, mut results) = catalog.spawn_debounced_filter(DEFAULT_FILTER_QUIET);
        assert_eq!(results.borrow().len(), 4);

        let start = Instant::now();
        input.send("b".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        input.send("sol".to_string()).unwrap();

        results.changed().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(*results.borrow(), vec!["SOLUSDT".to_string()]);
    }
}
