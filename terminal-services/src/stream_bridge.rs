//! Stream bridge
//!
//! Feeds transport events into the store and the dispatcher: each tick is
//! applied to the [`StateStore`] and, when it concerns the active symbol,
//! published on the price topic in the same step.

use std::sync::Arc;

use terminal_bybit::StreamEvent;
use terminal_core::{ConnectionState, PriceQuote};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{Update, UpdateDispatcher};
use crate::state_store::{ApplyOutcome, StateStore};

/// Apply one tick; returns what the store did with it
pub fn handle_ticker(
    store: &StateStore,
    dispatcher: &UpdateDispatcher,
    quote: PriceQuote,
) -> ApplyOutcome {
    let update = Update::price(&quote);
    let is_active = store.active_symbol().as_deref() == Some(quote.symbol.as_str());

    let outcome = store.apply_price(quote);
    if is_active && outcome.is_accepted() {
        dispatcher.publish(update);
    }
    outcome
}

/// Forward transport events until the transport goes away
pub fn spawn_stream_bridge(
    mut events: broadcast::Receiver<StreamEvent>,
    store: Arc<StateStore>,
    dispatcher: Arc<UpdateDispatcher>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StreamEvent::Ticker(quote)) => {
                    handle_ticker(&store, &dispatcher, quote);
                }
                Ok(StreamEvent::ConnectionChanged { state, error }) => match (state, error) {
                    (ConnectionState::Connected, _) => info!("[StreamBridge] Stream connected"),
                    (state, Some(error)) => {
                        warn!("[StreamBridge] Stream {:?}: {}", state, error)
                    }
                    (state, None) => debug!("[StreamBridge] Stream {:?}", state),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("[StreamBridge] Lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("[StreamBridge] Stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Topic;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ticks_for_other_symbols_are_stored_not_published() {
        let store = StateStore::default();
        let dispatcher = UpdateDispatcher::new();
        store.set_active_symbol("ETHUSDT");

        let outcome = handle_ticker(
            &store,
            &dispatcher,
            PriceQuote::from_stream("BTCUSDT", dec!(65000)),
        );
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(store.price("BTCUSDT").is_some());
        assert!(dispatcher.flush().delivered.is_empty());
    }

    #[tokio::test]
    async fn test_bridge_publishes_last_of_burst() {
        let store = Arc::new(StateStore::default());
        let dispatcher = Arc::new(UpdateDispatcher::new());
        store.set_active_symbol("BTCUSDT");

        let (tx, rx) = broadcast::channel(64);
        let bridge = spawn_stream_bridge(rx, Arc::clone(&store), Arc::clone(&dispatcher));

        for i in 1..=10 {
            tx.send(StreamEvent::Ticker(PriceQuote::from_stream(
                "BTCUSDT",
                dec!(65000) + rust_decimal::Decimal::from(i),
            )))
            .unwrap();
        }
        drop(tx);
        bridge.await.unwrap();

        let report = dispatcher.flush();
        assert_eq!(report.delivered, vec![Topic::Price]);
        assert_eq!(
            dispatcher.last_delivered(Topic::Price),
            Some(Update::Price {
                symbol: "BTCUSDT".to_string(),
                price: dec!(65010),
            })
        );
        assert_eq!(store.active_price().unwrap().price, dec!(65010));
    }
}
