//! Update dispatcher
//!
//! Decouples producers (stream bridge, polling) from consumers. Producers
//! publish from any task; a single flush drains everything published since
//! the previous flush, keeps the last value per topic and hands it to the
//! topic's handlers only if it differs from what was last delivered.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use terminal_core::{Order, Position, PriceQuote};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default flush cadence
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(2000);

/// Notification topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Price,
    Positions,
    Orders,
    Balance,
}

impl Topic {
    /// Delivery order within one flush
    pub const ALL: [Topic; 4] = [Topic::Price, Topic::Positions, Topic::Orders, Topic::Balance];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Price => "price",
            Topic::Positions => "positions",
            Topic::Orders => "orders",
            Topic::Balance => "balance",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value published on a topic
///
/// Price carries no timestamp: two ticks with the same price are the same
/// update as far as consumers are concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Price { symbol: String, price: Decimal },
    Positions(Vec<Position>),
    Orders(Vec<Order>),
    Balance(Decimal),
}

impl Update {
    pub fn topic(&self) -> Topic {
        match self {
            Update::Price { .. } => Topic::Price,
            Update::Positions(_) => Topic::Positions,
            Update::Orders(_) => Topic::Orders,
            Update::Balance(_) => Topic::Balance,
        }
    }

    pub fn price(quote: &PriceQuote) -> Self {
        Update::Price {
            symbol: quote.symbol.clone(),
            price: quote.price,
        }
    }
}

/// Handler registration id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&Update) -> anyhow::Result<()> + Send + Sync>;

/// What one flush did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Topics whose handlers were invoked, in delivery order
    pub delivered: Vec<Topic>,
    /// Publishes replaced by a later publish of the same topic
    pub coalesced: usize,
    /// Topics skipped because the value equals the last delivered one
    pub suppressed: usize,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.delivered.is_empty() && self.suppressed == 0
    }
}

/// Batching, deduplicating notification hub
pub struct UpdateDispatcher {
    handlers: DashMap<Topic, Vec<(HandlerId, Handler)>>,
    next_handler_id: AtomicU64,
    pending_tx: mpsc::UnboundedSender<Update>,
    pending_rx: Mutex<mpsc::UnboundedReceiver<Update>>,
    last_delivered: Mutex<HashMap<Topic, Update>>,
}

impl UpdateDispatcher {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            handlers: DashMap::new(),
            next_handler_id: AtomicU64::new(1),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            last_delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler for `topic`
    pub fn register<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&Update) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!("[Dispatcher] Registered handler {:?} on {}", id, topic);
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut removed = false;
        for mut entry in self.handlers.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|(handler_id, _)| *handler_id != id);
            removed |= entry.value().len() != before;
        }
        removed
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.handlers.get(&topic).map(|h| h.len()).unwrap_or(0)
    }

    /// Buffer an update for the next flush
    pub fn publish(&self, update: Update) {
        // The receiver lives as long as self
        let _ = self.pending_tx.send(update);
    }

    /// Deliver everything published since the last flush
    pub fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();

        let mut latest: HashMap<Topic, Update> = HashMap::new();
        {
            let mut pending = self.pending_rx.lock();
            while let Ok(update) = pending.try_recv() {
                if latest.insert(update.topic(), update).is_some() {
                    report.coalesced += 1;
                }
            }
        }

        for topic in Topic::ALL {
            let Some(update) = latest.remove(&topic) else {
                continue;
            };

            {
                let mut last = self.last_delivered.lock();
                if last.get(&topic) == Some(&update) {
                    report.suppressed += 1;
                    continue;
                }
                // Recorded before delivery: a failing handler does not cause a retry
                last.insert(topic, update.clone());
            }

            let handlers: Vec<Handler> = self
                .handlers
                .get(&topic)
                .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();

            for handler in handlers {
                match catch_unwind(AssertUnwindSafe(|| handler(&update))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("[Dispatcher] {} handler failed: {:#}", topic, e);
                        report.handler_failures += 1;
                    }
                    Err(_) => {
                        error!("[Dispatcher] {} handler panicked", topic);
                        report.handler_failures += 1;
                    }
                }
            }

            report.delivered.push(topic);
        }

        report
    }

    /// Drop buffered updates on `topics`; returns how many were dropped
    ///
    /// Updates on other topics stay queued in publish order.
    pub fn discard_pending(&self, topics: &[Topic]) -> usize {
        let mut pending = self.pending_rx.lock();
        let mut kept = Vec::new();
        let mut dropped = 0;
        while let Ok(update) = pending.try_recv() {
            if topics.contains(&update.topic()) {
                dropped += 1;
            } else {
                kept.push(update);
            }
        }
        // Re-queued under the receiver lock, so no flush sees a partial queue
        for update in kept {
            let _ = self.pending_tx.send(update);
        }

        if dropped > 0 {
            debug!("[Dispatcher] Discarded {} pending updates", dropped);
        }
        dropped
    }

    /// Value last handed to the handlers of `topic`
    pub fn last_delivered(&self, topic: Topic) -> Option<Update> {
        self.last_delivered.lock().get(&topic).cloned()
    }

    /// Forget the last delivered value so the next publish is delivered
    pub fn reset_topic(&self, topic: Topic) {
        self.last_delivered.lock().remove(&topic);
    }

    /// Run `flush` every `interval` until `shutdown` flips to true
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            info!("[Dispatcher] Flushing every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = dispatcher.flush();
                        if !report.is_empty() {
                            debug!("[Dispatcher] Flush: {:?}", report);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            // Deliver whatever was published before shutdown
            dispatcher.flush();
            info!("[Dispatcher] Flush loop stopped");
        })
    }
}

impl Default for UpdateDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
