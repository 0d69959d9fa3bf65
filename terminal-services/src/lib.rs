//! Synchronization services for the trading terminal
//!
//! Keeps one consistent view of price, positions, orders and balance for
//! the active symbol. The ticker stream and the polling task both write
//! into the [`StateStore`]; the [`UpdateDispatcher`] coalesces the
//! resulting notifications and delivers them on a fixed cadence.

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod polling;
pub mod settings;
pub mod state_store;
pub mod stream_bridge;
pub mod symbol_catalog;

pub use config::EngineConfig;
pub use dispatcher::{FlushReport, HandlerId, Topic, Update, UpdateDispatcher, DEFAULT_FLUSH_INTERVAL};
pub use engine::TerminalEngine;
pub use polling::{
    CycleReport, FetchOutcome, PollingConfig, PollingSync, RefreshScope, SyncCommand, SyncHandle,
};
pub use settings::{
    resolve_initial_symbol, InMemorySettings, JsonFileSettings, SymbolSettings, DEFAULT_SYMBOL,
};
pub use state_store::{ApplyOutcome, StateStore, StoreConfig, SyncContext};
pub use stream_bridge::{handle_ticker, spawn_stream_bridge};
pub use symbol_catalog::{filter_symbols, SymbolCatalog, DEFAULT_FILTER_QUIET};
