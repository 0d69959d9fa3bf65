//! Terminal Trading - order lifecycle coordination
//!
//! This crate provides:
//! - Typed trade commands (place, cancel, edit, close, TP/SL, multi-target TP)
//! - The order coordinator that runs them against the trading API
//! - Structured outcomes and user-facing notices

pub mod command;
pub mod coordinator;
pub mod types;

pub use command::{CommandOutcome, TakeProfitTarget, TradeCommand};
pub use coordinator::OrderCoordinator;
pub use types::*;
