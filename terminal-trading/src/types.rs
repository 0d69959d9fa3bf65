//! Shared types for order execution

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use terminal_core::{OrderId, TerminalError};

// ============================================================================
// Take-profit batches
// ============================================================================

/// Why one leg of a batch was not placed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFailure {
    /// Remote status code; `None` when no response arrived
    pub code: Option<i64>,
    pub message: String,
}

/// Result of one take-profit leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegOutcome {
    /// Position of the leg in the submitted target list, from zero
    pub index: usize,
    pub price: Decimal,
    pub qty: Decimal,
    pub result: std::result::Result<OrderId, LegFailure>,
}

impl LegOutcome {
    pub fn is_placed(&self) -> bool {
        self.result.is_ok()
    }

    pub fn order_id(&self) -> Option<&OrderId> {
        self.result.as_ref().ok()
    }
}

/// Itemized result of a multi-target take-profit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitReport {
    pub symbol: String,
    pub legs: Vec<LegOutcome>,
}

impl TakeProfitReport {
    pub fn placed(&self) -> Vec<&LegOutcome> {
        self.legs.iter().filter(|l| l.is_placed()).collect()
    }

    pub fn failed(&self) -> Vec<&LegOutcome> {
        self.legs.iter().filter(|l| !l.is_placed()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.legs.iter().all(LegOutcome::is_placed)
    }
}

// ============================================================================
// Notices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Error,
}

/// User-facing message about the outcome of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradingError {
    /// Rejected before any remote call
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Non-zero response code; the message is the exchange's, verbatim
    #[error("Rejected ({code}): {message}")]
    Api { code: i64, message: String },

    /// No usable response (network, timeout, bad body)
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Take-profit batch incomplete: {} of {} legs failed",
        .0.failed().len(),
        .0.legs.len()
    )]
    PartialBatch(TakeProfitReport),
}

impl TradingError {
    /// Remote status code, when the exchange rejected the request
    pub fn code(&self) -> Option<i64> {
        match self {
            TradingError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<TerminalError> for TradingError {
    fn from(err: TerminalError) -> Self {
        match err {
            TerminalError::Api { code, message } => TradingError::Api { code, message },
            TerminalError::Validation(msg) => TradingError::Validation(msg),
            TerminalError::NotFound(msg) => TradingError::NotFound(msg),
            other => TradingError::Request(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TradingError>;
