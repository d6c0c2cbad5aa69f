// src/error.rs
use rust_decimal::Decimal;
use thiserror::Error;

/// Connection-level failures. Only `Auth` is fatal; everything else is
/// recovered by the reconnect loop.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("broadcaster rejected authentication: {0}")]
    Auth(String),

    #[error("websocket error: {0}")]
    Network(String),

    #[error("connection closed by server")]
    Closed,

    #[error("connection stale: no traffic for {0:?}")]
    Stale(std::time::Duration),
}

impl FeedError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::Auth(_))
    }
}

/// Why an inbound message was dropped before reaching the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(String),
}

/// Reasons the risk gate refuses an execution-causing signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenyReason {
    #[error("auto-execute is disabled")]
    ExecutionDisabled,

    #[error("available balance {available} below minimum {minimum} USDT")]
    InsufficientBalance {
        available: Decimal,
        minimum: Decimal,
    },

    #[error("open position limit reached ({limit})")]
    TooManyPositions { limit: u32 },

    #[error("order notional {notional} below minimum {minimum} USDT")]
    BelowMinimumOrder { notional: Decimal, minimum: Decimal },

    #[error("daily trade limit reached ({limit})")]
    DailyTradeLimitReached { limit: u32 },

    #[error("daily loss limit tripped: realized pnl {pnl}, limit {limit} USDT")]
    DailyLossLimitReached { pnl: Decimal, limit: Decimal },
}

/// A broker call failed with a definite answer. Indeterminate outcomes
/// (timeouts) are represented separately so they are never mistaken for a
/// confirmed failure and resubmitted.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("broker rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected broker response: {0}")]
    BadResponse(String),
}
