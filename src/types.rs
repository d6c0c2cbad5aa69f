// src/types.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, DenyReason};

/// Direction of an exposure. The broadcaster and the broker both speak
/// "LONG"/"SHORT", so the wire names are part of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded instruction from the feed, stamped at arrival.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub received_at: DateTime<Utc>,
    pub command: Command,
}

impl Signal {
    pub fn signal_id(&self) -> &str {
        self.command.signal_id()
    }

    pub fn symbol(&self) -> &str {
        self.command.symbol()
    }

    pub fn kind(&self) -> &'static str {
        self.command.kind()
    }
}

/// Closed set of instructions the feed can send. New message kinds from the
/// broadcaster must be added here explicitly; the decoder drops anything it
/// does not recognize.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    NewPosition {
        signal_id: String,
        symbol: String,
        side: Side,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        leverage: u32,
    },
    ClosePosition {
        signal_id: String,
        symbol: String,
        close_percent: Decimal,
    },
    EditStopTakeProfit {
        signal_id: String,
        symbol: String,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    },
    UpdateLeverage {
        signal_id: String,
        symbol: String,
        leverage: u32,
    },
}

impl Command {
    pub fn signal_id(&self) -> &str {
        match self {
            Command::NewPosition { signal_id, .. }
            | Command::ClosePosition { signal_id, .. }
            | Command::EditStopTakeProfit { signal_id, .. }
            | Command::UpdateLeverage { signal_id, .. } => signal_id,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Command::NewPosition { symbol, .. }
            | Command::ClosePosition { symbol, .. }
            | Command::EditStopTakeProfit { symbol, .. }
            | Command::UpdateLeverage { symbol, .. } => symbol,
        }
    }

    /// Wire name of the message kind, for log correlation with the broadcaster.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::NewPosition { .. } => "NEW_SIGNAL",
            Command::ClosePosition { .. } => "CLOSE_SIGNAL",
            Command::EditStopTakeProfit { .. } => "EDIT_SLTP",
            Command::UpdateLeverage { .. } => "UPDATE_LEVERAGE",
        }
    }
}

/// An open exposure tracked by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub size: Decimal,
    pub leverage: u32,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl_so_far: Decimal,
}

/// Fill confirmation for a market order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub avg_price: Decimal,
}

/// Confirmation of a (full or partial) close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseResult {
    pub realized_pnl: Decimal,
}

/// Daily risk counters as seen by the risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskSnapshot {
    pub trades_today: u32,
    pub daily_realized_pnl: Decimal,
    pub open_position_count: u32,
}

/// Read-only view of ledger + risk state for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub positions: Vec<Position>,
    pub risk: RiskSnapshot,
}

/// Terminal result of processing one signal. Every variant ends up as a
/// structured log event; none is silently swallowed.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Executed { detail: String },
    Denied(DenyReason),
    Conflict { detail: String },
    Failed(BrokerError),
    TimeoutUnknown,
}

impl ExecutionOutcome {
    pub fn decision(&self) -> &'static str {
        match self {
            ExecutionOutcome::Executed { .. } => "executed",
            ExecutionOutcome::Denied(_) => "denied",
            ExecutionOutcome::Conflict { .. } => "conflict",
            ExecutionOutcome::Failed(_) => "failed",
            ExecutionOutcome::TimeoutUnknown => "timeout_unknown",
        }
    }
}
