// src/core/ledger.rs
//
// Authoritative in-memory record of open positions and today's counters.
// Single writer: only the execution engine mutates it; everyone else gets
// cloned snapshots.
use crate::types::{Position, RiskSnapshot};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::info;

pub struct PositionLedger {
    positions: BTreeMap<String, Position>,
    trades_today: u32,
    daily_realized_pnl: Decimal,
    window_start: NaiveDate,
}

impl PositionLedger {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            positions: BTreeMap::new(),
            trades_today: 0,
            daily_realized_pnl: Decimal::ZERO,
            window_start: today,
        }
    }

    pub fn upsert(&mut self, position: Position) {
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Ordered view (by symbol) for risk checks and status reporting.
    pub fn snapshot(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn open_position_count(&self) -> u32 {
        self.positions.len() as u32
    }

    pub fn record_trade(&mut self) {
        self.trades_today = self.trades_today.saturating_add(1);
    }

    pub fn record_realized_pnl(&mut self, amount: Decimal) {
        self.daily_realized_pnl += amount;
    }

    pub fn risk_snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            trades_today: self.trades_today,
            daily_realized_pnl: self.daily_realized_pnl,
            open_position_count: self.open_position_count(),
        }
    }

    /// Reset the daily counters once the UTC date rolls over. Open positions
    /// carry across days; only the counters are windowed.
    pub fn roll_daily_window(&mut self, today: NaiveDate) -> bool {
        if today == self.window_start {
            return false;
        }
        self.trades_today = 0;
        self.daily_realized_pnl = Decimal::ZERO;
        self.window_start = today;
        info!(window_start = %today, "daily counters reset");
        true
    }
}
