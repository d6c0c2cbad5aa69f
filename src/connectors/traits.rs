use crate::error::BrokerError;
use crate::types::{CloseResult, OrderResult, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Seam to the exchange. The engine only ever talks to this trait; the REST
/// adapter and the test doubles both live behind it.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Available futures balance in USDT.
    async fn get_balance(&self) -> Result<Decimal, BrokerError>;

    /// Current mark price for a symbol.
    async fn get_mark_price(&self, symbol: &str) -> Result<Decimal, BrokerError>;

    /// Place a market order for `notional` USDT (pre-leverage) at the given
    /// leverage. The broker handles quantity steps and fills.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        notional: Decimal,
        leverage: u32,
    ) -> Result<OrderResult, BrokerError>;

    /// Close `percent` (0..=100) of the open position on `symbol`.
    async fn close_position(&self, symbol: &str, percent: Decimal)
        -> Result<CloseResult, BrokerError>;

    /// Replace the stop-loss / take-profit orders on an open position.
    async fn update_stop_take_profit(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<(), BrokerError>;

    /// Change the leverage on an open position.
    async fn update_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BrokerError>;
}
