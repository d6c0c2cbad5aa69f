// src/core/risk.rs
//
// The single gatekeeper for execution-causing signals. Pure: the caller
// fetches the balance and hands over snapshots, so every decision here is
// deterministic and the checks run synchronously in one signal turn.
use crate::config::TradingParams;
use crate::error::DenyReason;
use crate::types::{Command, RiskSnapshot};
use rust_decimal::Decimal;

/// Requested leverage is never rejected for being high - it is capped at the
/// configured maximum. Returns the effective value and whether it was capped
/// (callers record the cap in the execution log).
pub fn clamp_leverage(requested: u32, max_leverage: u32) -> (u32, bool) {
    if requested > max_leverage {
        (max_leverage, true)
    } else {
        (requested, false)
    }
}

/// Ordered checks, first failure wins:
/// 1. auto-execute master switch
/// 2. balance floor
/// 3. (NewPosition) open-position cap, minimum order notional
/// 4. (NewPosition, ClosePosition) daily trade budget
/// 5. (NewPosition) daily loss breaker - closes and edits stay allowed so
///    existing risk can still be reduced after the breaker trips
pub fn authorize(
    command: &Command,
    risk: &RiskSnapshot,
    params: &TradingParams,
    available_balance: Decimal,
) -> Result<(), DenyReason> {
    if !params.auto_execute {
        return Err(DenyReason::ExecutionDisabled);
    }

    if available_balance < params.min_balance {
        return Err(DenyReason::InsufficientBalance {
            available: available_balance,
            minimum: params.min_balance,
        });
    }

    if let Command::NewPosition { leverage, .. } = command {
        if risk.open_position_count >= params.max_open_positions {
            return Err(DenyReason::TooManyPositions {
                limit: params.max_open_positions,
            });
        }

        let (effective_leverage, _) = clamp_leverage(*leverage, params.max_leverage);
        let notional = params.trade_amount_usdt * Decimal::from(effective_leverage);
        if notional < params.min_order_value {
            return Err(DenyReason::BelowMinimumOrder {
                notional,
                minimum: params.min_order_value,
            });
        }
    }

    if matches!(
        command,
        Command::NewPosition { .. } | Command::ClosePosition { .. }
    ) && risk.trades_today >= params.max_daily_trades
    {
        return Err(DenyReason::DailyTradeLimitReached {
            limit: params.max_daily_trades,
        });
    }

    if matches!(command, Command::NewPosition { .. })
        && params.stop_on_daily_loss > Decimal::ZERO
        && risk.daily_realized_pnl <= -params.stop_on_daily_loss
    {
        return Err(DenyReason::DailyLossLimitReached {
            pnl: risk.daily_realized_pnl,
            limit: params.stop_on_daily_loss,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> TradingParams {
        TradingParams {
            trade_amount_usdt: dec!(5),
            max_leverage: 25,
            min_order_value: dec!(5),
            auto_execute: true,
            max_daily_trades: 10,
            max_open_positions: 3,
            stop_on_daily_loss: dec!(100),
            min_balance: dec!(20),
        }
    }

    fn snapshot() -> RiskSnapshot {
        RiskSnapshot {
            trades_today: 0,
            daily_realized_pnl: Decimal::ZERO,
            open_position_count: 0,
        }
    }

    fn new_position(leverage: u32) -> Command {
        Command::NewPosition {
            signal_id: "sig-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: crate::types::Side::Long,
            stop_loss: None,
            take_profit: None,
            leverage,
        }
    }

    fn close_position() -> Command {
        Command::ClosePosition {
            signal_id: "sig-2".to_string(),
            symbol: "BTCUSDT".to_string(),
            close_percent: dec!(100),
        }
    }

    fn edit_sltp() -> Command {
        Command::EditStopTakeProfit {
            signal_id: "sig-3".to_string(),
            symbol: "BTCUSDT".to_string(),
            stop_loss: Some(dec!(44000)),
            take_profit: None,
        }
    }

    #[test]
    fn allows_new_position_within_limits() {
        assert_eq!(
            authorize(&new_position(10), &snapshot(), &params(), dec!(1000)),
            Ok(())
        );
    }

    #[test]
    fn disabled_execution_blocks_every_kind() {
        let params = TradingParams {
            auto_execute: false,
            ..params()
        };
        for command in [new_position(10), close_position(), edit_sltp()] {
            assert_eq!(
                authorize(&command, &snapshot(), &params, dec!(1000)),
                Err(DenyReason::ExecutionDisabled)
            );
        }
    }

    #[test]
    fn first_failing_check_wins() {
        // Disabled execution and a drained balance together: the master
        // switch is checked first.
        let params = TradingParams {
            auto_execute: false,
            ..params()
        };
        assert_eq!(
            authorize(&new_position(10), &snapshot(), &params, Decimal::ZERO),
            Err(DenyReason::ExecutionDisabled)
        );
    }

    #[test]
    fn low_balance_blocks_any_kind() {
        for command in [new_position(10), close_position(), edit_sltp()] {
            assert_eq!(
                authorize(&command, &snapshot(), &params(), dec!(19.99)),
                Err(DenyReason::InsufficientBalance {
                    available: dec!(19.99),
                    minimum: dec!(20),
                })
            );
        }
    }

    #[test]
    fn position_cap_applies_to_new_positions_only() {
        let risk = RiskSnapshot {
            open_position_count: 3,
            ..snapshot()
        };
        assert_eq!(
            authorize(&new_position(10), &risk, &params(), dec!(1000)),
            Err(DenyReason::TooManyPositions { limit: 3 })
        );
        // A close against a full book must still go through.
        assert_eq!(authorize(&close_position(), &risk, &params(), dec!(1000)), Ok(()));
    }

    #[test]
    fn position_cap_is_independent_of_arrival_order() {
        // Any new-position signal against a full book is denied, whatever
        // came before it.
        let risk = RiskSnapshot {
            open_position_count: 3,
            trades_today: 7,
            ..snapshot()
        };
        for leverage in [1, 10, 40] {
            assert_eq!(
                authorize(&new_position(leverage), &risk, &params(), dec!(1000)),
                Err(DenyReason::TooManyPositions { limit: 3 })
            );
        }
    }

    #[test]
    fn notional_below_minimum_is_denied() {
        let params = TradingParams {
            min_order_value: dec!(10),
            ..params()
        };
        // 5 USDT x 1 = 5 < 10
        assert_eq!(
            authorize(&new_position(1), &snapshot(), &params, dec!(1000)),
            Err(DenyReason::BelowMinimumOrder {
                notional: dec!(5),
                minimum: dec!(10),
            })
        );
        // 5 USDT x 2 = 10, exactly at the minimum
        assert_eq!(authorize(&new_position(2), &snapshot(), &params, dec!(1000)), Ok(()));
    }

    #[test]
    fn notional_uses_clamped_leverage() {
        // Requested 40x, cap 25x: notional checked at 5 x 25 = 125.
        let params = TradingParams {
            min_order_value: dec!(150),
            ..params()
        };
        assert_eq!(
            authorize(&new_position(40), &snapshot(), &params, dec!(1000)),
            Err(DenyReason::BelowMinimumOrder {
                notional: dec!(125),
                minimum: dec!(150),
            })
        );
    }

    #[test]
    fn daily_trade_limit_blocks_opens_and_closes_but_not_edits() {
        let risk = RiskSnapshot {
            trades_today: 10,
            ..snapshot()
        };
        assert_eq!(
            authorize(&new_position(10), &risk, &params(), dec!(1000)),
            Err(DenyReason::DailyTradeLimitReached { limit: 10 })
        );
        assert_eq!(
            authorize(&close_position(), &risk, &params(), dec!(1000)),
            Err(DenyReason::DailyTradeLimitReached { limit: 10 })
        );
        assert_eq!(authorize(&edit_sltp(), &risk, &params(), dec!(1000)), Ok(()));
    }

    #[test]
    fn loss_breaker_blocks_new_exposure_but_allows_closes() {
        let risk = RiskSnapshot {
            daily_realized_pnl: dec!(-150),
            ..snapshot()
        };
        assert_eq!(
            authorize(&new_position(10), &risk, &params(), dec!(1000)),
            Err(DenyReason::DailyLossLimitReached {
                pnl: dec!(-150),
                limit: dec!(100),
            })
        );
        assert_eq!(authorize(&close_position(), &risk, &params(), dec!(1000)), Ok(()));
        assert_eq!(authorize(&edit_sltp(), &risk, &params(), dec!(1000)), Ok(()));
    }

    #[test]
    fn loss_breaker_disabled_at_zero() {
        let params = TradingParams {
            stop_on_daily_loss: Decimal::ZERO,
            ..params()
        };
        let risk = RiskSnapshot {
            daily_realized_pnl: dec!(-10000),
            ..snapshot()
        };
        assert_eq!(authorize(&new_position(10), &risk, &params, dec!(1000)), Ok(()));
    }

    #[test]
    fn clamp_caps_and_reports() {
        assert_eq!(clamp_leverage(40, 25), (25, true));
        assert_eq!(clamp_leverage(25, 25), (25, false));
        assert_eq!(clamp_leverage(10, 25), (10, false));
    }
}
