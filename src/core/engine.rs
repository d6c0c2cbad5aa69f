// src/core/engine.rs
use crate::config::TradingParams;
use crate::connectors::feed::FeedEvent;
use crate::connectors::traits::BrokerClient;
use crate::core::decoder::decode;
use crate::core::ledger::PositionLedger;
use crate::core::risk::{authorize, clamp_leverage};
use crate::error::{BrokerError, DecodeError, DenyReason};
use crate::types::{Command, EngineStatus, ExecutionOutcome, Position, Side, Signal};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Orchestrates the whole signal path: decode, risk gate, broker calls,
/// ledger updates, outcome logging. Owns the ledger exclusively and
/// processes signals strictly one at a time in arrival order.
pub struct ExecutionEngine {
    params: TradingParams,
    broker: Arc<dyn BrokerClient>,
    ledger: PositionLedger,
    events: mpsc::Receiver<FeedEvent>,
    shutdown: watch::Receiver<bool>,
    call_timeout: Duration,
}

/// A broker call either failed with a definite answer or timed out with an
/// indeterminate one. The two must never be conflated: a timed-out order may
/// have filled, so it is reported for manual reconciliation, not resubmitted.
enum CallFailure {
    Broker(BrokerError),
    TimedOut,
}

impl CallFailure {
    fn into_outcome(self) -> ExecutionOutcome {
        match self {
            CallFailure::Broker(e) => ExecutionOutcome::Failed(e),
            CallFailure::TimedOut => ExecutionOutcome::TimeoutUnknown,
        }
    }

    fn describe(&self) -> String {
        match self {
            CallFailure::Broker(e) => e.to_string(),
            CallFailure::TimedOut => "timed out".to_string(),
        }
    }
}

impl ExecutionEngine {
    pub fn new(
        params: TradingParams,
        broker: Arc<dyn BrokerClient>,
        ledger: PositionLedger,
        events: mpsc::Receiver<FeedEvent>,
        shutdown: watch::Receiver<bool>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            params,
            broker,
            ledger,
            events,
            shutdown,
            call_timeout,
        }
    }

    /// Read-only snapshot of ledger + risk counters for status reporting.
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            positions: self.ledger.snapshot(),
            risk: self.ledger.risk_snapshot(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("engine loop running");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        info!("engine shutting down");
                        break;
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => {
                            info!("feed channel closed, engine stopping");
                            break;
                        }
                    }
                }
            }
        }

        let status = self.status();
        info!(
            open_positions = status.positions.len(),
            trades_today = status.risk.trades_today,
            daily_realized_pnl = %status.risk.daily_realized_pnl,
            "engine stopped"
        );
        Ok(())
    }

    async fn on_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => {
                info!("feed connected, signal processing active");
            }
            FeedEvent::Reconnecting { attempt, delay } => {
                warn!(
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    "feed reconnecting"
                );
            }
            FeedEvent::Disconnected { reason } => {
                // Interrupted signals are already logged as failed; the
                // broadcaster is authoritative and may redeliver.
                warn!(reason = %reason, "feed disconnected, signals are not replayed locally");
            }
            FeedEvent::Message { raw, received_at } => {
                self.ledger.roll_daily_window(Utc::now().date_naive());

                match decode(&raw, received_at) {
                    Ok(signal) => {
                        let outcome = self.handle(&signal).await;
                        log_outcome(&signal, &outcome);
                    }
                    Err(DecodeError::UnknownKind(kind)) => {
                        warn!(kind = %kind, "unknown message kind, dropped");
                    }
                    Err(DecodeError::Malformed(detail)) => {
                        warn!(detail = %detail, "malformed message, dropped");
                    }
                }
            }
        }
    }

    async fn handle(&mut self, signal: &Signal) -> ExecutionOutcome {
        match &signal.command {
            Command::NewPosition {
                symbol,
                side,
                stop_loss,
                take_profit,
                leverage,
                ..
            } => {
                self.open_position(signal, symbol, *side, *stop_loss, *take_profit, *leverage)
                    .await
            }
            Command::ClosePosition {
                symbol,
                close_percent,
                ..
            } => self.close_position(signal, symbol, *close_percent).await,
            Command::EditStopTakeProfit {
                symbol,
                stop_loss,
                take_profit,
                ..
            } => {
                self.edit_stop_take_profit(signal, symbol, *stop_loss, *take_profit)
                    .await
            }
            Command::UpdateLeverage {
                symbol, leverage, ..
            } => self.update_leverage(signal, symbol, *leverage).await,
        }
    }

    /// Balance fetch + risk gate, shared by every signal kind. No execution
    /// path reaches the broker's order endpoints without passing through here.
    async fn gate(&self, command: &Command) -> Result<(), ExecutionOutcome> {
        // The master switch is checked before anything else; no broker round
        // trip just to learn execution is off.
        if !self.params.auto_execute {
            return Err(ExecutionOutcome::Denied(DenyReason::ExecutionDisabled));
        }

        let balance = match self.broker_call(self.broker.get_balance()).await {
            Ok(balance) => balance,
            Err(failure) => return Err(failure.into_outcome()),
        };

        authorize(
            command,
            &self.ledger.risk_snapshot(),
            &self.params,
            balance,
        )
        .map_err(ExecutionOutcome::Denied)
    }

    async fn open_position(
        &mut self,
        signal: &Signal,
        symbol: &str,
        side: Side,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        requested_leverage: u32,
    ) -> ExecutionOutcome {
        // An update for an already-open symbol is rejected, not merged.
        if self.ledger.get(symbol).is_some() {
            return ExecutionOutcome::Conflict {
                detail: format!("position already open for {symbol}"),
            };
        }

        if let Err(outcome) = self.gate(&signal.command).await {
            return outcome;
        }

        let (leverage, clamped) = clamp_leverage(requested_leverage, self.params.max_leverage);
        if clamped {
            info!(
                signal_id = signal.signal_id(),
                symbol,
                requested = requested_leverage,
                effective = leverage,
                "leverage clamped to configured maximum"
            );
        }

        let mark_price = match self.broker_call(self.broker.get_mark_price(symbol)).await {
            Ok(price) => price,
            Err(failure) => return failure.into_outcome(),
        };
        if mark_price <= Decimal::ZERO {
            return ExecutionOutcome::Failed(BrokerError::BadResponse(format!(
                "non-positive mark price {mark_price} for {symbol}"
            )));
        }

        let notional = self.params.trade_amount_usdt;
        let size = notional * Decimal::from(leverage) / mark_price;

        // A failed or timed-out market order creates no position and is never
        // resubmitted - a blind resend risks duplicate execution.
        let order = match self
            .broker_call(
                self.broker
                    .place_market_order(symbol, side, notional, leverage),
            )
            .await
        {
            Ok(order) => order,
            Err(failure) => return failure.into_outcome(),
        };

        let entry_price = if order.avg_price > Decimal::ZERO {
            order.avg_price
        } else {
            mark_price
        };

        // SL/TP rides along as a follow-up call; a failure there is a warning
        // on an otherwise-filled open, not a rollback.
        let (stop_loss, take_profit) = if stop_loss.is_some() || take_profit.is_some() {
            match self
                .broker_call(
                    self.broker
                        .update_stop_take_profit(symbol, stop_loss, take_profit),
                )
                .await
            {
                Ok(()) => (stop_loss, take_profit),
                Err(failure) => {
                    warn!(
                        signal_id = signal.signal_id(),
                        symbol,
                        error = %failure.describe(),
                        "position opened but stop/take-profit update failed"
                    );
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        self.ledger.upsert(Position {
            symbol: symbol.to_string(),
            side,
            entry_price,
            size,
            leverage,
            stop_loss,
            take_profit,
            opened_at: Utc::now(),
            realized_pnl_so_far: Decimal::ZERO,
        });
        self.ledger.record_trade();

        ExecutionOutcome::Executed {
            detail: format!(
                "{side} {size} {symbol} @ {entry_price} ({leverage}x, order {})",
                order.order_id
            ),
        }
    }

    async fn close_position(
        &mut self,
        signal: &Signal,
        symbol: &str,
        close_percent: Decimal,
    ) -> ExecutionOutcome {
        let Some(existing) = self.ledger.get(symbol).cloned() else {
            return ExecutionOutcome::Conflict {
                detail: format!("no open position for {symbol}"),
            };
        };

        if let Err(outcome) = self.gate(&signal.command).await {
            return outcome;
        }

        let result = match self
            .broker_call(self.broker.close_position(symbol, close_percent))
            .await
        {
            Ok(result) => result,
            Err(failure) => return failure.into_outcome(),
        };

        let realized = result.realized_pnl;
        if close_percent == Decimal::ONE_HUNDRED {
            self.ledger.remove(symbol);
        } else {
            let mut position = existing;
            position.size =
                position.size * (Decimal::ONE_HUNDRED - close_percent) / Decimal::ONE_HUNDRED;
            position.realized_pnl_so_far += realized;
            self.ledger.upsert(position);
        }
        self.ledger.record_trade();
        self.ledger.record_realized_pnl(realized);

        ExecutionOutcome::Executed {
            detail: format!("closed {close_percent}% of {symbol}, realized {realized}"),
        }
    }

    async fn edit_stop_take_profit(
        &mut self,
        signal: &Signal,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> ExecutionOutcome {
        let Some(existing) = self.ledger.get(symbol).cloned() else {
            return ExecutionOutcome::Conflict {
                detail: format!("no open position for {symbol}"),
            };
        };

        if let Err(outcome) = self.gate(&signal.command).await {
            return outcome;
        }

        match self
            .broker_call(
                self.broker
                    .update_stop_take_profit(symbol, stop_loss, take_profit),
            )
            .await
        {
            Ok(()) => {
                let mut position = existing;
                position.stop_loss = stop_loss;
                position.take_profit = take_profit;
                self.ledger.upsert(position);

                ExecutionOutcome::Executed {
                    detail: format!(
                        "updated {symbol} sl={} tp={}",
                        format_opt(stop_loss),
                        format_opt(take_profit)
                    ),
                }
            }
            Err(failure) => failure.into_outcome(),
        }
    }

    async fn update_leverage(
        &mut self,
        signal: &Signal,
        symbol: &str,
        requested_leverage: u32,
    ) -> ExecutionOutcome {
        let Some(existing) = self.ledger.get(symbol).cloned() else {
            return ExecutionOutcome::Conflict {
                detail: format!("no open position for {symbol}"),
            };
        };

        if let Err(outcome) = self.gate(&signal.command).await {
            return outcome;
        }

        let (leverage, clamped) = clamp_leverage(requested_leverage, self.params.max_leverage);
        if clamped {
            info!(
                signal_id = signal.signal_id(),
                symbol,
                requested = requested_leverage,
                effective = leverage,
                "leverage clamped to configured maximum"
            );
        }

        match self
            .broker_call(self.broker.update_leverage(symbol, leverage))
            .await
        {
            Ok(()) => {
                let mut position = existing;
                position.leverage = leverage;
                self.ledger.upsert(position);

                ExecutionOutcome::Executed {
                    detail: format!("leverage on {symbol} set to {leverage}x"),
                }
            }
            Err(failure) => failure.into_outcome(),
        }
    }

    /// Every broker call runs under the same bounded timeout.
    async fn broker_call<T>(
        &self,
        call: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, CallFailure> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallFailure::Broker(e)),
            Err(_) => Err(CallFailure::TimedOut),
        }
    }
}

fn format_opt(value: Option<Decimal>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// One structured event per processed signal; no path is silent.
fn log_outcome(signal: &Signal, outcome: &ExecutionOutcome) {
    let signal_id = signal.signal_id();
    let kind = signal.kind();
    let symbol = signal.symbol();
    let decision = outcome.decision();

    match outcome {
        ExecutionOutcome::Executed { detail } => {
            info!(signal_id, kind, symbol, decision, detail = %detail, "✅ signal executed");
        }
        ExecutionOutcome::Denied(reason) => {
            warn!(signal_id, kind, symbol, decision, detail = %reason, "signal denied by risk gate");
        }
        ExecutionOutcome::Conflict { detail } => {
            warn!(signal_id, kind, symbol, decision, detail = %detail, "signal conflicts with ledger state");
        }
        ExecutionOutcome::Failed(e) => {
            error!(signal_id, kind, symbol, decision, detail = %e, "broker call failed, not retried");
        }
        ExecutionOutcome::TimeoutUnknown => {
            error!(
                signal_id, kind, symbol, decision,
                detail = "order outcome indeterminate, reconcile manually",
                "broker call timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloseResult, OrderResult};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct MockBroker {
        balance: Decimal,
        mark_price: Decimal,
        realized_pnl: Decimal,
        fail_market_orders: bool,
        fail_sltp: bool,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl Default for MockBroker {
        fn default() -> Self {
            Self {
                balance: dec!(1000),
                mark_price: dec!(50000),
                realized_pnl: Decimal::ZERO,
                fail_market_orders: false,
                fail_sltp: false,
                delay: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl MockBroker {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        async fn maybe_delay(&self) {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        }

        fn rejected() -> BrokerError {
            BrokerError::Rejected {
                status: 400,
                message: "rejected".to_string(),
            }
        }
    }

    #[async_trait]
    impl BrokerClient for MockBroker {
        async fn get_balance(&self) -> Result<Decimal, BrokerError> {
            self.maybe_delay().await;
            Ok(self.balance)
        }

        async fn get_mark_price(&self, _symbol: &str) -> Result<Decimal, BrokerError> {
            self.maybe_delay().await;
            Ok(self.mark_price)
        }

        async fn place_market_order(
            &self,
            symbol: &str,
            side: Side,
            notional: Decimal,
            leverage: u32,
        ) -> Result<OrderResult, BrokerError> {
            self.maybe_delay().await;
            self.record(format!("order {side} {notional} {symbol} {leverage}x"));
            if self.fail_market_orders {
                return Err(Self::rejected());
            }
            Ok(OrderResult {
                order_id: "ord-1".to_string(),
                avg_price: self.mark_price,
            })
        }

        async fn close_position(
            &self,
            symbol: &str,
            percent: Decimal,
        ) -> Result<CloseResult, BrokerError> {
            self.maybe_delay().await;
            self.record(format!("close {percent}% {symbol}"));
            Ok(CloseResult {
                realized_pnl: self.realized_pnl,
            })
        }

        async fn update_stop_take_profit(
            &self,
            symbol: &str,
            stop_loss: Option<Decimal>,
            take_profit: Option<Decimal>,
        ) -> Result<(), BrokerError> {
            self.maybe_delay().await;
            self.record(format!("sltp {symbol} {stop_loss:?} {take_profit:?}"));
            if self.fail_sltp {
                return Err(Self::rejected());
            }
            Ok(())
        }

        async fn update_leverage(&self, symbol: &str, leverage: u32) -> Result<(), BrokerError> {
            self.maybe_delay().await;
            self.record(format!("leverage {symbol} {leverage}x"));
            Ok(())
        }
    }

    fn params() -> TradingParams {
        TradingParams {
            trade_amount_usdt: dec!(5),
            max_leverage: 25,
            min_order_value: dec!(5),
            auto_execute: true,
            max_daily_trades: 999_999,
            max_open_positions: 999_999,
            stop_on_daily_loss: Decimal::ZERO,
            min_balance: Decimal::ZERO,
        }
    }

    struct Harness {
        engine: ExecutionEngine,
        broker: Arc<MockBroker>,
        events: mpsc::Sender<FeedEvent>,
        shutdown: watch::Sender<bool>,
    }

    fn harness(broker: MockBroker, params: TradingParams) -> Harness {
        harness_with_timeout(broker, params, Duration::from_secs(5))
    }

    fn harness_with_timeout(
        broker: MockBroker,
        params: TradingParams,
        call_timeout: Duration,
    ) -> Harness {
        let broker = Arc::new(broker);
        let (events, events_rx) = mpsc::channel(32);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let engine = ExecutionEngine::new(
            params,
            broker.clone(),
            PositionLedger::new(Utc::now().date_naive()),
            events_rx,
            shutdown_rx,
            call_timeout,
        );
        Harness {
            engine,
            broker,
            events,
            shutdown,
        }
    }

    fn new_signal(symbol: &str, leverage: u32) -> Signal {
        Signal {
            received_at: Utc::now(),
            command: Command::NewPosition {
                signal_id: format!("open-{symbol}"),
                symbol: symbol.to_string(),
                side: Side::Long,
                stop_loss: None,
                take_profit: None,
                leverage,
            },
        }
    }

    fn new_signal_with_sltp(symbol: &str, stop_loss: Decimal, take_profit: Decimal) -> Signal {
        Signal {
            received_at: Utc::now(),
            command: Command::NewPosition {
                signal_id: format!("open-{symbol}"),
                symbol: symbol.to_string(),
                side: Side::Long,
                stop_loss: Some(stop_loss),
                take_profit: Some(take_profit),
                leverage: 10,
            },
        }
    }

    fn close_signal(symbol: &str, percent: Decimal) -> Signal {
        Signal {
            received_at: Utc::now(),
            command: Command::ClosePosition {
                signal_id: format!("close-{symbol}"),
                symbol: symbol.to_string(),
                close_percent: percent,
            },
        }
    }

    fn edit_signal(symbol: &str, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Signal {
        Signal {
            received_at: Utc::now(),
            command: Command::EditStopTakeProfit {
                signal_id: format!("edit-{symbol}"),
                symbol: symbol.to_string(),
                stop_loss,
                take_profit,
            },
        }
    }

    fn leverage_signal(symbol: &str, leverage: u32) -> Signal {
        Signal {
            received_at: Utc::now(),
            command: Command::UpdateLeverage {
                signal_id: format!("lev-{symbol}"),
                symbol: symbol.to_string(),
                leverage,
            },
        }
    }

    fn seeded_position(symbol: &str, size: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: dec!(50000),
            size,
            leverage: 10,
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
            realized_pnl_so_far: Decimal::ZERO,
        }
    }

    #[tokio::test]
    async fn open_edit_close_lifecycle() {
        let mut h = harness(MockBroker::default(), params());

        // Open: position created, one trade counted.
        let outcome = h.engine.handle(&new_signal("BTCUSDT", 10)).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        let opened = h.engine.ledger.get("BTCUSDT").unwrap().clone();
        assert_eq!(opened.leverage, 10);
        // 5 USDT x 10 / 50000
        assert_eq!(opened.size, dec!(0.001));

        // Edit: mutated in place, no new position, no trade counted.
        let outcome = h
            .engine
            .handle(&edit_signal("BTCUSDT", Some(dec!(44000)), None))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        assert_eq!(h.engine.ledger.open_position_count(), 1);
        let edited = h.engine.ledger.get("BTCUSDT").unwrap();
        assert_eq!(edited.stop_loss, Some(dec!(44000)));
        assert_eq!(edited.opened_at, opened.opened_at);

        // Full close: position gone.
        let outcome = h.engine.handle(&close_signal("BTCUSDT", dec!(100))).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        assert!(h.engine.ledger.get("BTCUSDT").is_none());

        // Open + close counted, edit not.
        assert_eq!(h.engine.ledger.risk_snapshot().trades_today, 2);
    }

    #[tokio::test]
    async fn duplicate_new_position_is_a_conflict() {
        let mut h = harness(MockBroker::default(), params());

        let outcome = h.engine.handle(&new_signal("BTCUSDT", 10)).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));

        let outcome = h.engine.handle(&new_signal("BTCUSDT", 5)).await;
        assert!(matches!(outcome, ExecutionOutcome::Conflict { .. }));

        // Never two positions for one symbol, and the conflict is not a trade.
        assert_eq!(h.engine.ledger.open_position_count(), 1);
        assert_eq!(h.engine.ledger.risk_snapshot().trades_today, 1);
    }

    #[tokio::test]
    async fn update_signals_require_an_open_position() {
        let mut h = harness(MockBroker::default(), params());

        for signal in [
            close_signal("BTCUSDT", dec!(100)),
            edit_signal("BTCUSDT", Some(dec!(44000)), None),
            leverage_signal("BTCUSDT", 5),
        ] {
            let outcome = h.engine.handle(&signal).await;
            assert!(
                matches!(outcome, ExecutionOutcome::Conflict { .. }),
                "expected conflict for {}",
                signal.kind()
            );
        }
    }

    #[tokio::test]
    async fn partial_close_halves_the_position() {
        let broker = MockBroker {
            realized_pnl: dec!(12.5),
            ..MockBroker::default()
        };
        let mut h = harness(broker, params());
        h.engine.ledger.upsert(seeded_position("BTCUSDT", dec!(10)));

        let outcome = h.engine.handle(&close_signal("BTCUSDT", dec!(50))).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));

        let position = h.engine.ledger.get("BTCUSDT").unwrap();
        assert_eq!(position.size, dec!(5));
        assert_eq!(position.realized_pnl_so_far, dec!(12.5));

        let risk = h.engine.ledger.risk_snapshot();
        assert_eq!(risk.trades_today, 1);
        assert_eq!(risk.daily_realized_pnl, dec!(12.5));
    }

    #[tokio::test]
    async fn requested_leverage_is_clamped_on_open() {
        let mut h = harness(MockBroker::default(), params());

        let outcome = h.engine.handle(&new_signal("BTCUSDT", 40)).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        assert_eq!(h.engine.ledger.get("BTCUSDT").unwrap().leverage, 25);

        // The order itself went out at the clamped leverage.
        let calls = h.broker.calls.lock().unwrap();
        assert!(calls.iter().any(|c| c.contains("25x")), "calls: {calls:?}");
    }

    #[tokio::test]
    async fn broker_rejection_leaves_ledger_untouched() {
        let broker = MockBroker {
            fail_market_orders: true,
            ..MockBroker::default()
        };
        let mut h = harness(broker, params());

        let outcome = h.engine.handle(&new_signal("BTCUSDT", 10)).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
        assert!(h.engine.ledger.get("BTCUSDT").is_none());
        assert_eq!(h.engine.ledger.risk_snapshot().trades_today, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_order_is_reported_as_indeterminate() {
        let broker = MockBroker {
            delay: Some(Duration::from_millis(200)),
            ..MockBroker::default()
        };
        let mut h = harness_with_timeout(broker, params(), Duration::from_millis(50));

        let outcome = h.engine.handle(&new_signal("BTCUSDT", 10)).await;
        assert!(matches!(outcome, ExecutionOutcome::TimeoutUnknown));
        // Nothing recorded: the fill is unknown, reconciliation is manual.
        assert!(h.engine.ledger.get("BTCUSDT").is_none());
        assert_eq!(h.engine.ledger.risk_snapshot().trades_today, 0);
    }

    #[tokio::test]
    async fn loss_breaker_blocks_opens_but_closes_still_work() {
        let params = TradingParams {
            stop_on_daily_loss: dec!(100),
            ..params()
        };
        let mut h = harness(MockBroker::default(), params);
        h.engine.ledger.upsert(seeded_position("ETHUSDT", dec!(10)));
        h.engine.ledger.record_realized_pnl(dec!(-150));

        let outcome = h.engine.handle(&new_signal("BTCUSDT", 10)).await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Denied(DenyReason::DailyLossLimitReached { .. })
        ));

        let outcome = h.engine.handle(&close_signal("ETHUSDT", dec!(100))).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        assert!(h.engine.ledger.get("ETHUSDT").is_none());
    }

    #[tokio::test]
    async fn sltp_follow_up_failure_does_not_roll_back_the_open() {
        let broker = MockBroker {
            fail_sltp: true,
            ..MockBroker::default()
        };
        let mut h = harness(broker, params());

        let outcome = h
            .engine
            .handle(&new_signal_with_sltp("BTCUSDT", dec!(42000), dec!(45000)))
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));

        // Position exists, but the unapplied stop/take-profit is not recorded.
        let position = h.engine.ledger.get("BTCUSDT").unwrap();
        assert!(position.stop_loss.is_none());
        assert!(position.take_profit.is_none());
    }

    #[tokio::test]
    async fn update_leverage_clamps_and_mutates_in_place() {
        let mut h = harness(MockBroker::default(), params());
        h.engine.ledger.upsert(seeded_position("BTCUSDT", dec!(10)));

        let outcome = h.engine.handle(&leverage_signal("BTCUSDT", 40)).await;
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        assert_eq!(h.engine.ledger.get("BTCUSDT").unwrap().leverage, 25);
        assert_eq!(h.engine.ledger.risk_snapshot().trades_today, 0);
    }

    #[tokio::test]
    async fn run_survives_reconnects_without_losing_ledger_state() {
        let mut h = harness(MockBroker::default(), params());

        let open = r#"{"type":"NEW_SIGNAL","signal":{"signal_id":"s1","symbol":"BTCUSDT","signal_type":"LONG","leverage":10}}"#;
        let close = r#"{"type":"CLOSE_SIGNAL","signal_id":"s2","symbol":"BTCUSDT","percentage":100}"#;

        let events = h.events.clone();
        let feeder = tokio::spawn(async move {
            let send = |raw: &str| FeedEvent::Message {
                raw: raw.to_string(),
                received_at: Utc::now(),
            };
            events.send(FeedEvent::Connected).await.unwrap();
            events.send(send(open)).await.unwrap();
            events
                .send(FeedEvent::Disconnected {
                    reason: "connection closed by server".to_string(),
                })
                .await
                .unwrap();
            events
                .send(FeedEvent::Reconnecting {
                    attempt: 1,
                    delay: Duration::from_secs(5),
                })
                .await
                .unwrap();
            events.send(FeedEvent::Connected).await.unwrap();
            events.send(send(close)).await.unwrap();
        });

        feeder.await.unwrap();
        drop(h.events);
        h.engine.run().await.unwrap();

        // The open before the disconnect and the close after it were each
        // processed exactly once.
        let status = h.engine.status();
        assert!(status.positions.is_empty());
        assert_eq!(status.risk.trades_today, 2);
    }

    #[tokio::test]
    async fn shutdown_request_stops_the_loop() {
        let mut h = harness(MockBroker::default(), params());
        h.shutdown.send(true).unwrap();
        h.engine.run().await.unwrap();
    }
}
