// src/core/decoder.rs
//
// Turns raw broadcaster frames into typed signals. Decoding is pure: no
// logging, no state - callers decide what a dropped message means.
use crate::error::DecodeError;
use crate::types::{Command, Side, Signal};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Payloads as the broadcaster sends them. Field names mirror the wire
/// format; anything extra (entry_price, status, timestamps) is ignored.
#[derive(Debug, Deserialize)]
struct NewSignalEnvelope {
    signal: NewSignalPayload,
}

#[derive(Debug, Deserialize)]
struct NewSignalPayload {
    signal_id: String,
    symbol: String,
    signal_type: Side,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
    #[serde(default = "default_leverage")]
    leverage: u32,
}

#[derive(Debug, Deserialize)]
struct ClosePayload {
    signal_id: String,
    symbol: String,
    #[serde(default = "default_close_percent")]
    percentage: Decimal,
}

#[derive(Debug, Deserialize)]
struct EditSltpPayload {
    signal_id: String,
    symbol: String,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct LeveragePayload {
    signal_id: String,
    symbol: String,
    leverage: u32,
}

fn default_leverage() -> u32 {
    1
}

fn default_close_percent() -> Decimal {
    Decimal::ONE_HUNDRED
}

/// Decode one frame. Missing kind-required fields are `Malformed`; a `type`
/// this build does not know is `UnknownKind`, so new broadcaster message
/// kinds degrade to a logged drop instead of a crash.
pub fn decode(raw: &str, received_at: DateTime<Utc>) -> Result<Signal, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(format!("invalid json: {e}")))?;

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| DecodeError::Malformed("missing message type".to_string()))?
        .to_string();

    let command = match kind.as_str() {
        "NEW_SIGNAL" => {
            let envelope: NewSignalEnvelope = parse(value)?;
            let payload = envelope.signal;
            if payload.leverage == 0 {
                return Err(DecodeError::Malformed(
                    "leverage must be positive".to_string(),
                ));
            }
            Command::NewPosition {
                signal_id: payload.signal_id,
                symbol: payload.symbol,
                side: payload.signal_type,
                stop_loss: payload.stop_loss,
                take_profit: payload.take_profit,
                leverage: payload.leverage,
            }
        }
        "CLOSE_SIGNAL" => {
            let payload: ClosePayload = parse(value)?;
            if payload.percentage <= Decimal::ZERO || payload.percentage > Decimal::ONE_HUNDRED {
                return Err(DecodeError::Malformed(format!(
                    "close percentage {} outside (0, 100]",
                    payload.percentage
                )));
            }
            Command::ClosePosition {
                signal_id: payload.signal_id,
                symbol: payload.symbol,
                close_percent: payload.percentage,
            }
        }
        "EDIT_SLTP" => {
            let payload: EditSltpPayload = parse(value)?;
            Command::EditStopTakeProfit {
                signal_id: payload.signal_id,
                symbol: payload.symbol,
                stop_loss: payload.stop_loss,
                take_profit: payload.take_profit,
            }
        }
        "UPDATE_LEVERAGE" => {
            let payload: LeveragePayload = parse(value)?;
            if payload.leverage == 0 {
                return Err(DecodeError::Malformed(
                    "leverage must be positive".to_string(),
                ));
            }
            Command::UpdateLeverage {
                signal_id: payload.signal_id,
                symbol: payload.symbol,
                leverage: payload.leverage,
            }
        }
        other => return Err(DecodeError::UnknownKind(other.to_string())),
    };

    Ok(Signal {
        received_at,
        command,
    })
}

fn parse<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}
