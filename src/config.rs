// src/config.rs

use config::{Config, ConfigError, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize, Clone)]
pub struct BroadcasterConfig {
    pub url: String,
    pub auth_secret: String,
    pub client_id: Option<String>,
}

impl BroadcasterConfig {
    /// Stable id sent during the handshake; generated when not configured.
    pub fn client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("agent-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    pub base_url: String,
    pub api_secret: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TradingConfig {
    #[serde(default = "default_trade_amount")]
    pub trade_amount_usdt: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_min_order_value")]
    pub min_order_value: Decimal,
    #[serde(default = "default_true")]
    pub auto_execute: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            trade_amount_usdt: default_trade_amount(),
            max_leverage: default_max_leverage(),
            min_order_value: default_min_order_value(),
            auto_execute: true,
        }
    }
}

/// Risk limits are disabled by default; the operator opts in.
#[derive(Debug, Deserialize, Clone)]
pub struct RiskConfig {
    #[serde(default = "default_limit_off")]
    pub max_daily_trades: u32,
    #[serde(default = "default_limit_off")]
    pub max_open_positions: u32,
    #[serde(default)]
    pub stop_on_daily_loss: Decimal,
    #[serde(default)]
    pub min_balance: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_trades: default_limit_off(),
            max_open_positions: default_limit_off(),
            stop_on_daily_loss: Decimal::ZERO,
            min_balance: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: String,
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
            console: true,
        }
    }
}

/// Trading + risk limits flattened into the immutable struct the engine
/// consumes. The core never touches config files.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingParams {
    pub trade_amount_usdt: Decimal,
    pub max_leverage: u32,
    pub min_order_value: Decimal,
    pub auto_execute: bool,
    pub max_daily_trades: u32,
    pub max_open_positions: u32,
    pub stop_on_daily_loss: Decimal,
    pub min_balance: Decimal,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub broadcaster: BroadcasterConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name("Settings"))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn params(&self) -> TradingParams {
        TradingParams {
            trade_amount_usdt: self.trading.trade_amount_usdt,
            max_leverage: self.trading.max_leverage,
            min_order_value: self.trading.min_order_value,
            auto_execute: self.trading.auto_execute,
            max_daily_trades: self.risk.max_daily_trades,
            max_open_positions: self.risk.max_open_positions,
            stop_on_daily_loss: self.risk.stop_on_daily_loss,
            min_balance: self.risk.min_balance,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcaster.url.is_empty() {
            return Err(ConfigError::Message("broadcaster url is required".into()));
        }
        if self.broadcaster.auth_secret.is_empty() {
            return Err(ConfigError::Message(
                "broadcaster auth_secret is required".into(),
            ));
        }
        if self.broker.api_secret.is_empty()
            || PLACEHOLDER_SECRETS.contains(&self.broker.api_secret.trim())
        {
            return Err(ConfigError::Message(
                "enter your actual broker API secret in Settings.toml (not a placeholder)".into(),
            ));
        }
        if self.trading.trade_amount_usdt < self.trading.min_order_value {
            return Err(ConfigError::Message(format!(
                "trade_amount_usdt must be at least {} USDT (broker minimum order value)",
                self.trading.min_order_value
            )));
        }
        if self.trading.max_leverage == 0 {
            return Err(ConfigError::Message("max_leverage must be positive".into()));
        }
        Ok(())
    }
}

const PLACEHOLDER_SECRETS: &[&str] = &["your_api_secret", "your-secret", "api_secret"];

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_trade_amount() -> Decimal {
    Decimal::new(5, 0)
}

fn default_max_leverage() -> u32 {
    25
}

fn default_min_order_value() -> Decimal {
    Decimal::new(5, 0)
}

fn default_true() -> bool {
    true
}

fn default_limit_off() -> u32 {
    999_999
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "signal-runner.log".to_string()
}
