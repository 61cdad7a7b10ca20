//! Layered application configuration.
//!
//! Settings resolve in order: `config/default.toml`, then
//! `config/{env}.toml`, then `config/local.toml`, then `KESTREL_`-prefixed
//! environment variables (`KESTREL_EXECUTION__DEFAULT_LEVERAGE=10`). Every
//! knob has a serde default, so an empty directory still yields a working
//! configuration.

use std::path::Path;

use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub venue: VenueSettings,
    pub stream: StreamSettings,
    pub engine: EngineSettings,
    pub execution: ExecutionSettings,
    pub ledger: LedgerSettings,
    pub safety: SafetySettings,
    pub persistence: PersistenceSettings,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct VenueSettings {
    /// WebSocket endpoint for realtime data.
    pub ws_url: String,
    /// REST endpoint for queries and trading.
    pub api_url: String,
}

impl Default for VenueSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.hyperliquid.xyz/ws".into(),
            api_url: "https://api.hyperliquid.xyz".into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamSettings {
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_jitter_ms: u64,
    pub heartbeat_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            reconnect_max_attempts: 10,
            reconnect_jitter_ms: 500,
            heartbeat_secs: 50,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Shortest evaluation sleep after a trigger fires.
    pub eval_min_sleep_ms: u64,
    /// Longest evaluation sleep while nothing is happening.
    pub eval_max_sleep_ms: u64,
    /// Minimum seconds between technical evaluations of one trigger.
    pub technical_min_interval_secs: u64,
    /// Candle count floor for technical evaluation.
    pub min_candles: usize,
    /// Candle fetches request `max_period * lookback_multiplier` bars.
    pub lookback_multiplier: usize,
    /// Mid-price staleness bound before falling back to a direct query.
    pub mid_staleness_secs: u64,
    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
    /// Seconds between fee-schedule refreshes.
    pub fee_refresh_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            eval_min_sleep_ms: 250,
            eval_max_sleep_ms: 4_000,
            technical_min_interval_secs: 60,
            min_candles: 20,
            lookback_multiplier: 3,
            mid_staleness_secs: 10,
            reconcile_interval_secs: 300,
            fee_refresh_secs: 3_600,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Leverage applied when none was ever synced for a coin.
    pub default_leverage: u32,
    /// Market-order slippage bound (fraction, 0.05 = 5%).
    pub default_slippage: Decimal,
    /// Stop-loss limit offset beyond the trigger price.
    pub stop_loss_limit_offset: Decimal,
    /// Take-profit limit offset beyond the trigger price.
    pub take_profit_limit_offset: Decimal,
    /// Seconds a leverage sync stays fresh per coin.
    pub leverage_sync_ttl_secs: u64,
    /// Seconds coin metadata stays cached.
    pub meta_ttl_secs: u64,
    /// Seconds the account snapshot stays cached.
    pub account_cache_ttl_secs: u64,
    /// Orders cancelled per batch during a sweep.
    pub cancel_batch_size: usize,
    /// Pause between cancel batches.
    pub cancel_batch_pause_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_leverage: 20,
            default_slippage: Decimal::new(5, 2),
            stop_loss_limit_offset: Decimal::new(3, 2),
            take_profit_limit_offset: Decimal::new(1, 2),
            leverage_sync_ttl_secs: 60,
            meta_ttl_secs: 600,
            account_cache_ttl_secs: 2,
            cancel_batch_size: 5,
            cancel_batch_pause_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub closed_history_cap: usize,
    pub trade_log_cap: usize,
    pub estimated_taker_rate: Decimal,
    pub drift_warn_percent: Decimal,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            closed_history_cap: 500,
            trade_log_cap: 1000,
            estimated_taker_rate: Decimal::new(45, 5),
            drift_warn_percent: Decimal::ONE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SafetySettings {
    /// Largest position size allowed per order, in base units. Zero
    /// disables the check.
    pub max_position_size: Decimal,
    /// Daily realized-loss budget in quote currency. Zero disables.
    pub daily_loss_limit: Decimal,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::ZERO,
            daily_loss_limit: Decimal::ZERO,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Directory for durable ledger and order files.
    pub state_dir: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            state_dir: "state".into(),
        }
    }
}

/// Loads configuration from `config_dir` for the named environment.
pub fn load_config(config_dir: &Path, env: &str) -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(config_dir.join("default.toml")).required(false))
        .add_source(File::from(config_dir.join(format!("{env}.toml"))).required(false))
        .add_source(File::from(config_dir.join("local.toml")).required(false))
        .add_source(Environment::with_prefix("KESTREL").separator("__"));
    Ok(builder.build()?.try_deserialize()?)
}
