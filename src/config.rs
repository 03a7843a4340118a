use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Backtest,
    Paper,
    Live,
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "backtest" => Ok(Mode::Backtest),
            "paper" => Ok(Mode::Paper),
            "live" => Ok(Mode::Live),
            _ => anyhow::bail!("invalid MODE: {s}, must be backtest, paper or live"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MakerStrategyConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub timeout_seconds: u64,
    pub fallback_to_native: bool,
}

impl Default for MakerStrategyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 2,
            retry_interval_ms: 1500,
            timeout_seconds: 10,
            fallback_to_native: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitConfig {
    pub enabled: bool,
    pub default_ratio: Decimal,
    pub min_profit_ratio: Decimal,
    pub maker_strategy: MakerStrategyConfig,
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ratio: dec!(0.009),
            min_profit_ratio: dec!(0.005),
            maker_strategy: MakerStrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLossConfig {
    pub enabled: bool,
    pub order_type: String,
    pub slippage_buffer: Decimal,
    pub max_loss_ratio: Decimal,
    pub min_distance_ratio: Decimal,
    pub default_atr_multiplier: Decimal,
}

impl Default for StopLossConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            order_type: "stop".to_string(),
            slippage_buffer: dec!(0.002),
            max_loss_ratio: dec!(0.007),
            min_distance_ratio: dec!(0.001),
            default_atr_multiplier: dec!(1.5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionManagementConfig {
    pub take_profit: TakeProfitConfig,
    pub stop_loss: StopLossConfig,
    pub min_trade_size: Decimal,
    /// When enabled, `min_trade_size` is enforced as a floor over the Kelly-recommended
    /// size; when disabled, the recommended size passes through unchanged.
    pub dynamic_position_sizing_enabled: bool,
}

impl Default for PositionManagementConfig {
    fn default() -> Self {
        Self {
            take_profit: TakeProfitConfig::default(),
            stop_loss: StopLossConfig::default(),
            min_trade_size: dec!(0.0001),
            dynamic_position_sizing_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConstraintsConfig {
    pub currency_pair: String,
    pub default_order_type: String,
}

impl Default for TradingConstraintsConfig {
    fn default() -> Self {
        Self {
            currency_pair: "btc_jpy".to_string(),
            default_order_type: "market".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderExecutionConfig {
    pub smart_order_enabled: bool,
    pub high_confidence_threshold: f64,
    pub low_confidence_threshold: f64,
    pub max_spread_ratio_for_limit: Decimal,
    pub price_improvement_ratio: Decimal,
}

impl Default for OrderExecutionConfig {
    fn default() -> Self {
        Self {
            smart_order_enabled: true,
            high_confidence_threshold: 0.75,
            low_confidence_threshold: 0.4,
            max_spread_ratio_for_limit: dec!(0.003),
            price_improvement_ratio: dec!(0.001),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_drawdown_ratio: f64,
    pub consecutive_loss_limit: u32,
    pub cooldown_hours: i64,
    pub min_ml_confidence: f64,
    pub risk_threshold_deny: f64,
    pub risk_threshold_conditional: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown_ratio: 0.20,
            consecutive_loss_limit: 5,
            cooldown_hours: 6,
            min_ml_confidence: 0.30,
            risk_threshold_deny: 0.8,
            risk_threshold_conditional: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TpSlTimingConfig {
    pub verification_delay_secs: i64,
    pub check_interval_secs: i64,
    pub orphan_scan_interval_secs: i64,
    pub api_order_limit: u32,
    pub fallback_atr: Decimal,
    pub require_tpsl_recalculation: bool,
}

impl Default for TpSlTimingConfig {
    fn default() -> Self {
        Self {
            verification_delay_secs: 600,
            check_interval_secs: 600,
            orphan_scan_interval_secs: 1800,
            api_order_limit: 100,
            fallback_atr: dec!(50000),
            require_tpsl_recalculation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub spread_warning_threshold: f64,
    pub spread_critical_threshold: f64,
    pub latency_warning_ms: i64,
    pub latency_critical_ms: i64,
    pub spike_zscore_threshold: f64,
    pub min_history_for_spike_check: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            spread_warning_threshold: 0.003,
            spread_critical_threshold: 0.005,
            latency_warning_ms: 1000,
            latency_critical_ms: 3000,
            spike_zscore_threshold: 3.0,
            min_history_for_spike_check: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KellyConfig {
    pub min_trades_for_kelly: usize,
    pub max_position_ratio: Decimal,
    pub safety_factor: Decimal,
    pub conservative_default_ratio: Decimal,
    pub history_capacity: usize,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            min_trades_for_kelly: 20,
            max_position_ratio: dec!(0.25),
            safety_factor: dec!(0.7),
            conservative_default_ratio: dec!(0.02),
            history_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub unfilled_order_threshold_count: u32,
    pub unfilled_order_max_age_hours: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            unfilled_order_threshold_count: 25,
            unfilled_order_max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub cycle_interval_secs: u64,
    pub restore_on_startup: bool,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 60,
            restore_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub state_dir: String,
    pub log_dir: String,
    pub force_drawdown_reset: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: "state".to_string(),
            log_dir: "logs".to_string(),
            force_drawdown_reset: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub mode: Mode,
    pub position_management: PositionManagementConfig,
    pub trading_constraints: TradingConstraintsConfig,
    pub order_execution: OrderExecutionConfig,
    pub risk: RiskConfig,
    pub tp_sl_timing: TpSlTimingConfig,
    pub anomaly: AnomalyConfig,
    pub kelly: KellyConfig,
    pub cleanup: CleanupConfig,
    pub state: StateConfig,
    pub orchestration: OrchestrationConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Paper,
            position_management: PositionManagementConfig::default(),
            trading_constraints: TradingConstraintsConfig::default(),
            order_execution: OrderExecutionConfig::default(),
            risk: RiskConfig::default(),
            tp_sl_timing: TpSlTimingConfig::default(),
            anomaly: AnomalyConfig::default(),
            kelly: KellyConfig::default(),
            cleanup: CleanupConfig::default(),
            state: StateConfig::default(),
            orchestration: OrchestrationConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load from a TOML file, falling back to defaults for anything absent, then
    /// apply the one env override the core contract names (`FORCE_DRAWDOWN_RESET`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            BotConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FORCE_DRAWDOWN_RESET") {
            self.state.force_drawdown_reset = v.parse().unwrap_or(false);
        }
        if let Ok(v) = std::env::var("MODE") {
            if let Ok(mode) = v.parse::<Mode>() {
                self.mode = mode;
            }
        }
    }
}
