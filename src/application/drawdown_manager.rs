use crate::config::RiskConfig;
use crate::domain::types::{DrawdownSnapshot, TradingStatus};
use crate::infrastructure::persistence::{read_json, write_json_atomic};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const SNAPSHOT_CAPACITY: usize = 1000;
const FORCE_RESET_DEFAULT_BALANCE: f64 = 100_000.0;
const FORCE_RESET_DRAWDOWN_THRESHOLD: f64 = 0.50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSession {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub reason: String,
    pub initial_balance: Decimal,
    pub final_balance: Option<Decimal>,
    pub trades: u32,
    pub wins: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DrawdownState {
    current_balance: Decimal,
    peak_balance: Decimal,
    consecutive_losses: u32,
    last_loss_time: Option<DateTime<Utc>>,
    trading_status: TradingStatus,
    pause_until: Option<DateTime<Utc>>,
    current_session: Option<TradingSession>,
    #[serde(default)]
    schema_version: u32,
}

impl Default for DrawdownState {
    fn default() -> Self {
        Self {
            current_balance: Decimal::ZERO,
            peak_balance: Decimal::ZERO,
            consecutive_losses: 0,
            last_loss_time: None,
            trading_status: TradingStatus::Active,
            pause_until: None,
            current_session: None,
            schema_version: 1,
        }
    }
}

/// Peak/current equity, consecutive-loss tracking and the trading-status FSM, persisted
/// to disk after every state-changing call so restarts don't forget a pause.
pub struct DrawdownManager {
    config: RiskConfig,
    state: DrawdownState,
    history: Vec<DrawdownSnapshot>,
    state_path: PathBuf,
    force_reset_env: bool,
}

impl DrawdownManager {
    pub fn new(config: RiskConfig, state_path: PathBuf, force_reset_env: bool) -> Self {
        Self {
            config,
            state: DrawdownState::default(),
            history: Vec::new(),
            state_path,
            force_reset_env,
        }
    }

    pub async fn load(&mut self) -> anyhow::Result<()> {
        if let Some(mut loaded) = read_json::<DrawdownState>(&self.state_path).await? {
            if self.needs_force_reset(&loaded) {
                tracing::error!(critical = true, "drawdown state failed sanity check, force-resetting to ACTIVE");
                loaded = DrawdownState {
                    current_balance: Decimal::try_from(FORCE_RESET_DEFAULT_BALANCE).unwrap(),
                    peak_balance: Decimal::try_from(FORCE_RESET_DEFAULT_BALANCE).unwrap(),
                    ..DrawdownState::default()
                };
            }
            self.state = loaded;
            self.save().await?;
        }
        Ok(())
    }

    fn needs_force_reset(&self, state: &DrawdownState) -> bool {
        if self.force_reset_env {
            return true;
        }
        if state.trading_status == TradingStatus::PausedDrawdown {
            return true;
        }
        if state.current_balance <= Decimal::ZERO || state.peak_balance <= Decimal::ZERO {
            return true;
        }
        let ratio = Self::drawdown_ratio(state.current_balance, state.peak_balance);
        ratio > FORCE_RESET_DRAWDOWN_THRESHOLD
    }

    fn drawdown_ratio(current: Decimal, peak: Decimal) -> f64 {
        if peak <= Decimal::ZERO {
            return 0.0;
        }
        ((peak - current) / peak).to_f64().unwrap_or(0.0)
    }

    async fn save(&self) -> anyhow::Result<()> {
        write_json_atomic(&self.state_path, &self.state).await
    }

    pub async fn initialize_balance(&mut self, balance: Decimal) -> anyhow::Result<()> {
        self.state.current_balance = balance;
        self.state.peak_balance = balance;
        self.start_session(balance, "initialize".to_string());
        self.save().await
    }

    fn start_session(&mut self, balance: Decimal, reason: String) {
        self.state.current_session = Some(TradingSession {
            started_at: Utc::now(),
            ended_at: None,
            reason,
            initial_balance: balance,
            final_balance: None,
            trades: 0,
            wins: 0,
        });
    }

    fn end_session(&mut self, balance: Decimal) {
        if let Some(session) = self.state.current_session.as_mut() {
            session.ended_at = Some(Utc::now());
            session.final_balance = Some(balance);
        }
    }

    /// Updates current equity, tracks a new peak, and appends a capped history snapshot.
    /// Returns `(drawdown_ratio, trading_allowed)`.
    pub async fn update_balance(&mut self, balance: Decimal) -> anyhow::Result<(f64, bool)> {
        self.state.current_balance = balance;
        if balance > self.state.peak_balance {
            self.state.peak_balance = balance;
            if self.state.consecutive_losses > 0 {
                self.state.consecutive_losses = 0;
            }
            if self.state.trading_status == TradingStatus::PausedConsecutiveLoss {
                self.resume("new equity peak reached".to_string());
            }
        }
        let ratio = Self::drawdown_ratio(self.state.current_balance, self.state.peak_balance);
        self.history.push(DrawdownSnapshot {
            timestamp: Utc::now(),
            current_balance: self.state.current_balance,
            peak_balance: self.state.peak_balance,
            drawdown_ratio: ratio,
            consecutive_losses: self.state.consecutive_losses,
            trading_status: self.state.trading_status,
        });
        if self.history.len() > SNAPSHOT_CAPACITY {
            self.history.remove(0);
        }
        let allowed = self.check_trading_allowed();
        self.save().await?;
        Ok((ratio, allowed))
    }

    /// Profit resets the consecutive-loss counter; a loss increments it and, past the
    /// configured limit, pauses trading for `cooldown_hours`.
    pub async fn record_trade_result(&mut self, pnl: Decimal) -> anyhow::Result<()> {
        if let Some(session) = self.state.current_session.as_mut() {
            session.trades += 1;
            if pnl > Decimal::ZERO {
                session.wins += 1;
            }
        }
        if pnl > Decimal::ZERO {
            self.state.consecutive_losses = 0;
        } else {
            self.state.consecutive_losses += 1;
            self.state.last_loss_time = Some(Utc::now());
            if self.state.consecutive_losses >= self.config.consecutive_loss_limit {
                self.pause_consecutive_loss();
            }
        }
        self.save().await
    }

    fn pause_consecutive_loss(&mut self) {
        self.state.trading_status = TradingStatus::PausedConsecutiveLoss;
        self.state.pause_until = Some(Utc::now() + Duration::hours(self.config.cooldown_hours));
        self.end_session(self.state.current_balance);
    }

    fn pause_drawdown(&mut self) {
        self.state.trading_status = TradingStatus::PausedDrawdown;
        self.end_session(self.state.current_balance);
    }

    fn resume(&mut self, reason: String) {
        self.state.trading_status = TradingStatus::Active;
        self.state.pause_until = None;
        self.start_session(self.state.current_balance, reason);
    }

    /// False if manually paused, cooldown hasn't elapsed, drawdown breached the limit, or
    /// consecutive losses hit the limit. Auto-resumes a consecutive-loss pause once the
    /// cooldown has elapsed.
    pub fn check_trading_allowed(&mut self) -> bool {
        match self.state.trading_status {
            TradingStatus::PausedManual => false,
            TradingStatus::PausedConsecutiveLoss => {
                if let Some(until) = self.state.pause_until {
                    if Utc::now() >= until {
                        self.resume("cooldown elapsed".to_string());
                        return self.check_trading_allowed();
                    }
                }
                false
            }
            TradingStatus::PausedDrawdown => false,
            TradingStatus::Active => {
                let ratio =
                    Self::drawdown_ratio(self.state.current_balance, self.state.peak_balance);
                if ratio >= self.config.max_drawdown_ratio {
                    self.pause_drawdown();
                    return false;
                }
                if self.state.consecutive_losses >= self.config.consecutive_loss_limit {
                    self.pause_consecutive_loss();
                    return false;
                }
                true
            }
        }
    }

    pub async fn manual_pause(&mut self, reason: String) -> anyhow::Result<()> {
        self.state.trading_status = TradingStatus::PausedManual;
        self.end_session(self.state.current_balance);
        tracing::warn!(reason = %reason, "trading manually paused");
        self.save().await
    }

    pub async fn manual_resume(&mut self, reason: String) -> anyhow::Result<()> {
        self.resume(reason);
        self.save().await
    }

    pub fn trading_status(&self) -> TradingStatus {
        self.state.trading_status
    }

    pub fn current_balance(&self) -> Decimal {
        self.state.current_balance
    }

    pub fn peak_balance(&self) -> Decimal {
        self.state.peak_balance
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.state.consecutive_losses
    }

    pub fn current_drawdown_ratio(&self) -> f64 {
        Self::drawdown_ratio(self.state.current_balance, self.state.peak_balance)
    }

    pub fn statistics(&self) -> DrawdownStatistics {
        let win_rate = self
            .state
            .current_session
            .as_ref()
            .filter(|s| s.trades > 0)
            .map(|s| s.wins as f64 / s.trades as f64);
        DrawdownStatistics {
            current_balance: self.state.current_balance,
            peak_balance: self.state.peak_balance,
            drawdown_ratio: self.current_drawdown_ratio(),
            consecutive_losses: self.state.consecutive_losses,
            trading_status: self.state.trading_status,
            session_win_rate: win_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrawdownStatistics {
    pub current_balance: Decimal,
    pub peak_balance: Decimal,
    pub drawdown_ratio: f64,
    pub consecutive_losses: u32,
    pub trading_status: TradingStatus,
    pub session_win_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile_helpers::temp_state_path;

    mod tempfile_helpers {
        use std::path::PathBuf;
        use uuid::Uuid;

        pub fn temp_state_path() -> PathBuf {
            std::env::temp_dir().join(format!("drawdown_test_{}.json", Uuid::new_v4()))
        }
    }

    fn manager() -> DrawdownManager {
        DrawdownManager::new(RiskConfig::default(), temp_state_path(), false)
    }

    #[tokio::test]
    async fn peak_balance_is_monotonic_non_decreasing() {
        let mut m = manager();
        m.initialize_balance(dec!(1000)).await.unwrap();
        m.update_balance(dec!(1200)).await.unwrap();
        m.update_balance(dec!(900)).await.unwrap();
        assert_eq!(m.peak_balance(), dec!(1200));
    }

    #[tokio::test]
    async fn profitable_trade_resets_consecutive_losses() {
        let mut m = manager();
        m.initialize_balance(dec!(1000)).await.unwrap();
        m.record_trade_result(dec!(-10)).await.unwrap();
        m.record_trade_result(dec!(-10)).await.unwrap();
        assert_eq!(m.consecutive_losses(), 2);
        m.record_trade_result(dec!(5)).await.unwrap();
        assert_eq!(m.consecutive_losses(), 0);
    }

    #[tokio::test]
    async fn consecutive_loss_limit_pauses_trading() {
        let mut m = manager();
        m.initialize_balance(dec!(1000)).await.unwrap();
        for _ in 0..m.config.consecutive_loss_limit {
            m.record_trade_result(dec!(-1)).await.unwrap();
        }
        assert_eq!(m.trading_status(), TradingStatus::PausedConsecutiveLoss);
        assert!(!m.check_trading_allowed());
    }

    #[tokio::test]
    async fn drawdown_beyond_limit_pauses_trading() {
        let mut m = manager();
        m.initialize_balance(dec!(1_000_000)).await.unwrap();
        // 25% drawdown > default 20% limit
        let (_, allowed) = m.update_balance(dec!(750_000)).await.unwrap();
        assert!(!allowed);
        assert_eq!(m.trading_status(), TradingStatus::PausedDrawdown);
    }

    #[tokio::test]
    async fn force_reset_triggers_on_implausible_persisted_state() {
        let path = temp_state_path();
        let corrupt = DrawdownState {
            current_balance: dec!(-5),
            peak_balance: dec!(100),
            trading_status: TradingStatus::PausedDrawdown,
            ..DrawdownState::default()
        };
        write_json_atomic(&path, &corrupt).await.unwrap();

        let mut m = DrawdownManager::new(RiskConfig::default(), path, false);
        m.load().await.unwrap();
        assert_eq!(m.trading_status(), TradingStatus::Active);
        assert!(m.current_balance() > Decimal::ZERO);
    }
}
