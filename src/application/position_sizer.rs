use crate::config::KellyConfig;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct TradeResult {
    pub pnl: Decimal,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// Kelly-criterion position sizing from trade history, scaled by a safety factor and
/// capped by a profile ratio. Below the minimum sample size, falls back to a
/// conservative fixed fraction rather than trusting a noisy Kelly estimate.
pub struct PositionSizer {
    config: KellyConfig,
    history: VecDeque<TradeResult>,
}

impl PositionSizer {
    pub fn new(config: KellyConfig) -> Self {
        let capacity = config.history_capacity;
        Self {
            config,
            history: VecDeque::with_capacity(capacity),
        }
    }

    pub fn add_trade_result(&mut self, result: TradeResult) {
        self.history.push_back(result);
        if self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    fn kelly_fraction(&self) -> Option<Decimal> {
        if self.history.len() < self.config.min_trades_for_kelly {
            return None;
        }
        let wins: Vec<f64> = self
            .history
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl.to_f64().unwrap_or(0.0))
            .collect();
        let losses: Vec<f64> = self
            .history
            .iter()
            .filter(|t| t.pnl <= Decimal::ZERO)
            .map(|t| t.pnl.to_f64().unwrap_or(0.0).abs())
            .collect();
        if losses.is_empty() {
            return Some(self.config.max_position_ratio);
        }
        if wins.is_empty() {
            return Some(Decimal::ZERO);
        }
        let win_rate = wins.len() as f64 / self.history.len() as f64;
        let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        if avg_loss <= 0.0 {
            return Some(self.config.max_position_ratio);
        }
        let r = avg_win / avg_loss;
        let f = win_rate - (1.0 - win_rate) / r;
        let f = Decimal::try_from(f.max(0.0)).unwrap_or(Decimal::ZERO);
        Some(f.min(self.config.max_position_ratio))
    }

    /// `ml_confidence` and `strategy_confidence` each scale the base Kelly/default
    /// fraction down proportionally, then the result is floored at `min_trade_size`.
    pub fn recommend_position_size(
        &self,
        ml_confidence: f64,
        strategy_confidence: f64,
        min_trade_size: Decimal,
    ) -> Decimal {
        let base = self
            .kelly_fraction()
            .unwrap_or(self.config.conservative_default_ratio);
        let safety_scaled = base * self.config.safety_factor;
        let confidence_modifier =
            Decimal::try_from(((ml_confidence + strategy_confidence) / 2.0).clamp(0.0, 1.0))
                .unwrap_or(Decimal::ONE);
        let sized = safety_scaled * confidence_modifier;
        sized.max(min_trade_size)
    }

    pub fn kelly_statistics(&self) -> KellyStatistics {
        let trades = self.history.len();
        let wins = self.history.iter().filter(|t| t.pnl > Decimal::ZERO).count();
        KellyStatistics {
            trade_count: trades,
            win_count: wins,
            kelly_fraction: self.kelly_fraction(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KellyStatistics {
    pub trade_count: usize,
    pub win_count: usize,
    pub kelly_fraction: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(pnl: Decimal) -> TradeResult {
        TradeResult {
            pnl,
            confidence: 0.6,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn below_min_trades_uses_conservative_default() {
        let sizer = PositionSizer::new(KellyConfig::default());
        let size = sizer.recommend_position_size(0.6, 0.6, dec!(0.0001));
        assert!(size >= dec!(0.0001));
    }

    #[test]
    fn size_never_drops_below_min_trade_size() {
        let mut sizer = PositionSizer::new(KellyConfig::default());
        for _ in 0..25 {
            sizer.add_trade_result(sample(dec!(-1)));
        }
        let size = sizer.recommend_position_size(0.1, 0.1, dec!(0.0001));
        assert!(size >= dec!(0.0001));
    }

    #[test]
    fn kelly_fraction_requires_min_sample_size() {
        let mut sizer = PositionSizer::new(KellyConfig::default());
        for _ in 0..5 {
            sizer.add_trade_result(sample(dec!(10)));
        }
        assert!(sizer.kelly_statistics().kelly_fraction.is_none());
    }
}
