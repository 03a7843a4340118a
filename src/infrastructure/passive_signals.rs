use crate::domain::ports::{FeatureProvider, MlPredictor, StrategySource};
use crate::domain::types::{Action, MarketCondition, Signal};
use rust_decimal::prelude::ToPrimitive;

/// Strategy/ML/feature stack stand-ins: the real implementations live outside this crate's
/// scope, so these give the orchestrator something to call that never fabricates a trade.
/// `NullStrategySource` only ever emits `Hold`, so wiring one in is equivalent to running
/// the bot with trading disabled while keeping every other subsystem (TP/SL recovery,
/// drawdown tracking, orphan cleanup) live.
pub struct NullStrategySource;

impl StrategySource for NullStrategySource {
    fn generate(&self) -> Vec<Signal> {
        vec![Signal {
            action: Action::Hold,
            confidence: 0.0,
            stop_loss: None,
            take_profit: None,
            strategy_name: "null".to_string(),
        }]
    }
}

/// Echoes the signal's own confidence back; a real predictor would score the signal
/// against a trained model instead.
pub struct NullMlPredictor;

impl MlPredictor for NullMlPredictor {
    fn confidence(&self, signal: &Signal) -> f64 {
        signal.confidence
    }
}

/// Average true range from a plain high-low proxy (`ask - bid`) over the trailing window,
/// since `MarketCondition` carries no OHLC data. Good enough to seed the stop-loss distance
/// fallback; a real feature pipeline would compute ATR from candles instead.
pub struct NullFeatureProvider;

impl FeatureProvider for NullFeatureProvider {
    fn atr(&self, window: &[MarketCondition], period: usize) -> Option<f64> {
        if window.len() < period || period == 0 {
            return None;
        }
        let ranges: Vec<f64> = window
            .iter()
            .rev()
            .take(period)
            .map(|c| (c.ask - c.bid).to_f64().unwrap_or(0.0).max(0.0))
            .collect();
        if ranges.is_empty() {
            return None;
        }
        Some(ranges.iter().sum::<f64>() / ranges.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn null_strategy_always_holds() {
        let signals = NullStrategySource.generate();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].action, Action::Hold);
    }

    #[test]
    fn null_predictor_echoes_signal_confidence() {
        let signal = Signal {
            action: Action::Hold,
            confidence: 0.42,
            stop_loss: None,
            take_profit: None,
            strategy_name: "null".to_string(),
        };
        assert_eq!(NullMlPredictor.confidence(&signal), 0.42);
    }

    #[test]
    fn atr_needs_full_period_of_history() {
        let window = vec![
            MarketCondition {
                timestamp: Utc::now(),
                bid: dec!(100.0),
                ask: dec!(101.0),
                last: dec!(100.5),
                volume: dec!(1.0),
                api_latency_ms: 10,
            };
            3
        ];
        assert!(NullFeatureProvider.atr(&window, 5).is_none());
        assert_eq!(NullFeatureProvider.atr(&window, 3), Some(1.0));
    }
}
