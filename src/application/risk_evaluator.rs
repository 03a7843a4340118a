use crate::application::anomaly_detector::AnomalyDetector;
use crate::application::drawdown_manager::DrawdownManager;
use crate::application::position_sizer::PositionSizer;
use crate::config::RiskConfig;
use crate::domain::types::{
    Action, MarketCondition, Signal, TradeDecision, TradeEvaluation, TradingStatus,
};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;

/// Input the orchestrator gathers for one cycle's risk decision.
pub struct TradeOpportunity<'a> {
    pub signal: &'a Signal,
    pub ml_confidence: f64,
    pub market: MarketCondition,
    pub price_history: &'a [f64],
    pub volume_history: &'a [f64],
    pub current_balance: Decimal,
    pub atr_current: Option<f64>,
    pub regime: Option<String>,
    pub realized_volatility: f64,
}

/// Combines drawdown state, anomaly checks, ML confidence and position sizing into a
/// single APPROVED/CONDITIONAL/DENIED decision. The only entry point components outside
/// the risk gate call.
pub struct RiskEvaluator {
    config: RiskConfig,
    drawdown: DrawdownManager,
    anomaly: AnomalyDetector,
    sizer: PositionSizer,
}

impl RiskEvaluator {
    pub fn new(
        config: RiskConfig,
        drawdown: DrawdownManager,
        anomaly: AnomalyDetector,
        sizer: PositionSizer,
    ) -> Self {
        Self {
            config,
            drawdown,
            anomaly,
            sizer,
        }
    }

    pub fn drawdown_manager(&mut self) -> &mut DrawdownManager {
        &mut self.drawdown
    }

    pub fn anomaly_detector(&mut self) -> &mut AnomalyDetector {
        &mut self.anomaly
    }

    pub fn position_sizer(&mut self) -> &mut PositionSizer {
        &mut self.sizer
    }

    pub async fn evaluate_trade_opportunity(
        &mut self,
        opp: TradeOpportunity<'_>,
        min_trade_size: Decimal,
    ) -> TradeEvaluation {
        let mut denial_reasons = Vec::new();
        let mut warnings = Vec::new();

        let (drawdown_ratio, trading_allowed) = match self.drawdown.update_balance(opp.current_balance).await {
            Ok(v) => v,
            Err(e) => {
                return self.denied_evaluation(
                    opp.signal,
                    vec![format!("drawdown update failed: {e}")],
                    1.0,
                );
            }
        };
        if !trading_allowed {
            denial_reasons.push("ドローダウン制限".to_string());
        }

        let alerts = self.anomaly.comprehensive_anomaly_check(
            opp.market,
            opp.price_history,
            opp.volume_history,
        );
        let mut critical_anomalies = false;
        for alert in &alerts {
            match alert.level {
                crate::domain::types::AnomalyLevel::Critical => {
                    critical_anomalies = true;
                    denial_reasons.push(alert.message.clone());
                }
                crate::domain::types::AnomalyLevel::Warning => warnings.push(alert.message.clone()),
                crate::domain::types::AnomalyLevel::Normal => {}
            }
        }

        if opp.ml_confidence < self.config.min_ml_confidence {
            denial_reasons.push(format!(
                "ML confidence {:.2} below minimum {:.2}",
                opp.ml_confidence, self.config.min_ml_confidence
            ));
        }

        let action = opp.signal.action;
        let side = match action {
            Action::Buy => crate::domain::types::OrderSide::Buy,
            Action::Sell => crate::domain::types::OrderSide::Sell,
            Action::Hold => crate::domain::types::OrderSide::Buy,
        };

        let position_size = self.sizer.recommend_position_size(
            opp.ml_confidence,
            opp.signal.confidence,
            min_trade_size,
        );

        let anomaly_score = if critical_anomalies { 1.0 } else if !warnings.is_empty() { 0.3 } else { 0.0 };
        let consecutive_losses = self.drawdown.consecutive_losses();
        let risk_score = (0.30 * (1.0 - opp.ml_confidence)
            + 0.25 * anomaly_score
            + 0.25 * (drawdown_ratio / self.config.max_drawdown_ratio.max(f64::EPSILON))
            + 0.10 * (consecutive_losses as f64 / 5.0)
            + 0.10 * (opp.realized_volatility / 0.05).min(1.0))
        .clamp(0.0, 1.0);

        let mut market_conditions = HashMap::new();
        market_conditions.insert("bid".to_string(), opp.market.bid.to_string());
        market_conditions.insert("ask".to_string(), opp.market.ask.to_string());
        if let Some(atr) = opp.atr_current {
            market_conditions.insert("atr_current".to_string(), atr.to_string());
        }
        if let Some(regime) = &opp.regime {
            market_conditions.insert("regime".to_string(), regime.clone());
        }
        market_conditions.insert(
            "spread_pct".to_string(),
            ((opp.market.ask - opp.market.bid) / opp.market.last)
                .to_f64()
                .unwrap_or(0.0)
                .to_string(),
        );

        let decision = if !trading_allowed || critical_anomalies || !denial_reasons.is_empty() {
            TradeDecision::Denied
        } else if risk_score >= self.config.risk_threshold_deny {
            TradeDecision::Denied
        } else if risk_score >= self.config.risk_threshold_conditional {
            TradeDecision::Conditional
        } else {
            TradeDecision::Approved
        };

        TradeEvaluation {
            decision,
            side,
            risk_score,
            position_size,
            stop_loss: opp.signal.stop_loss,
            take_profit: opp.signal.take_profit,
            confidence_level: opp.ml_confidence,
            kelly_recommendation: position_size,
            drawdown_status: self.drawdown.trading_status(),
            warnings,
            denial_reasons,
            market_conditions,
            entry_price: None,
            emergency_exit: false,
        }
    }

    fn denied_evaluation(
        &self,
        signal: &Signal,
        denial_reasons: Vec<String>,
        risk_score: f64,
    ) -> TradeEvaluation {
        TradeEvaluation {
            decision: TradeDecision::Denied,
            side: crate::domain::types::OrderSide::Buy,
            risk_score,
            position_size: Decimal::ZERO,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            confidence_level: 0.0,
            kelly_recommendation: Decimal::ZERO,
            drawdown_status: TradingStatus::Active,
            warnings: vec![],
            denial_reasons,
            market_conditions: HashMap::new(),
            entry_price: None,
            emergency_exit: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnomalyConfig, KellyConfig};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn evaluator() -> RiskEvaluator {
        let path = std::env::temp_dir().join(format!("risk_test_{}.json", uuid::Uuid::new_v4()));
        RiskEvaluator::new(
            RiskConfig::default(),
            DrawdownManager::new(RiskConfig::default(), path, false),
            AnomalyDetector::new(AnomalyConfig::default()),
            PositionSizer::new(KellyConfig::default()),
        )
    }

    fn market() -> MarketCondition {
        MarketCondition {
            timestamp: Utc::now(),
            bid: dec!(13_999_500),
            ask: dec!(14_000_500),
            last: dec!(14_000_000),
            volume: dec!(10),
            api_latency_ms: 100,
        }
    }

    #[tokio::test]
    async fn denied_while_drawdown_paused() {
        let mut evaluator = evaluator();
        evaluator
            .drawdown_manager()
            .initialize_balance(dec!(1_000_000))
            .await
            .unwrap();

        let signal = Signal {
            action: Action::Buy,
            confidence: 0.6,
            stop_loss: Some(dec!(13_500_000)),
            take_profit: Some(dec!(14_500_000)),
            strategy_name: "test".to_string(),
        };
        let opp = TradeOpportunity {
            signal: &signal,
            ml_confidence: 0.65,
            market: market(),
            price_history: &[],
            volume_history: &[],
            current_balance: dec!(750_000),
            atr_current: Some(70_000.0),
            regime: Some("normal_range".to_string()),
            realized_volatility: 0.01,
        };
        let eval = evaluator
            .evaluate_trade_opportunity(opp, dec!(0.0001))
            .await;
        assert_eq!(eval.decision, TradeDecision::Denied);
        assert!(eval.denial_reasons.iter().any(|r| r.contains("ドローダウン")));
    }

    #[tokio::test]
    async fn approved_happy_path() {
        let mut evaluator = evaluator();
        evaluator
            .drawdown_manager()
            .initialize_balance(dec!(15_000))
            .await
            .unwrap();

        let signal = Signal {
            action: Action::Buy,
            confidence: 0.6,
            stop_loss: Some(dec!(13_500_000)),
            take_profit: Some(dec!(14_500_000)),
            strategy_name: "test".to_string(),
        };
        let opp = TradeOpportunity {
            signal: &signal,
            ml_confidence: 0.65,
            market: market(),
            price_history: &[],
            volume_history: &[],
            current_balance: dec!(15_000),
            atr_current: Some(70_000.0),
            regime: Some("normal_range".to_string()),
            realized_volatility: 0.01,
        };
        let eval = evaluator
            .evaluate_trade_opportunity(opp, dec!(0.0001))
            .await;
        assert_eq!(eval.decision, TradeDecision::Approved);
    }

    #[tokio::test]
    async fn denied_below_min_ml_confidence() {
        let mut evaluator = evaluator();
        evaluator
            .drawdown_manager()
            .initialize_balance(dec!(15_000))
            .await
            .unwrap();
        let signal = Signal {
            action: Action::Buy,
            confidence: 0.6,
            stop_loss: Some(dec!(13_500_000)),
            take_profit: Some(dec!(14_500_000)),
            strategy_name: "test".to_string(),
        };
        let opp = TradeOpportunity {
            signal: &signal,
            ml_confidence: 0.1,
            market: market(),
            price_history: &[],
            volume_history: &[],
            current_balance: dec!(15_000),
            atr_current: None,
            regime: None,
            realized_volatility: 0.01,
        };
        let eval = evaluator
            .evaluate_trade_opportunity(opp, dec!(0.0001))
            .await;
        assert_eq!(eval.decision, TradeDecision::Denied);
    }
}
