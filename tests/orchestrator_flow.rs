use bitbank_trader::application::anomaly_detector::AnomalyDetector;
use bitbank_trader::application::drawdown_manager::DrawdownManager;
use bitbank_trader::application::execution_service::ExecutionService;
use bitbank_trader::application::order_strategy_decider::OrderStrategyDecider;
use bitbank_trader::application::orchestrator::{CycleOutcome, ShutdownSignal, TradingCycleOrchestrator};
use bitbank_trader::application::orphan_sl_log::OrphanSlLog;
use bitbank_trader::application::position_sizer::PositionSizer;
use bitbank_trader::application::risk_evaluator::RiskEvaluator;
use bitbank_trader::application::tp_sl_manager::TpSlManager;
use bitbank_trader::config::BotConfig;
use bitbank_trader::domain::ports::{ExchangeClient, FeatureProvider, MlPredictor, StrategySource};
use bitbank_trader::domain::types::{Action, ExecutionMode, MarketCondition, Signal, TradeDecision};
use bitbank_trader::infrastructure::mock_exchange::MockExchange;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Emits one Buy signal, then Hold forever after — models a strategy that only wants
/// to open a single position rather than re-entering on every cycle.
struct OneShotBuy {
    fired: AtomicBool,
}

impl OneShotBuy {
    fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }
}

impl StrategySource for OneShotBuy {
    fn generate(&self) -> Vec<Signal> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return vec![Signal {
                action: Action::Hold,
                confidence: 0.0,
                stop_loss: None,
                take_profit: None,
                strategy_name: "integration-buy".to_string(),
            }];
        }
        vec![Signal {
            action: Action::Buy,
            confidence: 0.9,
            stop_loss: None,
            take_profit: None,
            strategy_name: "integration-buy".to_string(),
        }]
    }
}

struct HighConfidence;
impl MlPredictor for HighConfidence {
    fn confidence(&self, _signal: &Signal) -> f64 {
        0.95
    }
}

struct NoAtr;
impl FeatureProvider for NoAtr {
    fn atr(&self, _window: &[MarketCondition], _period: usize) -> Option<f64> {
        None
    }
}

fn build_orchestrator(exchange: Arc<dyn ExchangeClient>) -> TradingCycleOrchestrator {
    let config = BotConfig::default();
    let drawdown_path =
        std::env::temp_dir().join(format!("integration_drawdown_{}.json", uuid::Uuid::new_v4()));
    let orphan_path =
        std::env::temp_dir().join(format!("integration_orphan_{}.json", uuid::Uuid::new_v4()));

    let risk = RiskEvaluator::new(
        config.risk.clone(),
        DrawdownManager::new(config.risk.clone(), drawdown_path, false),
        AnomalyDetector::new(config.anomaly.clone()),
        PositionSizer::new(config.kelly.clone()),
    );
    let decider = OrderStrategyDecider::new(
        config.order_execution.clone(),
        config.trading_constraints.clone(),
    );
    let tp_sl = TpSlManager::new(
        config.position_management.clone(),
        config.tp_sl_timing.clone(),
        exchange.clone(),
        config.trading_constraints.currency_pair.clone(),
    );
    let execution = ExecutionService::new(
        ExecutionMode::Paper,
        Some(exchange.clone()),
        config.position_management.clone(),
        config.trading_constraints.clone(),
        dec!(14_000_000),
    );

    TradingCycleOrchestrator::new(
        config,
        Some(exchange),
        Arc::new(OneShotBuy::new()),
        Arc::new(HighConfidence),
        Arc::new(NoAtr),
        risk,
        decider,
        tp_sl,
        None,
        OrphanSlLog::new(orphan_path),
        execution,
        ShutdownSignal::new(),
    )
}

#[tokio::test]
async fn approved_buy_signal_opens_a_covered_position() {
    let exchange = Arc::new(MockExchange::new(dec!(14_000_000)));
    let mut orchestrator = build_orchestrator(exchange.clone());
    orchestrator.initialize().await.unwrap();

    let outcome = orchestrator.run_cycle().await.unwrap();

    match outcome {
        CycleOutcome::Executed { decision, .. } => {
            assert_ne!(decision, TradeDecision::Denied);
        }
        CycleOutcome::NoTrade => panic!("expected the high-confidence buy signal to trade"),
    }

    let positions = orchestrator.positions();
    assert_eq!(positions.len(), 1);
    assert!(positions[0].has_full_coverage() || positions[0].requires_full_coverage());
}

#[tokio::test]
async fn repeated_cycles_do_not_duplicate_positions_once_full() {
    let exchange = Arc::new(MockExchange::new(dec!(14_000_000)));
    let mut orchestrator = build_orchestrator(exchange);
    orchestrator.initialize().await.unwrap();

    orchestrator.run_cycle().await.unwrap();
    let after_first = orchestrator.positions().len();

    orchestrator.run_cycle().await.unwrap();
    let after_second = orchestrator.positions().len();

    assert_eq!(after_first, after_second);
}

#[tokio::test]
async fn shutdown_signal_stops_the_run_loop_before_a_second_cycle() {
    let exchange = Arc::new(MockExchange::new(dec!(14_000_000)));
    let mut orchestrator = build_orchestrator(exchange);
    orchestrator.initialize().await.unwrap();

    let shutdown = orchestrator.shutdown_signal();
    shutdown.trigger();
    assert!(shutdown.requested());
}
