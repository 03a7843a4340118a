use anyhow::Context;
use bitbank_trader::application::anomaly_detector::AnomalyDetector;
use bitbank_trader::application::drawdown_manager::DrawdownManager;
use bitbank_trader::application::execution_service::ExecutionService;
use bitbank_trader::application::order_strategy_decider::OrderStrategyDecider;
use bitbank_trader::application::orchestrator::{ShutdownSignal, TradingCycleOrchestrator};
use bitbank_trader::application::orphan_sl_log::OrphanSlLog;
use bitbank_trader::application::position_restorer::PositionRestorer;
use bitbank_trader::application::position_sizer::PositionSizer;
use bitbank_trader::application::risk_evaluator::RiskEvaluator;
use bitbank_trader::application::tp_sl_manager::TpSlManager;
use bitbank_trader::config::{BotConfig, Mode};
use bitbank_trader::domain::ports::ExchangeClient;
use bitbank_trader::domain::types::ExecutionMode;
use bitbank_trader::infrastructure::bitbank_client::BitbankClient;
use bitbank_trader::infrastructure::mock_exchange::MockExchange;
use bitbank_trader::infrastructure::passive_signals::{
    NullFeatureProvider, NullMlPredictor, NullStrategySource,
};
use bitbank_trader::telemetry;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;

fn execution_mode_for(mode: Mode) -> ExecutionMode {
    match mode {
        Mode::Backtest => ExecutionMode::Backtest,
        Mode::Paper => ExecutionMode::Paper,
        Mode::Live => ExecutionMode::Live,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = BotConfig::load(&config_path)
        .with_context(|| format!("loading config from {config_path}"))?;

    tracing::info!(mode = ?config.mode, "starting bitbank-trader");

    let exchange: Option<Arc<dyn ExchangeClient>> = match config.mode {
        Mode::Live => {
            let api_key = std::env::var("BITBANK_API_KEY")
                .context("BITBANK_API_KEY must be set in live mode")?;
            let api_secret = std::env::var("BITBANK_API_SECRET")
                .context("BITBANK_API_SECRET must be set in live mode")?;
            Some(Arc::new(BitbankClient::new(api_key, api_secret)))
        }
        Mode::Paper => Some(Arc::new(MockExchange::new(dec!(14_000_000)))),
        Mode::Backtest => None,
    };

    let symbol = config.trading_constraints.currency_pair.clone();
    let state_dir = PathBuf::from(&config.state.state_dir);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    let drawdown = DrawdownManager::new(
        config.risk.clone(),
        state_dir.join("drawdown_state.json"),
        config.state.force_drawdown_reset,
    );
    let anomaly = AnomalyDetector::new(config.anomaly.clone());
    let sizer = PositionSizer::new(config.kelly.clone());
    let risk = RiskEvaluator::new(config.risk.clone(), drawdown, anomaly, sizer);
    let decider = OrderStrategyDecider::new(
        config.order_execution.clone(),
        config.trading_constraints.clone(),
    );

    let exchange_for_tp_sl = exchange.clone().unwrap_or_else(|| {
        Arc::new(MockExchange::new(dec!(14_000_000))) as Arc<dyn ExchangeClient>
    });
    let tp_sl = TpSlManager::new(
        config.position_management.clone(),
        config.tp_sl_timing.clone(),
        exchange_for_tp_sl,
        symbol.clone(),
    );

    let restorer = match (&config.mode, &exchange) {
        (Mode::Live, Some(exchange)) => {
            Some(PositionRestorer::new(exchange.clone(), symbol.clone()))
        }
        _ => None,
    };

    let orphan_log = OrphanSlLog::new(state_dir.join("orphan_sl_log.json"));

    let execution = ExecutionService::new(
        execution_mode_for(config.mode),
        exchange.clone(),
        config.position_management.clone(),
        config.trading_constraints.clone(),
        dec!(14_000_000),
    );

    let strategy = Arc::new(NullStrategySource);
    let ml = Arc::new(NullMlPredictor);
    let features = Arc::new(NullFeatureProvider);
    let shutdown = ShutdownSignal::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                shutdown.trigger();
            }
        });
    }

    let mut orchestrator = TradingCycleOrchestrator::new(
        config,
        exchange,
        strategy,
        ml,
        features,
        risk,
        decider,
        tp_sl,
        restorer,
        orphan_log,
        execution,
        shutdown,
    );

    orchestrator
        .initialize()
        .await
        .context("initializing trading cycle orchestrator")?;
    orchestrator.run_forever().await
}
