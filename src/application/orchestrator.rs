use crate::application::execution_service::ExecutionService;
use crate::application::order_strategy_decider::OrderStrategyDecider;
use crate::application::orphan_sl_log::OrphanSlLog;
use crate::application::position_restorer::PositionRestorer;
use crate::application::risk_evaluator::{RiskEvaluator, TradeOpportunity};
use crate::application::tp_sl_manager::TpSlManager;
use crate::config::BotConfig;
use crate::domain::ports::{ExchangeClient, FeatureProvider, MlPredictor, StrategySource};
use crate::domain::types::{Action, MarketCondition, OrderSide, TradeDecision, VirtualPosition};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

const MARKET_HISTORY_CAPACITY: usize = 500;

/// Cooperative shutdown flag: `trigger()` from a signal handler, `requested()` polled
/// once per cycle. A `watch` channel rather than an `AtomicBool` so a future version can
/// `.changed().await` it without polling, without changing the public surface now.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn requested(&self) -> bool {
        *self.rx.borrow()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

pub enum CycleOutcome {
    NoTrade,
    Executed { order_id: Option<String>, decision: TradeDecision },
}

/// Owns every stateful component and drives the single-threaded cycle: restore (once,
/// live only) -> sample market -> periodic coverage/orphan checks -> signal -> risk gate
/// -> execute -> schedule verification -> process due verifications -> cleanup.
pub struct TradingCycleOrchestrator {
    config: BotConfig,
    exchange: Option<Arc<dyn ExchangeClient>>,
    strategy: Arc<dyn StrategySource>,
    ml: Arc<dyn MlPredictor>,
    features: Arc<dyn FeatureProvider>,
    risk: RiskEvaluator,
    decider: OrderStrategyDecider,
    tp_sl: TpSlManager,
    restorer: Option<PositionRestorer>,
    orphan_log: OrphanSlLog,
    execution: ExecutionService,
    price_history: VecDeque<f64>,
    volume_history: VecDeque<f64>,
    market_window: VecDeque<MarketCondition>,
    restored_on_startup: bool,
    shutdown: ShutdownSignal,
}

impl TradingCycleOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        exchange: Option<Arc<dyn ExchangeClient>>,
        strategy: Arc<dyn StrategySource>,
        ml: Arc<dyn MlPredictor>,
        features: Arc<dyn FeatureProvider>,
        risk: RiskEvaluator,
        decider: OrderStrategyDecider,
        tp_sl: TpSlManager,
        restorer: Option<PositionRestorer>,
        orphan_log: OrphanSlLog,
        execution: ExecutionService,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
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
            price_history: VecDeque::with_capacity(MARKET_HISTORY_CAPACITY),
            volume_history: VecDeque::with_capacity(MARKET_HISTORY_CAPACITY),
            market_window: VecDeque::with_capacity(MARKET_HISTORY_CAPACITY),
            restored_on_startup: false,
            shutdown,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn restored_on_startup(&self) -> bool {
        self.restored_on_startup
    }

    /// Loads persisted drawdown/orphan state, then restores positions from the exchange
    /// once if in live mode with restore-on-startup enabled.
    pub async fn initialize(&mut self) -> anyhow::Result<()> {
        self.risk.drawdown_manager().load().await?;
        self.orphan_log.load().await?;
        if let Some(restorer) = &self.restorer {
            if self.config.orchestration.restore_on_startup {
                let restored = restorer.restore_positions_from_api().await?;
                for position in restored {
                    self.execution.positions_mut().push(position);
                }
                self.restored_on_startup = true;
            }
        }
        Ok(())
    }

    pub async fn run_forever(&mut self) -> anyhow::Result<()> {
        loop {
            if self.shutdown.requested() {
                tracing::info!("shutdown requested, stopping cycle loop");
                return Ok(());
            }
            match self.run_cycle().await {
                Ok(CycleOutcome::Executed { order_id, decision }) => {
                    tracing::info!(?decision, order_id = ?order_id, "cycle executed a trade");
                }
                Ok(CycleOutcome::NoTrade) => {}
                Err(e) => {
                    tracing::error!(error = %e, "cycle failed, continuing to next interval");
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(self.config.orchestration.cycle_interval_secs))
                .await;
        }
    }

    pub async fn run_cycle(&mut self) -> anyhow::Result<CycleOutcome> {
        let Some(exchange) = self.exchange.clone() else {
            return self.run_cycle_without_exchange().await;
        };
        let symbol = self.config.trading_constraints.currency_pair.clone();

        let ticker = exchange.fetch_ticker(&symbol).await?;
        let sample = MarketCondition {
            timestamp: Utc::now(),
            bid: ticker.bid,
            ask: ticker.ask,
            last: ticker.last,
            volume: rust_decimal::Decimal::ZERO,
            api_latency_ms: 0,
        };
        self.record_sample(sample);

        if self.tp_sl.periodic_check_due() {
            let positions = exchange.fetch_margin_positions(&symbol).await?;
            let real_amounts: Vec<(OrderSide, rust_decimal::Decimal, rust_decimal::Decimal)> = positions
                .iter()
                .map(|p| (p.side.as_order_side(), p.amount, p.average_price))
                .collect();
            self.tp_sl
                .ensure_coverage_for_existing_positions(self.execution.positions_mut(), &real_amounts, None)
                .await;
            self.tp_sl.mark_checked();
        }

        if self.tp_sl.orphan_scan_due() {
            if let Some(restorer) = &self.restorer {
                restorer
                    .scan_orphan_positions(&self.tp_sl, self.execution.positions_mut(), None)
                    .await?;
                restorer.cleanup_orphan_sl_orders(&mut self.orphan_log).await?;
            }
            self.tp_sl.mark_orphan_scanned();
        }

        self.run_cleanup_if_needed().await;

        let signals = self.strategy.generate();
        let Some(signal) = signals.into_iter().find(|s| s.action != Action::Hold) else {
            return Ok(CycleOutcome::NoTrade);
        };
        let ml_confidence = self.ml.confidence(&signal);
        let atr_current = self.features.atr(self.market_window.make_contiguous(), 14);
        let balance = exchange.fetch_balance().await?;

        let price_hist: Vec<f64> = self.price_history.iter().copied().collect();
        let volume_hist: Vec<f64> = self.volume_history.iter().copied().collect();
        let opp = TradeOpportunity {
            signal: &signal,
            ml_confidence,
            market: sample,
            price_history: &price_hist,
            volume_history: &volume_hist,
            current_balance: balance.total,
            atr_current,
            regime: None,
            realized_volatility: Self::realized_volatility(&price_hist),
        };
        let mut evaluation = self
            .risk
            .evaluate_trade_opportunity(opp, self.config.position_management.min_trade_size)
            .await;

        if evaluation.decision == TradeDecision::Denied {
            return Ok(CycleOutcome::NoTrade);
        }

        let exec_config = self
            .decider
            .get_optimal_execution_config(&evaluation, exchange.as_ref())
            .await;
        evaluation.entry_price = exec_config.price.or(Some(sample.last));

        let result = self.execution.execute_trade(&evaluation, &self.tp_sl).await;
        if let Some(orphan) = result.pending_orphan_sl.clone() {
            if let Err(e) = self.orphan_log.append(orphan).await {
                tracing::warn!(error = %e, "failed to persist orphaned SL record");
            }
        }
        if result.success {
            if let Some(order_id) = &result.order_id {
                if let Some(position) = self
                    .execution
                    .positions()
                    .iter()
                    .find(|p| &p.order_id == order_id)
                    .cloned()
                {
                    let verification = self.execution.schedule_verification_for(
                        order_id,
                        &position,
                        self.config.tp_sl_timing.verification_delay_secs,
                        &symbol,
                    );
                    self.tp_sl.schedule_verification(verification);
                }
            }
        }

        self.process_due_verifications(exchange.as_ref()).await?;

        Ok(CycleOutcome::Executed {
            order_id: result.order_id,
            decision: evaluation.decision,
        })
    }

    /// Backtest/paper cycles with no exchange client still run the signal -> risk ->
    /// execute pipeline, just without any reconciliation or orphan handling.
    async fn run_cycle_without_exchange(&mut self) -> anyhow::Result<CycleOutcome> {
        let signals = self.strategy.generate();
        let Some(signal) = signals.into_iter().find(|s| s.action != Action::Hold) else {
            return Ok(CycleOutcome::NoTrade);
        };
        let ml_confidence = self.ml.confidence(&signal);
        let sample = MarketCondition {
            timestamp: Utc::now(),
            bid: rust_decimal::Decimal::ZERO,
            ask: rust_decimal::Decimal::ZERO,
            last: rust_decimal::Decimal::ZERO,
            volume: rust_decimal::Decimal::ZERO,
            api_latency_ms: 0,
        };
        let opp = TradeOpportunity {
            signal: &signal,
            ml_confidence,
            market: sample,
            price_history: &[],
            volume_history: &[],
            current_balance: self.risk.drawdown_manager().current_balance(),
            atr_current: None,
            regime: None,
            realized_volatility: 0.0,
        };
        let mut evaluation = self
            .risk
            .evaluate_trade_opportunity(opp, self.config.position_management.min_trade_size)
            .await;
        if evaluation.decision == TradeDecision::Denied {
            return Ok(CycleOutcome::NoTrade);
        }
        evaluation.entry_price = Some(sample.last);
        let result = self.execution.execute_trade(&evaluation, &self.tp_sl).await;
        Ok(CycleOutcome::Executed {
            order_id: result.order_id,
            decision: evaluation.decision,
        })
    }

    async fn run_cleanup_if_needed(&mut self) {
        let Some(restorer) = &self.restorer else {
            return;
        };
        let cleanup = &self.config.cleanup;
        match restorer
            .cleanup_old_unfilled_orders(
                self.execution.positions(),
                cleanup.unfilled_order_threshold_count,
                cleanup.unfilled_order_max_age_hours,
            )
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::info!(cancelled = n, "cleaned up stale unfilled orders"),
            Err(e) => tracing::warn!(error = %e, "stale order cleanup failed"),
        }
    }

    /// For each verification whose delay has elapsed: re-fetch the margin position for its
    /// side. A gone (or zero-amount) position means the TP or SL filled normally and there
    /// is nothing to do. Otherwise the position is still open, so delegate to the same
    /// coverage check the periodic path uses to re-place any missing TP/SL.
    async fn process_due_verifications(&mut self, exchange: &dyn ExchangeClient) -> anyhow::Result<()> {
        for verification in self.tp_sl.due_verifications() {
            let positions = exchange.fetch_margin_positions(&verification.symbol).await?;
            let Some(position) = positions
                .iter()
                .find(|p| p.side.as_order_side() == verification.side && p.amount > rust_decimal::Decimal::ZERO)
            else {
                continue;
            };

            let real_amounts = vec![(verification.side, position.amount, position.average_price)];
            self.tp_sl
                .ensure_coverage_for_existing_positions(self.execution.positions_mut(), &real_amounts, None)
                .await;
        }
        Ok(())
    }

    fn record_sample(&mut self, sample: MarketCondition) {
        self.market_window.push_back(sample);
        if self.market_window.len() > MARKET_HISTORY_CAPACITY {
            self.market_window.pop_front();
        }
        self.price_history.push_back(sample.last.to_f64().unwrap_or(0.0));
        if self.price_history.len() > MARKET_HISTORY_CAPACITY {
            self.price_history.pop_front();
        }
        self.volume_history.push_back(sample.volume.to_f64().unwrap_or(0.0));
        if self.volume_history.len() > MARKET_HISTORY_CAPACITY {
            self.volume_history.pop_front();
        }
    }

    fn realized_volatility(prices: &[f64]) -> f64 {
        if prices.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = prices
            .windows(2)
            .map(|w| if w[0] != 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        variance.sqrt()
    }

    pub fn positions(&self) -> &[VirtualPosition] {
        self.execution.positions()
    }
}
