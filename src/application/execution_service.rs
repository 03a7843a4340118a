use crate::application::tp_sl_manager::TpSlManager;
use crate::config::{PositionManagementConfig, TradingConstraintsConfig};
use crate::critical;
use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeClient;
use crate::domain::types::{
    CreateOrderRequest, ExecutionMode, ExecutionResult, ExecutionStatus, OrderType,
    PendingTpSlVerification, TradeDecision, TradeEvaluation, VirtualPosition,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Owns the in-memory `VirtualPosition` list and runs the atomic entry protocol:
/// validate → dispatch by mode → (live) cleanup, strategy decision, recalculation,
/// SL+TP placement with rollback on partial failure.
pub struct ExecutionService {
    mode: ExecutionMode,
    exchange: Option<Arc<dyn ExchangeClient>>,
    position_config: PositionManagementConfig,
    constraints: TradingConstraintsConfig,
    positions: Vec<VirtualPosition>,
    order_counter: AtomicU64,
    reference_price: Decimal,
    pub executed_trades: u64,
}

impl ExecutionService {
    pub fn new(
        mode: ExecutionMode,
        exchange: Option<Arc<dyn ExchangeClient>>,
        position_config: PositionManagementConfig,
        constraints: TradingConstraintsConfig,
        reference_price: Decimal,
    ) -> Self {
        Self {
            mode,
            exchange,
            position_config,
            constraints,
            positions: Vec::new(),
            order_counter: AtomicU64::new(0),
            reference_price,
            executed_trades: 0,
        }
    }

    pub fn positions(&self) -> &[VirtualPosition] {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut Vec<VirtualPosition> {
        &mut self.positions
    }

    fn next_synthetic_id(&self, prefix: &str) -> String {
        let n = self.order_counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}_{n}")
    }

    /// 4.8.1: the single entry point the orchestrator calls on APPROVED/CONDITIONAL.
    pub async fn execute_trade(
        &mut self,
        evaluation: &TradeEvaluation,
        tp_sl: &TpSlManager,
    ) -> ExecutionResult {
        if evaluation.decision == TradeDecision::Denied {
            return ExecutionResult::no_op();
        }

        let min_trade_size = self.position_config.min_trade_size;
        let amount = if self.position_config.dynamic_position_sizing_enabled {
            evaluation.position_size.max(min_trade_size)
        } else {
            evaluation.position_size
        };

        let result = match self.mode {
            ExecutionMode::Backtest => self.execute_backtest(evaluation, amount),
            ExecutionMode::Paper => self.execute_paper(evaluation, amount),
            ExecutionMode::Live => self.execute_live(evaluation, amount, tp_sl).await,
        };
        if result.success {
            self.executed_trades += 1;
        }
        result
    }

    fn execute_backtest(&mut self, evaluation: &TradeEvaluation, amount: Decimal) -> ExecutionResult {
        let price = evaluation.entry_price.unwrap_or(self.reference_price);
        ExecutionResult {
            success: true,
            status: ExecutionStatus::Filled,
            order_id: Some(self.next_synthetic_id("backtest")),
            price,
            amount,
            fee: Decimal::ZERO,
            error: None,
            pending_orphan_sl: None,
        }
    }

    fn execute_paper(&mut self, evaluation: &TradeEvaluation, amount: Decimal) -> ExecutionResult {
        let price = evaluation.entry_price.unwrap_or(self.reference_price);
        let order_id = self.next_synthetic_id("paper");
        self.positions.push(VirtualPosition {
            order_id: order_id.clone(),
            side: evaluation.side,
            amount,
            entry_price: price,
            timestamp: Utc::now(),
            take_profit: evaluation.take_profit,
            stop_loss: evaluation.stop_loss,
            tp_order_id: Some(format!("{order_id}_tp")),
            sl_order_id: Some(format!("{order_id}_sl")),
            sl_placed_at: Some(Utc::now()),
            restored: false,
            recovered: false,
        });
        ExecutionResult {
            success: true,
            status: ExecutionStatus::Filled,
            order_id: Some(order_id),
            price,
            amount,
            fee: Decimal::ZERO,
            error: None,
            pending_orphan_sl: None,
        }
    }

    async fn execute_live(
        &mut self,
        evaluation: &TradeEvaluation,
        amount: Decimal,
        tp_sl: &TpSlManager,
    ) -> ExecutionResult {
        let Some(exchange) = self.exchange.clone() else {
            return ExecutionResult::failed("live mode requires an exchange client");
        };

        tp_sl.cleanup_old_tp_sl_before_entry(evaluation.side, &self.positions).await;

        let req = CreateOrderRequest {
            symbol: self.constraints.currency_pair.clone(),
            side: evaluation.side,
            order_type: OrderType::Market,
            amount,
            price: None,
            is_closing_order: false,
        };
        let ack = match exchange.create_order(req).await {
            Ok(ack) => ack,
            Err(ExchangeError::InsufficientMargin) => {
                return ExecutionResult::rejected("insufficient margin");
            }
            Err(e) => return ExecutionResult::failed(e.to_string()),
        };

        let entry_price = ack.filled_price.unwrap_or(ack.price);
        let atr_current = evaluation
            .market_condition_decimal("atr_current")
            .and_then(|d| d.to_string().parse::<f64>().ok());
        let regime = evaluation.market_conditions.get("regime").cloned();

        let (tp_price, sl_price) = match tp_sl.calculate_tp_sl_for_live_trade(
            evaluation.side,
            entry_price,
            atr_current,
            None,
            regime.as_deref(),
        ) {
            Ok(prices) => prices,
            Err(e) => {
                let orphan = self.rollback(&ack.id, None, None, evaluation.side, amount, tp_sl).await;
                return ExecutionResult::failed(format!("TP/SL recalculation failed: {e}"))
                    .with_pending_orphan_sl(orphan);
            }
        };

        let sl_result = tp_sl
            .place_sl_with_retry(evaluation.side, amount, entry_price, sl_price)
            .await;
        let sl = match sl_result {
            Ok(sl) => sl,
            Err(e) => {
                let orphan = self.rollback(&ack.id, None, None, evaluation.side, amount, tp_sl).await;
                return ExecutionResult::failed(format!("stop-loss placement failed: {e}"))
                    .with_pending_orphan_sl(orphan);
            }
        };

        let tp_result = tp_sl.place_tp_with_retry(evaluation.side, amount, tp_price).await;
        let tp = match tp_result {
            Ok(tp) => tp,
            Err(e) => {
                let orphan = self
                    .rollback(&ack.id, None, Some(&sl.0), evaluation.side, amount, tp_sl)
                    .await;
                return ExecutionResult::failed(format!("take-profit placement failed: {e}"))
                    .with_pending_orphan_sl(orphan);
            }
        };

        let position = VirtualPosition {
            order_id: ack.id.clone(),
            side: evaluation.side,
            amount,
            entry_price,
            timestamp: Utc::now(),
            take_profit: Some(tp_price),
            stop_loss: Some(sl_price),
            tp_order_id: tp.map(|(id, _)| id),
            sl_order_id: Some(sl.0.clone()),
            sl_placed_at: Some(sl.2),
            restored: false,
            recovered: false,
        };
        if position.requires_full_coverage() && !position.has_full_coverage() {
            let orphan = self
                .rollback(&ack.id, position.tp_order_id.as_deref(), Some(&sl.0), evaluation.side, amount, tp_sl)
                .await;
            return ExecutionResult::failed("atomic entry left a partial position")
                .with_pending_orphan_sl(orphan);
        }
        self.positions.push(position);

        ExecutionResult {
            success: true,
            status: ExecutionStatus::Filled,
            order_id: Some(ack.id),
            price: entry_price,
            amount,
            fee: ack.fee,
            error: None,
            pending_orphan_sl: None,
        }
    }

    async fn rollback(
        &self,
        entry_order_id: &str,
        tp_order_id: Option<&str>,
        sl_order_id: Option<&str>,
        side: crate::domain::types::OrderSide,
        amount: Decimal,
        tp_sl: &TpSlManager,
    ) -> Option<crate::domain::types::OrphanSlRecord> {
        tp_sl
            .rollback_entry(entry_order_id, tp_order_id, sl_order_id, side, amount)
            .await
    }

    pub fn schedule_verification_for(&self, order_id: &str, position: &VirtualPosition, verification_delay_secs: i64, symbol: &str) -> PendingTpSlVerification {
        PendingTpSlVerification {
            scheduled_at: Utc::now(),
            verify_after: Utc::now() + Duration::seconds(verification_delay_secs),
            entry_order_id: order_id.to_string(),
            side: position.side,
            amount: position.amount,
            entry_price: position.entry_price,
            expected_tp_order_id: position.tp_order_id.clone(),
            expected_sl_order_id: position.sl_order_id.clone(),
            symbol: symbol.to_string(),
        }
    }

    pub fn get_trading_statistics(&self) -> TradingStatistics {
        TradingStatistics {
            executed_trades: self.executed_trades,
            open_positions: self.positions.len(),
        }
    }
}

pub struct TradingStatistics {
    pub executed_trades: u64,
    pub open_positions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TpSlTimingConfig;
    use crate::domain::types::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn evaluation(side: OrderSide) -> TradeEvaluation {
        TradeEvaluation {
            decision: TradeDecision::Approved,
            side,
            risk_score: 0.1,
            position_size: dec!(0.0001),
            stop_loss: Some(dec!(13_500_000)),
            take_profit: Some(dec!(14_500_000)),
            confidence_level: 0.65,
            kelly_recommendation: dec!(0.0001),
            drawdown_status: TradingStatus::Active,
            warnings: vec![],
            denial_reasons: vec![],
            market_conditions: HashMap::new(),
            entry_price: Some(dec!(14_000_000)),
            emergency_exit: false,
        }
    }

    fn tp_sl_stub() -> TpSlManager {
        TpSlManager::new(
            PositionManagementConfig::default(),
            TpSlTimingConfig::default(),
            Arc::new(NoopExchange),
            "btc_jpy".to_string(),
        )
    }

    struct NoopExchange;
    #[async_trait::async_trait]
    impl ExchangeClient for NoopExchange {
        async fn fetch_ticker(&self, _s: &str) -> Result<Ticker, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_order_book(&self, _s: &str) -> Result<OrderBook, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_margin_positions(&self, _s: &str) -> Result<Vec<MarginPosition>, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_active_orders(&self, _s: &str, _l: u32) -> Result<Vec<ActiveOrder>, ExchangeError> {
            unimplemented!()
        }
        async fn create_order(&self, _r: CreateOrderRequest) -> Result<OrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn create_take_profit_order(&self, _r: CreateTpRequest) -> Result<OrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn create_stop_loss_order(&self, _r: CreateSlRequest) -> Result<SlOrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _id: &str, _s: &str) -> Result<CancelStatus, ExchangeError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn backtest_fills_synthetically_with_no_network() {
        let mut service = ExecutionService::new(
            ExecutionMode::Backtest,
            None,
            PositionManagementConfig::default(),
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let tp_sl = tp_sl_stub();
        let result = service.execute_trade(&evaluation(OrderSide::Buy), &tp_sl).await;
        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Filled);
        assert_eq!(result.fee, Decimal::ZERO);
    }

    #[tokio::test]
    async fn paper_mode_creates_virtual_position_with_tp_sl() {
        let mut service = ExecutionService::new(
            ExecutionMode::Paper,
            None,
            PositionManagementConfig::default(),
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let tp_sl = tp_sl_stub();
        let result = service.execute_trade(&evaluation(OrderSide::Buy), &tp_sl).await;
        assert!(result.success);
        assert_eq!(service.positions().len(), 1);
        assert!(service.positions()[0].has_full_coverage());
    }

    #[tokio::test]
    async fn denied_evaluation_is_a_no_op() {
        let mut service = ExecutionService::new(
            ExecutionMode::Paper,
            None,
            PositionManagementConfig::default(),
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let mut eval = evaluation(OrderSide::Buy);
        eval.decision = TradeDecision::Denied;
        let tp_sl = tp_sl_stub();
        let result = service.execute_trade(&eval, &tp_sl).await;
        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(service.positions().is_empty());
    }

    #[tokio::test]
    async fn min_trade_size_floor_applies_when_dynamic_sizing_enabled() {
        let mut service = ExecutionService::new(
            ExecutionMode::Paper,
            None,
            PositionManagementConfig::default(),
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let mut eval = evaluation(OrderSide::Buy);
        eval.position_size = dec!(0.00001);
        let tp_sl = tp_sl_stub();
        let result = service.execute_trade(&eval, &tp_sl).await;
        assert_eq!(result.amount, PositionManagementConfig::default().min_trade_size);
    }

    #[tokio::test]
    async fn min_trade_size_floor_skipped_when_dynamic_sizing_disabled() {
        let mut config = PositionManagementConfig::default();
        config.dynamic_position_sizing_enabled = false;
        let mut service = ExecutionService::new(
            ExecutionMode::Paper,
            None,
            config,
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let mut eval = evaluation(OrderSide::Buy);
        eval.position_size = dec!(0.00001);
        let tp_sl = tp_sl_stub();
        let result = service.execute_trade(&eval, &tp_sl).await;
        assert_eq!(result.amount, dec!(0.00001));
    }

    /// Stop-loss placement succeeds but every cancel fails, so a take-profit failure
    /// forces rollback into an orphaned SL rather than a clean cancel.
    struct FlakyCancelExchange;
    #[async_trait::async_trait]
    impl ExchangeClient for FlakyCancelExchange {
        async fn fetch_ticker(&self, _s: &str) -> Result<Ticker, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_order_book(&self, _s: &str) -> Result<OrderBook, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_margin_positions(&self, _s: &str) -> Result<Vec<MarginPosition>, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_active_orders(&self, _s: &str, _l: u32) -> Result<Vec<ActiveOrder>, ExchangeError> {
            Ok(vec![])
        }
        async fn create_order(&self, r: CreateOrderRequest) -> Result<OrderAck, ExchangeError> {
            Ok(OrderAck {
                id: "entry1".to_string(),
                price: dec!(14_000_000),
                amount: r.amount,
                filled_price: Some(dec!(14_000_000)),
                filled_amount: Some(r.amount),
                fee: Decimal::ZERO,
            })
        }
        async fn create_take_profit_order(&self, _r: CreateTpRequest) -> Result<OrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn create_stop_loss_order(&self, r: CreateSlRequest) -> Result<SlOrderAck, ExchangeError> {
            Ok(SlOrderAck {
                id: "sl1".to_string(),
                trigger_price: r.stop_loss_price,
            })
        }
        async fn cancel_order(&self, _id: &str, _s: &str) -> Result<CancelStatus, ExchangeError> {
            Err(ExchangeError::Other("exchange unavailable".into()))
        }
    }

    #[tokio::test]
    async fn partial_coverage_rollback_surfaces_an_orphaned_sl_for_the_caller_to_persist() {
        let mut config = PositionManagementConfig::default();
        config.take_profit.enabled = false;
        let mut service = ExecutionService::new(
            ExecutionMode::Live,
            Some(Arc::new(FlakyCancelExchange)),
            config.clone(),
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let tp_sl = TpSlManager::new(
            config,
            TpSlTimingConfig::default(),
            Arc::new(FlakyCancelExchange),
            "btc_jpy".to_string(),
        );
        let mut eval = evaluation(OrderSide::Buy);
        eval.market_conditions.insert("atr_current".to_string(), "50000".to_string());

        let result = service.execute_trade(&eval, &tp_sl).await;

        assert!(!result.success);
        assert!(service.positions().is_empty());
        let orphan = result.pending_orphan_sl.expect("expected a surfaced orphan SL record");
        assert_eq!(orphan.sl_order_id, "sl1");
        assert_eq!(orphan.position_side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn live_mode_without_exchange_fails_without_panicking() {
        let mut service = ExecutionService::new(
            ExecutionMode::Live,
            None,
            PositionManagementConfig::default(),
            TradingConstraintsConfig::default(),
            dec!(14_000_000),
        );
        let tp_sl = tp_sl_stub();
        let result = service.execute_trade(&evaluation(OrderSide::Buy), &tp_sl).await;
        assert!(!result.success);
        assert_eq!(result.status, ExecutionStatus::Failed);
    }
}
