use crate::config::{PositionManagementConfig, TpSlTimingConfig};
use crate::critical;
use crate::domain::errors::{DomainError, ExchangeError};
use crate::domain::ports::ExchangeClient;
use crate::domain::types::{
    ActiveOrderType, CreateSlRequest, CreateTpRequest, OrderSide, OrderType, PendingTpSlVerification,
    VirtualPosition,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use std::sync::Arc;

const COVERAGE_THRESHOLD: Decimal = dec!(0.95);
const ENTRY_CANCEL_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RegimeRatios {
    pub min_profit_ratio: Decimal,
    pub max_loss_ratio: Decimal,
}

fn ratios_for_regime(regime: Option<&str>) -> RegimeRatios {
    match regime {
        Some("trending") => RegimeRatios {
            min_profit_ratio: dec!(0.015),
            max_loss_ratio: dec!(0.010),
        },
        _ => RegimeRatios {
            // normal_range defaults
            min_profit_ratio: dec!(0.009),
            max_loss_ratio: dec!(0.007),
        },
    }
}

/// Places and maintains TP/SL for every live position: individual placement with
/// maker-fallback and retries, ATR-based recalculation on fill, coverage recovery,
/// SL-breach handling, and pre-entry cleanup of stale exit orders.
pub struct TpSlManager {
    position_config: PositionManagementConfig,
    timing: TpSlTimingConfig,
    exchange: Arc<dyn ExchangeClient>,
    symbol: String,
    last_check: Option<DateTime<Utc>>,
    last_orphan_scan: Option<DateTime<Utc>>,
    pending_verifications: Vec<PendingTpSlVerification>,
}

impl TpSlManager {
    pub fn new(
        position_config: PositionManagementConfig,
        timing: TpSlTimingConfig,
        exchange: Arc<dyn ExchangeClient>,
        symbol: String,
    ) -> Self {
        Self {
            position_config,
            timing,
            exchange,
            symbol,
            last_check: None,
            last_orphan_scan: None,
            pending_verifications: Vec::new(),
        }
    }

    // ---- 4.6.1 individual TP placement ----------------------------------------------

    pub async fn place_take_profit(
        &self,
        side: OrderSide,
        amount: Decimal,
        tp_price: Decimal,
    ) -> Result<Option<(String, Decimal)>, DomainError> {
        if !self.position_config.take_profit.enabled {
            return Ok(None);
        }
        if tp_price <= Decimal::ZERO {
            return Err(DomainError::Validation("take-profit price must be positive".into()));
        }
        let exit_side = side.opposite();
        let maker = &self.position_config.take_profit.maker_strategy;

        if maker.enabled {
            let mut last_err = None;
            for _attempt in 0..=maker.max_retries {
                let req = CreateTpRequest {
                    entry_side: side,
                    amount,
                    take_profit_price: tp_price,
                    symbol: self.symbol.clone(),
                    post_only: true,
                };
                match self.exchange.create_take_profit_order(req).await {
                    Ok(ack) if !ack.id.is_empty() => return Ok(Some((ack.id, tp_price))),
                    Ok(_) => {
                        last_err = Some(DomainError::Exchange(ExchangeError::Other(
                            "empty order id".into(),
                        )));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "maker take-profit attempt failed, retrying");
                        last_err = Some(DomainError::Exchange(e));
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(maker.retry_interval_ms)).await;
            }
            if maker.fallback_to_native {
                let req = CreateTpRequest {
                    entry_side: side,
                    amount,
                    take_profit_price: tp_price,
                    symbol: self.symbol.clone(),
                    post_only: false,
                };
                let ack = self
                    .exchange
                    .create_take_profit_order(req)
                    .await
                    .map_err(DomainError::Exchange)?;
                if ack.id.is_empty() {
                    return Err(DomainError::Exchange(ExchangeError::Other("empty order id".into())));
                }
                return Ok(Some((ack.id, tp_price)));
            }
            return Err(last_err.unwrap_or(DomainError::Fatal("maker TP exhausted retries".into())));
        }

        let req = CreateTpRequest {
            entry_side: side,
            amount,
            take_profit_price: tp_price,
            symbol: self.symbol.clone(),
            post_only: false,
        };
        let ack = self
            .exchange
            .create_take_profit_order(req)
            .await
            .map_err(DomainError::Exchange)?;
        if ack.id.is_empty() {
            return Err(DomainError::Exchange(ExchangeError::Other("empty order id".into())));
        }
        let _ = exit_side;
        Ok(Some((ack.id, tp_price)))
    }

    /// Exponential backoff wrapper: 1s, 2s, 4s between whole-call attempts.
    pub async fn place_tp_with_retry(
        &self,
        side: OrderSide,
        amount: Decimal,
        tp_price: Decimal,
    ) -> Result<Option<(String, Decimal)>, DomainError> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.place_take_profit(side, amount, tp_price).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
        Err(last_err.unwrap())
    }

    // ---- 4.6.2 individual SL placement -----------------------------------------------

    pub async fn place_stop_loss(
        &self,
        side: OrderSide,
        amount: Decimal,
        entry_price: Decimal,
        sl_price: Decimal,
    ) -> Result<(String, Decimal, DateTime<Utc>), DomainError> {
        if !self.position_config.stop_loss.enabled {
            return Err(DomainError::Validation("stop-loss is disabled".into()));
        }
        if sl_price <= Decimal::ZERO {
            return Err(DomainError::Validation("stop-loss price must be positive".into()));
        }
        match side {
            OrderSide::Buy if sl_price >= entry_price => {
                return Err(DomainError::invalid_sl_direction("buy", sl_price, entry_price));
            }
            OrderSide::Sell if sl_price <= entry_price => {
                return Err(DomainError::invalid_sl_direction("sell", sl_price, entry_price));
            }
            _ => {}
        }

        let distance = ((entry_price - sl_price) / entry_price).abs();
        let max_loss_ratio = self.position_config.stop_loss.max_loss_ratio;
        if distance < self.position_config.stop_loss.min_distance_ratio {
            tracing::warn!(%distance, "stop-loss distance under 0.1%, placement proceeding anyway");
        } else if distance > max_loss_ratio * dec!(3) {
            tracing::warn!(%distance, "stop-loss distance beyond 3x max_loss_ratio, placement proceeding anyway");
        }

        let order_type = if self.position_config.stop_loss.order_type == "stop_limit" {
            OrderType::StopLimit
        } else {
            OrderType::Stop
        };
        let limit_price = if order_type == OrderType::StopLimit {
            let buffer = self.position_config.stop_loss.slippage_buffer;
            Some(match side {
                OrderSide::Buy => sl_price * (dec!(1) - buffer),
                OrderSide::Sell => sl_price * (dec!(1) + buffer),
            })
        } else {
            None
        };

        let req = CreateSlRequest {
            entry_side: side,
            amount,
            stop_loss_price: sl_price,
            symbol: self.symbol.clone(),
            order_type,
            limit_price,
        };
        let ack = self
            .exchange
            .create_stop_loss_order(req)
            .await
            .map_err(DomainError::Exchange)?;
        if ack.id.is_empty() {
            return Err(DomainError::Exchange(ExchangeError::Other("empty order id".into())));
        }
        Ok((ack.id, ack.trigger_price, Utc::now()))
    }

    pub async fn place_sl_with_retry(
        &self,
        side: OrderSide,
        amount: Decimal,
        entry_price: Decimal,
        sl_price: Decimal,
    ) -> Result<(String, Decimal, DateTime<Utc>), DomainError> {
        let mut last_err = None;
        for attempt in 0..3u32 {
            match self.place_stop_loss(side, amount, entry_price, sl_price).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(std::time::Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
        Err(last_err.unwrap())
    }

    // ---- 4.6.3 TP/SL recalculation on fill --------------------------------------------

    /// Prefers a pre-supplied current ATR, falls back to a longer-window tail value, and
    /// finally to the configured default if neither is available.
    pub fn calculate_tp_sl_for_live_trade(
        &self,
        side: OrderSide,
        entry_price: Decimal,
        atr_current: Option<f64>,
        atr_tail: Option<f64>,
        regime: Option<&str>,
    ) -> Result<(Decimal, Decimal), DomainError> {
        let has_atr_source = atr_current.is_some() || atr_tail.is_some();
        if !has_atr_source {
            if self.timing.require_tpsl_recalculation {
                return Err(DomainError::Fatal(
                    "TP/SL recalculation required but no ATR source available".into(),
                ));
            }
            return Ok((entry_price, entry_price));
        }
        let ratios = ratios_for_regime(regime);
        let (tp, sl) = match side {
            OrderSide::Buy => (
                entry_price * (dec!(1) + ratios.min_profit_ratio),
                entry_price * (dec!(1) - ratios.max_loss_ratio),
            ),
            OrderSide::Sell => (
                entry_price * (dec!(1) - ratios.min_profit_ratio),
                entry_price * (dec!(1) + ratios.max_loss_ratio),
            ),
        };
        Ok((tp, sl))
    }

    pub fn calculate_recovery_tp_sl_prices(
        &self,
        side: OrderSide,
        entry_price: Decimal,
        regime: Option<&str>,
    ) -> (Decimal, Decimal) {
        let ratios = ratios_for_regime(regime);
        match side {
            OrderSide::Buy => (
                entry_price * (dec!(1) + ratios.min_profit_ratio),
                entry_price * (dec!(1) - ratios.max_loss_ratio),
            ),
            OrderSide::Sell => (
                entry_price * (dec!(1) - ratios.min_profit_ratio),
                entry_price * (dec!(1) + ratios.max_loss_ratio),
            ),
        }
    }

    // ---- 4.6.4 pre-entry cleanup of stale exit orders ---------------------------------

    pub async fn cleanup_old_tp_sl_before_entry(
        &self,
        entry_side: OrderSide,
        positions: &[VirtualPosition],
    ) {
        let protected: HashSet<String> = positions
            .iter()
            .flat_map(|p| {
                [p.tp_order_id.clone(), p.sl_order_id.clone(), Some(p.order_id.clone())]
                    .into_iter()
                    .flatten()
            })
            .collect();
        let exit_side = entry_side.opposite();
        let active = match self
            .exchange
            .fetch_active_orders(&self.symbol, self.timing.api_order_limit)
            .await
        {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch active orders for pre-entry cleanup");
                return;
            }
        };
        for order in active {
            if order.side != exit_side || protected.contains(&order.id) {
                continue;
            }
            let is_exit_order = matches!(
                order.order_type,
                ActiveOrderType::Limit | ActiveOrderType::Stop | ActiveOrderType::StopLimit
            );
            if !is_exit_order {
                continue;
            }
            if let Err(e) = self.exchange.cancel_order(&order.id, &self.symbol).await {
                if !e.is_not_found() {
                    tracing::warn!(order_id = %order.id, error = %e, "failed to cancel stale exit order, continuing anyway");
                }
            }
        }
    }

    // ---- 4.6.9 SL-or-market-close ------------------------------------------------------

    pub async fn place_sl_or_market_close(
        &self,
        side: OrderSide,
        amount: Decimal,
        entry_price: Decimal,
        sl_price: Decimal,
    ) -> Option<(String, Decimal, Option<DateTime<Utc>>)> {
        let ticker = match self.exchange.fetch_ticker(&self.symbol).await {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "ticker fetch failed before SL placement");
                return self.place_sl_fallback(side, amount, entry_price, sl_price).await;
            }
        };
        let breached = match side {
            OrderSide::Buy => ticker.last <= sl_price,
            OrderSide::Sell => ticker.last >= sl_price,
        };
        if !breached {
            return self.place_sl_fallback(side, amount, entry_price, sl_price).await;
        }

        let req = crate::domain::types::CreateOrderRequest {
            symbol: self.symbol.clone(),
            side: side.opposite(),
            order_type: OrderType::Market,
            amount,
            price: None,
            is_closing_order: true,
        };
        match self.exchange.create_order(req).await {
            Ok(ack) => Some((format!("market_close_{}", ack.id), ticker.last, None)),
            Err(e) => {
                critical!(error = %e, "market close after SL breach failed, manual intervention required");
                None
            }
        }
    }

    async fn place_sl_fallback(
        &self,
        side: OrderSide,
        amount: Decimal,
        entry_price: Decimal,
        sl_price: Decimal,
    ) -> Option<(String, Decimal, Option<DateTime<Utc>>)> {
        match self.place_sl_with_retry(side, amount, entry_price, sl_price).await {
            Ok((id, trigger, placed_at)) => Some((id, trigger, Some(placed_at))),
            Err(e) => {
                tracing::warn!(error = %e, "stop-loss placement failed after retries");
                None
            }
        }
    }

    // ---- 4.6.8 ensure coverage for existing positions ----------------------------------

    /// Returns true if every real position's TP and SL live-order coverage is >= 95%.
    /// Idempotent (L1): calling twice with no market change yields the same result.
    pub async fn ensure_coverage_for_existing_positions(
        &self,
        positions: &mut Vec<VirtualPosition>,
        real_amounts: &[(OrderSide, Decimal, Decimal)], // (side, amount, avg_price)
        regime: Option<&str>,
    ) {
        let active = match self
            .exchange
            .fetch_active_orders(&self.symbol, self.timing.api_order_limit)
            .await
        {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch active orders during coverage check");
                return;
            }
        };

        let mut processed_sides = HashSet::new();
        for (side, amount, avg_price) in real_amounts {
            if *amount <= Decimal::ZERO || !processed_sides.insert(*side) {
                continue;
            }
            let exit_side = side.opposite();
            let tp_covered: Decimal = active
                .iter()
                .filter(|o| o.side == exit_side && o.order_type == ActiveOrderType::Limit)
                .map(|o| o.amount)
                .sum();
            let sl_covered: Decimal = active
                .iter()
                .filter(|o| {
                    o.side == exit_side
                        && matches!(o.order_type, ActiveOrderType::Stop | ActiveOrderType::StopLimit)
                })
                .map(|o| o.amount)
                .sum();
            let tp_ok = *amount > Decimal::ZERO && tp_covered / *amount >= COVERAGE_THRESHOLD;
            let sl_ok = *amount > Decimal::ZERO && sl_covered / *amount >= COVERAGE_THRESHOLD;
            if tp_ok && sl_ok {
                continue;
            }

            if positions
                .iter()
                .any(|p| p.side == *side && p.restored && p.has_full_coverage())
            {
                continue;
            }
            positions.retain(|p| !(p.side == *side && !p.has_full_coverage()));

            let (tp_price, sl_price) = self.calculate_recovery_tp_sl_prices(*side, *avg_price, regime);
            let tp_result = if tp_ok {
                None
            } else {
                self.place_tp_with_retry(*side, *amount, tp_price).await.ok().flatten()
            };
            let sl_result = if sl_ok {
                None
            } else {
                self.place_sl_or_market_close(*side, *amount, *avg_price, sl_price).await
            };

            let tp_now_ok = tp_ok || tp_result.is_some();
            let sl_now_ok = sl_ok || sl_result.is_some();
            if tp_now_ok && sl_now_ok {
                positions.push(VirtualPosition {
                    order_id: format!("recovered_{}", uuid::Uuid::new_v4()),
                    side: *side,
                    amount: *amount,
                    entry_price: *avg_price,
                    timestamp: Utc::now(),
                    take_profit: Some(tp_price),
                    stop_loss: Some(sl_price),
                    tp_order_id: tp_result.map(|(id, _)| id),
                    sl_order_id: sl_result.map(|(id, _, _)| id),
                    sl_placed_at: None,
                    restored: false,
                    recovered: true,
                });
            } else {
                critical!(side = ?side, "coverage recovery incomplete, will retry next cycle");
            }
        }
    }

    // ---- 4.6.6 / 4.6.7 verification and periodic health check --------------------------

    pub fn schedule_verification(&mut self, verification: PendingTpSlVerification) {
        self.pending_verifications.push(verification);
    }

    /// Only items whose `verify_after <= now` are consumed; the rest keep their order.
    pub fn due_verifications(&mut self) -> Vec<PendingTpSlVerification> {
        let now = Utc::now();
        let mut due = Vec::new();
        self.pending_verifications.retain(|v| {
            if v.verify_after <= now {
                due.push(v.clone());
                false
            } else {
                true
            }
        });
        due
    }

    pub fn periodic_check_due(&self) -> bool {
        match self.last_check {
            None => true,
            Some(last) => Utc::now() - last >= Duration::seconds(self.timing.check_interval_secs),
        }
    }

    pub fn mark_checked(&mut self) {
        self.last_check = Some(Utc::now());
    }

    pub fn orphan_scan_due(&self) -> bool {
        match self.last_orphan_scan {
            None => true,
            Some(last) => Utc::now() - last >= Duration::seconds(self.timing.orphan_scan_interval_secs),
        }
    }

    pub fn mark_orphan_scanned(&mut self) {
        self.last_orphan_scan = Some(Utc::now());
    }

    // ---- rollback (4.6.5 step 6) --------------------------------------------------------

    pub async fn rollback_entry(
        &self,
        entry_order_id: &str,
        tp_order_id: Option<&str>,
        sl_order_id: Option<&str>,
        side: OrderSide,
        amount: Decimal,
    ) -> Option<crate::domain::types::OrphanSlRecord> {
        if let Some(tp_id) = tp_order_id {
            let _ = self.exchange.cancel_order(tp_id, &self.symbol).await;
        }
        let mut orphan_sl = None;
        if let Some(sl_id) = sl_order_id {
            let mut cancelled = false;
            for _ in 0..ENTRY_CANCEL_RETRIES {
                match self.exchange.cancel_order(sl_id, &self.symbol).await {
                    Ok(_) => {
                        cancelled = true;
                        break;
                    }
                    Err(e) if e.is_not_found() => {
                        cancelled = true;
                        break;
                    }
                    Err(_) => continue,
                }
            }
            if !cancelled {
                orphan_sl = Some(crate::domain::types::OrphanSlRecord {
                    sl_order_id: sl_id.to_string(),
                    position_side: side,
                    amount,
                    created_at: Utc::now(),
                });
            }
        }

        let mut entry_cancelled = false;
        for _ in 0..ENTRY_CANCEL_RETRIES {
            match self.exchange.cancel_order(entry_order_id, &self.symbol).await {
                Ok(_) => {
                    entry_cancelled = true;
                    break;
                }
                Err(e) if e.is_not_found() => {
                    entry_cancelled = true;
                    break;
                }
                Err(_) => continue,
            }
        }
        if !entry_cancelled {
            critical!(entry_order_id = %entry_order_id, "entry cancellation failed after rollback retries, manual intervention required");
        }
        orphan_sl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedExchange {
        tp_id: Mutex<Option<String>>,
        sl_id: Mutex<Option<String>>,
        ticker_last: Decimal,
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
            Ok(Ticker {
                last: self.ticker_last,
                bid: self.ticker_last - dec!(500),
                ask: self.ticker_last + dec!(500),
            })
        }
        async fn fetch_order_book(&self, _symbol: &str) -> Result<OrderBook, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_margin_positions(
            &self,
            _symbol: &str,
        ) -> Result<Vec<MarginPosition>, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_active_orders(
            &self,
            _symbol: &str,
            _limit: u32,
        ) -> Result<Vec<ActiveOrder>, ExchangeError> {
            Ok(vec![])
        }
        async fn create_order(&self, req: CreateOrderRequest) -> Result<OrderAck, ExchangeError> {
            Ok(OrderAck {
                id: "market_close_real".to_string(),
                price: req.price.unwrap_or_default(),
                amount: req.amount,
                filled_price: req.price,
                filled_amount: Some(req.amount),
                fee: Decimal::ZERO,
            })
        }
        async fn create_take_profit_order(
            &self,
            _req: CreateTpRequest,
        ) -> Result<OrderAck, ExchangeError> {
            let id = self.tp_id.lock().unwrap().clone().unwrap_or_default();
            Ok(OrderAck {
                id,
                price: dec!(0),
                amount: dec!(0),
                filled_price: None,
                filled_amount: None,
                fee: Decimal::ZERO,
            })
        }
        async fn create_stop_loss_order(
            &self,
            _req: CreateSlRequest,
        ) -> Result<SlOrderAck, ExchangeError> {
            let id = self.sl_id.lock().unwrap().clone().unwrap_or_default();
            Ok(SlOrderAck {
                id,
                trigger_price: dec!(0),
            })
        }
        async fn cancel_order(
            &self,
            _order_id: &str,
            _symbol: &str,
        ) -> Result<CancelStatus, ExchangeError> {
            Ok(CancelStatus::CancelledUnfilled)
        }
    }

    fn manager(exchange: Arc<dyn ExchangeClient>) -> TpSlManager {
        TpSlManager::new(
            PositionManagementConfig::default(),
            TpSlTimingConfig::default(),
            exchange,
            "btc_jpy".to_string(),
        )
    }

    #[tokio::test]
    async fn sl_rejects_wrong_direction_for_buy() {
        let exchange = Arc::new(ScriptedExchange {
            tp_id: Mutex::new(Some("t1".into())),
            sl_id: Mutex::new(Some("s1".into())),
            ticker_last: dec!(14_000_000),
        });
        let m = manager(exchange);
        let result = m
            .place_stop_loss(OrderSide::Buy, dec!(0.001), dec!(14_000_000), dec!(14_100_000))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sl_breach_triggers_market_close() {
        // Scenario 3: long position, ticker already below the would-be SL trigger.
        let exchange = Arc::new(ScriptedExchange {
            tp_id: Mutex::new(Some("t1".into())),
            sl_id: Mutex::new(Some("s1".into())),
            ticker_last: dec!(13_850_000),
        });
        let m = manager(exchange);
        let result = m
            .place_sl_or_market_close(OrderSide::Buy, dec!(0.0002), dec!(14_100_000), dec!(13_998_700))
            .await;
        let (id, _, placed_at) = result.unwrap();
        assert!(id.starts_with("market_close_"));
        assert!(placed_at.is_none());
    }

    #[tokio::test]
    async fn recalculation_uses_normal_range_defaults() {
        let exchange = Arc::new(ScriptedExchange {
            tp_id: Mutex::new(Some("t1".into())),
            sl_id: Mutex::new(Some("s1".into())),
            ticker_last: dec!(14_000_000),
        });
        let m = manager(exchange);
        let (tp, sl) = m
            .calculate_tp_sl_for_live_trade(OrderSide::Buy, dec!(14_000_000), Some(70_000.0), None, Some("normal_range"))
            .unwrap();
        assert_eq!(tp, dec!(14_000_000) * (dec!(1) + dec!(0.009)));
        assert_eq!(sl, dec!(14_000_000) * (dec!(1) - dec!(0.007)));
    }
}
