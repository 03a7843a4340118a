use crate::application::orphan_sl_log::OrphanSlLog;
use crate::application::tp_sl_manager::TpSlManager;
use crate::critical;
use crate::domain::ports::ExchangeClient;
use crate::domain::types::{ActiveOrderType, VirtualPosition};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

const RESTORE_PRICE_BAND: Decimal = dec!(0.03);
const ORPHAN_COVERAGE_THRESHOLD: Decimal = dec!(0.95);

/// Rebuilds in-memory position state from the exchange: startup restore, periodic
/// orphan scans, and cleanup of stale unfilled/orphan orders. Only runs in live mode —
/// paper and backtest never need reconciliation against a real exchange.
pub struct PositionRestorer {
    exchange: Arc<dyn ExchangeClient>,
    symbol: String,
}

impl PositionRestorer {
    pub fn new(exchange: Arc<dyn ExchangeClient>, symbol: String) -> Self {
        Self { exchange, symbol }
    }

    /// 4.7.1: on startup, match each real position to the nearest exit-side TP/SL
    /// candidate within a 3% price band of the average entry price.
    pub async fn restore_positions_from_api(&self) -> anyhow::Result<Vec<VirtualPosition>> {
        let positions = self.exchange.fetch_margin_positions(&self.symbol).await?;
        let active = self
            .exchange
            .fetch_active_orders(&self.symbol, 200)
            .await?;

        let mut restored = Vec::new();
        for position in positions.into_iter().filter(|p| p.amount > Decimal::ZERO) {
            let side = position.side.as_order_side();
            let exit_side = side.opposite();
            let band_low = position.average_price * (Decimal::ONE - RESTORE_PRICE_BAND);
            let band_high = position.average_price * (Decimal::ONE + RESTORE_PRICE_BAND);

            let tp_candidate = active.iter().find(|o| {
                o.side == exit_side
                    && o.order_type == ActiveOrderType::Limit
                    && o.price
                        .map(|p| p >= band_low && p <= band_high)
                        .unwrap_or(false)
            });
            let sl_candidate = active.iter().find(|o| {
                o.side == exit_side
                    && matches!(o.order_type, ActiveOrderType::Stop | ActiveOrderType::StopLimit)
                    && o.trigger_price
                        .map(|p| p >= band_low && p <= band_high)
                        .unwrap_or(false)
            });

            restored.push(VirtualPosition {
                order_id: format!("restored_{}", uuid::Uuid::new_v4()),
                side,
                amount: position.amount,
                entry_price: position.average_price,
                timestamp: Utc::now(),
                take_profit: tp_candidate.and_then(|o| o.price),
                stop_loss: sl_candidate.and_then(|o| o.trigger_price),
                tp_order_id: tp_candidate.map(|o| o.id.clone()),
                sl_order_id: sl_candidate.map(|o| o.id.clone()),
                sl_placed_at: None,
                restored: true,
                recovered: false,
            });
        }
        Ok(restored)
    }

    /// 4.7.2: for any real position with no matching VirtualPosition, adopt it (tracking
    /// only, if already fully covered) or attempt recovery placement.
    pub async fn scan_orphan_positions(
        &self,
        tp_sl: &TpSlManager,
        positions: &mut Vec<VirtualPosition>,
        regime: Option<&str>,
    ) -> anyhow::Result<()> {
        let real_positions = self.exchange.fetch_margin_positions(&self.symbol).await?;
        let active = self
            .exchange
            .fetch_active_orders(&self.symbol, 200)
            .await?;

        for real in real_positions.into_iter().filter(|p| p.amount > Decimal::ZERO) {
            let side = real.side.as_order_side();
            if positions.iter().any(|p| p.side == side) {
                continue;
            }
            if real.average_price <= Decimal::ZERO {
                critical!(side = ?side, "orphan position has no determinable average price, manual intervention required");
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
            let tp_ok = tp_covered / real.amount >= ORPHAN_COVERAGE_THRESHOLD;
            let sl_ok = sl_covered / real.amount >= ORPHAN_COVERAGE_THRESHOLD;

            if tp_ok && sl_ok {
                positions.push(VirtualPosition {
                    order_id: format!("adopted_{}", uuid::Uuid::new_v4()),
                    side,
                    amount: real.amount,
                    entry_price: real.average_price,
                    timestamp: Utc::now(),
                    take_profit: None,
                    stop_loss: None,
                    tp_order_id: Some("existing".to_string()),
                    sl_order_id: Some("existing".to_string()),
                    sl_placed_at: None,
                    restored: true,
                    recovered: false,
                });
                continue;
            }

            let (tp_price, sl_price) = tp_sl.calculate_recovery_tp_sl_prices(side, real.average_price, regime);
            let tp_result = if tp_ok {
                None
            } else {
                tp_sl.place_tp_with_retry(side, real.amount, tp_price).await.ok().flatten()
            };
            let sl_result = if sl_ok {
                None
            } else {
                tp_sl
                    .place_sl_or_market_close(side, real.amount, real.average_price, sl_price)
                    .await
            };
            if (tp_ok || tp_result.is_some()) && (sl_ok || sl_result.is_some()) {
                positions.push(VirtualPosition {
                    order_id: format!("adopted_{}", uuid::Uuid::new_v4()),
                    side,
                    amount: real.amount,
                    entry_price: real.average_price,
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
                critical!(side = ?side, "orphan recovery incomplete");
            }
        }
        Ok(())
    }

    /// When the active order count crosses the threshold, cancel exit-side limit orders
    /// older than `max_age_hours` that aren't protected, to stay under the exchange's
    /// per-pair order cap.
    pub async fn cleanup_old_unfilled_orders(
        &self,
        positions: &[VirtualPosition],
        threshold_count: u32,
        max_age_hours: i64,
    ) -> anyhow::Result<usize> {
        let active = self.exchange.fetch_active_orders(&self.symbol, 200).await?;
        if (active.len() as u32) < threshold_count {
            return Ok(0);
        }
        let protected: std::collections::HashSet<String> = positions
            .iter()
            .flat_map(|p| [p.tp_order_id.clone(), p.sl_order_id.clone()].into_iter().flatten())
            .collect();
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);

        let mut cancelled = 0;
        for order in active {
            if order.order_type != ActiveOrderType::Limit {
                continue;
            }
            if protected.contains(&order.id) || order.timestamp > cutoff {
                continue;
            }
            match self.exchange.cancel_order(&order.id, &self.symbol).await {
                Ok(_) => cancelled += 1,
                Err(e) if e.is_not_found() => cancelled += 1,
                Err(e) => tracing::warn!(order_id = %order.id, error = %e, "failed to cancel stale order"),
            }
        }
        Ok(cancelled)
    }

    pub async fn cleanup_orphan_sl_orders(&self, log: &mut OrphanSlLog) -> anyhow::Result<usize> {
        log.cleanup_orphan_sl_orders(self.exchange.as_ref(), &self.symbol).await
    }
}
