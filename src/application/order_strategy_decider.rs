use crate::config::{OrderExecutionConfig, TradingConstraintsConfig};
use crate::domain::ports::ExchangeClient;
use crate::domain::types::{OrderSide, OrderType, TradeEvaluation};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub strategy_label: String,
}

/// Chooses market vs. limit (optionally post-only maker) execution and, for limit
/// orders, the price to post at.
pub struct OrderStrategyDecider {
    order_execution: OrderExecutionConfig,
    constraints: TradingConstraintsConfig,
}

impl OrderStrategyDecider {
    pub fn new(order_execution: OrderExecutionConfig, constraints: TradingConstraintsConfig) -> Self {
        Self {
            order_execution,
            constraints,
        }
    }

    pub async fn get_optimal_execution_config(
        &self,
        evaluation: &TradeEvaluation,
        exchange: &dyn ExchangeClient,
    ) -> ExecutionConfig {
        if !self.order_execution.smart_order_enabled {
            return self.static_config(evaluation, exchange).await;
        }
        self.smart_config(evaluation, exchange).await
    }

    async fn static_config(
        &self,
        evaluation: &TradeEvaluation,
        exchange: &dyn ExchangeClient,
    ) -> ExecutionConfig {
        if self.constraints.default_order_type == "market" {
            return ExecutionConfig {
                order_type: OrderType::Market,
                price: None,
                strategy_label: "default_market".to_string(),
            };
        }
        match exchange
            .fetch_order_book(&self.constraints.currency_pair)
            .await
        {
            Ok(book) => {
                let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) else {
                    return self.fallback_market();
                };
                let price = match evaluation.side {
                    OrderSide::Buy => ask * (dec!(1) + dec!(0.0005)),
                    OrderSide::Sell => bid * (dec!(1) - dec!(0.0005)),
                };
                ExecutionConfig {
                    order_type: OrderType::Limit,
                    price: Some(price),
                    strategy_label: "default_limit".to_string(),
                }
            }
            Err(_) => self.fallback_market(),
        }
    }

    async fn smart_config(
        &self,
        evaluation: &TradeEvaluation,
        exchange: &dyn ExchangeClient,
    ) -> ExecutionConfig {
        let book = match exchange
            .fetch_order_book(&self.constraints.currency_pair)
            .await
        {
            Ok(book) => book,
            Err(_) => return self.fallback_market(),
        };
        let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) else {
            return self.fallback_market();
        };
        let mid = (bid + ask) / dec!(2);
        if mid <= Decimal::ZERO {
            return self.fallback_market();
        }
        let spread_ratio = (ask - bid) / mid;

        if spread_ratio > self.order_execution.max_spread_ratio_for_limit {
            return ExecutionConfig {
                order_type: OrderType::Market,
                price: None,
                strategy_label: "wide_spread_market".to_string(),
            };
        }
        if evaluation.emergency_exit {
            return ExecutionConfig {
                order_type: OrderType::Market,
                price: None,
                strategy_label: "emergency_market".to_string(),
            };
        }
        if evaluation.confidence_level < self.order_execution.low_confidence_threshold {
            return ExecutionConfig {
                order_type: OrderType::Market,
                price: None,
                strategy_label: "low_confidence_market".to_string(),
            };
        }
        if evaluation.confidence_level >= self.order_execution.high_confidence_threshold {
            let improvement = self.order_execution.price_improvement_ratio;
            let raw_price = match evaluation.side {
                OrderSide::Buy => bid * (dec!(1) + improvement),
                OrderSide::Sell => ask * (dec!(1) - improvement),
            };
            let capped_price = match evaluation.side {
                OrderSide::Buy => raw_price.min(ask * (dec!(1) - dec!(0.001))),
                OrderSide::Sell => raw_price.max(bid * (dec!(1) + dec!(0.001))),
            };
            return ExecutionConfig {
                order_type: OrderType::Limit,
                price: Some(capped_price),
                strategy_label: "high_confidence_limit".to_string(),
            };
        }
        ExecutionConfig {
            order_type: OrderType::Market,
            price: None,
            strategy_label: "medium_confidence_market".to_string(),
        }
    }

    fn fallback_market(&self) -> ExecutionConfig {
        ExecutionConfig {
            order_type: OrderType::Market,
            price: None,
            strategy_label: "fallback_market".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ExchangeError;
    use crate::domain::types::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeExchange {
        bid: Decimal,
        ask: Decimal,
    }

    #[async_trait]
    impl ExchangeClient for FakeExchange {
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
            unimplemented!()
        }
        async fn fetch_order_book(&self, _symbol: &str) -> Result<OrderBook, ExchangeError> {
            Ok(OrderBook {
                bids: vec![(self.bid, dec!(1))],
                asks: vec![(self.ask, dec!(1))],
            })
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
            unimplemented!()
        }
        async fn create_order(&self, _req: CreateOrderRequest) -> Result<OrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn create_take_profit_order(
            &self,
            _req: CreateTpRequest,
        ) -> Result<OrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn create_stop_loss_order(
            &self,
            _req: CreateSlRequest,
        ) -> Result<SlOrderAck, ExchangeError> {
            unimplemented!()
        }
        async fn cancel_order(
            &self,
            _order_id: &str,
            _symbol: &str,
        ) -> Result<CancelStatus, ExchangeError> {
            unimplemented!()
        }
    }

    fn evaluation(side: OrderSide, confidence: f64) -> TradeEvaluation {
        TradeEvaluation {
            decision: TradeDecision::Approved,
            side,
            risk_score: 0.1,
            position_size: dec!(0.0001),
            stop_loss: None,
            take_profit: None,
            confidence_level: confidence,
            kelly_recommendation: dec!(0.0001),
            drawdown_status: TradingStatus::Active,
            warnings: vec![],
            denial_reasons: vec![],
            market_conditions: HashMap::new(),
            entry_price: None,
            emergency_exit: false,
        }
    }

    #[tokio::test]
    async fn high_confidence_narrow_spread_posts_capped_limit() {
        // High confidence, narrow spread: posts a capped limit order.
        let decider = OrderStrategyDecider::new(
            OrderExecutionConfig::default(),
            TradingConstraintsConfig::default(),
        );
        let exchange = FakeExchange {
            bid: dec!(14_000_000),
            ask: dec!(14_001_000),
        };
        let eval = evaluation(OrderSide::Buy, 0.85);
        let config = decider.get_optimal_execution_config(&eval, &exchange).await;
        assert_eq!(config.strategy_label, "high_confidence_limit");
        // Capped so the buy never crosses the spread (stays below ask * 0.999).
        let price = config.price.expect("limit order carries a price");
        assert!(price <= exchange.ask * dec!(0.999));
        assert!(price >= exchange.bid);
    }

    #[tokio::test]
    async fn wide_spread_forces_market() {
        let decider = OrderStrategyDecider::new(
            OrderExecutionConfig::default(),
            TradingConstraintsConfig::default(),
        );
        let exchange = FakeExchange {
            bid: dec!(100),
            ask: dec!(110),
        };
        let eval = evaluation(OrderSide::Buy, 0.9);
        let config = decider.get_optimal_execution_config(&eval, &exchange).await;
        assert_eq!(config.strategy_label, "wide_spread_market");
    }

    #[tokio::test]
    async fn low_confidence_forces_market() {
        let decider = OrderStrategyDecider::new(
            OrderExecutionConfig::default(),
            TradingConstraintsConfig::default(),
        );
        let exchange = FakeExchange {
            bid: dec!(100),
            ask: dec!(100.1),
        };
        let eval = evaluation(OrderSide::Buy, 0.2);
        let config = decider.get_optimal_execution_config(&eval, &exchange).await;
        assert_eq!(config.strategy_label, "low_confidence_market");
    }
}
