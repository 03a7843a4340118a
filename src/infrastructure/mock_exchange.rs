use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeClient;
use crate::domain::types::{
    ActiveOrder, ActiveOrderType, Balance, CancelStatus, CreateOrderRequest, CreateSlRequest,
    CreateTpRequest, MarginPosition, OrderAck, OrderBook, OrderSide, SlOrderAck, Ticker,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// In-memory `ExchangeClient` for paper mode and deterministic tests. Fills every order
/// immediately at the supplied or current mid price; no partial fills, no real margin
/// accounting. Callers seed `ticker`/`book`/`balance` and mutate them between calls to
/// script a scenario.
pub struct MockExchange {
    pub ticker: Mutex<Ticker>,
    pub book: Mutex<OrderBook>,
    pub balance: Mutex<Balance>,
    pub active_orders: Mutex<Vec<ActiveOrder>>,
    pub positions: Mutex<Vec<MarginPosition>>,
    counter: AtomicU64,
}

impl MockExchange {
    pub fn new(mid_price: Decimal) -> Self {
        Self {
            ticker: Mutex::new(Ticker {
                last: mid_price,
                bid: mid_price - dec!(500),
                ask: mid_price + dec!(500),
            }),
            book: Mutex::new(OrderBook {
                bids: vec![(mid_price - dec!(500), dec!(1))],
                asks: vec![(mid_price + dec!(500), dec!(1))],
            }),
            balance: Mutex::new(Balance {
                free: dec!(1_000_000),
                total: dec!(1_000_000),
            }),
            active_orders: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}_{n}")
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
        Ok(*self.ticker.lock().unwrap())
    }

    async fn fetch_order_book(&self, _symbol: &str) -> Result<OrderBook, ExchangeError> {
        Ok(self.book.lock().unwrap().clone())
    }

    async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        Ok(*self.balance.lock().unwrap())
    }

    async fn fetch_margin_positions(&self, _symbol: &str) -> Result<Vec<MarginPosition>, ExchangeError> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn fetch_active_orders(&self, _symbol: &str, _limit: u32) -> Result<Vec<ActiveOrder>, ExchangeError> {
        Ok(self.active_orders.lock().unwrap().clone())
    }

    async fn create_order(&self, req: CreateOrderRequest) -> Result<OrderAck, ExchangeError> {
        let last = self.ticker.lock().unwrap().last;
        let price = req.price.unwrap_or(last);
        Ok(OrderAck {
            id: self.next_id("order"),
            price,
            amount: req.amount,
            filled_price: Some(price),
            filled_amount: Some(req.amount),
            fee: Decimal::ZERO,
        })
    }

    async fn create_take_profit_order(&self, req: CreateTpRequest) -> Result<OrderAck, ExchangeError> {
        let id = self.next_id("tp");
        self.active_orders.lock().unwrap().push(ActiveOrder {
            id: id.clone(),
            side: req.entry_side.opposite(),
            order_type: ActiveOrderType::Limit,
            amount: req.amount,
            price: Some(req.take_profit_price),
            trigger_price: None,
            timestamp: Utc::now(),
        });
        Ok(OrderAck {
            id,
            price: req.take_profit_price,
            amount: req.amount,
            filled_price: None,
            filled_amount: None,
            fee: Decimal::ZERO,
        })
    }

    async fn create_stop_loss_order(&self, req: CreateSlRequest) -> Result<SlOrderAck, ExchangeError> {
        let id = self.next_id("sl");
        self.active_orders.lock().unwrap().push(ActiveOrder {
            id: id.clone(),
            side: req.entry_side.opposite(),
            order_type: if req.limit_price.is_some() {
                ActiveOrderType::StopLimit
            } else {
                ActiveOrderType::Stop
            },
            amount: req.amount,
            price: req.limit_price,
            trigger_price: Some(req.stop_loss_price),
            timestamp: Utc::now(),
        });
        Ok(SlOrderAck {
            id,
            trigger_price: req.stop_loss_price,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<CancelStatus, ExchangeError> {
        let mut orders = self.active_orders.lock().unwrap();
        let before = orders.len();
        orders.retain(|o| o.id != order_id);
        if orders.len() == before {
            return Err(ExchangeError::NotFound);
        }
        Ok(CancelStatus::CancelledUnfilled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_order_fills_immediately_at_ticker_price() {
        let exchange = MockExchange::new(dec!(14_000_000));
        let ack = exchange
            .create_order(CreateOrderRequest {
                symbol: "btc_jpy".to_string(),
                side: OrderSide::Buy,
                order_type: crate::domain::types::OrderType::Market,
                amount: dec!(0.001),
                price: None,
                is_closing_order: false,
            })
            .await
            .unwrap();
        assert_eq!(ack.filled_price, Some(dec!(14_000_000)));
    }

    #[tokio::test]
    async fn cancel_unknown_order_returns_not_found() {
        let exchange = MockExchange::new(dec!(14_000_000));
        let result = exchange.cancel_order("nonexistent", "btc_jpy").await;
        assert!(matches!(result, Err(ExchangeError::NotFound)));
    }

    #[tokio::test]
    async fn tp_and_sl_placement_register_as_active_orders() {
        let exchange = MockExchange::new(dec!(14_000_000));
        exchange
            .create_take_profit_order(CreateTpRequest {
                entry_side: OrderSide::Buy,
                amount: dec!(0.001),
                take_profit_price: dec!(14_500_000),
                symbol: "btc_jpy".to_string(),
                post_only: true,
            })
            .await
            .unwrap();
        exchange
            .create_stop_loss_order(CreateSlRequest {
                entry_side: OrderSide::Buy,
                amount: dec!(0.001),
                stop_loss_price: dec!(13_500_000),
                symbol: "btc_jpy".to_string(),
                order_type: crate::domain::types::OrderType::Stop,
                limit_price: None,
            })
            .await
            .unwrap();
        assert_eq!(exchange.active_orders.lock().unwrap().len(), 2);
    }
}
