use crate::domain::errors::ExchangeError;
use crate::domain::types::{
    ActiveOrder, Balance, CancelStatus, CreateOrderRequest, CreateSlRequest, CreateTpRequest,
    MarginPosition, OrderAck, OrderBook, SlOrderAck, Ticker,
};
use async_trait::async_trait;

/// The single interface every component depends on for exchange I/O — no duck typing,
/// one trait, swappable for a deterministic stub in tests and backtests.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;
    async fn fetch_order_book(&self, symbol: &str) -> Result<OrderBook, ExchangeError>;
    async fn fetch_balance(&self) -> Result<Balance, ExchangeError>;
    async fn fetch_margin_positions(
        &self,
        symbol: &str,
    ) -> Result<Vec<MarginPosition>, ExchangeError>;
    async fn fetch_active_orders(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<ActiveOrder>, ExchangeError>;
    async fn create_order(&self, req: CreateOrderRequest) -> Result<OrderAck, ExchangeError>;
    async fn create_take_profit_order(
        &self,
        req: CreateTpRequest,
    ) -> Result<OrderAck, ExchangeError>;
    async fn create_stop_loss_order(
        &self,
        req: CreateSlRequest,
    ) -> Result<SlOrderAck, ExchangeError>;
    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<CancelStatus, ExchangeError>;
}

/// Stand-ins for the out-of-scope external collaborators named in the purpose statement
/// (ML training, feature engineering, strategy generation): reduced to the one or two
/// methods the orchestrator actually calls, so the engine is runnable without a real stack.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        lookback: usize,
    ) -> anyhow::Result<Vec<crate::domain::types::MarketCondition>>;
}

pub trait FeatureProvider: Send + Sync {
    /// Average true range over the supplied window, or `None` if there isn't enough history.
    fn atr(&self, window: &[crate::domain::types::MarketCondition], period: usize) -> Option<f64>;
}

pub trait StrategySource: Send + Sync {
    fn generate(&self) -> Vec<crate::domain::types::Signal>;
}

pub trait MlPredictor: Send + Sync {
    /// Confidence in `[0, 1]` that the aggregated strategy signal is correct.
    fn confidence(&self, signal: &crate::domain::types::Signal) -> f64;
}
