use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// One enum for "no trade", replacing the original's mix of `None` / `""` / `"hold"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn from_str_normalized(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "buy" => Action::Buy,
            "sell" => Action::Sell,
            _ => Action::Hold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::Stop => write!(f, "stop"),
            OrderType::StopLimit => write!(f, "stop_limit"),
        }
    }
}

/// Produced by the (external) strategy/ML stack; this crate only consumes its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    pub confidence: f64,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub strategy_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDecision {
    Approved,
    Denied,
    Conditional,
}

/// The closed, named-field record type the design notes call for in place of a
/// dataclass with mutable nested dicts — `market_conditions` stays an explicit map
/// for the handful of ad hoc feature keys (`atr_current`, `regime`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvaluation {
    pub decision: TradeDecision,
    pub side: OrderSide,
    pub risk_score: f64,
    pub position_size: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub confidence_level: f64,
    pub kelly_recommendation: Decimal,
    pub drawdown_status: TradingStatus,
    pub warnings: Vec<String>,
    pub denial_reasons: Vec<String>,
    pub market_conditions: HashMap<String, String>,
    pub entry_price: Option<Decimal>,
    pub emergency_exit: bool,
}

impl TradeEvaluation {
    pub fn market_condition_decimal(&self, key: &str) -> Option<Decimal> {
        self.market_conditions.get(key)?.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualPosition {
    pub order_id: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    pub sl_placed_at: Option<DateTime<Utc>>,
    pub restored: bool,
    pub recovered: bool,
}

impl VirtualPosition {
    /// A freshly-entered (not restored, not recovered) position must exit the atomic
    /// entry protocol with both exits attached.
    pub fn has_full_coverage(&self) -> bool {
        self.tp_order_id.is_some() && self.sl_order_id.is_some()
    }

    pub fn requires_full_coverage(&self) -> bool {
        !self.restored && !self.recovered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingStatus {
    Active,
    PausedDrawdown,
    PausedConsecutiveLoss,
    PausedManual,
}

impl fmt::Display for TradingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingStatus::Active => write!(f, "ACTIVE"),
            TradingStatus::PausedDrawdown => write!(f, "PAUSED_DRAWDOWN"),
            TradingStatus::PausedConsecutiveLoss => write!(f, "PAUSED_CONSECUTIVE_LOSS"),
            TradingStatus::PausedManual => write!(f, "PAUSED_MANUAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownSnapshot {
    pub timestamp: DateTime<Utc>,
    pub current_balance: Decimal,
    pub peak_balance: Decimal,
    pub drawdown_ratio: f64,
    pub consecutive_losses: u32,
    pub trading_status: TradingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTpSlVerification {
    pub scheduled_at: DateTime<Utc>,
    pub verify_after: DateTime<Utc>,
    pub entry_order_id: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub entry_price: Decimal,
    pub expected_tp_order_id: Option<String>,
    pub expected_sl_order_id: Option<String>,
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanSlRecord {
    pub sl_order_id: String,
    pub position_side: OrderSide,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyLevel {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyAlert {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub level: AnomalyLevel,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub should_pause_trading: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarketCondition {
    pub timestamp: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    pub api_latency_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Backtest,
    Paper,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Filled,
    Submitted,
    Cancelled,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub order_id: Option<String>,
    pub price: Decimal,
    pub amount: Decimal,
    pub fee: Decimal,
    pub error: Option<String>,
    /// Set when a rollback left an SL order that failed to cancel; the caller is
    /// responsible for appending it to the durable orphan log.
    pub pending_orphan_sl: Option<OrphanSlRecord>,
}

impl ExecutionResult {
    pub fn no_op() -> Self {
        ExecutionResult {
            success: true,
            status: ExecutionStatus::Cancelled,
            order_id: None,
            price: Decimal::ZERO,
            amount: Decimal::ZERO,
            fee: Decimal::ZERO,
            error: None,
            pending_orphan_sl: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        ExecutionResult {
            success: false,
            status: ExecutionStatus::Rejected,
            order_id: None,
            price: Decimal::ZERO,
            amount: Decimal::ZERO,
            fee: Decimal::ZERO,
            error: Some(reason.into()),
            pending_orphan_sl: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionResult {
            success: false,
            status: ExecutionStatus::Failed,
            order_id: None,
            price: Decimal::ZERO,
            amount: Decimal::ZERO,
            fee: Decimal::ZERO,
            error: Some(reason.into()),
            pending_orphan_sl: None,
        }
    }

    /// Attaches an orphaned SL record for the caller to persist, if rollback produced one.
    pub fn with_pending_orphan_sl(mut self, orphan: Option<OrphanSlRecord>) -> Self {
        self.pending_orphan_sl = orphan;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Balance {
    pub free: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MarginPosition {
    pub side: PositionSide,
    pub amount: Decimal,
    pub average_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveOrderType {
    Limit,
    Stop,
    StopLimit,
    Market,
}

#[derive(Debug, Clone)]
pub struct ActiveOrder {
    pub id: String,
    pub side: OrderSide,
    pub order_type: ActiveOrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub is_closing_order: bool,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub id: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled_price: Option<Decimal>,
    pub filled_amount: Option<Decimal>,
    pub fee: Decimal,
}

#[derive(Debug, Clone)]
pub struct CreateTpRequest {
    pub entry_side: OrderSide,
    pub amount: Decimal,
    pub take_profit_price: Decimal,
    pub symbol: String,
    pub post_only: bool,
}

#[derive(Debug, Clone)]
pub struct CreateSlRequest {
    pub entry_side: OrderSide,
    pub amount: Decimal,
    pub stop_loss_price: Decimal,
    pub symbol: String,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct SlOrderAck {
    pub id: String,
    pub trigger_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    CancelledUnfilled,
    CancelledPartiallyFilled,
    FullyFilled,
}
