use rust_decimal::Decimal;
use thiserror::Error;

/// Errors surfaced by the exchange port. Known Bitbank error codes get their own
/// variant so callers can match on kind instead of sniffing message text.
#[derive(Debug, Error, Clone)]
pub enum ExchangeError {
    #[error("insufficient margin")]
    InsufficientMargin,
    #[error("unsupported order type")]
    BadOrderType,
    #[error("order not found")]
    NotFound,
    #[error("too many open orders for pair")]
    TooManyOrders,
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    /// `true` for network/5xx/rate-limit style failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    /// `cancel_order` on an already-gone order is treated as a successful cancel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExchangeError::NotFound)
    }
}

/// Errors raised by the core domain components (validation, reconciliation, state).
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("atomic entry left a partial position: {0}")]
    PartialEntry(String),
    #[error("reconciliation gap: {0}")]
    ReconciliationGap(String),
    #[error("persisted state is corrupt: {0}")]
    StateCorruption(String),
    #[error("unexpected error: {0}")]
    Fatal(String),
}

impl DomainError {
    pub fn invalid_sl_direction(side: &str, sl_price: Decimal, entry_price: Decimal) -> Self {
        DomainError::Validation(format!(
            "stop-loss {sl_price} invalid for {side} entry at {entry_price}"
        ))
    }
}
