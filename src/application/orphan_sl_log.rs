use crate::domain::ports::ExchangeClient;
use crate::domain::types::OrphanSlRecord;
use crate::infrastructure::persistence::{read_json, write_json_atomic};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Durable list of SL order ids that failed to cancel during rollback or exit; retried
/// on the next startup. The only durable artifact besides drawdown state, per the
/// read-modify-write policy that's safe because only the orchestrator writes it.
pub struct OrphanSlLog {
    path: PathBuf,
    records: Vec<OrphanSlRecord>,
}

impl OrphanSlLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            records: Vec::new(),
        }
    }

    pub async fn load(&mut self) -> Result<()> {
        self.records = read_json::<Vec<OrphanSlRecord>>(&self.path)
            .await?
            .unwrap_or_default();
        Ok(())
    }

    pub async fn append(&mut self, record: OrphanSlRecord) -> Result<()> {
        self.records.push(record);
        write_json_atomic(&self.path, &self.records).await
    }

    /// Cancels every recorded orphan SL; "not found" counts as cleaned. Deletes the file
    /// once the sweep completes; a record only persists until confirmed cancelled.
    pub async fn cleanup_orphan_sl_orders(
        &mut self,
        exchange: &dyn ExchangeClient,
        symbol: &str,
    ) -> Result<usize> {
        let mut cleaned = 0;
        let mut remaining = Vec::new();
        for record in self.records.drain(..) {
            match exchange.cancel_order(&record.sl_order_id, symbol).await {
                Ok(_) => cleaned += 1,
                Err(e) if e.is_not_found() => cleaned += 1,
                Err(e) => {
                    tracing::warn!(order_id = %record.sl_order_id, error = %e, "orphan SL cleanup failed, will retry next startup");
                    remaining.push(record);
                }
            }
        }
        self.records = remaining;
        if self.records.is_empty() {
            let _ = tokio::fs::remove_file(&self.path).await;
        } else {
            write_json_atomic(&self.path, &self.records).await?;
        }
        Ok(cleaned)
    }

    pub fn records(&self) -> &[OrphanSlRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ExchangeError;
    use crate::domain::types::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    struct AlwaysNotFound;

    #[async_trait]
    impl ExchangeClient for AlwaysNotFound {
        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, ExchangeError> {
            unimplemented!()
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
            Err(ExchangeError::NotFound)
        }
    }

    #[tokio::test]
    async fn not_found_counts_as_cleaned_and_deletes_file() {
        let path = std::env::temp_dir().join(format!("orphan_sl_{}.json", uuid::Uuid::new_v4()));
        let mut log = OrphanSlLog::new(path.clone());
        log.append(OrphanSlRecord {
            sl_order_id: "s1".to_string(),
            position_side: OrderSide::Buy,
            amount: dec!(0.001),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        let exchange = AlwaysNotFound;
        let cleaned = log.cleanup_orphan_sl_orders(&exchange, "btc_jpy").await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(!path.exists());
    }
}
