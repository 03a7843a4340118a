//! Bitbank REST client: request signing, response parsing, and bitbank's numeric error
//! codes mapped onto `ExchangeError` so callers match on kind instead of sniffing text.

use crate::domain::errors::ExchangeError;
use crate::domain::ports::ExchangeClient;
use crate::domain::types::{
    ActiveOrder, ActiveOrderType, Balance, CancelStatus, CreateOrderRequest, CreateSlRequest,
    CreateTpRequest, MarginPosition, OrderAck, OrderBook, OrderSide, OrderType, PositionSide,
    SlOrderAck, Ticker,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;

const PUBLIC_BASE_URL: &str = "https://public.bitbank.cc";
const PRIVATE_BASE_URL: &str = "https://api.bitbank.cc";

/// Bitbank codes that name a specific condition the rest of the system cares about;
/// anything else collapses to `Other`. 50061/50062 are margin conditions, 60002 is a
/// bad/unsupported order shape, 60011 is the stale-order-not-found case `cancel_order`
/// treats as an already-successful cancel.
fn map_error_code(code: i64, message: &str) -> ExchangeError {
    match code {
        50061 | 50062 => ExchangeError::InsufficientMargin,
        60002 => ExchangeError::BadOrderType,
        60011 => ExchangeError::NotFound,
        50008 | 50009 | 50010 => ExchangeError::TooManyOrders,
        20001..=20999 => ExchangeError::Transient(message.to_string()),
        _ => ExchangeError::Other(format!("bitbank error {code}: {message}")),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: u8,
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    code: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    data: ErrorData,
}

pub struct BitbankClient {
    client: reqwest::Client,
    api_key: String,
    api_secret: String,
}

impl BitbankClient {
    pub fn new(api_key: String, api_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_secret,
        }
    }

    fn nonce() -> String {
        Utc::now().timestamp_millis().to_string()
    }

    /// HMAC-SHA256 over `nonce + path + body` (GET: body is empty; POST: body is the JSON payload).
    fn sign(&self, nonce: &str, path_and_body: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts a key of any length");
        mac.update(format!("{nonce}{path_and_body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_public<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ExchangeError> {
        let url = format!("{PUBLIC_BASE_URL}{path}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::parse_envelope(response).await
    }

    async fn get_private<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, ExchangeError> {
        let nonce = Self::nonce();
        let signature = self.sign(&nonce, path);
        let response = self
            .client
            .get(format!("{PRIVATE_BASE_URL}{path}"))
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-NONCE", &nonce)
            .header("ACCESS-SIGNATURE", &signature)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::parse_envelope(response).await
    }

    async fn post_private<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ExchangeError> {
        let body_str = body.to_string();
        let nonce = Self::nonce();
        let signature = self.sign(&nonce, &body_str);
        let response = self
            .client
            .post(format!("{PRIVATE_BASE_URL}{path}"))
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-NONCE", &nonce)
            .header("ACCESS-SIGNATURE", &signature)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        Self::parse_envelope(response).await
    }

    async fn parse_envelope<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transient(e.to_string()))?;
        if !status.is_success() {
            return Err(ExchangeError::Transient(format!("http {status}: {text}")));
        }
        if let Ok(envelope) = serde_json::from_str::<Envelope<T>>(&text) {
            if envelope.success == 1 {
                return Ok(envelope.data);
            }
        }
        if let Ok(err) = serde_json::from_str::<ErrorEnvelope>(&text) {
            return Err(map_error_code(err.data.code, &text));
        }
        Err(ExchangeError::Other(format!("unparseable response: {text}")))
    }
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    last: String,
    buy: String,
    sell: String,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct AssetEntry {
    asset: String,
    free_amount: String,
    onhand_amount: String,
}

#[derive(Debug, Deserialize)]
struct AssetsResponse {
    assets: Vec<AssetEntry>,
}

#[derive(Debug, Deserialize)]
struct MarginPositionEntry {
    pair: String,
    position_side: String,
    open_amount: String,
    average_price: String,
}

#[derive(Debug, Deserialize)]
struct MarginPositionsResponse {
    positions: Vec<MarginPositionEntry>,
}

#[derive(Debug, Deserialize)]
struct ActiveOrderEntry {
    order_id: i64,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    remaining_amount: String,
    price: Option<String>,
    trigger_price: Option<String>,
    ordered_at: i64,
}

#[derive(Debug, Deserialize)]
struct ActiveOrdersResponse {
    orders: Vec<ActiveOrderEntry>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: i64,
    price: Option<String>,
    start_amount: String,
    executed_amount: String,
    average_price: String,
}

fn parse_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl ExchangeClient for BitbankClient {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let resp: TickerResponse = self.get_public(&format!("/{symbol}/ticker")).await?;
        Ok(Ticker {
            last: parse_decimal(&resp.last),
            bid: parse_decimal(&resp.buy),
            ask: parse_decimal(&resp.sell),
        })
    }

    async fn fetch_order_book(&self, symbol: &str) -> Result<OrderBook, ExchangeError> {
        let resp: DepthResponse = self.get_public(&format!("/{symbol}/depth")).await?;
        let to_levels = |levels: Vec<[String; 2]>| {
            levels
                .into_iter()
                .map(|[p, a]| (parse_decimal(&p), parse_decimal(&a)))
                .collect()
        };
        Ok(OrderBook {
            bids: to_levels(resp.bids),
            asks: to_levels(resp.asks),
        })
    }

    async fn fetch_balance(&self) -> Result<Balance, ExchangeError> {
        let resp: AssetsResponse = self.get_private("/v1/user/assets").await?;
        let jpy = resp
            .assets
            .iter()
            .find(|a| a.asset == "jpy")
            .ok_or_else(|| ExchangeError::Other("no JPY balance entry".to_string()))?;
        Ok(Balance {
            free: parse_decimal(&jpy.free_amount),
            total: parse_decimal(&jpy.onhand_amount),
        })
    }

    async fn fetch_margin_positions(&self, symbol: &str) -> Result<Vec<MarginPosition>, ExchangeError> {
        let resp: MarginPositionsResponse = self
            .get_private(&format!("/v1/user/margin/positions?pair={symbol}"))
            .await?;
        Ok(resp
            .positions
            .into_iter()
            .filter(|p| p.pair == symbol)
            .map(|p| MarginPosition {
                side: if p.position_side == "short" {
                    PositionSide::Short
                } else {
                    PositionSide::Long
                },
                amount: parse_decimal(&p.open_amount),
                average_price: parse_decimal(&p.average_price),
            })
            .collect())
    }

    async fn fetch_active_orders(&self, symbol: &str, limit: u32) -> Result<Vec<ActiveOrder>, ExchangeError> {
        let resp: ActiveOrdersResponse = self
            .get_private(&format!("/v1/user/spot/active_orders?pair={symbol}&count={limit}"))
            .await?;
        Ok(resp
            .orders
            .into_iter()
            .map(|o| ActiveOrder {
                id: o.order_id.to_string(),
                side: if o.side == "sell" { OrderSide::Sell } else { OrderSide::Buy },
                order_type: match o.order_type.as_str() {
                    "limit" => ActiveOrderType::Limit,
                    "stop" => ActiveOrderType::Stop,
                    "stop_limit" => ActiveOrderType::StopLimit,
                    _ => ActiveOrderType::Market,
                },
                amount: parse_decimal(&o.remaining_amount),
                price: o.price.as_deref().map(parse_decimal),
                trigger_price: o.trigger_price.as_deref().map(parse_decimal),
                timestamp: Utc
                    .timestamp_millis_opt(o.ordered_at)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn create_order(&self, req: CreateOrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut body = serde_json::json!({
            "pair": req.symbol,
            "amount": req.amount.to_string(),
            "side": side_str(req.side),
            "type": order_type_str(req.order_type),
        });
        if let Some(price) = req.price {
            body["price"] = serde_json::Value::String(price.to_string());
        }
        let resp: OrderResponse = self.post_private("/v1/user/spot/order", &body).await?;
        Ok(order_ack_from(resp))
    }

    async fn create_take_profit_order(&self, req: CreateTpRequest) -> Result<OrderAck, ExchangeError> {
        let exit_side = req.entry_side.opposite();
        let body = serde_json::json!({
            "pair": req.symbol,
            "amount": req.amount.to_string(),
            "price": req.take_profit_price.to_string(),
            "side": side_str(exit_side),
            "type": "limit",
            "post_only": req.post_only,
        });
        let resp: OrderResponse = self.post_private("/v1/user/spot/order", &body).await?;
        Ok(order_ack_from(resp))
    }

    async fn create_stop_loss_order(&self, req: CreateSlRequest) -> Result<SlOrderAck, ExchangeError> {
        let exit_side = req.entry_side.opposite();
        let mut body = serde_json::json!({
            "pair": req.symbol,
            "amount": req.amount.to_string(),
            "side": side_str(exit_side),
            "type": order_type_str(req.order_type),
            "trigger_price": req.stop_loss_price.to_string(),
        });
        if let Some(limit_price) = req.limit_price {
            body["price"] = serde_json::Value::String(limit_price.to_string());
        }
        let resp: OrderResponse = self.post_private("/v1/user/spot/order", &body).await?;
        Ok(SlOrderAck {
            id: resp.order_id.to_string(),
            trigger_price: req.stop_loss_price,
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<CancelStatus, ExchangeError> {
        let body = serde_json::json!({
            "pair": symbol,
            "order_id": order_id.parse::<i64>().unwrap_or_default(),
        });
        let resp: OrderResponse = self.post_private("/v1/user/spot/cancel_order", &body).await?;
        let executed = parse_decimal(&resp.executed_amount);
        let start = parse_decimal(&resp.start_amount);
        Ok(if executed >= start {
            CancelStatus::FullyFilled
        } else if executed > Decimal::ZERO {
            CancelStatus::CancelledPartiallyFilled
        } else {
            CancelStatus::CancelledUnfilled
        })
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "buy",
        OrderSide::Sell => "sell",
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "market",
        OrderType::Limit => "limit",
        OrderType::Stop => "stop",
        OrderType::StopLimit => "stop_limit",
    }
}

fn order_ack_from(resp: OrderResponse) -> OrderAck {
    let executed = parse_decimal(&resp.executed_amount);
    OrderAck {
        id: resp.order_id.to_string(),
        price: resp.price.as_deref().map(parse_decimal).unwrap_or_default(),
        amount: parse_decimal(&resp.start_amount),
        filled_price: if executed > Decimal::ZERO {
            Some(parse_decimal(&resp.average_price))
        } else {
            None
        },
        filled_amount: if executed > Decimal::ZERO { Some(executed) } else { None },
        fee: Decimal::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_margin_codes_map_to_insufficient_margin() {
        assert!(matches!(
            map_error_code(50061, "x"),
            ExchangeError::InsufficientMargin
        ));
        assert!(matches!(
            map_error_code(50062, "x"),
            ExchangeError::InsufficientMargin
        ));
    }

    #[test]
    fn stale_order_code_maps_to_not_found() {
        assert!(matches!(map_error_code(60011, "x"), ExchangeError::NotFound));
    }

    #[test]
    fn bad_order_shape_maps_to_bad_order_type() {
        assert!(matches!(map_error_code(60002, "x"), ExchangeError::BadOrderType));
    }

    #[test]
    fn signature_is_deterministic_for_same_inputs() {
        let client = BitbankClient::new("key".to_string(), "secret".to_string());
        let a = client.sign("1", "/v1/user/assets");
        let b = client.sign("1", "/v1/user/assets");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
