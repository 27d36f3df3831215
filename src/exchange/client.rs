//! Signed Bitunix futures REST client.
//!
//! Request signing follows the double-SHA256 scheme: the digest is
//! `sha256(nonce + timestamp + api_key + sorted_query + compact_body)` and the
//! signature is `sha256(digest + api_secret)`, both hex-encoded, sent together
//! with `api-key`, `nonce` and `timestamp` headers.

use crate::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::ExchangeApi;
use crate::exchange::types::*;
use crate::indicators::Candle;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};
use uuid::Uuid;

const PLACE_ORDER_PATH: &str = "/api/v1/futures/trade/place_order";
const CANCEL_ORDERS_PATH: &str = "/api/v1/futures/trade/cancel_orders";
const PENDING_ORDERS_PATH: &str = "/api/v1/futures/trade/get_pending_orders";
const CLOSE_ALL_POSITION_PATH: &str = "/api/v1/futures/trade/close_all_position";
const KLINE_PATH: &str = "/api/v1/futures/market/kline";
const ACCOUNT_PATH: &str = "/api/v1/futures/account";

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// REST client for Bitunix USDT-margined futures.
pub struct BitunixClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    margin_coin: String,
}

impl BitunixClient {
    /// Create a new client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            margin_coin: config.margin_coin.clone(),
        })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64
    }

    /// Signature over the sorted query string and the compact JSON body.
    fn sign(&self, nonce: &str, timestamp: &str, sorted_query: &str, body: &str) -> String {
        let digest = sha256_hex(&format!(
            "{nonce}{timestamp}{}{sorted_query}{body}",
            self.api_key
        ));
        sha256_hex(&format!("{digest}{}", self.api_secret))
    }

    /// Query params concatenated key-then-value, sorted by key, no separators.
    fn sorted_query(params: &[(&str, String)]) -> String {
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        sorted
            .iter()
            .map(|(k, v)| format!("{k}{v}"))
            .collect::<String>()
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let nonce = Uuid::new_v4().simple().to_string();
        let timestamp = Self::timestamp_ms().to_string();
        let sign = self.sign(&nonce, &timestamp, &Self::sorted_query(params), "");

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .header("api-key", &self.api_key)
            .header("nonce", nonce)
            .header("timestamp", timestamp)
            .header("sign", sign)
            .send()
            .await?;

        let envelope: ApiResponse<T> = response.json().await?;
        Self::unwrap_envelope(envelope)
    }

    async fn signed_post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ExchangeError> {
        let envelope = self.signed_post_raw(path, body).await?;
        Self::unwrap_envelope(envelope)
    }

    async fn signed_post_raw<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<ApiResponse<T>, ExchangeError> {
        let nonce = Uuid::new_v4().simple().to_string();
        let timestamp = Self::timestamp_ms().to_string();
        let compact_body = body.to_string();
        let sign = self.sign(&nonce, &timestamp, "", &compact_body);

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .header("api-key", &self.api_key)
            .header("nonce", nonce)
            .header("timestamp", timestamp)
            .header("sign", sign)
            .header("Content-Type", "application/json")
            .body(compact_body)
            .send()
            .await?;

        Ok(response.json().await?)
    }

    fn unwrap_envelope<T>(envelope: ApiResponse<T>) -> Result<T, ExchangeError> {
        if envelope.code != 0 {
            return Err(ExchangeError::from_code(envelope.code, envelope.msg));
        }
        envelope
            .data
            .ok_or_else(|| ExchangeError::Validation("response envelope missing data".into()))
    }

    /// POST where only the envelope code matters (cancel/close endpoints
    /// return no meaningful payload).
    async fn signed_post_ack(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<(), ExchangeError> {
        let envelope: ApiResponse<serde_json::Value> = self.signed_post_raw(path, body).await?;
        if envelope.code != 0 {
            return Err(ExchangeError::from_code(envelope.code, envelope.msg));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeApi for BitunixClient {
    #[instrument(skip(self, req), fields(symbol = %req.symbol, side = %req.side, price = %req.price))]
    async fn place_limit_order(&self, req: &LimitOrderRequest) -> Result<String, ExchangeError> {
        let body = serde_json::json!({
            "symbol": req.symbol,
            "qty": req.qty.to_string(),
            "side": req.side.as_order_side(),
            "tradeSide": "OPEN",
            "orderType": "LIMIT",
            "price": req.price.to_string(),
            "effect": "GTC",
            "clientId": req.client_id,
            "tpPrice": req.take_profit.to_string(),
            "tpStopType": "MARK_PRICE",
            "tpOrderType": "LIMIT",
            "tpOrderPrice": req.take_profit.to_string(),
            "slPrice": req.stop_loss.to_string(),
            "slStopType": "MARK_PRICE",
            "slOrderType": "LIMIT",
            "slOrderPrice": req.stop_loss.to_string(),
        });

        let placed: PlacedOrder = self.signed_post(PLACE_ORDER_PATH, &body).await?;
        let order_id = placed
            .order_id
            .ok_or_else(|| ExchangeError::Validation("placement response missing orderId".into()))?;

        debug!(order_id = %order_id, "Limit order accepted");
        Ok(order_id)
    }

    #[instrument(skip(self, order_ids), fields(symbol, count = order_ids.len()))]
    async fn cancel_orders(
        &self,
        symbol: &str,
        order_ids: &[String],
    ) -> Result<(), ExchangeError> {
        if order_ids.is_empty() {
            return Ok(());
        }

        let body = serde_json::json!({
            "symbol": symbol,
            "orderList": order_ids
                .iter()
                .map(|id| serde_json::json!({ "orderId": id }))
                .collect::<Vec<_>>(),
        });

        // Success is reported for the batch; per-id results are not exposed.
        self.signed_post_ack(CANCEL_ORDERS_PATH, &body).await
    }

    async fn get_pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, ExchangeError> {
        let params = [("symbol", symbol.to_string())];
        let list: PendingOrderList = self.signed_get(PENDING_ORDERS_PATH, &params).await?;
        Ok(list.order_list)
    }

    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError> {
        let params = [("marginCoin", self.margin_coin.clone())];
        let account: AccountSnapshot = self.signed_get(ACCOUNT_PATH, &params).await?;
        Ok(account.available)
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let entries: Vec<KlineEntry> = self.signed_get(KLINE_PATH, &params).await?;

        Ok(entries
            .into_iter()
            .map(|k| Candle {
                close_time: Utc
                    .timestamp_millis_opt(k.time)
                    .single()
                    .unwrap_or_else(Utc::now),
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn close_all_positions(&self, symbol: &str) -> Result<(), ExchangeError> {
        let body = serde_json::json!({ "symbol": symbol });
        self.signed_post_ack(CLOSE_ALL_POSITION_PATH, &body).await
    }
}
