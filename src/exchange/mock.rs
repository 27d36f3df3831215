//! Mock exchange for paper trading and tests.
//!
//! Fills nothing on its own: orders rest until canceled or closed, which is
//! exactly what the grid core needs to exercise placement, cleanup and
//! compensation paths. Failures can be scripted per call.

use crate::exchange::error::{ExchangeError, CODE_INSUFFICIENT_BALANCE};
use crate::exchange::traits::ExchangeApi;
use crate::exchange::types::{LimitOrderRequest, PendingOrder};
use crate::indicators::Candle;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Failure to inject into the next matching call.
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    InsufficientBalance,
    Network,
    Api { code: i64, message: String },
}

impl ScriptedFailure {
    fn into_error(self) -> ExchangeError {
        match self {
            ScriptedFailure::InsufficientBalance => ExchangeError::InsufficientBalance {
                code: CODE_INSUFFICIENT_BALANCE,
            },
            ScriptedFailure::Network => ExchangeError::Network("simulated outage".into()),
            ScriptedFailure::Api { code, message } => ExchangeError::Api { code, message },
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    available_balance: Decimal,
    open_orders: HashMap<String, PendingOrder>,
    placed: Vec<LimitOrderRequest>,
    canceled: Vec<String>,
    closed_symbols: Vec<String>,
    candles: HashMap<String, Vec<Candle>>,
    place_failures: VecDeque<ScriptedFailure>,
}

/// In-memory [`ExchangeApi`] implementation.
pub struct MockExchange {
    state: Mutex<MockState>,
    order_seq: AtomicU64,
}

impl MockExchange {
    pub fn new(available_balance: Decimal) -> Self {
        Self {
            state: Mutex::new(MockState {
                available_balance,
                ..MockState::default()
            }),
            order_seq: AtomicU64::new(1),
        }
    }

    pub fn set_available_balance(&self, balance: Decimal) {
        self.state.lock().expect("mock state lock").available_balance = balance;
    }

    /// Candles returned by `get_recent_candles`, oldest first.
    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.state
            .lock()
            .expect("mock state lock")
            .candles
            .insert(symbol.to_string(), candles);
    }

    /// Queue a failure for the next `place_limit_order` call.
    pub fn fail_next_place(&self, failure: ScriptedFailure) {
        self.state
            .lock()
            .expect("mock state lock")
            .place_failures
            .push_back(failure);
    }

    /// Every placement request accepted so far.
    pub fn placed_orders(&self) -> Vec<LimitOrderRequest> {
        self.state.lock().expect("mock state lock").placed.clone()
    }

    /// Every order id canceled so far, in call order.
    pub fn canceled_ids(&self) -> Vec<String> {
        self.state.lock().expect("mock state lock").canceled.clone()
    }

    /// Symbols that had all positions closed.
    pub fn closed_symbols(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock state lock")
            .closed_symbols
            .clone()
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().expect("mock state lock").open_orders.len()
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new(dec!(10000))
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_limit_order(&self, req: &LimitOrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.state.lock().expect("mock state lock");

        if let Some(failure) = state.place_failures.pop_front() {
            return Err(failure.into_error());
        }

        let order_id = format!("mock-{}", self.order_seq.fetch_add(1, Ordering::SeqCst));
        state.placed.push(req.clone());
        state.open_orders.insert(
            order_id.clone(),
            PendingOrder {
                order_id: order_id.clone(),
                symbol: req.symbol.clone(),
                side: req.side.as_order_side().to_string(),
                price: req.price,
                qty: req.qty,
            },
        );

        debug!(order_id = %order_id, symbol = %req.symbol, price = %req.price, "Mock order placed");
        Ok(order_id)
    }

    async fn cancel_orders(
        &self,
        _symbol: &str,
        order_ids: &[String],
    ) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().expect("mock state lock");
        for id in order_ids {
            state.open_orders.remove(id);
            state.canceled.push(id.clone());
        }
        Ok(())
    }

    async fn get_pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, ExchangeError> {
        let state = self.state.lock().expect("mock state lock");
        Ok(state
            .open_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError> {
        Ok(self.state.lock().expect("mock state lock").available_balance)
    }

    async fn get_recent_candles(
        &self,
        symbol: &str,
        _interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let state = self.state.lock().expect("mock state lock");
        let candles = state.candles.get(symbol).cloned().unwrap_or_default();
        let start = candles.len().saturating_sub(limit);
        Ok(candles[start..].to_vec())
    }

    async fn close_all_positions(&self, symbol: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().expect("mock state lock");
        state.closed_symbols.push(symbol.to_string());
        state.open_orders.retain(|_, o| o.symbol != symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::Side;
    use chrono::Utc;

    fn request(symbol: &str, price: Decimal) -> LimitOrderRequest {
        LimitOrderRequest {
            symbol: symbol.to_string(),
            side: Side::Long,
            qty: dec!(0.01),
            price,
            take_profit: price + dec!(1),
            stop_loss: price - dec!(1),
            client_id: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_orders_rest_until_canceled() {
        let exchange = MockExchange::default();

        let id = exchange
            .place_limit_order(&request("BTCUSDT", dec!(100)))
            .await
            .unwrap();
        assert_eq!(exchange.open_order_count(), 1);

        let pending = exchange.get_pending_orders("BTCUSDT").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_id, id);

        exchange.cancel_orders("BTCUSDT", &[id.clone()]).await.unwrap();
        assert_eq!(exchange.open_order_count(), 0);
        assert_eq!(exchange.canceled_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_scripted_failure_fires_once() {
        let exchange = MockExchange::default();
        exchange.fail_next_place(ScriptedFailure::InsufficientBalance);

        let err = exchange
            .place_limit_order(&request("BTCUSDT", dec!(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::InsufficientBalance { .. }));

        // Next call succeeds.
        assert!(exchange
            .place_limit_order(&request("BTCUSDT", dec!(100)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_all_clears_symbol_only() {
        let exchange = MockExchange::default();
        exchange
            .place_limit_order(&request("BTCUSDT", dec!(100)))
            .await
            .unwrap();
        exchange
            .place_limit_order(&request("ETHUSDT", dec!(10)))
            .await
            .unwrap();

        exchange.close_all_positions("BTCUSDT").await.unwrap();
        assert_eq!(exchange.closed_symbols(), vec!["BTCUSDT".to_string()]);
        assert_eq!(exchange.open_order_count(), 1);
    }

    #[tokio::test]
    async fn test_candle_limit_returns_most_recent() {
        let exchange = MockExchange::default();
        let candles: Vec<Candle> = (0..5)
            .map(|i| Candle {
                close_time: Utc::now(),
                open: Decimal::from(i),
                high: Decimal::from(i),
                low: Decimal::from(i),
                close: Decimal::from(i),
            })
            .collect();
        exchange.set_candles("BTCUSDT", candles);

        let recent = exchange
            .get_recent_candles("BTCUSDT", "1m", 2)
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].close, dec!(3));
        assert_eq!(recent[1].close, dec!(4));
    }
}
