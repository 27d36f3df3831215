//! The exchange capability boundary the trading core talks to.
//!
//! Everything the grid needs from a venue fits behind one trait so the core
//! can run against the live [`BitunixClient`](super::BitunixClient), the
//! paper-trading [`MockExchange`](super::MockExchange), or a mockall double
//! in tests.

use crate::exchange::error::ExchangeError;
use crate::exchange::types::{LimitOrderRequest, PendingOrder};
use crate::indicators::Candle;
use async_trait::async_trait;
use rust_decimal::Decimal;

#[cfg(test)]
use mockall::automock;

/// Order placement, cancellation and market/account queries for one venue.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Submit a limit order with attached TP/SL legs; returns the exchange
    /// order id. A response without an order id is a validation error.
    async fn place_limit_order(&self, req: &LimitOrderRequest) -> Result<String, ExchangeError>;

    /// Cancel a batch of orders for one symbol. Success is per batch; the
    /// exchange does not report per-id granularity.
    async fn cancel_orders(&self, symbol: &str, order_ids: &[String])
        -> Result<(), ExchangeError>;

    /// All currently resting orders for a symbol.
    async fn get_pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, ExchangeError>;

    /// Available (uncommitted) balance of the margin coin.
    async fn get_available_balance(&self) -> Result<Decimal, ExchangeError>;

    /// Most recent closed candles, oldest first.
    async fn get_recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Market-close every open position for a symbol.
    async fn close_all_positions(&self, symbol: &str) -> Result<(), ExchangeError>;
}
