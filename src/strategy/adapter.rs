//! Order placement capability shared by the ladder and the grid manager.
//!
//! The adapter owns the margin handshake with the capital ledger: margin is
//! reserved only after the exchange returns an order id, and a reservation
//! failure at that point compensates by canceling the just-placed order so no
//! unaccounted order is ever left resting. It also remembers each order's
//! expected take-profit price so fills can be classified once.

use crate::capital::CapitalLedger;
use crate::exchange::{ExchangeApi, ExchangeError, LimitOrderRequest, Side};
use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tolerance when matching a fill price against the recorded TP price.
const TP_MATCH_EPSILON: Decimal = dec!(0.0000001);

/// Quantity is rounded to this many decimal places.
const QTY_PRECISION: u32 = 4;

/// Low-level capability for placing/canceling orders and classifying fills.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Place a limit order with protective exits.
    ///
    /// `Ok(None)` means the placement was skipped (insufficient capital, dust
    /// quantity, or a recoverable exchange error); only validation errors
    /// propagate as `Err`.
    async fn place_limit_order(
        &self,
        symbol: &str,
        price: Decimal,
        side: Side,
        take_profit: Decimal,
        stop_loss: Decimal,
    ) -> Result<Option<String>>;

    /// Cancel a batch of orders and release their margin reservations.
    async fn cancel_orders(&self, symbol: &str, order_ids: &[String]) -> Result<()>;

    /// One-shot query: was this order's fill its take-profit? The id is
    /// forgotten after the first call, whether or not it matched.
    fn was_take_profit_fill(&self, order_id: &str) -> bool;

    /// Record an observed fill price for later TP classification. Must be
    /// called before the fill is forwarded to the ladder.
    fn notify_fill(&self, order_id: &str, fill_price: Decimal);
}

/// [`OrderService`] backed by a real (or mock) exchange and the capital ledger.
pub struct OrderServiceAdapter {
    exchange: Arc<dyn ExchangeApi>,
    ledger: Arc<CapitalLedger>,
    margin_per_order: Decimal,
    leverage_by_symbol: HashMap<String, Decimal>,
    min_order_qty: Decimal,
    tp_prices: Mutex<HashMap<String, Decimal>>,
    tp_fills: Mutex<HashSet<String>>,
}

impl OrderServiceAdapter {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        ledger: Arc<CapitalLedger>,
        margin_per_order: Decimal,
        leverage_by_symbol: HashMap<String, Decimal>,
        min_order_qty: Decimal,
    ) -> Self {
        Self {
            exchange,
            ledger,
            margin_per_order,
            leverage_by_symbol,
            min_order_qty,
            tp_prices: Mutex::new(HashMap::new()),
            tp_fills: Mutex::new(HashSet::new()),
        }
    }

    fn leverage_for(&self, symbol: &str) -> Decimal {
        self.leverage_by_symbol
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    /// `round(margin x leverage / price, 4)` and the margin that quantity
    /// actually commits.
    fn size_order(&self, symbol: &str, price: Decimal) -> (Decimal, Decimal) {
        let leverage = self.leverage_for(symbol);
        let qty = ((self.margin_per_order * leverage) / price).round_dp(QTY_PRECISION);
        let margin = (qty * price) / leverage;
        (qty, margin)
    }
}

#[async_trait]
impl OrderService for OrderServiceAdapter {
    async fn place_limit_order(
        &self,
        symbol: &str,
        price: Decimal,
        side: Side,
        take_profit: Decimal,
        stop_loss: Decimal,
    ) -> Result<Option<String>> {
        let (qty, margin) = self.size_order(symbol, price);
        if qty < self.min_order_qty {
            warn!(symbol, %price, %qty, "Quantity below minimum, skipping placement");
            return Ok(None);
        }

        let available = self.ledger.available();
        if available < margin {
            debug!(
                symbol,
                %price,
                available = %available,
                required = %margin,
                "Insufficient ledger capital, skipping placement"
            );
            return Ok(None);
        }

        let request = LimitOrderRequest {
            symbol: symbol.to_string(),
            side,
            qty,
            price,
            take_profit,
            stop_loss,
            client_id: Uuid::new_v4().to_string(),
        };

        let order_id = match self.exchange.place_limit_order(&request).await {
            Ok(id) => id,
            Err(err @ ExchangeError::Validation(_)) => return Err(err.into()),
            Err(ExchangeError::InsufficientBalance { code }) => {
                warn!(symbol, code, "Exchange rejected order on balance; resyncing ledger");
                match self.exchange.get_available_balance().await {
                    Ok(avail) => self.ledger.refresh_total_capital(avail),
                    Err(e) => warn!(error = %e, "Balance resync failed"),
                }
                return Ok(None);
            }
            Err(e) => {
                warn!(symbol, %price, error = %e, "Placement failed, skipping");
                return Ok(None);
            }
        };

        if let Err(e) = self.ledger.reserve_margin(&order_id, margin) {
            // The order is live but unfunded in our books: compensate by
            // canceling it rather than leaving it resting unaccounted.
            error!(symbol, order_id = %order_id, error = %e, "Reservation failed after placement, canceling");
            if let Err(cancel_err) = self
                .exchange
                .cancel_orders(symbol, std::slice::from_ref(&order_id))
                .await
            {
                error!(symbol, order_id = %order_id, error = %cancel_err, "Compensating cancel failed");
            }
            return Ok(None);
        }

        self.tp_prices
            .lock()
            .expect("tp price lock poisoned")
            .insert(order_id.clone(), take_profit);

        info!(
            symbol,
            order_id = %order_id,
            side = %side,
            %price,
            %qty,
            tp = %take_profit,
            sl = %stop_loss,
            "Limit order placed"
        );
        Ok(Some(order_id))
    }

    async fn cancel_orders(&self, symbol: &str, order_ids: &[String]) -> Result<()> {
        if order_ids.is_empty() {
            return Ok(());
        }

        self.exchange.cancel_orders(symbol, order_ids).await?;

        // The exchange reports batch success only; release every id.
        let mut tp_prices = self.tp_prices.lock().expect("tp price lock poisoned");
        for id in order_ids {
            self.ledger.release_margin(id);
            tp_prices.remove(id);
        }
        debug!(symbol, count = order_ids.len(), "Orders canceled and margin released");
        Ok(())
    }

    fn was_take_profit_fill(&self, order_id: &str) -> bool {
        self.tp_fills
            .lock()
            .expect("tp fill lock poisoned")
            .remove(order_id)
    }

    fn notify_fill(&self, order_id: &str, fill_price: Decimal) {
        let expected = self
            .tp_prices
            .lock()
            .expect("tp price lock poisoned")
            .remove(order_id);

        if let Some(expected_tp) = expected {
            if (fill_price - expected_tp).abs() <= TP_MATCH_EPSILON {
                self.tp_fills
                    .lock()
                    .expect("tp fill lock poisoned")
                    .insert(order_id.to_string());
            }
        }
    }
}
