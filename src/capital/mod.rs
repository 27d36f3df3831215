//! In-memory margin accounting shared across all symbols.
//!
//! The ledger is the sole admission gate for capital: no order may be placed
//! unless its margin was reserved here first. The exchange remains the source
//! of truth for the total — [`CapitalLedger::refresh_total_capital`] rebuilds
//! the total from the exchange-reported available balance plus whatever this
//! process currently has allocated.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by ledger operations.
#[derive(Debug, Error, PartialEq)]
pub enum CapitalError {
    /// Reserving `requested` would push allocation past total capital.
    #[error("insufficient capital: requested {requested}, only {available} free")]
    InsufficientCapital {
        requested: Decimal,
        available: Decimal,
    },
}

#[derive(Debug)]
struct LedgerState {
    total: Decimal,
    allocated: Decimal,
    margin_by_order: HashMap<String, Decimal>,
}

/// Thread-safe margin ledger.
///
/// All operations take one short-lived mutex; nothing awaits while holding it.
#[derive(Debug)]
pub struct CapitalLedger {
    state: Mutex<LedgerState>,
}

impl CapitalLedger {
    /// Create a ledger with a starting total capital figure.
    pub fn new(total_capital: Decimal) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                total: total_capital,
                allocated: Decimal::ZERO,
                margin_by_order: HashMap::new(),
            }),
        }
    }

    /// Reserve `amount` of margin for `order_id`.
    ///
    /// Reserving an already-reserved id is a no-op (idempotent). Fails with
    /// [`CapitalError::InsufficientCapital`] when the reservation would
    /// exceed total capital, leaving the ledger untouched.
    pub fn reserve_margin(&self, order_id: &str, amount: Decimal) -> Result<(), CapitalError> {
        let mut state = self.state.lock().expect("capital ledger lock poisoned");

        if state.margin_by_order.contains_key(order_id) {
            return Ok(());
        }

        let available = state.total - state.allocated;
        if state.allocated + amount > state.total {
            warn!(
                order_id,
                requested = %amount,
                available = %available,
                "Margin reservation rejected"
            );
            return Err(CapitalError::InsufficientCapital {
                requested: amount,
                available,
            });
        }

        state.margin_by_order.insert(order_id.to_string(), amount);
        state.allocated += amount;
        debug!(
            order_id,
            reserved = %amount,
            allocated = %state.allocated,
            available = %(state.total - state.allocated),
            "Margin reserved"
        );
        Ok(())
    }

    /// Release the margin held for `order_id`. Unknown ids are a no-op.
    pub fn release_margin(&self, order_id: &str) {
        let mut state = self.state.lock().expect("capital ledger lock poisoned");

        let Some(margin) = state.margin_by_order.remove(order_id) else {
            return;
        };

        state.allocated -= margin;
        if state.allocated < Decimal::ZERO {
            state.allocated = Decimal::ZERO;
        }
        debug!(
            order_id,
            released = %margin,
            allocated = %state.allocated,
            available = %(state.total - state.allocated),
            "Margin released"
        );
    }

    /// Capital not currently committed to any order.
    pub fn available(&self) -> Decimal {
        let state = self.state.lock().expect("capital ledger lock poisoned");
        state.total - state.allocated
    }

    /// Capital currently committed to open orders.
    pub fn allocated(&self) -> Decimal {
        self.state
            .lock()
            .expect("capital ledger lock poisoned")
            .allocated
    }

    /// Number of orders with an active reservation.
    pub fn active_order_count(&self) -> usize {
        self.state
            .lock()
            .expect("capital ledger lock poisoned")
            .margin_by_order
            .len()
    }

    /// Rebuild total capital from the exchange's reported available balance.
    ///
    /// The exchange's "available" figure excludes margin this process already
    /// committed, so `total = exchange_available + allocated`. The total can
    /// never drop below the currently allocated amount.
    pub fn refresh_total_capital(&self, exchange_available: Decimal) {
        let mut state = self.state.lock().expect("capital ledger lock poisoned");
        state.total = exchange_available + state.allocated;
        debug!(
            total = %state.total,
            allocated = %state.allocated,
            available = %(state.total - state.allocated),
            "Total capital refreshed from exchange balance"
        );
    }
}
