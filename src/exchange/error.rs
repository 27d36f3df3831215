//! Typed errors for exchange operations.

use thiserror::Error;

/// Bitunix error code for an order rejected on insufficient balance.
pub const CODE_INSUFFICIENT_BALANCE: i64 = 20003;

/// Errors surfaced by the REST client and the exchange capability boundary.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// A required field was missing or malformed (e.g. no order id in a
    /// placement response). Raised immediately, never silently defaulted.
    #[error("validation error: {0}")]
    Validation(String),

    /// The exchange rejected the order for lack of balance. Carries the
    /// structured exchange code so callers can resync their own ledger.
    #[error("exchange reports insufficient balance (code {code})")]
    InsufficientBalance { code: i64 },

    /// Any other non-zero exchange response code.
    #[error("exchange API error {code}: {message}")]
    Api { code: i64, message: String },

    /// Transport-level failure (HTTP, TLS, timeouts).
    #[error("network error: {0}")]
    Network(String),
}

impl ExchangeError {
    /// Map a non-zero envelope code to the right variant.
    pub fn from_code(code: i64, message: impl Into<String>) -> Self {
        if code == CODE_INSUFFICIENT_BALANCE {
            ExchangeError::InsufficientBalance { code }
        } else {
            ExchangeError::Api {
                code,
                message: message.into(),
            }
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        ExchangeError::Network(err.to_string())
    }
}
