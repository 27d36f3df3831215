//! Exchange integration for Bitunix USDT-margined futures.
//!
//! - Signed REST client for order placement, cancellation and market data
//! - Supervised WebSocket feed with automatic reconnect + resubscribe
//! - Paper-trading mock implementing the same capability trait

mod client;
pub mod error;
pub mod mock;
mod traits;
mod types;
mod websocket;

pub use client::BitunixClient;
pub use error::ExchangeError;
pub use mock::{MockExchange, ScriptedFailure};
pub use traits::ExchangeApi;
pub use types::*;
pub use websocket::{
    BitunixFeed, FeedCredentials, FeedEvent, OrderEventKind, OrderUpdateEvent, Subscription,
};

#[cfg(test)]
pub use traits::MockExchangeApi;
