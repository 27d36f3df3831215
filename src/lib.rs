//! # Grid Ladder Bot
//!
//! An automated ATR-spaced grid ("ladder") trading bot for Bitunix
//! USDT-margined perpetual futures.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and per-symbol strategy parameters
//! - `capital`: In-memory margin ledger shared across all symbols
//! - `exchange`: Bitunix REST client, supervised WebSocket feed, paper mock
//! - `indicators`: Candle windows and ATR-derived rung spacing
//! - `strategy`: The recentering ladder, order adapter and grid manager
//! - `utils`: Shared decimal helpers

pub mod capital;
pub mod config;
pub mod exchange;
pub mod indicators;
pub mod strategy;
pub mod utils;

pub use config::Config;
