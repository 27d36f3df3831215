//! Grid Ladder Bot - main entry point.

use anyhow::{Context, Result};
use clap::Parser;
use grid_ladder_bot::capital::CapitalLedger;
use grid_ladder_bot::config::Config;
use grid_ladder_bot::exchange::{
    BitunixClient, BitunixFeed, ExchangeApi, FeedCredentials, MockExchange,
};
use grid_ladder_bot::indicators::CandleStore;
use grid_ladder_bot::strategy::{
    GridOrderManager, OrderService, OrderServiceAdapter, SymbolLocks,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CANDLE_INTERVAL: &str = "1m";

/// Grid Ladder Bot CLI
#[derive(Parser)]
#[command(name = "grid-ladder-bot")]
#[command(version, about = "ATR-spaced grid ladder trading on Bitunix Futures")]
struct Cli {
    /// Path to the configuration file (without extension)
    #[arg(short, long)]
    config: Option<String>,

    /// Paper-trade against an in-memory mock instead of the live exchange
    #[arg(long)]
    paper: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;
    anyhow::ensure!(!config.symbols.is_empty(), "no symbols configured");

    info!(
        symbols = config.symbols.len(),
        paper = cli.paper,
        capital = %config.capital.total_capital,
        "Starting grid ladder bot"
    );

    let ledger = Arc::new(CapitalLedger::new(config.capital.total_capital));
    let exchange: Arc<dyn ExchangeApi> = if cli.paper {
        Arc::new(MockExchange::new(config.capital.total_capital))
    } else {
        Arc::new(BitunixClient::new(&config.exchange)?)
    };

    let leverage_by_symbol: HashMap<String, Decimal> = config
        .symbols
        .iter()
        .map(|s| (s.symbol.clone(), s.grid.leverage))
        .collect();
    let orders: Arc<dyn OrderService> = Arc::new(OrderServiceAdapter::new(
        Arc::clone(&exchange),
        Arc::clone(&ledger),
        config.capital.margin_per_order,
        leverage_by_symbol,
        config.capital.min_order_qty,
    ));

    // Prime candle windows from REST history; the kline stream extends them.
    let candles = Arc::new(CandleStore::new(config.atr_period));
    for sym in &config.symbols {
        match exchange
            .get_recent_candles(&sym.symbol, CANDLE_INTERVAL, config.atr_period + 1)
            .await
        {
            Ok(backfill) if !backfill.is_empty() => {
                info!(symbol = %sym.symbol, count = backfill.len(), "Primed candle window");
                candles.prime(&sym.symbol, backfill);
            }
            Ok(_) => {
                warn!(symbol = %sym.symbol, "No candle history returned; waiting for stream")
            }
            Err(e) => {
                warn!(symbol = %sym.symbol, error = %e, "Candle backfill failed; waiting for stream")
            }
        }
    }

    let manager = Arc::new(GridOrderManager::new(
        orders,
        Arc::clone(&exchange),
        Arc::clone(&ledger),
        Arc::clone(&candles),
        config.capital.margin_per_order,
        config.symbols.clone(),
        Arc::new(SymbolLocks::default()),
    ));

    // Feed wiring: public price/kline streams, private order/balance streams.
    let (event_tx, mut event_rx) = mpsc::channel(1024);

    let public_feed = Arc::new(BitunixFeed::new(config.exchange.ws_public_url.clone()));
    for sym in &config.symbols {
        public_feed.subscribe_price(&sym.symbol);
        public_feed.subscribe_klines(&sym.symbol, CANDLE_INTERVAL);
    }
    let public_handle = Arc::clone(&public_feed).start(event_tx.clone());

    let private_handle = if cli.paper {
        // Paper mode has no private stream; orders rest on the mock.
        None
    } else {
        let private_feed = Arc::new(BitunixFeed::with_credentials(
            config.exchange.ws_private_url.clone(),
            FeedCredentials {
                api_key: config.exchange.api_key.clone(),
                api_secret: config.exchange.api_secret.clone(),
            },
        ));
        private_feed.subscribe_orders();
        private_feed.subscribe_balance();
        Some(Arc::clone(&private_feed).start(event_tx.clone()))
    };
    drop(event_tx);

    // Reconcile orders left resting by a previous run before trading.
    if !cli.paper {
        for sym in &config.symbols {
            if let Err(e) = manager.sync_open_orders(&sym.symbol).await {
                warn!(symbol = %sym.symbol, error = %e, "Initial order sync failed");
            }
        }
    }

    let loop_handles = manager.run();

    let dispatch_manager = Arc::clone(&manager);
    let dispatch = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            dispatch_manager.handle_event(event).await;
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");

    manager.shutdown();
    dispatch.abort();
    public_handle.abort();
    if let Some(handle) = private_handle {
        handle.abort();
    }
    for handle in loop_handles {
        handle.abort();
    }

    info!("Grid ladder bot stopped");
    Ok(())
}
