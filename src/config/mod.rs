//! Configuration for the grid ladder bot.
//!
//! Loads settings from a config file plus `GLB`-prefixed environment
//! variables. Per-symbol grid and ladder parameters are immutable for a run.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange endpoints and credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Capital and per-order sizing
    #[serde(default)]
    pub capital: CapitalConfig,
    /// Rolling ATR period shared by spacing and exit derivation
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    /// Symbols to trade, each with its own grid/ladder parameters
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for signed requests
    #[serde(default)]
    pub api_key: String,
    /// API secret for request signatures
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_ws_public_url")]
    pub ws_public_url: String,
    #[serde(default = "default_ws_private_url")]
    pub ws_private_url: String,
    /// Margin coin for balance queries and ledger refresh
    #[serde(default = "default_margin_coin")]
    pub margin_coin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Starting total capital in USDT (refreshed from exchange balance)
    #[serde(default = "default_total_capital")]
    pub total_capital: Decimal,
    /// Fixed margin budget per placed order, in USDT
    #[serde(default = "default_margin_per_order")]
    pub margin_per_order: Decimal,
    /// Minimum viable order quantity; smaller orders are rejected
    #[serde(default = "default_min_order_qty")]
    pub min_order_qty: Decimal,
}

/// One traded symbol and its strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    /// Price tick size all prices are quantized to
    #[serde(default = "default_tick_size")]
    pub tick_size: Decimal,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub ladder: LadderConfig,
}

/// Operational policy for one symbol's grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Target resting long orders below price
    #[serde(default = "default_order_count")]
    pub long_order_count: usize,
    /// Target resting short orders above price
    #[serde(default = "default_order_count")]
    pub short_order_count: usize,
    /// Take-profit distance as a multiple of ATR
    #[serde(default = "default_exit_mult")]
    pub take_profit_mult: Decimal,
    /// Stop-loss distance as a multiple of ATR
    #[serde(default = "default_exit_mult")]
    pub stop_loss_mult: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    /// Rung spacing as a multiple of ATR
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: Decimal,
    /// Orders older than this and >1% from price are expired
    #[serde(default = "default_stale_age_secs")]
    pub stale_age_secs: u64,
    /// Hard cap on concurrently open orders for the symbol
    #[serde(default = "default_max_orders")]
    pub max_orders_per_symbol: usize,
    /// Replace per-order TP with a flat percentage of entry
    #[serde(default = "default_grouped_take_profit")]
    pub grouped_take_profit: bool,
    /// Grouped take-profit band as a fraction of average entry
    #[serde(default = "default_group_take_profit_pct")]
    pub group_take_profit_pct: Decimal,
    /// When false, a wide 5x ATR stop is substituted instead of none
    #[serde(default = "default_use_stop_loss")]
    pub use_stop_loss: bool,
    /// Absolute unrealized loss per side that blocks new entries, USDT
    #[serde(default = "default_max_loss_per_side_usd")]
    pub max_loss_per_side_usd: Decimal,
    /// Drawdown from the side's average entry that blocks new entries
    #[serde(default = "default_max_loss_per_side_pct")]
    pub max_loss_per_side_pct: Decimal,
    /// Fraction of a side underwater/winning that triggers trend adjustment
    #[serde(default = "default_trend_flip_threshold")]
    pub trend_flip_threshold: Decimal,
}

/// Parameters of the recentering ladder itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderConfig {
    /// Rungs per side when (re)seeding
    #[serde(default = "default_order_count")]
    pub base_rungs_per_side: usize,
    /// Multiplier applied to the raw spacing source (ATR)
    #[serde(default = "default_atr_multiplier")]
    pub spacing_multiplier: Decimal,
    /// Take-profit as a fraction of rung price
    #[serde(default = "default_ladder_exit_pct")]
    pub take_profit_pct: Decimal,
    /// Stop-loss as a fraction of rung price
    #[serde(default = "default_ladder_exit_pct")]
    pub stop_loss_pct: Decimal,
    /// Absolute nudge applied to TP/SL for funding costs
    #[serde(default)]
    pub funding_rate_adjustment: Decimal,
    /// Confirmed TP fills on one side that trigger a recenter
    #[serde(default = "default_rungs_to_tp_recenter")]
    pub rungs_to_tp_recenter: u32,
}

// Default value functions

fn default_atr_period() -> usize {
    14
}

fn default_rest_url() -> String {
    "https://fapi.bitunix.com".to_string()
}

fn default_ws_public_url() -> String {
    "wss://fapi.bitunix.com/public/".to_string()
}

fn default_ws_private_url() -> String {
    "wss://fapi.bitunix.com/private/".to_string()
}

fn default_margin_coin() -> String {
    "USDT".to_string()
}

fn default_total_capital() -> Decimal {
    Decimal::new(200, 0) // 200 USDT
}

fn default_margin_per_order() -> Decimal {
    Decimal::new(5, 0) // 5 USDT per rung
}

fn default_min_order_qty() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_order_count() -> usize {
    5
}

fn default_exit_mult() -> Decimal {
    Decimal::new(4, 1) // 0.4 x ATR
}

fn default_leverage() -> Decimal {
    Decimal::new(25, 0)
}

fn default_atr_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_stale_age_secs() -> u64 {
    20
}

fn default_max_orders() -> usize {
    10
}

fn default_grouped_take_profit() -> bool {
    true
}

fn default_group_take_profit_pct() -> Decimal {
    Decimal::new(6, 3) // 0.006 = 0.6%
}

fn default_use_stop_loss() -> bool {
    true
}

fn default_max_loss_per_side_usd() -> Decimal {
    Decimal::new(10, 0)
}

fn default_max_loss_per_side_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02 = 2%
}

fn default_trend_flip_threshold() -> Decimal {
    Decimal::new(60, 2) // 0.60
}

fn default_ladder_exit_pct() -> Decimal {
    Decimal::new(5, 3) // 0.005 = 0.5%
}

fn default_rungs_to_tp_recenter() -> u32 {
    2
}

impl Config {
    /// Load configuration from a file plus `GLB__`-prefixed env variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("config")).required(path.is_some()))
            .add_source(config::Environment::default().separator("__").prefix("GLB"));

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.atr_period > 0, "atr_period must be positive");
        anyhow::ensure!(
            self.capital.total_capital > Decimal::ZERO,
            "total_capital must be positive"
        );
        anyhow::ensure!(
            self.capital.margin_per_order > Decimal::ZERO,
            "margin_per_order must be positive"
        );

        for sym in &self.symbols {
            anyhow::ensure!(!sym.symbol.is_empty(), "symbol name must not be empty");
            anyhow::ensure!(
                sym.tick_size > Decimal::ZERO,
                "{}: tick_size must be positive",
                sym.symbol
            );
            anyhow::ensure!(
                sym.grid.leverage >= Decimal::ONE,
                "{}: leverage must be >= 1",
                sym.symbol
            );
            anyhow::ensure!(
                sym.grid.long_order_count > 0 && sym.grid.short_order_count > 0,
                "{}: order counts must be positive",
                sym.symbol
            );
            anyhow::ensure!(
                sym.grid.max_orders_per_symbol > 0,
                "{}: max_orders_per_symbol must be positive",
                sym.symbol
            );
            anyhow::ensure!(
                sym.grid.trend_flip_threshold > Decimal::ZERO
                    && sym.grid.trend_flip_threshold <= Decimal::ONE,
                "{}: trend_flip_threshold must be in (0, 1]",
                sym.symbol
            );
            anyhow::ensure!(
                sym.grid.group_take_profit_pct > Decimal::ZERO,
                "{}: group_take_profit_pct must be positive",
                sym.symbol
            );
            anyhow::ensure!(
                sym.ladder.base_rungs_per_side > 0,
                "{}: base_rungs_per_side must be positive",
                sym.symbol
            );
            anyhow::ensure!(
                sym.ladder.take_profit_pct > Decimal::ZERO
                    && sym.ladder.take_profit_pct < Decimal::ONE,
                "{}: take_profit_pct must be in (0, 1)",
                sym.symbol
            );
            anyhow::ensure!(
                sym.ladder.stop_loss_pct > Decimal::ZERO && sym.ladder.stop_loss_pct < Decimal::ONE,
                "{}: stop_loss_pct must be in (0, 1)",
                sym.symbol
            );
            anyhow::ensure!(
                sym.ladder.rungs_to_tp_recenter > 0,
                "{}: rungs_to_tp_recenter must be positive",
                sym.symbol
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            capital: CapitalConfig::default(),
            atr_period: default_atr_period(),
            symbols: Vec::new(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            rest_url: default_rest_url(),
            ws_public_url: default_ws_public_url(),
            ws_private_url: default_ws_private_url(),
            margin_coin: default_margin_coin(),
        }
    }
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total_capital: default_total_capital(),
            margin_per_order: default_margin_per_order(),
            min_order_qty: default_min_order_qty(),
        }
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            long_order_count: default_order_count(),
            short_order_count: default_order_count(),
            take_profit_mult: default_exit_mult(),
            stop_loss_mult: default_exit_mult(),
            leverage: default_leverage(),
            atr_multiplier: default_atr_multiplier(),
            stale_age_secs: default_stale_age_secs(),
            max_orders_per_symbol: default_max_orders(),
            grouped_take_profit: default_grouped_take_profit(),
            group_take_profit_pct: default_group_take_profit_pct(),
            use_stop_loss: default_use_stop_loss(),
            max_loss_per_side_usd: default_max_loss_per_side_usd(),
            max_loss_per_side_pct: default_max_loss_per_side_pct(),
            trend_flip_threshold: default_trend_flip_threshold(),
        }
    }
}

impl Default for LadderConfig {
    fn default() -> Self {
        Self {
            base_rungs_per_side: default_order_count(),
            spacing_multiplier: default_atr_multiplier(),
            take_profit_pct: default_ladder_exit_pct(),
            stop_loss_pct: default_ladder_exit_pct(),
            funding_rate_adjustment: Decimal::ZERO,
            rungs_to_tp_recenter: default_rungs_to_tp_recenter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config_with_symbol() -> Config {
        Config {
            symbols: vec![SymbolConfig {
                symbol: "BTCUSDT".to_string(),
                tick_size: dec!(0.01),
                grid: GridConfig::default(),
                ladder: LadderConfig::default(),
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(config_with_symbol().validate().is_ok());
    }

    #[test]
    fn test_zero_leverage_rejected() {
        let mut config = config_with_symbol();
        config.symbols[0].grid.leverage = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tp_fraction_out_of_range_rejected() {
        let mut config = config_with_symbol();
        config.symbols[0].ladder.take_profit_pct = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_symbol_config_deserializes_with_defaults() {
        let json = r#"{
            "symbol": "HBARUSDT",
            "tick_size": "0.00001",
            "grid": { "leverage": "10" }
        }"#;
        let sym: SymbolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(sym.symbol, "HBARUSDT");
        assert_eq!(sym.tick_size, dec!(0.00001));
        assert_eq!(sym.grid.leverage, dec!(10));
        // Unspecified fields fall back to defaults.
        assert_eq!(sym.grid.long_order_count, 5);
        assert_eq!(sym.ladder.rungs_to_tp_recenter, 2);
    }
}
