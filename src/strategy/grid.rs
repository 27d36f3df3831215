//! Per-symbol grid orchestration on top of the recentering ladder.
//!
//! The manager owns the active-order table (the bot's view of what is resting
//! at the exchange), reacts to feed events, and runs one monitoring loop per
//! symbol enforcing operational policy: order caps, per-side loss caps, stale
//! expiry, rung replenishment, trend flips and the grouped take-profit zone.
//! Every action re-reads authoritative state rather than trusting event
//! order, so out-of-order delivery from the feed is tolerated.

use crate::capital::CapitalLedger;
use crate::config::SymbolConfig;
use crate::exchange::{ExchangeApi, FeedEvent, OrderEventKind, OrderUpdateEvent, Side};
use crate::indicators::{AtrSpacing, CandleStore};
use crate::strategy::adapter::OrderService;
use crate::strategy::ladder::{RecenterLadder, Rung};
use crate::utils::decimal::{round_to_tick, safe_div};
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay between monitoring-loop iterations.
const MONITOR_INTERVAL: Duration = Duration::from_millis(500);
/// Delay between grouped take-profit zone checks.
const PROFIT_ZONE_INTERVAL: Duration = Duration::from_secs(1);
/// Interval of the summary status report.
const STATUS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
/// Cooldown before a symbol's grid may be re-initialized.
const REINIT_COOLDOWN: Duration = Duration::from_secs(10);

/// A replenish placement is skipped when a same-side order already rests
/// within this absolute price band.
const PRICE_MATCH_TOLERANCE: Decimal = dec!(0.0008);
/// Stale orders must also be at least this fraction away from current price.
const STALE_DISTANCE_PCT: Decimal = dec!(0.01);
/// How many orders a trend adjustment flips or reallocates at a time.
const TREND_FLIP_COUNT: usize = 2;

/// One order the bot believes is resting at the exchange.
#[derive(Debug, Clone)]
pub struct GridOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub capital_allocated: Decimal,
    pub leverage: Decimal,
    pub created_at: DateTime<Utc>,
}

impl GridOrder {
    pub fn new(
        order_id: String,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        capital_allocated: Decimal,
        leverage: Decimal,
    ) -> Self {
        Self {
            order_id,
            symbol: symbol.to_string(),
            side,
            entry_price,
            capital_allocated,
            leverage,
            created_at: Utc::now(),
        }
    }

    /// Position size implied by margin and leverage.
    pub fn quantity(&self) -> Decimal {
        safe_div(self.capital_allocated * self.leverage, self.entry_price)
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        match self.side {
            Side::Long => (current_price - self.entry_price) * self.quantity(),
            Side::Short => (self.entry_price - current_price) * self.quantity(),
        }
    }

    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        (Utc::now() - self.created_at).num_seconds() > max_age_secs as i64
    }
}

/// Per-symbol mirror of rung prices, both sides ascending.
#[derive(Debug, Default)]
pub struct RungBook {
    longs: Vec<Decimal>,
    shorts: Vec<Decimal>,
}

impl RungBook {
    fn insert(&mut self, side: Side, price: Decimal) {
        let list = match side {
            Side::Long => &mut self.longs,
            Side::Short => &mut self.shorts,
        };
        if let Err(pos) = list.binary_search(&price) {
            list.insert(pos, price);
        }
    }

    fn remove(&mut self, side: Side, price: Decimal) {
        let list = match side {
            Side::Long => &mut self.longs,
            Side::Short => &mut self.shorts,
        };
        if let Ok(pos) = list.binary_search(&price) {
            list.remove(pos);
        }
    }

    fn replace(&mut self, rungs: &[Rung]) {
        self.longs.clear();
        self.shorts.clear();
        for rung in rungs {
            self.insert(rung.side, rung.price);
        }
    }

    fn clear(&mut self) {
        self.longs.clear();
        self.shorts.clear();
    }

    pub fn longs(&self) -> &[Decimal] {
        &self.longs
    }

    pub fn shorts(&self) -> &[Decimal] {
        &self.shorts
    }
}

/// Registry of per-symbol initialization locks, passed in as a constructed
/// dependency rather than living in a process-wide global.
#[derive(Debug, Default)]
pub struct SymbolLocks {
    locks: DashMap<String, Arc<TokioMutex<()>>>,
}

impl SymbolLocks {
    pub fn lock_for(&self, symbol: &str) -> Arc<TokioMutex<()>> {
        self.locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(())))
            .clone()
    }
}

/// Per-symbol grid orchestrator.
pub struct GridOrderManager {
    orders: Arc<dyn OrderService>,
    exchange: Arc<dyn ExchangeApi>,
    ledger: Arc<CapitalLedger>,
    candles: Arc<CandleStore>,
    margin_per_order: Decimal,
    configs: HashMap<String, SymbolConfig>,
    ladders: HashMap<String, Arc<RecenterLadder>>,
    active_orders: DashMap<String, GridOrder>,
    rung_books: DashMap<String, Arc<StdMutex<RungBook>>>,
    prices: DashMap<String, Decimal>,
    funding_rates: DashMap<String, Decimal>,
    initialized: DashMap<String, ()>,
    last_init: DashMap<String, Instant>,
    init_locks: Arc<SymbolLocks>,
    shutdown_tx: watch::Sender<bool>,
}

impl GridOrderManager {
    pub fn new(
        orders: Arc<dyn OrderService>,
        exchange: Arc<dyn ExchangeApi>,
        ledger: Arc<CapitalLedger>,
        candles: Arc<CandleStore>,
        margin_per_order: Decimal,
        symbols: Vec<SymbolConfig>,
        init_locks: Arc<SymbolLocks>,
    ) -> Self {
        let mut configs = HashMap::new();
        let mut ladders = HashMap::new();
        let rung_books = DashMap::new();

        for sym in symbols {
            let spacing = Arc::new(AtrSpacing::new(sym.symbol.clone(), Arc::clone(&candles)));
            let ladder = Arc::new(RecenterLadder::new(
                sym.symbol.clone(),
                sym.ladder.clone(),
                Arc::clone(&orders),
                spacing,
                sym.tick_size,
            ));
            ladders.insert(sym.symbol.clone(), ladder);
            rung_books.insert(
                sym.symbol.clone(),
                Arc::new(StdMutex::new(RungBook::default())),
            );
            configs.insert(sym.symbol.clone(), sym);
        }

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            orders,
            exchange,
            ledger,
            candles,
            margin_per_order,
            configs,
            ladders,
            active_orders: DashMap::new(),
            rung_books,
            prices: DashMap::new(),
            funding_rates: DashMap::new(),
            initialized: DashMap::new(),
            last_init: DashMap::new(),
            init_locks,
            shutdown_tx,
        }
    }

    // ==================== Feed reaction ====================

    /// Route one feed event. Safe to call concurrently with the monitoring
    /// loops; every handler re-reads current state.
    pub async fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::PriceTick {
                symbol,
                price,
                funding_rate,
            } => {
                self.prices.insert(symbol.clone(), price);
                if let Some(rate) = funding_rate {
                    self.funding_rates.insert(symbol.clone(), rate);
                }

                let Some(ladder) = self.ladders.get(&symbol) else {
                    return;
                };
                if self.initialized.contains_key(&symbol) {
                    if let Err(e) = ladder.on_price_tick(price).await {
                        warn!(symbol = %symbol, error = %e, "Price tick handling failed");
                    }
                } else {
                    self.initialize_grid(&symbol, price).await;
                }
            }
            FeedEvent::OrderUpdate(update) => match update.event {
                OrderEventKind::Filled => self.handle_fill(update).await,
                OrderEventKind::Canceled => self.handle_cancel(update).await,
                OrderEventKind::Create => {}
            },
            FeedEvent::CandleClosed { symbol, candle } => {
                self.candles.push(&symbol, candle);
            }
            FeedEvent::BalanceUpdate { coin, available } => {
                if coin.eq_ignore_ascii_case("USDT") {
                    self.ledger.refresh_total_capital(available);
                }
            }
            FeedEvent::Connected => info!("Feed connected"),
            FeedEvent::Disconnected => warn!("Feed disconnected; supervisor is reconnecting"),
        }
    }

    /// Seed the first grid for a symbol. Claims are one-shot per symbol and
    /// serialized by the per-symbol init lock.
    async fn initialize_grid(&self, symbol: &str, live_price: Decimal) {
        let Some(ladder) = self.ladders.get(symbol) else {
            return;
        };
        if !self.candles.is_primed(symbol) {
            debug!(symbol, "Grid init deferred: candle window not primed");
            return;
        }

        let lock = self.init_locks.lock_for(symbol);
        let _guard = lock.lock().await;

        if !self.try_claim_first_grid(symbol) {
            return;
        }

        info!(symbol, price = %live_price, "First grid claimed, seeding ladder");
        if let Err(e) = ladder.initialize(live_price).await {
            warn!(symbol, error = %e, "Ladder seeding failed");
        }

        // Mirror the seeded rungs into the active-order table immediately;
        // later recenters arrive through the rung-sync task.
        let snapshot = ladder.subscribe().borrow().clone();
        self.apply_rung_snapshot(symbol, &snapshot);
    }

    /// Claim the "first grid" for this symbol. True exactly once per symbol
    /// until the claim is cleared.
    pub fn try_claim_first_grid(&self, symbol: &str) -> bool {
        if self.initialized.insert(symbol.to_string(), ()).is_none() {
            self.last_init.insert(symbol.to_string(), Instant::now());
            true
        } else {
            false
        }
    }

    /// Clear the claim so the grid can be re-initialized on purpose.
    pub fn clear_grid_initialized(&self, symbol: &str) {
        self.initialized.remove(symbol);
    }

    /// Whether re-initialization is allowed after the cooldown. Renews the
    /// timestamp when it is.
    pub fn can_reinitialize(&self, symbol: &str, cooldown: Duration) -> bool {
        if let Some(last) = self.last_init.get(symbol) {
            if last.elapsed() < cooldown {
                return false;
            }
        }
        self.last_init.insert(symbol.to_string(), Instant::now());
        true
    }

    /// Mirror a ladder rung snapshot: replace the rung book and upsert table
    /// entries for rungs that carry an order id.
    pub fn apply_rung_snapshot(&self, symbol: &str, rungs: &[Rung]) {
        {
            let book = self.rung_book(symbol);
            let mut book = book.lock().expect("rung book lock poisoned");
            book.replace(rungs);
        }

        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        for rung in rungs {
            let Some(order_id) = &rung.order_id else {
                continue;
            };
            if !self.active_orders.contains_key(order_id) {
                self.active_orders.insert(
                    order_id.clone(),
                    GridOrder::new(
                        order_id.clone(),
                        symbol,
                        rung.side,
                        rung.price,
                        self.margin_per_order,
                        cfg.grid.leverage,
                    ),
                );
            }
        }
    }

    async fn handle_fill(&self, update: OrderUpdateEvent) {
        debug!(
            order_id = %update.order_id,
            symbol = %update.symbol,
            price = %update.price,
            "Order filled"
        );

        // Classification must happen before the ladder consumes the flag.
        self.orders.notify_fill(&update.order_id, update.price);
        if let Some(ladder) = self.ladders.get(&update.symbol) {
            if let Err(e) = ladder
                .on_order_filled(&update.order_id, update.side, update.price)
                .await
            {
                warn!(symbol = %update.symbol, error = %e, "Fill handling failed");
            }
        }

        self.remove_order(&update.order_id);
        self.cleanup_extra_orders(&update.symbol).await;
    }

    async fn handle_cancel(&self, update: OrderUpdateEvent) {
        debug!(order_id = %update.order_id, symbol = %update.symbol, "Order canceled");
        self.remove_order(&update.order_id);
        self.cleanup_extra_orders(&update.symbol).await;
    }

    /// Drop one order from the table, release its margin, and clear its rung.
    fn remove_order(&self, order_id: &str) {
        if let Some((_, order)) = self.active_orders.remove(order_id) {
            self.ledger.release_margin(order_id);
            let book = self.rung_book(&order.symbol);
            book.lock()
                .expect("rung book lock poisoned")
                .remove(order.side, order.entry_price);
        }
    }

    // ==================== State snapshots ====================

    fn rung_book(&self, symbol: &str) -> Arc<StdMutex<RungBook>> {
        self.rung_books
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    pub fn open_count(&self, symbol: &str) -> usize {
        self.active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol)
            .count()
    }

    fn side_count(&self, symbol: &str, side: Side) -> usize {
        self.active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol && e.value().side == side)
            .count()
    }

    fn side_orders(&self, symbol: &str, side: Side) -> Vec<GridOrder> {
        self.active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol && e.value().side == side)
            .map(|e| e.value().clone())
            .collect()
    }

    fn symbol_orders(&self, symbol: &str) -> Vec<GridOrder> {
        self.active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Sum of unrealized PnL across one side's open orders.
    pub fn unrealized_side_pnl(&self, symbol: &str, side: Side, current_price: Decimal) -> Decimal {
        self.side_orders(symbol, side)
            .iter()
            .map(|o| o.unrealized_pnl(current_price))
            .sum()
    }

    // ==================== Placement ====================

    /// Derive the TP/SL pair for an entry from ATR and configured multipliers.
    ///
    /// Grouped take-profit mode replaces the TP with a flat percentage of
    /// entry; a disabled stop-loss is substituted with a wide 5x ATR stop so
    /// every order still carries one. `None` until ATR is available.
    pub fn derive_exits(
        &self,
        symbol: &str,
        entry_price: Decimal,
        side: Side,
    ) -> Option<(Decimal, Decimal)> {
        let cfg = self.configs.get(symbol)?;
        let grid = &cfg.grid;
        let atr = self.candles.atr(symbol)?;
        let funding = self
            .funding_rates
            .get(symbol)
            .map(|r| *r)
            .unwrap_or(Decimal::ZERO);

        let take_abs = atr * grid.take_profit_mult;
        let stop_abs = atr * grid.stop_loss_mult;

        let mut tp = match side {
            Side::Long => entry_price + take_abs + funding,
            Side::Short => entry_price - take_abs - funding,
        };
        let mut sl = match side {
            Side::Long => entry_price - stop_abs - funding,
            Side::Short => entry_price + stop_abs + funding,
        };

        if !grid.use_stop_loss {
            let wide = atr * dec!(5);
            sl = match side {
                Side::Long => entry_price - wide,
                Side::Short => entry_price + wide,
            };
        }
        if grid.grouped_take_profit {
            tp = match side {
                Side::Long => entry_price * (Decimal::ONE + grid.group_take_profit_pct),
                Side::Short => entry_price * (Decimal::ONE - grid.group_take_profit_pct),
            };
        }

        Some((
            round_to_tick(tp, cfg.tick_size),
            round_to_tick(sl, cfg.tick_size),
        ))
    }

    /// Place one grid rung, subject to full admission control.
    ///
    /// Rejections (counts, caps, loss limits, missing data) return `None`
    /// with no side effect.
    pub async fn place_rung_order(
        &self,
        symbol: &str,
        entry_price: Decimal,
        side: Side,
    ) -> Option<String> {
        let cfg = self.configs.get(symbol)?;
        let grid = &cfg.grid;

        let side_cap = match side {
            Side::Long => grid.long_order_count,
            Side::Short => grid.short_order_count,
        };
        if self.side_count(symbol, side) >= side_cap {
            return None;
        }
        if self.open_count(symbol) >= grid.max_orders_per_symbol {
            return None;
        }

        let current_price = *self.prices.get(symbol)?;

        let side_pnl = self.unrealized_side_pnl(symbol, side, current_price);
        if side_pnl < -grid.max_loss_per_side_usd {
            warn!(
                symbol,
                %side,
                pnl = %side_pnl,
                cap = %grid.max_loss_per_side_usd,
                "Side loss cap reached, skipping placement"
            );
            return None;
        }

        if grid.max_loss_per_side_pct > Decimal::ZERO {
            let side_orders = self.side_orders(symbol, side);
            if !side_orders.is_empty() {
                let avg_entry = side_orders.iter().map(|o| o.entry_price).sum::<Decimal>()
                    / Decimal::from(side_orders.len() as u64);
                // Rolling average over currently open orders only.
                let drawdown = match side {
                    Side::Long => safe_div(avg_entry - current_price, avg_entry),
                    Side::Short => safe_div(current_price - avg_entry, avg_entry),
                };
                if drawdown >= grid.max_loss_per_side_pct {
                    warn!(
                        symbol,
                        %side,
                        drawdown = %drawdown,
                        cap = %grid.max_loss_per_side_pct,
                        "Side drawdown cap reached, skipping placement"
                    );
                    return None;
                }
            }
        }

        let (tp, sl) = self.derive_exits(symbol, entry_price, side)?;

        match self
            .orders
            .place_limit_order(symbol, entry_price, side, tp, sl)
            .await
        {
            Ok(Some(order_id)) => {
                let qty = ((self.margin_per_order * grid.leverage) / entry_price).round_dp(4);
                let margin = (qty * entry_price) / grid.leverage;
                self.active_orders.insert(
                    order_id.clone(),
                    GridOrder::new(
                        order_id.clone(),
                        symbol,
                        side,
                        entry_price,
                        margin,
                        grid.leverage,
                    ),
                );
                let book = self.rung_book(symbol);
                book.lock()
                    .expect("rung book lock poisoned")
                    .insert(side, entry_price);
                Some(order_id)
            }
            Ok(None) => None,
            Err(e) => {
                error!(symbol, %entry_price, error = %e, "Rung placement error");
                None
            }
        }
    }

    // ==================== Maintenance ====================

    /// Cancel a batch and drop it from local state. Margin release happens in
    /// the order service; removal here is idempotent with feed-driven removal.
    pub async fn cancel_and_release(&self, symbol: &str, order_ids: &[String]) {
        if order_ids.is_empty() {
            return;
        }
        if let Err(e) = self.orders.cancel_orders(symbol, order_ids).await {
            warn!(symbol, error = %e, "Cancel batch failed; next cycle re-evaluates");
            return;
        }
        for id in order_ids {
            self.remove_order(id);
        }
    }

    /// Cancel per-side excess beyond the configured counts, farthest from
    /// current price first.
    pub async fn cleanup_extra_orders(&self, symbol: &str) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        let Some(current_price) = self.prices.get(symbol).map(|p| *p) else {
            return;
        };

        for (side, configured) in [
            (Side::Long, cfg.grid.long_order_count),
            (Side::Short, cfg.grid.short_order_count),
        ] {
            let mut orders = self.side_orders(symbol, side);
            if orders.len() <= configured {
                continue;
            }
            let excess = orders.len() - configured;
            orders.sort_by(|a, b| {
                (b.entry_price - current_price)
                    .abs()
                    .cmp(&(a.entry_price - current_price).abs())
            });
            let ids: Vec<String> = orders
                .iter()
                .take(excess)
                .map(|o| o.order_id.clone())
                .collect();
            info!(symbol, %side, excess, "Canceling excess orders");
            self.cancel_and_release(symbol, &ids).await;
        }
    }

    /// Cancel orders that are both older than the stale age and more than 1%
    /// away from current price.
    pub async fn expire_stale_orders(&self, symbol: &str, current_price: Decimal) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        let stale: Vec<String> = self
            .active_orders
            .iter()
            .filter(|e| {
                let o = e.value();
                o.symbol == symbol
                    && safe_div((o.entry_price - current_price).abs(), current_price)
                        > STALE_DISTANCE_PCT
                    && o.is_stale(cfg.grid.stale_age_secs)
            })
            .map(|e| e.key().clone())
            .collect();

        if !stale.is_empty() {
            info!(symbol, count = stale.len(), "Expiring stale orders");
            self.cancel_and_release(symbol, &stale).await;
        }
    }

    /// Top up missing rungs on each side up to the configured counts,
    /// skipping prices already occupied within the tolerance band. Stops
    /// entirely once the per-symbol cap is reached.
    pub async fn replenish_rungs(&self, symbol: &str, current_price: Decimal, spacing: Decimal) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        let grid = &cfg.grid;

        for (side, configured) in [
            (Side::Long, grid.long_order_count),
            (Side::Short, grid.short_order_count),
        ] {
            let mut needed = configured.saturating_sub(self.side_count(symbol, side));
            for i in 1..=configured {
                if needed == 0 {
                    break;
                }
                if self.open_count(symbol) >= grid.max_orders_per_symbol {
                    return;
                }

                let offset = spacing * Decimal::from(i as u64);
                let raw = match side {
                    Side::Long => current_price - offset,
                    Side::Short => current_price + offset,
                };
                let price = round_to_tick(raw, cfg.tick_size);
                if price <= Decimal::ZERO {
                    continue;
                }

                let occupied = self.active_orders.iter().any(|e| {
                    let o = e.value();
                    o.symbol == symbol
                        && o.side == side
                        && (o.entry_price - price).abs() <= PRICE_MATCH_TOLERANCE
                });
                if occupied {
                    continue;
                }

                if self.place_rung_order(symbol, price, side).await.is_some() {
                    needed -= 1;
                }
            }
        }
    }

    /// Trend adjustment: flip the worst losers of a dominantly losing side to
    /// the opposite side, and reallocate toward a dominantly winning side.
    /// Placements go through the same admission control as any rung.
    pub async fn adjust_for_trend(&self, symbol: &str, current_price: Decimal, spacing: Decimal) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        let grid = &cfg.grid;
        if self.open_count(symbol) >= grid.max_orders_per_symbol {
            return;
        }

        let buys = self.side_orders(symbol, Side::Long);
        let sells = self.side_orders(symbol, Side::Short);

        let long_trigger = threshold_count(grid.long_order_count, grid.trend_flip_threshold);
        let short_trigger = threshold_count(grid.short_order_count, grid.trend_flip_threshold);

        let losing = |o: &GridOrder| o.unrealized_pnl(current_price) < Decimal::ZERO;
        let winning = |o: &GridOrder| o.unrealized_pnl(current_price) > Decimal::ZERO;

        // Flip the worst losing longs into shorts above price.
        if buys.iter().filter(|o| losing(o)).count() >= long_trigger {
            self.flip_worst(symbol, &buys, Side::Short, current_price + spacing, current_price)
                .await;
        }

        // Flip the worst losing shorts into longs below price.
        if sells.iter().filter(|o| losing(o)).count() >= short_trigger {
            self.flip_worst(symbol, &sells, Side::Long, current_price - spacing, current_price)
                .await;
        }

        // Reward a dominantly winning side with the other side's worst orders.
        if buys.iter().filter(|o| winning(o)).count() >= long_trigger && !sells.is_empty() {
            self.flip_worst(symbol, &sells, Side::Long, current_price - spacing, current_price)
                .await;
        }
        if sells.iter().filter(|o| winning(o)).count() >= short_trigger && !buys.is_empty() {
            self.flip_worst(symbol, &buys, Side::Short, current_price + spacing, current_price)
                .await;
        }
    }

    /// Cancel the worst orders (by unrealized PnL) from `victims` and reopen
    /// them on `new_side` at `new_price`.
    async fn flip_worst(
        &self,
        symbol: &str,
        victims: &[GridOrder],
        new_side: Side,
        new_price: Decimal,
        current_price: Decimal,
    ) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };

        let mut victims = victims.to_vec();
        victims.sort_by(|a, b| {
            a.unrealized_pnl(current_price)
                .cmp(&b.unrealized_pnl(current_price))
        });

        let price = round_to_tick(new_price, cfg.tick_size);
        for victim in victims.iter().take(TREND_FLIP_COUNT) {
            if self.open_count(symbol) >= cfg.grid.max_orders_per_symbol {
                break;
            }
            info!(
                symbol,
                order_id = %victim.order_id,
                from = %victim.side,
                to = %new_side,
                entry = %victim.entry_price,
                "Trend adjustment: moving order to the other side"
            );
            self.cancel_and_release(symbol, std::slice::from_ref(&victim.order_id))
                .await;
            self.place_rung_order(symbol, price, new_side).await;
        }
    }

    /// Grouped take-profit zone: when price moves past the configured band
    /// around the average entry, close everything and chase a fresh ladder.
    pub async fn check_profit_zone(&self, symbol: &str) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        if !cfg.grid.grouped_take_profit {
            return;
        }
        let Some(current_price) = self.prices.get(symbol).map(|p| *p) else {
            return;
        };
        let orders = self.symbol_orders(symbol);
        if orders.is_empty() {
            return;
        }

        let avg_entry = orders.iter().map(|o| o.entry_price).sum::<Decimal>()
            / Decimal::from(orders.len() as u64);
        let upper = avg_entry * (Decimal::ONE + cfg.grid.group_take_profit_pct);
        let lower = avg_entry * (Decimal::ONE - cfg.grid.group_take_profit_pct);

        if current_price >= upper || current_price <= lower {
            info!(
                symbol,
                price = %current_price,
                avg_entry = %avg_entry,
                "Grouped take-profit zone hit, closing symbol"
            );
            self.close_all_positions(symbol).await;
            self.chase_grid(symbol, current_price).await;
        }
    }

    /// Close every position for a symbol and drop its local state.
    pub async fn close_all_positions(&self, symbol: &str) {
        let ids: Vec<String> = self
            .active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol)
            .map(|e| e.key().clone())
            .collect();
        for id in &ids {
            self.remove_order(id);
        }
        {
            let book = self.rung_book(symbol);
            book.lock().expect("rung book lock poisoned").clear();
        }

        if let Err(e) = self.exchange.close_all_positions(symbol).await {
            warn!(symbol, error = %e, "Close-all request failed");
        }
    }

    /// Rebuild a fresh rung set around a new live price.
    pub async fn chase_grid(&self, symbol: &str, live_price: Decimal) {
        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        let Some(atr) = self.candles.atr(symbol) else {
            debug!(symbol, "Chase skipped: ATR unavailable");
            return;
        };
        let spacing = atr * cfg.grid.atr_multiplier;
        info!(symbol, price = %live_price, %spacing, "Chasing fresh ladder");
        self.replenish_rungs(symbol, live_price, spacing).await;
    }

    /// Rebuild the symbol's in-memory view from the exchange's pending
    /// orders. Margin figures for resynced orders are unknown and left at
    /// zero; the next balance snapshot trues up the ledger.
    pub async fn sync_open_orders(&self, symbol: &str) -> Result<()> {
        let pending = self.exchange.get_pending_orders(symbol).await?;

        let existing: Vec<String> = self
            .active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol)
            .map(|e| e.key().clone())
            .collect();
        for id in &existing {
            if self.active_orders.remove(id).is_some() {
                self.ledger.release_margin(id);
            }
        }

        let book = self.rung_book(symbol);
        book.lock().expect("rung book lock poisoned").clear();

        let Some(cfg) = self.configs.get(symbol) else {
            return Ok(());
        };
        for order in pending {
            let Some(side) = Side::from_order_side(&order.side) else {
                continue;
            };
            self.active_orders.insert(
                order.order_id.clone(),
                GridOrder::new(
                    order.order_id.clone(),
                    symbol,
                    side,
                    order.price,
                    Decimal::ZERO,
                    cfg.grid.leverage,
                ),
            );
            book.lock()
                .expect("rung book lock poisoned")
                .insert(side, order.price);
        }

        info!(symbol, count = self.open_count(symbol), "Open orders resynced");
        Ok(())
    }

    // ==================== Loops ====================

    /// One pass of the monitoring loop: cleanup, stale expiry, replenish,
    /// trend adjustment — in that order, always.
    pub async fn monitor_iteration(&self, symbol: &str) {
        if !self.initialized.contains_key(symbol) {
            return;
        }
        let Some(current_price) = self.prices.get(symbol).map(|p| *p) else {
            return;
        };

        self.cleanup_extra_orders(symbol).await;
        self.expire_stale_orders(symbol, current_price).await;

        let Some(cfg) = self.configs.get(symbol) else {
            return;
        };
        if self.open_count(symbol) >= cfg.grid.max_orders_per_symbol {
            return;
        }
        let Some(atr) = self.candles.atr(symbol) else {
            return;
        };
        let spacing = atr * cfg.grid.atr_multiplier;

        self.replenish_rungs(symbol, current_price, spacing).await;
        self.adjust_for_trend(symbol, current_price, spacing).await;
    }

    /// Spawn all per-symbol loops plus the status reporter.
    pub fn run(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for symbol in self.configs.keys().cloned() {
            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let sym = symbol.clone();
            handles.push(tokio::spawn(async move {
                info!(symbol = %sym, "Order monitor started");
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
                    }
                    manager.monitor_iteration(&sym).await;
                }
                info!(symbol = %sym, "Order monitor stopped");
            }));

            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            let sym = symbol.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(PROFIT_ZONE_INTERVAL) => {}
                    }
                    manager.check_profit_zone(&sym).await;
                }
            }));

            if let Some(ladder) = self.ladders.get(&symbol) {
                let manager = Arc::clone(self);
                let mut rungs_rx = ladder.subscribe();
                let sym = symbol.clone();
                handles.push(tokio::spawn(async move {
                    while rungs_rx.changed().await.is_ok() {
                        let snapshot = rungs_rx.borrow_and_update().clone();
                        manager.apply_rung_snapshot(&sym, &snapshot);
                    }
                }));
            }
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(STATUS_REPORT_INTERVAL) => {}
                }
                manager.status_report();
            }
        }));

        handles
    }

    /// Log a summary of open orders and ledger totals.
    pub fn status_report(&self) {
        let allocated = self.ledger.allocated();
        let available = self.ledger.available();
        info!(
            open_orders = self.active_orders.len(),
            allocated = %allocated,
            available = %available,
            total = %(allocated + available),
            "Status report"
        );
        for symbol in self.configs.keys() {
            debug!(
                symbol = %symbol,
                open = self.open_count(symbol),
                longs = self.side_count(symbol, Side::Long),
                shorts = self.side_count(symbol, Side::Short),
                "Symbol status"
            );
        }
    }

    /// Stop every loop spawned by [`run`](Self::run).
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Cooldown-gated manual reset: cancel everything for the symbol and
    /// reseed the ladder at the given price.
    pub async fn reset_grid(&self, symbol: &str, live_price: Decimal) {
        if !self.can_reinitialize(symbol, REINIT_COOLDOWN) {
            debug!(symbol, "Reset skipped: within re-init cooldown");
            return;
        }
        self.clear_grid_initialized(symbol);

        let ids: Vec<String> = self
            .active_orders
            .iter()
            .filter(|e| e.value().symbol == symbol)
            .map(|e| e.key().clone())
            .collect();
        self.cancel_and_release(symbol, &ids).await;

        self.initialize_grid(symbol, live_price).await;
    }
}

/// `ceil(count * fraction)` as an order count.
fn threshold_count(count: usize, fraction: Decimal) -> usize {
    (Decimal::from(count as u64) * fraction)
        .ceil()
        .to_usize()
        .unwrap_or(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GridConfig, LadderConfig};
    use crate::exchange::MockExchange;
    use crate::indicators::Candle;
    use crate::strategy::adapter::OrderServiceAdapter;
    use chrono::Duration as ChronoDuration;

    const SYMBOL: &str = "BTCUSDT";

    /// 15 candles with a constant true range of 4, so ATR(14) = 4.
    fn fixture_candles() -> Vec<Candle> {
        (0..15u32)
            .map(|i| {
                let i = Decimal::from(i);
                Candle {
                    close_time: Utc::now(),
                    open: dec!(100) + i,
                    high: dec!(102) + i,
                    low: dec!(98) + i,
                    close: dec!(100) + i,
                }
            })
            .collect()
    }

    fn symbol_config() -> SymbolConfig {
        SymbolConfig {
            symbol: SYMBOL.to_string(),
            tick_size: dec!(0.01),
            grid: GridConfig::default(),
            ladder: LadderConfig::default(),
        }
    }

    fn build_manager(
        config: SymbolConfig,
        capital: Decimal,
    ) -> (Arc<GridOrderManager>, Arc<MockExchange>, Arc<CapitalLedger>) {
        let exchange = Arc::new(MockExchange::new(capital));
        let ledger = Arc::new(CapitalLedger::new(capital));
        let candles = Arc::new(CandleStore::new(14));
        candles.prime(SYMBOL, fixture_candles());

        let mut leverage = HashMap::new();
        leverage.insert(SYMBOL.to_string(), config.grid.leverage);
        let adapter = Arc::new(OrderServiceAdapter::new(
            exchange.clone() as Arc<dyn ExchangeApi>,
            Arc::clone(&ledger),
            dec!(5),
            leverage,
            dec!(0.0001),
        ));

        let manager = Arc::new(GridOrderManager::new(
            adapter,
            exchange.clone() as Arc<dyn ExchangeApi>,
            Arc::clone(&ledger),
            candles,
            dec!(5),
            vec![config],
            Arc::new(SymbolLocks::default()),
        ));
        (manager, exchange, ledger)
    }

    fn synthetic_order(id: &str, side: Side, entry: Decimal) -> GridOrder {
        GridOrder::new(id.to_string(), SYMBOL, side, entry, dec!(5), dec!(25))
    }

    fn insert_orders(manager: &GridOrderManager, side: Side, entries: &[Decimal]) -> Vec<String> {
        let mut ids = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let id = format!("syn-{side}-{i}");
            manager
                .active_orders
                .insert(id.clone(), synthetic_order(&id, side, *entry));
            ids.push(id);
        }
        ids
    }

    fn set_price(manager: &GridOrderManager, price: Decimal) {
        manager.prices.insert(SYMBOL.to_string(), price);
    }

    #[test]
    fn test_first_grid_claim_is_one_shot() {
        let (manager, _, _) = build_manager(symbol_config(), dec!(1000));
        assert!(manager.try_claim_first_grid(SYMBOL));
        assert!(!manager.try_claim_first_grid(SYMBOL));

        manager.clear_grid_initialized(SYMBOL);
        assert!(manager.try_claim_first_grid(SYMBOL));
    }

    #[tokio::test]
    async fn test_reinit_cooldown() {
        let (manager, _, _) = build_manager(symbol_config(), dec!(1000));
        manager.try_claim_first_grid(SYMBOL);

        // Immediately after the claim, still cooling down.
        assert!(!manager.can_reinitialize(SYMBOL, Duration::from_millis(200)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(manager.can_reinitialize(SYMBOL, Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_price_tick_seeds_grid_exactly_once() {
        let (manager, exchange, _) = build_manager(symbol_config(), dec!(1000));

        manager
            .handle_event(FeedEvent::PriceTick {
                symbol: SYMBOL.to_string(),
                price: dec!(100),
                funding_rate: None,
            })
            .await;

        // ATR = 4, spacing multiplier 1: 5 longs below and 5 shorts above.
        assert_eq!(exchange.placed_orders().len(), 10);
        assert_eq!(manager.open_count(SYMBOL), 10);

        // A second tick inside the envelope does not reseed.
        manager
            .handle_event(FeedEvent::PriceTick {
                symbol: SYMBOL.to_string(),
                price: dec!(100),
                funding_rate: None,
            })
            .await;
        assert_eq!(exchange.placed_orders().len(), 10);
    }

    #[tokio::test]
    async fn test_admission_rejects_at_side_cap() {
        let (manager, exchange, ledger) = build_manager(symbol_config(), dec!(1000));
        set_price(&manager, dec!(100));
        insert_orders(&manager, Side::Long, &[dec!(99), dec!(98), dec!(97), dec!(96), dec!(95)]);

        let result = manager.place_rung_order(SYMBOL, dec!(94), Side::Long).await;
        assert!(result.is_none());
        assert!(exchange.placed_orders().is_empty());
        assert_eq!(ledger.allocated(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_admission_rejects_at_symbol_cap() {
        let mut config = symbol_config();
        config.grid.max_orders_per_symbol = 4;
        let (manager, exchange, _) = build_manager(config, dec!(1000));
        set_price(&manager, dec!(100));
        insert_orders(&manager, Side::Long, &[dec!(99), dec!(98)]);
        insert_orders(&manager, Side::Short, &[dec!(101), dec!(102)]);

        let result = manager.place_rung_order(SYMBOL, dec!(97), Side::Long).await;
        assert!(result.is_none());
        assert!(exchange.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_admission_rejects_without_capital() {
        // Ledger smaller than one rung's margin.
        let (manager, exchange, ledger) = build_manager(symbol_config(), dec!(3));
        set_price(&manager, dec!(100));

        let result = manager.place_rung_order(SYMBOL, dec!(96), Side::Long).await;
        assert!(result.is_none());
        assert!(exchange.placed_orders().is_empty());
        assert_eq!(ledger.allocated(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_absolute_loss_cap_blocks_side() {
        let mut config = symbol_config();
        config.grid.max_loss_per_side_pct = Decimal::ZERO; // isolate the USD cap
        let (manager, exchange, _) = build_manager(config, dec!(1000));
        set_price(&manager, dec!(100));

        // One long 10 under water: qty = 5*25/110, pnl ~= -11.36 < -10.
        insert_orders(&manager, Side::Long, &[dec!(110)]);

        let blocked = manager.place_rung_order(SYMBOL, dec!(95), Side::Long).await;
        assert!(blocked.is_none());
        assert!(exchange.placed_orders().is_empty());

        // The other side is unaffected.
        let allowed = manager.place_rung_order(SYMBOL, dec!(104), Side::Short).await;
        assert!(allowed.is_some());
        assert_eq!(exchange.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_percentage_drawdown_blocks_side() {
        let mut config = symbol_config();
        config.grid.max_loss_per_side_usd = dec!(100000); // isolate the pct cap
        let (manager, exchange, _) = build_manager(config, dec!(1000));
        set_price(&manager, dec!(97));

        // Average entry 100, current 97: 3% drawdown >= 2% cap.
        insert_orders(&manager, Side::Long, &[dec!(100)]);

        let blocked = manager.place_rung_order(SYMBOL, dec!(93), Side::Long).await;
        assert!(blocked.is_none());
        assert!(exchange.placed_orders().is_empty());
    }

    #[test]
    fn test_exit_derivation_atr_based() {
        let mut config = symbol_config();
        config.grid.grouped_take_profit = false;
        let (manager, _, _) = build_manager(config, dec!(1000));

        // ATR 4, multipliers 0.4: tp = 100 + 1.6, sl = 100 - 1.6.
        let (tp, sl) = manager.derive_exits(SYMBOL, dec!(100), Side::Long).unwrap();
        assert_eq!(tp, dec!(101.6));
        assert_eq!(sl, dec!(98.4));

        let (tp, sl) = manager.derive_exits(SYMBOL, dec!(100), Side::Short).unwrap();
        assert_eq!(tp, dec!(98.4));
        assert_eq!(sl, dec!(101.6));
    }

    #[test]
    fn test_exit_derivation_substitutions() {
        let mut config = symbol_config();
        config.grid.use_stop_loss = false; // forces the wide 5x ATR stop
        let (manager, _, _) = build_manager(config, dec!(1000));

        let (tp, sl) = manager.derive_exits(SYMBOL, dec!(100), Side::Long).unwrap();
        // Grouped TP (default on): 100 * 1.006.
        assert_eq!(tp, dec!(100.6));
        // Wide stop: 100 - 5 * 4.
        assert_eq!(sl, dec!(80));

        let (tp, sl) = manager.derive_exits(SYMBOL, dec!(100), Side::Short).unwrap();
        assert_eq!(tp, dec!(99.4));
        assert_eq!(sl, dec!(120));
    }

    #[tokio::test]
    async fn test_cleanup_cancels_farthest_first() {
        let (manager, exchange, _) = build_manager(symbol_config(), dec!(1000));
        set_price(&manager, dec!(100));

        // 7 longs against a configured count of 5.
        let entries = [
            dec!(99),
            dec!(98),
            dec!(97),
            dec!(96),
            dec!(95),
            dec!(90),
            dec!(80),
        ];
        let ids = insert_orders(&manager, Side::Long, &entries);

        manager.cleanup_extra_orders(SYMBOL).await;

        // Exactly the two farthest (80, then 90) were canceled.
        let canceled = exchange.canceled_ids();
        assert_eq!(canceled.len(), 2);
        assert!(canceled.contains(&ids[6])); // entry 80
        assert!(canceled.contains(&ids[5])); // entry 90
        assert_eq!(manager.open_count(SYMBOL), 5);

        let remaining: Vec<Decimal> = manager
            .side_orders(SYMBOL, Side::Long)
            .iter()
            .map(|o| o.entry_price)
            .collect();
        assert!(remaining.iter().all(|p| *p >= dec!(95)));
    }

    #[tokio::test]
    async fn test_stale_expiry_requires_age_and_distance() {
        let (manager, exchange, _) = build_manager(symbol_config(), dec!(1000));
        set_price(&manager, dec!(100));

        // Old and far: expired.
        let mut old_far = synthetic_order("old-far", Side::Long, dec!(90));
        old_far.created_at = Utc::now() - ChronoDuration::seconds(60);
        manager.active_orders.insert("old-far".into(), old_far);

        // Old but near (0.5% away): kept.
        let mut old_near = synthetic_order("old-near", Side::Long, dec!(99.5));
        old_near.created_at = Utc::now() - ChronoDuration::seconds(60);
        manager.active_orders.insert("old-near".into(), old_near);

        // Far but fresh: kept.
        let fresh_far = synthetic_order("fresh-far", Side::Long, dec!(90.5));
        manager.active_orders.insert("fresh-far".into(), fresh_far);

        manager.expire_stale_orders(SYMBOL, dec!(100)).await;

        assert_eq!(exchange.canceled_ids(), vec!["old-far".to_string()]);
        assert_eq!(manager.open_count(SYMBOL), 2);
    }

    #[tokio::test]
    async fn test_replenish_tops_up_missing_rungs() {
        let (manager, exchange, _) = build_manager(symbol_config(), dec!(1000));
        set_price(&manager, dec!(100));

        // Two longs already resting exactly on grid prices; spacing 4.
        insert_orders(&manager, Side::Long, &[dec!(96), dec!(92)]);

        manager.replenish_rungs(SYMBOL, dec!(100), dec!(4)).await;

        // Long side topped up to 5 (3 new), short side fully seeded (5 new).
        let placed = exchange.placed_orders();
        assert_eq!(placed.len(), 8);

        let new_longs: Vec<Decimal> = placed
            .iter()
            .filter(|r| r.side == Side::Long)
            .map(|r| r.price)
            .collect();
        // 96 and 92 are occupied; the remaining grid prices fill in.
        assert_eq!(new_longs, vec![dec!(88), dec!(84), dec!(80)]);
        assert_eq!(manager.open_count(SYMBOL), 10);
    }

    #[tokio::test]
    async fn test_replenish_stops_at_symbol_cap() {
        let mut config = symbol_config();
        config.grid.max_orders_per_symbol = 3;
        let (manager, exchange, _) = build_manager(config, dec!(1000));
        set_price(&manager, dec!(100));
        insert_orders(&manager, Side::Long, &[dec!(96), dec!(92)]);

        manager.replenish_rungs(SYMBOL, dec!(100), dec!(4)).await;

        // Only one slot left under the cap.
        assert_eq!(exchange.placed_orders().len(), 1);
        assert_eq!(manager.open_count(SYMBOL), 3);
    }

    #[tokio::test]
    async fn test_trend_flip_moves_worst_losers() {
        let mut config = symbol_config();
        config.grid.max_loss_per_side_usd = dec!(100000);
        config.grid.max_loss_per_side_pct = Decimal::ZERO;
        let (manager, exchange, _) = build_manager(config, dec!(1000));
        set_price(&manager, dec!(100));

        // All five longs are under water; entries 105..109.
        let ids = insert_orders(
            &manager,
            Side::Long,
            &[dec!(105), dec!(106), dec!(107), dec!(108), dec!(109)],
        );

        manager.adjust_for_trend(SYMBOL, dec!(100), dec!(4)).await;

        // The two worst (109, 108) were canceled and reopened as shorts at
        // current price + spacing.
        let canceled = exchange.canceled_ids();
        assert!(canceled.contains(&ids[4]));
        assert!(canceled.contains(&ids[3]));

        let new_shorts: Vec<Decimal> = exchange
            .placed_orders()
            .iter()
            .filter(|r| r.side == Side::Short)
            .map(|r| r.price)
            .collect();
        assert_eq!(new_shorts, vec![dec!(104), dec!(104)]);
    }

    #[tokio::test]
    async fn test_profit_zone_closes_and_chases() {
        let (manager, exchange, _) = build_manager(symbol_config(), dec!(1000));

        // Average entry 100 and grouped band 0.6%: 101 is past the zone.
        insert_orders(&manager, Side::Long, &[dec!(99), dec!(101)]);
        set_price(&manager, dec!(101));

        manager.check_profit_zone(SYMBOL).await;

        assert_eq!(exchange.closed_symbols(), vec![SYMBOL.to_string()]);
        // The chase reseeded a full ladder around the new price.
        assert_eq!(exchange.placed_orders().len(), 10);
        assert_eq!(manager.open_count(SYMBOL), 10);
    }

    #[tokio::test]
    async fn test_sync_rebuilds_from_exchange_view() {
        let (manager, exchange, _) = build_manager(symbol_config(), dec!(1000));
        set_price(&manager, dec!(100));

        // A ghost entry the exchange no longer knows about.
        insert_orders(&manager, Side::Long, &[dec!(95)]);

        // Two real resting orders at the exchange.
        for (price, side) in [(dec!(98), Side::Long), (dec!(103), Side::Short)] {
            exchange
                .place_limit_order(&crate::exchange::LimitOrderRequest {
                    symbol: SYMBOL.to_string(),
                    side,
                    qty: dec!(1),
                    price,
                    take_profit: price + dec!(1),
                    stop_loss: price - dec!(1),
                    client_id: "sync".into(),
                })
                .await
                .unwrap();
        }

        manager.sync_open_orders(SYMBOL).await.unwrap();

        assert_eq!(manager.open_count(SYMBOL), 2);
        let book = manager.rung_book(SYMBOL);
        let book = book.lock().unwrap();
        assert_eq!(book.longs(), &[dec!(98)]);
        assert_eq!(book.shorts(), &[dec!(103)]);
    }

    #[tokio::test]
    async fn test_fill_event_releases_and_cleans_up() {
        let (manager, _, ledger) = build_manager(symbol_config(), dec!(1000));
        set_price(&manager, dec!(100));

        manager
            .active_orders
            .insert("f1".into(), synthetic_order("f1", Side::Long, dec!(99)));
        ledger.reserve_margin("f1", dec!(5)).unwrap();

        manager
            .handle_event(FeedEvent::OrderUpdate(OrderUpdateEvent {
                order_id: "f1".into(),
                symbol: SYMBOL.to_string(),
                side: Side::Long,
                price: dec!(99),
                qty: dec!(1),
                event: OrderEventKind::Filled,
            }))
            .await;

        assert_eq!(manager.open_count(SYMBOL), 0);
        assert_eq!(ledger.allocated(), Decimal::ZERO);
    }

    #[test]
    fn test_threshold_count_rounds_up() {
        assert_eq!(threshold_count(5, dec!(0.6)), 3);
        assert_eq!(threshold_count(4, dec!(0.6)), 3); // 2.4 -> 3
        assert_eq!(threshold_count(10, dec!(0.6)), 6);
        assert_eq!(threshold_count(1, dec!(0.6)), 1);
    }

    #[tokio::test]
    async fn test_balance_update_refreshes_ledger() {
        let (manager, _, ledger) = build_manager(symbol_config(), dec!(1000));
        ledger.reserve_margin("x", dec!(100)).unwrap();

        manager
            .handle_event(FeedEvent::BalanceUpdate {
                coin: "USDT".to_string(),
                available: dec!(50),
            })
            .await;

        assert_eq!(ledger.available(), dec!(50));
        assert_eq!(ledger.allocated(), dec!(100));
    }
}
