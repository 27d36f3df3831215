//! The recentering ladder: a symmetric set of resting limit orders around a
//! moving center price.
//!
//! The ladder seeds once at the first live price, then rebuilds itself around
//! a new center whenever price escapes the rung envelope or enough take-profit
//! fills accrue on one side. Rung snapshots are published on a watch channel
//! so the grid manager can mirror them without event-handler coupling.

use crate::config::LadderConfig;
use crate::exchange::Side;
use crate::indicators::SpacingSource;
use crate::strategy::adapter::OrderService;
use crate::utils::decimal::round_to_tick;
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// One price level of the ladder, tagged with a side and, once placed, the
/// live exchange order id.
#[derive(Debug, Clone, PartialEq)]
pub struct Rung {
    pub price: Decimal,
    pub side: Side,
    pub order_id: Option<String>,
}

#[derive(Debug)]
struct LadderState {
    seeded: bool,
    center: Decimal,
    /// Ascending by price, strictly below center.
    longs: Vec<Rung>,
    /// Ascending by price, strictly above center.
    shorts: Vec<Rung>,
    tp_hits_long: u32,
    tp_hits_short: u32,
}

/// Ladder strategy that recenters the whole rung set on envelope breaks and
/// take-profit streaks.
pub struct RecenterLadder {
    symbol: String,
    cfg: LadderConfig,
    orders: Arc<dyn OrderService>,
    spacing: Arc<dyn SpacingSource>,
    tick_size: Decimal,
    state: Mutex<LadderState>,
    rungs_tx: watch::Sender<Vec<Rung>>,
}

impl RecenterLadder {
    pub fn new(
        symbol: impl Into<String>,
        cfg: LadderConfig,
        orders: Arc<dyn OrderService>,
        spacing: Arc<dyn SpacingSource>,
        tick_size: Decimal,
    ) -> Self {
        let (rungs_tx, _) = watch::channel(Vec::new());
        Self {
            symbol: symbol.into(),
            cfg,
            orders,
            spacing,
            tick_size,
            state: Mutex::new(LadderState {
                seeded: false,
                center: Decimal::ZERO,
                longs: Vec::new(),
                shorts: Vec::new(),
                tp_hits_long: 0,
                tp_hits_short: 0,
            }),
            rungs_tx,
        }
    }

    /// Receive the full rung set after every recenter.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Rung>> {
        self.rungs_tx.subscribe()
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Seed the ladder at the first live price. No-op once seeded.
    pub async fn initialize(&self, live_price: Decimal) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.seeded {
            return Ok(());
        }
        state.seeded = true;
        info!(symbol = %self.symbol, price = %live_price, "Seeding ladder");
        self.recenter(&mut state, live_price).await
    }

    /// React to a live price: recenter when price escapes the rung envelope.
    /// Ignored until seeded.
    pub async fn on_price_tick(&self, live_price: Decimal) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.seeded {
            return Ok(());
        }

        let spacing = match self.grid_spacing().await {
            Ok(s) => s,
            Err(e) => {
                debug!(symbol = %self.symbol, error = %e, "Spacing unavailable, tick ignored");
                return Ok(());
            }
        };

        let long_min = state.longs.first().map(|r| r.price);
        let short_max = state.shorts.last().map(|r| r.price);

        let escaped = match (long_min, short_max) {
            (Some(lo), Some(hi)) => live_price < lo - spacing || live_price > hi + spacing,
            // A side with zero rungs means the last rebuild failed outright;
            // treat it as out-of-envelope and rebuild here.
            _ => true,
        };

        if escaped {
            info!(
                symbol = %self.symbol,
                price = %live_price,
                "Price escaped rung envelope"
            );
            self.recenter(&mut state, live_price).await?;
        }
        Ok(())
    }

    /// React to a fill. Only adapter-confirmed take-profit fills count toward
    /// the per-side recenter counter.
    pub async fn on_order_filled(
        &self,
        order_id: &str,
        side: Side,
        fill_price: Decimal,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.seeded {
            return Ok(());
        }

        if !self.orders.was_take_profit_fill(order_id) {
            return Ok(());
        }

        let hits = match side {
            Side::Long => {
                state.tp_hits_long += 1;
                state.tp_hits_long
            }
            Side::Short => {
                state.tp_hits_short += 1;
                state.tp_hits_short
            }
        };
        debug!(
            symbol = %self.symbol,
            order_id,
            %side,
            hits,
            "Take-profit fill confirmed"
        );

        if hits >= self.cfg.rungs_to_tp_recenter {
            info!(
                symbol = %self.symbol,
                %side,
                hits,
                "Take-profit streak, recentering at fill price"
            );
            self.recenter(&mut state, fill_price).await?;
        }
        Ok(())
    }

    async fn grid_spacing(&self) -> Result<Decimal> {
        Ok(self.spacing.current_spacing().await? * self.cfg.spacing_multiplier)
    }

    /// Rebuild the entire ladder around `new_center`.
    ///
    /// Spacing is computed first so an unprimed source aborts before anything
    /// is canceled. Placement is sequential per side; a failed placement
    /// leaves that rung's order id unset and is retried only by a later
    /// recenter.
    async fn recenter(&self, state: &mut LadderState, new_center: Decimal) -> Result<()> {
        let spacing = self.grid_spacing().await?;

        let mut to_cancel: Vec<String> = state
            .longs
            .iter()
            .chain(state.shorts.iter())
            .filter_map(|r| r.order_id.clone())
            .collect();
        let mut seen = HashSet::new();
        to_cancel.retain(|id| seen.insert(id.clone()));

        if !to_cancel.is_empty() {
            if let Err(e) = self.orders.cancel_orders(&self.symbol, &to_cancel).await {
                // The next monitoring pass re-evaluates; stale ids are inert.
                warn!(symbol = %self.symbol, error = %e, "Cancel batch failed during recenter");
            }
        }

        state.center = new_center;
        state.tp_hits_long = 0;
        state.tp_hits_short = 0;

        let long_prices = self.build_prices(new_center, Side::Long, spacing);
        let short_prices = self.build_prices(new_center, Side::Short, spacing);

        let mut longs = Vec::with_capacity(long_prices.len());
        for price in long_prices {
            let tp = round_to_tick(
                price * (Decimal::ONE + self.cfg.take_profit_pct)
                    + self.cfg.funding_rate_adjustment,
                self.tick_size,
            );
            let sl = round_to_tick(
                price * (Decimal::ONE - self.cfg.stop_loss_pct) - self.cfg.funding_rate_adjustment,
                self.tick_size,
            );
            let order_id = self.place_rung(price, Side::Long, tp, sl).await;
            longs.push(Rung {
                price,
                side: Side::Long,
                order_id,
            });
        }

        let mut shorts = Vec::with_capacity(short_prices.len());
        for price in short_prices {
            let tp = round_to_tick(
                price * (Decimal::ONE - self.cfg.take_profit_pct)
                    - self.cfg.funding_rate_adjustment,
                self.tick_size,
            );
            let sl = round_to_tick(
                price * (Decimal::ONE + self.cfg.stop_loss_pct) + self.cfg.funding_rate_adjustment,
                self.tick_size,
            );
            let order_id = self.place_rung(price, Side::Short, tp, sl).await;
            shorts.push(Rung {
                price,
                side: Side::Short,
                order_id,
            });
        }

        info!(
            symbol = %self.symbol,
            center = %new_center,
            spacing = %spacing,
            longs = longs.len(),
            shorts = shorts.len(),
            "Ladder recentered"
        );

        state.longs = longs;
        state.shorts = shorts;

        let snapshot: Vec<Rung> = state
            .longs
            .iter()
            .chain(state.shorts.iter())
            .cloned()
            .collect();
        self.rungs_tx.send_replace(snapshot);
        Ok(())
    }

    /// Quantized rung prices for one side, ascending, unique, strictly on the
    /// correct side of the center.
    fn build_prices(&self, center: Decimal, side: Side, spacing: Decimal) -> Vec<Decimal> {
        let mut prices = Vec::with_capacity(self.cfg.base_rungs_per_side);
        for i in 1..=self.cfg.base_rungs_per_side {
            let offset = spacing * Decimal::from(i as u64);
            let raw = match side {
                Side::Long => center - offset,
                Side::Short => center + offset,
            };
            let price = round_to_tick(raw, self.tick_size);

            let on_correct_side = match side {
                Side::Long => price > Decimal::ZERO && price < center,
                Side::Short => price > center,
            };
            // Quantization can collapse adjacent rungs onto one tick; keep
            // prices unique per side.
            if on_correct_side && !prices.contains(&price) {
                prices.push(price);
            }
        }
        prices.sort();
        prices
    }

    async fn place_rung(
        &self,
        price: Decimal,
        side: Side,
        tp: Decimal,
        sl: Decimal,
    ) -> Option<String> {
        match self
            .orders
            .place_limit_order(&self.symbol, price, side, tp, sl)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(
                    symbol = %self.symbol,
                    %price,
                    %side,
                    error = %e,
                    "Rung placement error"
                );
                None
            }
        }
    }
}
