//! Candle buffering and Average True Range.
//!
//! Rung spacing and protective-stop distances are all derived from ATR over
//! a fixed-size rolling window of closed candles. The window is primed from
//! REST history at startup and extended from streamed closed candles, and the
//! computation is identical for both sources.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;

/// One closed candle.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

/// Fixed-capacity FIFO of closed candles, oldest first.
///
/// Capacity is `period + 1`: true range needs the previous close, so `n + 1`
/// candles yield `n` true-range samples.
#[derive(Debug, Clone)]
pub struct CandleWindow {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a closed candle, evicting the oldest past capacity.
    pub fn push(&mut self, candle: Candle) {
        self.candles.push_back(candle);
        if self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Whether the window holds enough candles for a full `period` ATR.
    pub fn is_primed(&self, period: usize) -> bool {
        self.candles.len() >= period + 1
    }

    /// Parallel high/low/close series, oldest first.
    pub fn series(&self) -> (Vec<Decimal>, Vec<Decimal>, Vec<Decimal>) {
        let highs = self.candles.iter().map(|c| c.high).collect();
        let lows = self.candles.iter().map(|c| c.low).collect();
        let closes = self.candles.iter().map(|c| c.close).collect();
        (highs, lows, closes)
    }

    /// ATR over this window.
    pub fn atr(&self, period: usize) -> Decimal {
        let (highs, lows, closes) = self.series();
        average_true_range(period, &highs, &lows, &closes)
    }
}

/// Simple-average ATR from parallel high/low/close series (oldest first).
///
/// True range per step is `max(high - low, |high - prev_close|, |low - prev_close|)`.
/// With fewer than `period` samples the plain average of what exists is
/// returned; with no samples, zero.
pub fn average_true_range(
    period: usize,
    highs: &[Decimal],
    lows: &[Decimal],
    closes: &[Decimal],
) -> Decimal {
    let steps = highs.len().min(lows.len()).min(closes.len());
    let mut trs = Vec::with_capacity(steps.saturating_sub(1));
    for i in 1..steps {
        let range = highs[i] - lows[i];
        let up = (highs[i] - closes[i - 1]).abs();
        let down = (lows[i] - closes[i - 1]).abs();
        trs.push(range.max(up).max(down));
    }

    if trs.is_empty() {
        return Decimal::ZERO;
    }

    let take = if trs.len() < period { trs.len() } else { period };
    let sum: Decimal = trs[trs.len() - take..].iter().copied().sum();
    sum / Decimal::from(take as u64)
}

/// Per-symbol candle windows shared between the feed handlers and the
/// spacing/exit computations.
#[derive(Debug)]
pub struct CandleStore {
    period: usize,
    windows: DashMap<String, CandleWindow>,
}

impl CandleStore {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            windows: DashMap::new(),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Replace a symbol's window with REST-backfilled candles, oldest first.
    pub fn prime(&self, symbol: &str, candles: impl IntoIterator<Item = Candle>) {
        let mut window = CandleWindow::new(self.period + 1);
        for candle in candles {
            window.push(candle);
        }
        self.windows.insert(symbol.to_string(), window);
    }

    /// Append one streamed closed candle.
    pub fn push(&self, symbol: &str, candle: Candle) {
        self.windows
            .entry(symbol.to_string())
            .or_insert_with(|| CandleWindow::new(self.period + 1))
            .push(candle);
    }

    pub fn is_primed(&self, symbol: &str) -> bool {
        self.windows
            .get(symbol)
            .map(|w| w.is_primed(self.period))
            .unwrap_or(false)
    }

    /// ATR snapshot for a symbol; `None` until the window is primed.
    pub fn atr(&self, symbol: &str) -> Option<Decimal> {
        let window = self.windows.get(symbol)?;
        if !window.is_primed(self.period) {
            return None;
        }
        Some(window.atr(self.period))
    }
}

/// Source of the current raw spacing unit (ATR) for one symbol.
///
/// Consumers apply their own configured multiplier on top.
#[async_trait]
pub trait SpacingSource: Send + Sync {
    async fn current_spacing(&self) -> Result<Decimal>;
}

/// ATR-backed spacing source reading from a shared [`CandleStore`].
pub struct AtrSpacing {
    symbol: String,
    store: Arc<CandleStore>,
}

impl AtrSpacing {
    pub fn new(symbol: impl Into<String>, store: Arc<CandleStore>) -> Self {
        Self {
            symbol: symbol.into(),
            store,
        }
    }
}

#[async_trait]
impl SpacingSource for AtrSpacing {
    /// Errors while the window is unprimed: a zero spacing would collapse
    /// every rung onto the center price.
    async fn current_spacing(&self) -> Result<Decimal> {
        match self.store.atr(&self.symbol) {
            Some(atr) if atr > Decimal::ZERO => Ok(atr),
            Some(_) => bail!("ATR is zero for {}", self.symbol),
            None => bail!(
                "candle window for {} not primed ({} candles needed)",
                self.symbol,
                self.store.period() + 1
            ),
        }
    }
}
