// =============================================================================
// Volatility Monitor - per-symbol ATR and regime classification
// =============================================================================
//
// Maintains three rolling buffers per symbol (candles, true ranges, ticks)
// and derives a snapshot on every appended candle: ATR over short/medium/long
// windows as a percentage of price, candle-range statistics, recent price
// changes, and an additively scored volatility regime with confidence.
//
// Regime scoring (highest total wins, confidence = winner / total):
//
//   ATR%        >= 1.5  -> HIGH+40    >= 0.5 -> MEDIUM+30, HIGH+10   else LOW+40
//   avg range%  >= 2.0  -> HIGH+35    >= 0.8 -> MEDIUM+25, HIGH+10   else LOW+35
//   |5m change| >= 1.0  -> HIGH+25    >= 0.3 -> MEDIUM+20            else LOW+25
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::market_data::Candle;
use crate::types::VolatilityRegime;

/// Snapshot of the volatility analysis for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilitySnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,

    /// ATR as a percentage of the current price.
    pub atr_short: f64,
    pub atr_medium: f64,
    pub atr_long: f64,

    /// Candle-range statistics over the last 20 candles, percent of open.
    pub avg_candle_range_pct: f64,
    pub max_candle_range_pct: f64,
    pub min_candle_range_pct: f64,

    pub current_price: f64,
    pub price_change_1min: f64,
    pub price_change_5min: f64,
    pub price_change_15min: f64,

    pub regime: VolatilityRegime,
    /// Winner share of the regime score total, in [0, 1].
    pub regime_confidence: f64,

    /// atr_short > atr_medium > atr_long.
    pub is_expanding: bool,
    /// atr_short < atr_medium < atr_long.
    pub is_contracting: bool,
}

/// Tunable regime thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeThresholds {
    pub high_atr: f64,
    pub medium_atr: f64,
    pub high_range: f64,
    pub medium_range: f64,
}

impl Default for RegimeThresholds {
    fn default() -> Self {
        Self {
            high_atr: 1.5,
            medium_atr: 0.5,
            high_range: 2.0,
            medium_range: 0.8,
        }
    }
}

/// How many candles contribute to the range statistics.
const RANGE_STATS_WINDOW: usize = 20;

struct SymbolBuffers {
    candles: VecDeque<Candle>,
    true_ranges: VecDeque<f64>,
    ticks: VecDeque<(DateTime<Utc>, f64)>,
}

/// Rolling volatility analysis over one or more symbols.
///
/// Single-writer: the controller owns the monitor and feeds it; readers take
/// snapshot copies.
pub struct VolatilityMonitor {
    atr_short: usize,
    atr_medium: usize,
    atr_long: usize,
    candle_buffer_size: usize,
    tick_buffer_size: usize,
    thresholds: RegimeThresholds,

    buffers: HashMap<String, SymbolBuffers>,
    snapshots: HashMap<String, VolatilitySnapshot>,
}

impl VolatilityMonitor {
    pub fn new(atr_short: usize, atr_medium: usize, atr_long: usize) -> Self {
        Self {
            atr_short,
            atr_medium,
            atr_long,
            candle_buffer_size: 100,
            tick_buffer_size: 1000,
            thresholds: RegimeThresholds::default(),
            buffers: HashMap::new(),
            snapshots: HashMap::new(),
        }
    }

    /// Append a candle and recompute the symbol's snapshot.
    pub fn append_candle(&mut self, symbol: &str, candle: Candle) -> VolatilitySnapshot {
        let candle_cap = self.candle_buffer_size;
        let tick_cap = self.tick_buffer_size;
        let buffers = self
            .buffers
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolBuffers {
                candles: VecDeque::with_capacity(candle_cap),
                true_ranges: VecDeque::with_capacity(candle_cap),
                ticks: VecDeque::with_capacity(tick_cap),
            });

        let tr = match buffers.candles.back() {
            Some(prev) => true_range(&candle, prev.close),
            None => candle.range(),
        };

        buffers.candles.push_back(candle.clone());
        buffers.true_ranges.push_back(tr);
        while buffers.candles.len() > candle_cap {
            buffers.candles.pop_front();
        }
        while buffers.true_ranges.len() > candle_cap {
            buffers.true_ranges.pop_front();
        }

        buffers.ticks.push_back((candle.timestamp, candle.close));
        while buffers.ticks.len() > tick_cap {
            buffers.ticks.pop_front();
        }

        let snapshot = self.build_snapshot(symbol, &candle);
        self.snapshots.insert(symbol.to_string(), snapshot.clone());
        snapshot
    }

    /// Append a tick price. Does not recompute the snapshot.
    pub fn append_tick(&mut self, symbol: &str, price: f64, timestamp: DateTime<Utc>) {
        let tick_cap = self.tick_buffer_size;
        let candle_cap = self.candle_buffer_size;
        let buffers = self
            .buffers
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolBuffers {
                candles: VecDeque::with_capacity(candle_cap),
                true_ranges: VecDeque::with_capacity(candle_cap),
                ticks: VecDeque::with_capacity(tick_cap),
            });

        buffers.ticks.push_back((timestamp, price));
        while buffers.ticks.len() > tick_cap {
            buffers.ticks.pop_front();
        }
    }

    /// Latest snapshot for a symbol, if any candle has arrived.
    pub fn snapshot(&self, symbol: &str) -> Option<VolatilitySnapshot> {
        self.snapshots.get(symbol).cloned()
    }

    /// Current regime for a symbol.
    pub fn regime(&self, symbol: &str) -> VolatilityRegime {
        self.snapshots
            .get(symbol)
            .map(|s| s.regime)
            .unwrap_or(VolatilityRegime::Unknown)
    }

    /// Recommended grid step size range (min%, max%) for the current regime.
    pub fn recommended_step_range(&self, symbol: &str) -> (f64, f64) {
        let atr = self
            .snapshots
            .get(symbol)
            .map(|s| s.atr_medium)
            .unwrap_or(0.0);

        match self.regime(symbol) {
            VolatilityRegime::High => (f64::max(0.5, atr * 0.5), f64::max(1.5, atr * 1.2)),
            VolatilityRegime::Medium => (f64::max(0.3, atr * 0.4), f64::max(0.8, atr * 0.8)),
            VolatilityRegime::Low => (0.15, f64::max(0.4, atr * 0.6)),
            VolatilityRegime::Unknown => (0.3, 0.8),
        }
    }

    /// Last `count` candles for a symbol, oldest first.
    pub fn candle_history(&self, symbol: &str, count: usize) -> Vec<Candle> {
        match self.buffers.get(symbol) {
            Some(b) => {
                let start = b.candles.len().saturating_sub(count);
                b.candles.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn set_regime_thresholds(&mut self, thresholds: RegimeThresholds) {
        self.thresholds = thresholds;
    }

    /// Drop all data for a symbol.
    pub fn clear_symbol(&mut self, symbol: &str) {
        self.buffers.remove(symbol);
        self.snapshots.remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn build_snapshot(&self, symbol: &str, candle: &Candle) -> VolatilitySnapshot {
        let buffers = &self.buffers[symbol];
        let current_price = candle.close;

        let atr_short_abs = atr(&buffers.true_ranges, self.atr_short);
        let atr_medium_abs = atr(&buffers.true_ranges, self.atr_medium);
        let atr_long_abs = atr(&buffers.true_ranges, self.atr_long);

        let atr_short = atr_pct(atr_short_abs, current_price);
        let atr_medium = atr_pct(atr_medium_abs, current_price);
        let atr_long = atr_pct(atr_long_abs, current_price);

        let start = buffers.candles.len().saturating_sub(RANGE_STATS_WINDOW);
        let ranges: Vec<f64> = buffers
            .candles
            .iter()
            .skip(start)
            .map(Candle::range_pct)
            .collect();
        let (avg_range, max_range, min_range) = if ranges.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = ranges.iter().sum();
            let max = ranges.iter().cloned().fold(f64::MIN, f64::max);
            let min = ranges.iter().cloned().fold(f64::MAX, f64::min);
            (sum / ranges.len() as f64, max, min)
        };

        let now = candle.timestamp;
        let price_change_1min = price_change(&buffers.ticks, current_price, now, 1);
        let price_change_5min = price_change(&buffers.ticks, current_price, now, 5);
        let price_change_15min = price_change(&buffers.ticks, current_price, now, 15);

        let (regime, regime_confidence) =
            classify_regime(atr_medium, avg_range, price_change_5min, &self.thresholds);

        let is_expanding = atr_short > atr_medium && atr_medium > atr_long;
        let is_contracting = atr_short < atr_medium && atr_medium < atr_long;

        debug!(
            symbol,
            atr_medium = format!("{atr_medium:.3}"),
            regime = %regime,
            confidence = format!("{regime_confidence:.2}"),
            "volatility snapshot updated"
        );

        VolatilitySnapshot {
            symbol: symbol.to_string(),
            timestamp: now,
            atr_short,
            atr_medium,
            atr_long,
            avg_candle_range_pct: avg_range,
            max_candle_range_pct: max_range,
            min_candle_range_pct: min_range,
            current_price,
            price_change_1min,
            price_change_5min,
            price_change_15min,
            regime,
            regime_confidence,
            is_expanding,
            is_contracting,
        }
    }
}

// =============================================================================
// Pure math
// =============================================================================

/// TR = max(high - low, |high - prev_close|, |low - prev_close|).
fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    (candle.high - candle.low)
        .max((candle.high - prev_close).abs())
        .max((candle.low - prev_close).abs())
}

/// Arithmetic mean of the last `period` true ranges; falls back to the
/// available count when fewer are present.
fn atr(true_ranges: &VecDeque<f64>, period: usize) -> f64 {
    if true_ranges.is_empty() {
        return 0.0;
    }
    let period = period.min(true_ranges.len());
    let start = true_ranges.len() - period;
    let sum: f64 = true_ranges.iter().skip(start).sum();
    sum / period as f64
}

fn atr_pct(atr_abs: f64, price: f64) -> f64 {
    if price > 0.0 {
        atr_abs / price * 100.0
    } else {
        0.0
    }
}

/// Percent change from the oldest tick inside the trailing window to `price`.
fn price_change(
    ticks: &VecDeque<(DateTime<Utc>, f64)>,
    price: f64,
    now: DateTime<Utc>,
    minutes: i64,
) -> f64 {
    if ticks.is_empty() || price <= 0.0 {
        return 0.0;
    }

    let cutoff = now - Duration::minutes(minutes);
    let old_price = ticks
        .iter()
        .find(|(ts, _)| *ts >= cutoff)
        .map(|(_, p)| *p);

    match old_price {
        Some(old) if old > 0.0 => (price - old) / old * 100.0,
        _ => 0.0,
    }
}

/// Additive regime scoring; returns the winning regime and its score share.
fn classify_regime(
    atr_pct: f64,
    avg_range_pct: f64,
    price_change_5min: f64,
    thresholds: &RegimeThresholds,
) -> (VolatilityRegime, f64) {
    let mut high = 0.0;
    let mut medium = 0.0;
    let mut low = 0.0;

    if atr_pct >= thresholds.high_atr {
        high += 40.0;
    } else if atr_pct >= thresholds.medium_atr {
        medium += 30.0;
        high += 10.0;
    } else {
        low += 40.0;
    }

    if avg_range_pct >= thresholds.high_range {
        high += 35.0;
    } else if avg_range_pct >= thresholds.medium_range {
        medium += 25.0;
        high += 10.0;
    } else {
        low += 35.0;
    }

    let abs_change = price_change_5min.abs();
    if abs_change >= 1.0 {
        high += 25.0;
    } else if abs_change >= 0.3 {
        medium += 20.0;
    } else {
        low += 25.0;
    }

    let total = high + medium + low;
    if total == 0.0 {
        return (VolatilityRegime::Unknown, 0.0);
    }

    if high >= medium && high >= low {
        (VolatilityRegime::High, high / total)
    } else if medium >= low {
        (VolatilityRegime::Medium, medium / total)
    } else {
        (VolatilityRegime::Low, low / total)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 15, min, 0).unwrap()
    }

    fn candle(min: u32, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: ts(min),
            open,
            high,
            low,
            close,
            volume: 10_000,
        }
    }

    fn quiet_candle(min: u32, around: f64) -> Candle {
        candle(min, around, around + 0.05, around - 0.05, around + 0.01)
    }

    #[test]
    fn first_candle_uses_plain_range_as_true_range() {
        let mut monitor = VolatilityMonitor::new(5, 14, 50);
        let snap = monitor.append_candle("ACME", candle(0, 100.0, 101.0, 99.0, 100.5));
        // Single TR of 2.0 over a 100.5 close.
        assert!((snap.atr_medium - 2.0 / 100.5 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn true_range_accounts_for_gaps() {
        let c = candle(1, 105.0, 106.0, 104.5, 105.5);
        // Gap up from prev close 100: high - prev_close dominates.
        assert!((true_range(&c, 100.0) - 6.0).abs() < 1e-10);
    }

    #[test]
    fn atr_is_rolling_mean_of_available_history() {
        let mut monitor = VolatilityMonitor::new(2, 3, 50);
        monitor.append_candle("ACME", candle(0, 100.0, 102.0, 100.0, 101.0)); // TR 2
        monitor.append_candle("ACME", candle(1, 101.0, 102.0, 101.0, 101.5)); // TR 1
        let snap = monitor.append_candle("ACME", candle(2, 101.5, 104.5, 101.5, 104.0)); // TR 3

        let price = 104.0;
        assert!((snap.atr_short - (1.0 + 3.0) / 2.0 / price * 100.0).abs() < 1e-9);
        assert!((snap.atr_medium - (2.0 + 1.0 + 3.0) / 3.0 / price * 100.0).abs() < 1e-9);
        // Long window falls back to the 3 available true ranges.
        assert!((snap.atr_long - snap.atr_medium).abs() < 1e-12);
        assert!(snap.atr_short >= 0.0 && snap.atr_medium >= 0.0 && snap.atr_long >= 0.0);
    }

    #[test]
    fn quiet_tape_classifies_low() {
        let mut monitor = VolatilityMonitor::new(5, 14, 50);
        let mut snap = None;
        for i in 0..20 {
            snap = Some(monitor.append_candle("ACME", quiet_candle(i, 100.0)));
        }
        let snap = snap.unwrap();
        assert_eq!(snap.regime, VolatilityRegime::Low);
        assert!(snap.regime_confidence > 0.9);
    }

    #[test]
    fn regime_flips_low_to_high_on_wide_fast_candles() {
        let mut monitor = VolatilityMonitor::new(5, 14, 50);
        for i in 0..20 {
            monitor.append_candle("ACME", quiet_candle(i, 100.0));
        }
        assert_eq!(monitor.regime("ACME"), VolatilityRegime::Low);

        // Five candles with ~2.5% range and a fast price rise.
        let mut price = 100.0;
        let mut flipped_at = None;
        for i in 0..5u32 {
            let open = price;
            price *= 1.012;
            let snap = monitor.append_candle(
                "ACME",
                candle(20 + i, open, open * 1.025, open, price),
            );
            if snap.regime == VolatilityRegime::High && flipped_at.is_none() {
                flipped_at = Some(i);
            }
        }
        assert!(flipped_at.is_some(), "regime never reached HIGH");
        assert_eq!(monitor.regime("ACME"), VolatilityRegime::High);
    }

    #[test]
    fn price_change_windows_use_tick_history() {
        let mut monitor = VolatilityMonitor::new(5, 14, 50);
        monitor.append_tick("ACME", 100.0, ts(0));
        monitor.append_tick("ACME", 101.0, ts(3));
        let snap = monitor.append_candle("ACME", candle(5, 102.0, 102.1, 101.9, 102.0));

        // 5-minute window starts at minute 0 -> old price 100.0.
        assert!((snap.price_change_5min - 2.0).abs() < 1e-9);
        // 1-minute window has no earlier tick except the candle itself.
        assert!((snap.price_change_1min - 0.0).abs() < 1e-9);
    }

    #[test]
    fn step_range_by_regime() {
        let mut monitor = VolatilityMonitor::new(5, 14, 50);
        assert_eq!(monitor.recommended_step_range("ACME"), (0.3, 0.8));

        for i in 0..20 {
            monitor.append_candle("ACME", quiet_candle(i, 100.0));
        }
        let (lo, hi) = monitor.recommended_step_range("ACME");
        assert!((lo - 0.15).abs() < 1e-10);
        assert!((hi - 0.4).abs() < 1e-10);
    }

    #[test]
    fn expanding_and_contracting_flags() {
        let mut monitor = VolatilityMonitor::new(2, 4, 8);
        // Ranges grow over time: short ATR ends above medium above long.
        for i in 0..10u32 {
            let width = 0.1 + 0.1 * i as f64;
            monitor.append_candle(
                "ACME",
                candle(i, 100.0, 100.0 + width, 100.0 - width, 100.0),
            );
        }
        let snap = monitor.snapshot("ACME").unwrap();
        assert!(snap.is_expanding);
        assert!(!snap.is_contracting);
    }

    #[test]
    fn clear_symbol_drops_state() {
        let mut monitor = VolatilityMonitor::new(5, 14, 50);
        monitor.append_candle("ACME", quiet_candle(0, 100.0));
        monitor.clear_symbol("ACME");
        assert!(monitor.snapshot("ACME").is_none());
        assert_eq!(monitor.regime("ACME"), VolatilityRegime::Unknown);
    }
}
