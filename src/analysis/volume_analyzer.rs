// =============================================================================
// Volume Analyzer - spike, trend, and anomaly detection
// =============================================================================
//
// Keeps a rolling (timestamp, volume, price-change) buffer per symbol plus a
// daily running total that resets on date rollover. Each appended sample
// refreshes the snapshot: moving averages, the ratio-driven condition ladder,
// the consecutive-high run, a coarse trend, the percentile of the current
// sample, and the Pearson correlation between volume and price change.
//
// Condition ladder (ratio = current / short MA):
//   EXTREME >= 3.0 | SPIKE >= 2.0 | HIGH >= 1.2 | NORMAL >= 0.8 | LOW >= 0.5
//   | VERY_LOW below.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Volume state relative to the short moving average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeCondition {
    VeryLow,
    Low,
    Normal,
    High,
    Spike,
    Extreme,
}

impl VolumeCondition {
    /// HIGH, SPIKE, and EXTREME all count as elevated.
    pub fn is_elevated(self) -> bool {
        matches!(self, Self::High | Self::Spike | Self::Extreme)
    }
}

impl std::fmt::Display for VolumeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VeryLow => write!(f, "VERY_LOW"),
            Self::Low => write!(f, "LOW"),
            Self::Normal => write!(f, "NORMAL"),
            Self::High => write!(f, "HIGH"),
            Self::Spike => write!(f, "SPIKE"),
            Self::Extreme => write!(f, "EXTREME"),
        }
    }
}

/// Direction of the volume trend over the last ten samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeTrend {
    Increasing,
    Stable,
    Decreasing,
}

impl std::fmt::Display for VolumeTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Increasing => write!(f, "INCREASING"),
            Self::Stable => write!(f, "STABLE"),
            Self::Decreasing => write!(f, "DECREASING"),
        }
    }
}

/// Snapshot of the volume analysis for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,

    pub current_volume: u64,
    pub volume_5min: u64,
    pub volume_15min: u64,
    pub volume_today: u64,

    pub ma_short: f64,
    pub ma_long: f64,

    /// current / short MA; 1.0 when the MA is zero.
    pub volume_ratio: f64,
    /// Fraction of buffered samples strictly below the current one, 0-100.
    pub volume_percentile: f64,

    pub condition: VolumeCondition,
    pub trend: VolumeTrend,

    pub is_spike: bool,
    pub spike_magnitude: f64,
    pub consecutive_high: u32,

    /// Pearson correlation of volume vs. price change over the last window.
    pub price_volume_correlation: f64,
}

const CORRELATION_WINDOW: usize = 20;

struct SymbolVolume {
    samples: VecDeque<(DateTime<Utc>, u64, f64)>,
    daily_total: u64,
    daily_date: Option<NaiveDate>,
    consecutive_high: u32,
}

/// Rolling volume analysis over one or more symbols. Single-writer.
pub struct VolumeAnalyzer {
    ma_short: usize,
    ma_long: usize,
    spike_threshold: f64,
    extreme_threshold: f64,
    buffer_size: usize,

    state: HashMap<String, SymbolVolume>,
    snapshots: HashMap<String, VolumeSnapshot>,
}

impl VolumeAnalyzer {
    pub fn new(ma_short: usize, spike_threshold: f64) -> Self {
        Self {
            ma_short,
            ma_long: 50,
            spike_threshold,
            extreme_threshold: 3.0,
            buffer_size: 100,
            state: HashMap::new(),
            snapshots: HashMap::new(),
        }
    }

    /// Append a volume sample and recompute the snapshot.
    pub fn append(
        &mut self,
        symbol: &str,
        volume: u64,
        price_change_pct: f64,
        timestamp: DateTime<Utc>,
    ) -> VolumeSnapshot {
        let buffer_size = self.buffer_size;
        let entry = self
            .state
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolVolume {
                samples: VecDeque::with_capacity(buffer_size),
                daily_total: 0,
                daily_date: None,
                consecutive_high: 0,
            });

        // Daily total resets on calendar date change.
        let today = timestamp.date_naive();
        if entry.daily_date != Some(today) {
            entry.daily_total = 0;
            entry.daily_date = Some(today);
        }
        entry.daily_total += volume;

        entry.samples.push_back((timestamp, volume, price_change_pct));
        while entry.samples.len() > buffer_size {
            entry.samples.pop_front();
        }

        let snapshot = self.build_snapshot(symbol, volume, timestamp);
        self.snapshots.insert(symbol.to_string(), snapshot.clone());
        snapshot
    }

    pub fn snapshot(&self, symbol: &str) -> Option<VolumeSnapshot> {
        self.snapshots.get(symbol).cloned()
    }

    pub fn condition(&self, symbol: &str) -> VolumeCondition {
        self.snapshots
            .get(symbol)
            .map(|s| s.condition)
            .unwrap_or(VolumeCondition::Normal)
    }

    pub fn volume_ratio(&self, symbol: &str) -> f64 {
        self.snapshots
            .get(symbol)
            .map(|s| s.volume_ratio)
            .unwrap_or(1.0)
    }

    pub fn is_high_volume(&self, symbol: &str) -> bool {
        self.condition(symbol).is_elevated()
    }

    pub fn is_low_volume(&self, symbol: &str) -> bool {
        matches!(
            self.condition(symbol),
            VolumeCondition::Low | VolumeCondition::VeryLow
        )
    }

    /// Recommend pausing trading on extreme volume or a sustained high run.
    pub fn should_pause_trading(&self, symbol: &str) -> (bool, String) {
        let Some(snapshot) = self.snapshots.get(symbol) else {
            return (false, String::new());
        };

        if snapshot.condition == VolumeCondition::Extreme {
            return (
                true,
                format!("extreme volume ({:.1}x normal)", snapshot.spike_magnitude),
            );
        }

        if snapshot.consecutive_high >= 5 {
            return (
                true,
                format!(
                    "sustained high volume ({} consecutive samples)",
                    snapshot.consecutive_high
                ),
            );
        }

        (false, String::new())
    }

    pub fn reset_daily(&mut self, symbol: Option<&str>) {
        match symbol {
            Some(sym) => {
                if let Some(entry) = self.state.get_mut(sym) {
                    entry.daily_total = 0;
                }
            }
            None => {
                for entry in self.state.values_mut() {
                    entry.daily_total = 0;
                }
            }
        }
    }

    pub fn clear_symbol(&mut self, symbol: &str) {
        self.state.remove(symbol);
        self.snapshots.remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn build_snapshot(
        &mut self,
        symbol: &str,
        current_volume: u64,
        timestamp: DateTime<Utc>,
    ) -> VolumeSnapshot {
        let entry = self.state.get_mut(symbol).expect("state entry exists");
        let volumes: Vec<u64> = entry.samples.iter().map(|(_, v, _)| *v).collect();

        let ma_short = moving_average(&volumes, self.ma_short);
        let ma_long = moving_average(&volumes, self.ma_long);

        let volume_ratio = if ma_short > 0.0 {
            current_volume as f64 / ma_short
        } else {
            1.0
        };

        let condition = condition_for_ratio(volume_ratio, self.spike_threshold, self.extreme_threshold);

        if condition.is_elevated() {
            entry.consecutive_high += 1;
        } else {
            entry.consecutive_high = 0;
        }

        let is_spike = volume_ratio >= self.spike_threshold;
        let spike_magnitude = if is_spike { volume_ratio } else { 0.0 };

        let volume_5min = sum_window(&entry.samples, timestamp, 5);
        let volume_15min = sum_window(&entry.samples, timestamp, 15);

        let percentile = percentile_of(&volumes, current_volume);
        let trend = trend_of(&volumes);
        let correlation = price_volume_correlation(&entry.samples);

        VolumeSnapshot {
            symbol: symbol.to_string(),
            timestamp,
            current_volume,
            volume_5min,
            volume_15min,
            volume_today: entry.daily_total,
            ma_short,
            ma_long,
            volume_ratio,
            volume_percentile: percentile,
            condition,
            trend,
            is_spike,
            spike_magnitude,
            consecutive_high: entry.consecutive_high,
            price_volume_correlation: correlation,
        }
    }
}

// =============================================================================
// Pure math
// =============================================================================

fn moving_average(values: &[u64], period: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let period = period.min(values.len());
    let start = values.len() - period;
    let sum: u64 = values[start..].iter().sum();
    sum as f64 / period as f64
}

fn condition_for_ratio(ratio: f64, spike: f64, extreme: f64) -> VolumeCondition {
    if ratio >= extreme {
        VolumeCondition::Extreme
    } else if ratio >= spike {
        VolumeCondition::Spike
    } else if ratio >= 1.2 {
        VolumeCondition::High
    } else if ratio >= 0.8 {
        VolumeCondition::Normal
    } else if ratio >= 0.5 {
        VolumeCondition::Low
    } else {
        VolumeCondition::VeryLow
    }
}

fn sum_window(
    samples: &VecDeque<(DateTime<Utc>, u64, f64)>,
    now: DateTime<Utc>,
    minutes: i64,
) -> u64 {
    let cutoff = now - Duration::minutes(minutes);
    samples
        .iter()
        .filter(|(ts, _, _)| *ts >= cutoff)
        .map(|(_, v, _)| *v)
        .sum()
}

/// Fraction of samples strictly below `current`, scaled to 0-100.
fn percentile_of(values: &[u64], current: u64) -> f64 {
    if values.len() < 2 {
        return 50.0;
    }
    let below = values.iter().filter(|v| **v < current).count();
    below as f64 / values.len() as f64 * 100.0
}

/// Average of the last five samples vs. the five before them.
fn trend_of(values: &[u64]) -> VolumeTrend {
    if values.len() < 10 {
        return VolumeTrend::Stable;
    }

    let recent: f64 = values[values.len() - 5..].iter().sum::<u64>() as f64 / 5.0;
    let previous: f64 =
        values[values.len() - 10..values.len() - 5].iter().sum::<u64>() as f64 / 5.0;

    if previous == 0.0 {
        return VolumeTrend::Stable;
    }

    let change = (recent - previous) / previous;
    if change > 0.2 {
        VolumeTrend::Increasing
    } else if change < -0.2 {
        VolumeTrend::Decreasing
    } else {
        VolumeTrend::Stable
    }
}

/// Pearson correlation over the last window; 0 when either variance is zero.
fn price_volume_correlation(samples: &VecDeque<(DateTime<Utc>, u64, f64)>) -> f64 {
    if samples.len() < 10 {
        return 0.0;
    }

    let start = samples.len().saturating_sub(CORRELATION_WINDOW);
    let window: Vec<(f64, f64)> = samples
        .iter()
        .skip(start)
        .map(|(_, v, p)| (*v as f64, *p))
        .collect();

    let n = window.len() as f64;
    let mean_vol = window.iter().map(|(v, _)| v).sum::<f64>() / n;
    let mean_price = window.iter().map(|(_, p)| p).sum::<f64>() / n;

    let numerator: f64 = window
        .iter()
        .map(|(v, p)| (v - mean_vol) * (p - mean_price))
        .sum();

    let std_vol = (window.iter().map(|(v, _)| (v - mean_vol).powi(2)).sum::<f64>() / n).sqrt();
    let std_price =
        (window.iter().map(|(_, p)| (p - mean_price).powi(2)).sum::<f64>() / n).sqrt();

    if std_vol == 0.0 || std_price == 0.0 {
        return 0.0;
    }

    numerator / (n * std_vol * std_price)
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

    fn ts_day(day: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 15, min, 0).unwrap()
    }

    #[test]
    fn condition_ladder() {
        assert_eq!(condition_for_ratio(3.5, 2.0, 3.0), VolumeCondition::Extreme);
        assert_eq!(condition_for_ratio(2.1, 2.0, 3.0), VolumeCondition::Spike);
        assert_eq!(condition_for_ratio(1.3, 2.0, 3.0), VolumeCondition::High);
        assert_eq!(condition_for_ratio(1.0, 2.0, 3.0), VolumeCondition::Normal);
        assert_eq!(condition_for_ratio(0.6, 2.0, 3.0), VolumeCondition::Low);
        assert_eq!(condition_for_ratio(0.2, 2.0, 3.0), VolumeCondition::VeryLow);
    }

    #[test]
    fn consecutive_high_tracks_runs_and_resets() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        // Build a stable baseline around 1000.
        for i in 0..20 {
            analyzer.append("ACME", 1000, 0.0, ts(i));
        }
        assert_eq!(analyzer.snapshot("ACME").unwrap().consecutive_high, 0);

        // Three elevated samples in a row.
        let mut run = 0;
        for i in 20..23 {
            run = analyzer.append("ACME", 1500, 0.1, ts(i)).consecutive_high;
        }
        assert_eq!(run, 3);

        // One normal sample resets the run to zero.
        let snap = analyzer.append("ACME", 1000, 0.0, ts(23));
        assert_eq!(snap.consecutive_high, 0);
    }

    #[test]
    fn ratio_is_one_with_empty_short_ma() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        let snap = analyzer.append("ACME", 0, 0.0, ts(0));
        assert!((snap.volume_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn daily_total_resets_on_date_change() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        analyzer.append("ACME", 500, 0.0, ts_day(12, 0));
        let snap = analyzer.append("ACME", 300, 0.0, ts_day(12, 1));
        assert_eq!(snap.volume_today, 800);

        let snap = analyzer.append("ACME", 100, 0.0, ts_day(13, 0));
        assert_eq!(snap.volume_today, 100);
    }

    #[test]
    fn trend_requires_ten_samples() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        for i in 0..9 {
            let snap = analyzer.append("ACME", 1000 + i as u64 * 500, 0.0, ts(i));
            assert_eq!(snap.trend, VolumeTrend::Stable);
        }
    }

    #[test]
    fn rising_volume_reports_increasing_trend() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        let mut snap = None;
        for i in 0..5 {
            snap = Some(analyzer.append("ACME", 1000, 0.0, ts(i)));
        }
        for i in 5..10 {
            snap = Some(analyzer.append("ACME", 2000, 0.0, ts(i)));
        }
        assert_eq!(snap.unwrap().trend, VolumeTrend::Increasing);
    }

    #[test]
    fn pause_on_extreme_volume() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        for i in 0..20 {
            analyzer.append("ACME", 1000, 0.0, ts(i));
        }
        analyzer.append("ACME", 4000, 0.5, ts(20));

        let (pause, reason) = analyzer.should_pause_trading("ACME");
        assert!(pause);
        assert!(reason.contains("extreme volume"));
    }

    #[test]
    fn pause_on_sustained_high_run() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        for i in 0..20 {
            analyzer.append("ACME", 1000, 0.0, ts(i));
        }
        for i in 20..25 {
            analyzer.append("ACME", 1500, 0.1, ts(i));
        }

        let (pause, reason) = analyzer.should_pause_trading("ACME");
        assert!(pause);
        assert!(reason.contains("sustained high volume"));
    }

    #[test]
    fn correlation_is_zero_without_variance() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        let mut snap = None;
        for i in 0..15 {
            snap = Some(analyzer.append("ACME", 1000, 0.0, ts(i)));
        }
        assert!((snap.unwrap().price_volume_correlation - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn correlation_positive_when_volume_tracks_price() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        let mut snap = None;
        for i in 0..20u32 {
            let volume = 1000 + (i as u64 % 5) * 400;
            let price_change = (i as f64 % 5.0) * 0.1;
            snap = Some(analyzer.append("ACME", volume, price_change, ts(i)));
        }
        assert!(snap.unwrap().price_volume_correlation > 0.9);
    }

    #[test]
    fn window_sums_respect_timestamps() {
        let mut analyzer = VolumeAnalyzer::new(20, 2.0);
        analyzer.append("ACME", 100, 0.0, ts(0));
        analyzer.append("ACME", 200, 0.0, ts(12));
        let snap = analyzer.append("ACME", 300, 0.0, ts(14));

        assert_eq!(snap.volume_5min, 500); // minutes 12 and 14
        assert_eq!(snap.volume_15min, 600); // everything
    }
}
