// =============================================================================
// Time Profile - trading-phase schedule and time-of-day recommendations
// =============================================================================
//
// Projects the clock into the exchange zone (America/New_York) and maps it to
// a trading phase with per-phase recommendations (typical volatility, step
// multiplier, level budget). The snapshot also carries a 0-3 caution level,
// a trading-recommended flag, and weekday risk markers (Friday afternoon,
// Monday morning).
//
// Phase schedule (NY local time):
//   00:00-09:30 PRE_MARKET | 09:30-10:30 MARKET_OPEN | 10:30-12:00 MORNING
//   12:00-14:00 MIDDAY     | 14:00-15:30 AFTERNOON   | 15:30-16:00 MARKET_CLOSE
//   16:00-      AFTER_HOURS
//
// Snapshots are cached for 10 seconds to keep wall-clock reads cheap.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::types::VolatilityRegime;

/// Trading phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingPhase {
    PreMarket,
    MarketOpen,
    Morning,
    Midday,
    Afternoon,
    MarketClose,
    AfterHours,
}

impl std::fmt::Display for TradingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreMarket => write!(f, "PRE_MARKET"),
            Self::MarketOpen => write!(f, "MARKET_OPEN"),
            Self::Morning => write!(f, "MORNING"),
            Self::Midday => write!(f, "MIDDAY"),
            Self::Afternoon => write!(f, "AFTERNOON"),
            Self::MarketClose => write!(f, "MARKET_CLOSE"),
            Self::AfterHours => write!(f, "AFTER_HOURS"),
        }
    }
}

/// Static recommendations for one phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseCharacteristics {
    pub phase: TradingPhase,
    pub typical_volatility: VolatilityRegime,
    pub step_multiplier: f64,
    pub max_levels: u32,
    pub trading_allowed: bool,
    pub notes: &'static str,
}

/// Snapshot of the time profile at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeProfileSnapshot {
    pub timestamp: DateTime<Utc>,

    pub phase: TradingPhase,
    /// Elapsed fraction of the current phase, 0-1.
    pub phase_progress: f64,

    pub minutes_since_open: i64,
    pub minutes_until_close: i64,
    pub minutes_in_phase: i64,
    pub minutes_until_phase_change: i64,

    pub typical_volatility: VolatilityRegime,
    pub step_multiplier: f64,
    pub recommended_max_levels: u32,
    pub trading_recommended: bool,
    /// 0 = normal, 3 = maximum caution.
    pub caution_level: u8,

    pub weekday: Weekday,
    pub is_friday_afternoon: bool,
    pub is_monday_morning: bool,
}

/// Per-symbol, per-phase observation stats (exponential moving averages).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PhaseStats {
    pub avg_atr: f64,
    pub avg_range: f64,
    pub sample_count: u64,
}

/// EMA weight for new phase observations.
const OBSERVATION_ALPHA: f64 = 0.1;
/// Snapshot cache lifetime in seconds.
const CACHE_TTL_SECS: i64 = 10;

fn schedule() -> Vec<(NaiveTime, NaiveTime, TradingPhase)> {
    let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
    vec![
        (t(0, 0), t(9, 30), TradingPhase::PreMarket),
        (t(9, 30), t(10, 30), TradingPhase::MarketOpen),
        (t(10, 30), t(12, 0), TradingPhase::Morning),
        (t(12, 0), t(14, 0), TradingPhase::Midday),
        (t(14, 0), t(15, 30), TradingPhase::Afternoon),
        (t(15, 30), t(16, 0), TradingPhase::MarketClose),
        (t(16, 0), NaiveTime::from_hms_opt(23, 59, 59).unwrap(), TradingPhase::AfterHours),
    ]
}

fn default_characteristics() -> HashMap<TradingPhase, PhaseCharacteristics> {
    use TradingPhase::*;
    use VolatilityRegime::*;

    let table = [
        (PreMarket, Unknown, 1.5, 5, false, "no regular session"),
        (MarketOpen, High, 1.5, 8, true, "widest candles of the day"),
        (Morning, Medium, 1.0, 12, true, "prime trading window"),
        (Midday, Low, 0.7, 15, true, "lunch lull, smaller steps"),
        (Afternoon, Medium, 1.0, 12, true, "activity picks back up"),
        (MarketClose, High, 1.3, 8, true, "closing volatility"),
        (AfterHours, Unknown, 1.5, 5, false, "no regular session"),
    ];

    table
        .into_iter()
        .map(|(phase, vol, mult, levels, allowed, notes)| {
            (
                phase,
                PhaseCharacteristics {
                    phase,
                    typical_volatility: vol,
                    step_multiplier: mult,
                    max_levels: levels,
                    trading_allowed: allowed,
                    notes,
                },
            )
        })
        .collect()
}

/// Time-of-day analysis for the controller.
pub struct TimeProfile {
    clock: Clock,
    characteristics: HashMap<TradingPhase, PhaseCharacteristics>,
    symbol_stats: HashMap<String, HashMap<TradingPhase, PhaseStats>>,
    cache: Option<(DateTime<Utc>, TimeProfileSnapshot)>,
}

impl TimeProfile {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            characteristics: default_characteristics(),
            symbol_stats: HashMap::new(),
            cache: None,
        }
    }

    /// Current snapshot, cached for up to ten seconds.
    pub fn snapshot(&mut self) -> TimeProfileSnapshot {
        let now = self.clock.now_utc();

        if let Some((at, cached)) = &self.cache {
            if (now - *at).num_seconds() < CACHE_TTL_SECS {
                return cached.clone();
            }
        }

        let snapshot = self.compute_snapshot(now);
        self.cache = Some((now, snapshot.clone()));
        snapshot
    }

    pub fn current_phase(&mut self) -> TradingPhase {
        self.snapshot().phase
    }

    pub fn phase_characteristics(&self, phase: TradingPhase) -> &PhaseCharacteristics {
        &self.characteristics[&phase]
    }

    /// Inside the regular session (between open and close phases)?
    pub fn is_market_hours(&mut self) -> bool {
        !matches!(
            self.current_phase(),
            TradingPhase::PreMarket | TradingPhase::AfterHours
        )
    }

    /// Advise shrinking exposure because of the clock.
    pub fn should_reduce_positions(&mut self) -> (bool, String) {
        let snapshot = self.snapshot();

        if snapshot.minutes_until_close <= 15 {
            return (
                true,
                format!(
                    "{} minutes until market close",
                    snapshot.minutes_until_close
                ),
            );
        }

        if snapshot.is_friday_afternoon && snapshot.minutes_until_close <= 60 {
            return (true, "Friday afternoon weekend risk".into());
        }

        (false, String::new())
    }

    /// Record an ATR / candle-range observation for symbol-phase learning.
    pub fn record_observation(&mut self, symbol: &str, atr: f64, candle_range: f64) {
        let phase = self.current_phase();
        let stats = self
            .symbol_stats
            .entry(symbol.to_string())
            .or_default()
            .entry(phase)
            .or_default();

        if stats.sample_count == 0 {
            stats.avg_atr = atr;
            stats.avg_range = candle_range;
        } else {
            stats.avg_atr = OBSERVATION_ALPHA * atr + (1.0 - OBSERVATION_ALPHA) * stats.avg_atr;
            stats.avg_range =
                OBSERVATION_ALPHA * candle_range + (1.0 - OBSERVATION_ALPHA) * stats.avg_range;
        }
        stats.sample_count += 1;
    }

    pub fn symbol_phase_stats(&self, symbol: &str, phase: TradingPhase) -> Option<PhaseStats> {
        self.symbol_stats
            .get(symbol)
            .and_then(|phases| phases.get(&phase))
            .copied()
    }

    /// Override one phase's recommendations at runtime.
    pub fn update_phase_characteristics(
        &mut self,
        phase: TradingPhase,
        step_multiplier: Option<f64>,
        max_levels: Option<u32>,
    ) {
        if let Some(chars) = self.characteristics.get_mut(&phase) {
            if let Some(mult) = step_multiplier {
                chars.step_multiplier = mult;
            }
            if let Some(levels) = max_levels {
                chars.max_levels = levels;
            }
        }
        self.cache = None;
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn compute_snapshot(&self, now: DateTime<Utc>) -> TimeProfileSnapshot {
        let ny = now.with_timezone(&chrono_tz::America::New_York);
        let ny_time = ny.time();
        let weekday = ny.weekday();

        let phase = phase_for_time(ny_time);
        let (phase_start, phase_end) = phase_boundaries(phase);

        let total_secs = seconds_between(phase_start, phase_end);
        let elapsed_secs = seconds_between(phase_start, ny_time).max(0);
        let phase_progress = if total_secs > 0 {
            (elapsed_secs as f64 / total_secs as f64).clamp(0.0, 1.0)
        } else {
            0.5
        };

        let market_open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let market_close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        let session_minutes = seconds_between(market_open, market_close) / 60;

        let (minutes_since_open, minutes_until_close) =
            if ny_time >= market_open && ny_time <= market_close {
                (
                    seconds_between(market_open, ny_time) / 60,
                    seconds_between(ny_time, market_close) / 60,
                )
            } else if ny_time < market_open {
                (0, session_minutes)
            } else {
                (session_minutes, 0)
            };

        let is_friday_afternoon =
            weekday == Weekday::Fri && ny_time >= NaiveTime::from_hms_opt(14, 0, 0).unwrap();
        let is_monday_morning =
            weekday == Weekday::Mon && ny_time <= NaiveTime::from_hms_opt(10, 30, 0).unwrap();

        let mut caution_level: u8 = 0;
        if phase == TradingPhase::MarketOpen {
            caution_level = 1;
        }
        if phase == TradingPhase::MarketClose {
            caution_level = 2;
        }
        if minutes_until_close > 0 && minutes_until_close <= 15 {
            caution_level = 3;
        }
        if is_friday_afternoon {
            caution_level = caution_level.max(2);
        }
        if is_monday_morning {
            caution_level = caution_level.max(1);
        }

        let chars = &self.characteristics[&phase];
        let is_weekday = weekday.number_from_monday() <= 5;
        let trading_recommended = chars.trading_allowed && is_weekday && minutes_until_close > 5;

        TimeProfileSnapshot {
            timestamp: now,
            phase,
            phase_progress,
            minutes_since_open,
            minutes_until_close,
            minutes_in_phase: elapsed_secs / 60,
            minutes_until_phase_change: (total_secs - elapsed_secs).max(0) / 60,
            typical_volatility: chars.typical_volatility,
            step_multiplier: chars.step_multiplier,
            recommended_max_levels: chars.max_levels,
            trading_recommended,
            caution_level,
            weekday,
            is_friday_afternoon,
            is_monday_morning,
        }
    }
}

fn phase_for_time(t: NaiveTime) -> TradingPhase {
    for (start, end, phase) in schedule() {
        if t >= start && t < end {
            return phase;
        }
    }
    TradingPhase::AfterHours
}

fn phase_boundaries(phase: TradingPhase) -> (NaiveTime, NaiveTime) {
    for (start, end, p) in schedule() {
        if p == phase {
            return (start, end);
        }
    }
    unreachable!("every phase appears in the schedule")
}

fn seconds_between(a: NaiveTime, b: NaiveTime) -> i64 {
    let secs = |t: NaiveTime| t.hour() as i64 * 3600 + t.minute() as i64 * 60 + t.second() as i64;
    secs(b) - secs(a)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-12 is a Tuesday, 2024-03-15 a Friday, 2024-03-11 a Monday.

    #[test]
    fn phase_schedule_boundaries() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert_eq!(phase_for_time(t(9, 29)), TradingPhase::PreMarket);
        assert_eq!(phase_for_time(t(9, 30)), TradingPhase::MarketOpen);
        assert_eq!(phase_for_time(t(10, 30)), TradingPhase::Morning);
        assert_eq!(phase_for_time(t(12, 0)), TradingPhase::Midday);
        assert_eq!(phase_for_time(t(14, 0)), TradingPhase::Afternoon);
        assert_eq!(phase_for_time(t(15, 30)), TradingPhase::MarketClose);
        assert_eq!(phase_for_time(t(16, 0)), TradingPhase::AfterHours);
    }

    #[test]
    fn midmorning_snapshot() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 12, 10, 45, 0));
        let snap = profile.snapshot();

        assert_eq!(snap.phase, TradingPhase::Morning);
        assert_eq!(snap.minutes_since_open, 75);
        assert_eq!(snap.minutes_until_close, 315);
        assert_eq!(snap.caution_level, 0);
        assert!(snap.trading_recommended);
        assert_eq!(snap.typical_volatility, VolatilityRegime::Medium);
        // 15 minutes into a 90-minute phase.
        assert!((snap.phase_progress - 15.0 / 90.0).abs() < 1e-9);
    }

    #[test]
    fn market_open_raises_caution() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 12, 9, 45, 0));
        let snap = profile.snapshot();
        assert_eq!(snap.phase, TradingPhase::MarketOpen);
        assert_eq!(snap.caution_level, 1);
        assert!((snap.step_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(snap.recommended_max_levels, 8);
    }

    #[test]
    fn last_quarter_hour_is_maximum_caution() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 12, 15, 50, 0));
        let snap = profile.snapshot();
        assert_eq!(snap.phase, TradingPhase::MarketClose);
        assert_eq!(snap.caution_level, 3);

        let (reduce, reason) = profile.should_reduce_positions();
        assert!(reduce);
        assert!(reason.contains("until market close"));
    }

    #[test]
    fn friday_afternoon_flags_and_caution() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 15, 14, 30, 0));
        let snap = profile.snapshot();
        assert!(snap.is_friday_afternoon);
        assert_eq!(snap.caution_level, 2);
        // 90 minutes to close: no reduction yet.
        let (reduce, _) = profile.should_reduce_positions();
        assert!(!reduce);

        // Within the last hour on Friday: reduce.
        let mut late = TimeProfile::new(Clock::fixed_ny(2024, 3, 15, 15, 10, 0));
        let (reduce, reason) = late.should_reduce_positions();
        assert!(reduce);
        assert!(reason.contains("Friday"));
    }

    #[test]
    fn monday_morning_flag() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 11, 10, 0, 0));
        let snap = profile.snapshot();
        assert!(snap.is_monday_morning);
        assert_eq!(snap.caution_level, 1);
    }

    #[test]
    fn weekend_blocks_trading_recommendation() {
        // 2024-03-16 is a Saturday.
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 16, 11, 0, 0));
        let snap = profile.snapshot();
        assert!(!snap.trading_recommended);
    }

    #[test]
    fn snapshot_cache_holds_for_ten_seconds() {
        let clock = Clock::fixed_ny(2024, 3, 12, 10, 29, 55);
        let mut profile = TimeProfile::new(clock.clone());

        assert_eq!(profile.snapshot().phase, TradingPhase::MarketOpen);

        // Crossing the 10:30 boundary within the cache window is not observed.
        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(profile.snapshot().phase, TradingPhase::MarketOpen);

        // After the TTL the new phase shows up.
        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(profile.snapshot().phase, TradingPhase::Morning);
    }

    #[test]
    fn observation_ema_converges() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 12, 10, 45, 0));
        profile.record_observation("ACME", 1.0, 0.5);
        let stats = profile
            .symbol_phase_stats("ACME", TradingPhase::Morning)
            .unwrap();
        assert!((stats.avg_atr - 1.0).abs() < f64::EPSILON);

        profile.record_observation("ACME", 2.0, 0.5);
        let stats = profile
            .symbol_phase_stats("ACME", TradingPhase::Morning)
            .unwrap();
        assert!((stats.avg_atr - (0.1 * 2.0 + 0.9 * 1.0)).abs() < 1e-12);
        assert_eq!(stats.sample_count, 2);
    }

    #[test]
    fn characteristics_override() {
        let mut profile = TimeProfile::new(Clock::fixed_ny(2024, 3, 12, 12, 30, 0));
        profile.update_phase_characteristics(TradingPhase::Midday, Some(0.5), Some(20));
        let snap = profile.snapshot();
        assert!((snap.step_multiplier - 0.5).abs() < f64::EPSILON);
        assert_eq!(snap.recommended_max_levels, 20);
    }
}
