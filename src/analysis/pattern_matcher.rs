// =============================================================================
// Pattern Matcher - nearest-neighbour lookup over situation fingerprints
// =============================================================================
//
// Each recorded market situation is reduced to a fixed-length normalised
// vector (the fingerprint). Matching compares the current fingerprint against
// the stored history with a weighted euclidean similarity and aggregates the
// outcomes of the closest neighbours into a probabilistic short-horizon
// prediction.
//
// History is bounded per symbol, filtered by a lookback window at query time,
// and round-trips through a schema-tagged JSON store. A corrupt store is
// treated as empty.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;
use crate::types::VolatilityRegime;

use super::time_profile::TradingPhase;
use super::volume_analyzer::VolumeCondition;

/// Classified movement following a situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovementPattern {
    Consolidation,
    BreakoutUp,
    BreakoutDown,
    TrendUp,
    TrendDown,
    ReversalUp,
    ReversalDown,
    HighVolatility,
    Unknown,
}

impl MovementPattern {
    pub fn is_bullish(self) -> bool {
        matches!(self, Self::BreakoutUp | Self::TrendUp | Self::ReversalUp)
    }

    pub fn is_bearish(self) -> bool {
        matches!(
            self,
            Self::BreakoutDown | Self::TrendDown | Self::ReversalDown
        )
    }
}

impl std::fmt::Display for MovementPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consolidation => write!(f, "CONSOLIDATION"),
            Self::BreakoutUp => write!(f, "BREAKOUT_UP"),
            Self::BreakoutDown => write!(f, "BREAKOUT_DOWN"),
            Self::TrendUp => write!(f, "TREND_UP"),
            Self::TrendDown => write!(f, "TREND_DOWN"),
            Self::ReversalUp => write!(f, "REVERSAL_UP"),
            Self::ReversalDown => write!(f, "REVERSAL_DOWN"),
            Self::HighVolatility => write!(f, "HIGH_VOLATILITY"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Fixed-length characterisation of a market situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SituationFingerprint {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,

    /// Where the price sits inside the day range, 0 (low) to 100 (high).
    pub price_position_in_range: f64,
    pub atr_pct: f64,
    pub volatility_regime: VolatilityRegime,
    pub volume_ratio: f64,
    pub volume_condition: VolumeCondition,
    pub short_term_trend: f64,
    pub medium_term_trend: f64,
    pub trading_phase: TradingPhase,
    pub minutes_since_open: i64,
    pub last_candle_body_pct: f64,
    pub last_candle_range_pct: f64,
}

impl SituationFingerprint {
    /// Normalised comparison vector. The components and their normalisation
    /// constants are fixed; similarity weights live in [`FEATURE_WEIGHTS`].
    pub fn to_vector(&self) -> [f64; 8] {
        [
            self.price_position_in_range / 100.0,
            (self.atr_pct / 3.0).min(1.0),
            self.volume_ratio / 3.0,
            (self.short_term_trend + 5.0) / 10.0,
            (self.medium_term_trend + 5.0) / 10.0,
            self.minutes_since_open as f64 / 390.0,
            self.last_candle_body_pct / 3.0,
            self.last_candle_range_pct / 5.0,
        ]
    }
}

/// What happened after a recorded situation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalOutcome {
    pub fingerprint: SituationFingerprint,

    pub price_change_5min: f64,
    pub price_change_15min: f64,
    pub price_change_30min: f64,

    pub max_up_5min: f64,
    pub max_down_5min: f64,
    pub max_up_15min: f64,
    pub max_down_15min: f64,

    pub pattern: MovementPattern,
}

impl HistoricalOutcome {
    /// Placeholder recorded before the subsequent moves are known.
    pub fn pending(fingerprint: SituationFingerprint) -> Self {
        Self {
            fingerprint,
            price_change_5min: 0.0,
            price_change_15min: 0.0,
            price_change_30min: 0.0,
            max_up_5min: 0.0,
            max_down_5min: 0.0,
            max_up_15min: 0.0,
            max_down_15min: 0.0,
            pattern: MovementPattern::Unknown,
        }
    }

    /// Placeholders have not seen any real subsequent change yet.
    fn has_outcome(&self) -> bool {
        self.price_change_5min != 0.0 || self.price_change_15min != 0.0
    }
}

/// Observed moves used to complete a pending outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeUpdate {
    pub price_change_5min: f64,
    pub price_change_15min: f64,
    pub price_change_30min: f64,
    pub max_up_5min: f64,
    pub max_down_5min: f64,
    pub max_up_15min: f64,
    pub max_down_15min: f64,
}

/// Aggregated prediction from the closest historical neighbours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatchResult {
    pub current_fingerprint: SituationFingerprint,
    pub match_count: usize,

    pub expected_5min_change: f64,
    pub expected_15min_change: f64,
    pub confidence: f64,

    pub prob_up_5min: f64,
    pub prob_down_5min: f64,
    pub prob_up_15min: f64,
    pub prob_down_15min: f64,

    pub expected_max_up: f64,
    pub expected_max_down: f64,

    pub dominant_pattern: MovementPattern,
}

impl PatternMatchResult {
    fn empty(current: SituationFingerprint) -> Self {
        Self {
            current_fingerprint: current,
            match_count: 0,
            expected_5min_change: 0.0,
            expected_15min_change: 0.0,
            confidence: 0.0,
            prob_up_5min: 0.5,
            prob_down_5min: 0.5,
            prob_up_15min: 0.5,
            prob_down_15min: 0.5,
            expected_max_up: 0.0,
            expected_max_down: 0.0,
            dominant_pattern: MovementPattern::Unknown,
        }
    }
}

/// Aggregate history statistics for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub total_records: usize,
    pub valid_records: usize,
    pub avg_5min_change: f64,
    pub avg_15min_change: f64,
    pub std_5min: f64,
    pub std_15min: f64,
    pub up_probability_5min: f64,
    pub up_probability_15min: f64,
}

/// Similarity weights for the eight vector components.
const FEATURE_WEIGHTS: [f64; 8] = [1.5, 2.0, 1.0, 1.5, 1.0, 0.5, 1.0, 1.0];

/// Window for matching a late outcome update to its fingerprint.
const OUTCOME_MATCH_WINDOW_SECS: i64 = 60;

const STORE_VERSION: &str = "1.0";

#[derive(Serialize, Deserialize)]
struct PatternStore {
    version: String,
    symbol: String,
    updated_at: DateTime<Utc>,
    outcomes: Vec<HistoricalOutcome>,
}

/// Per-symbol history with nearest-neighbour lookup.
pub struct PatternMatcher {
    similarity_threshold: f64,
    max_history_per_symbol: usize,
    lookback_days: i64,
    min_matches: usize,
    max_matches: usize,
    clock: Clock,
    data_dir: PathBuf,

    history: HashMap<String, Vec<HistoricalOutcome>>,
}

impl PatternMatcher {
    pub fn new(
        similarity_threshold: f64,
        lookback_days: i64,
        clock: Clock,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            similarity_threshold,
            max_history_per_symbol: 1000,
            lookback_days,
            min_matches: 5,
            max_matches: 20,
            clock,
            data_dir,
            history: HashMap::new(),
        }
    }

    /// Record a situation, optionally with its outcome already known.
    /// Without an outcome a placeholder is stored and completed later via
    /// [`update_outcome`].
    pub fn record(&mut self, fingerprint: SituationFingerprint, outcome: Option<OutcomeUpdate>) {
        let symbol = fingerprint.symbol.clone();
        let record = match outcome {
            Some(update) => completed(fingerprint, update),
            None => HistoricalOutcome::pending(fingerprint),
        };

        let entries = self.history.entry(symbol).or_default();
        entries.push(record);
        if entries.len() > self.max_history_per_symbol {
            let excess = entries.len() - self.max_history_per_symbol;
            entries.drain(..excess);
        }
    }

    /// Complete the pending record whose fingerprint timestamp lies within
    /// one minute of `timestamp`.
    pub fn update_outcome(
        &mut self,
        symbol: &str,
        timestamp: DateTime<Utc>,
        update: OutcomeUpdate,
    ) -> bool {
        let Some(entries) = self.history.get_mut(symbol) else {
            return false;
        };

        for entry in entries.iter_mut() {
            let diff = (entry.fingerprint.timestamp - timestamp)
                .num_seconds()
                .abs();
            if diff < OUTCOME_MATCH_WINDOW_SECS {
                apply_update(entry, update);
                return true;
            }
        }
        false
    }

    /// Find similar historical situations and aggregate their outcomes.
    pub fn find_similar(&self, current: &SituationFingerprint) -> PatternMatchResult {
        let Some(entries) = self.history.get(&current.symbol) else {
            return PatternMatchResult::empty(current.clone());
        };

        let cutoff = self.clock.now_utc() - Duration::days(self.lookback_days);
        let current_vector = current.to_vector();

        let mut scored: Vec<(f64, &HistoricalOutcome)> = entries
            .iter()
            .filter(|o| o.fingerprint.timestamp >= cutoff)
            .filter(|o| o.has_outcome())
            .filter_map(|o| {
                let sim = similarity(&current_vector, &o.fingerprint.to_vector());
                (sim >= self.similarity_threshold).then_some((sim, o))
            })
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_matches);

        if scored.is_empty() {
            return PatternMatchResult::empty(current.clone());
        }

        let matches: Vec<&HistoricalOutcome> = scored.iter().map(|(_, o)| *o).collect();
        aggregate(current.clone(), &matches, self.min_matches)
    }

    /// Convenience: (expected 5-min, expected 15-min, confidence).
    pub fn prediction(&self, current: &SituationFingerprint) -> (f64, f64, f64) {
        let result = self.find_similar(current);
        (
            result.expected_5min_change,
            result.expected_15min_change,
            result.confidence,
        )
    }

    /// Aggregate statistics over the recorded history for one symbol.
    pub fn statistics(&self, symbol: &str) -> PatternStatistics {
        let Some(entries) = self.history.get(symbol) else {
            return PatternStatistics::default();
        };

        let valid: Vec<&HistoricalOutcome> =
            entries.iter().filter(|o| o.has_outcome()).collect();
        if valid.is_empty() {
            return PatternStatistics {
                total_records: entries.len(),
                ..Default::default()
            };
        }

        let changes_5: Vec<f64> = valid.iter().map(|o| o.price_change_5min).collect();
        let changes_15: Vec<f64> = valid.iter().map(|o| o.price_change_15min).collect();

        PatternStatistics {
            total_records: entries.len(),
            valid_records: valid.len(),
            avg_5min_change: mean(&changes_5),
            avg_15min_change: mean(&changes_15),
            std_5min: sample_stdev(&changes_5),
            std_15min: sample_stdev(&changes_15),
            up_probability_5min: fraction_positive(&changes_5),
            up_probability_15min: fraction_positive(&changes_15),
        }
    }

    pub fn record_count(&self, symbol: &str) -> usize {
        self.history.get(symbol).map_or(0, Vec::len)
    }

    /// Drop history for a symbol, including its persisted store.
    pub fn clear_symbol(&mut self, symbol: &str) {
        self.history.remove(symbol);
        let path = self.store_path(symbol);
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn save_history(&self, symbol: &str) -> Result<()> {
        let outcomes = self.history.get(symbol).cloned().unwrap_or_default();
        let store = PatternStore {
            version: STORE_VERSION.to_string(),
            symbol: symbol.to_string(),
            updated_at: self.clock.now_utc(),
            outcomes,
        };

        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("failed to create {}", self.data_dir.display()))?;

        let path = self.store_path(symbol);
        let content =
            serde_json::to_string_pretty(&store).context("failed to serialise pattern store")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename to {}", path.display()))?;

        Ok(())
    }

    /// Load a symbol's history from disk. Returns the number of records;
    /// a missing or corrupt store loads as empty.
    pub fn load_history(&mut self, symbol: &str) -> usize {
        let path = self.store_path(symbol);
        if !path.exists() {
            return 0;
        }

        let store: Option<PatternStore> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());

        match store {
            Some(store) => {
                let count = store.outcomes.len();
                self.history.insert(symbol.to_string(), store.outcomes);
                count
            }
            None => {
                warn!(
                    symbol,
                    path = %path.display(),
                    "corrupt pattern store, starting with empty history"
                );
                self.history.insert(symbol.to_string(), Vec::new());
                0
            }
        }
    }

    fn store_path(&self, symbol: &str) -> PathBuf {
        self.data_dir.join(format!("{symbol}_patterns.json"))
    }
}

// =============================================================================
// Pure math
// =============================================================================

/// Weighted euclidean similarity in [0, 1]; identical vectors score 1.
pub fn similarity(a: &[f64; 8], b: &[f64; 8]) -> f64 {
    let weighted_sq_diff: f64 = FEATURE_WEIGHTS
        .iter()
        .zip(a.iter().zip(b.iter()))
        .map(|(w, (x, y))| w * (x - y).powi(2))
        .sum();

    let max_distance: f64 = FEATURE_WEIGHTS.iter().sum();
    let sim = 1.0 - weighted_sq_diff.sqrt() / max_distance.sqrt();
    sim.clamp(0.0, 1.0)
}

/// Classify the movement that followed a situation.
pub fn classify_pattern(
    change_5: f64,
    change_15: f64,
    max_up: f64,
    max_down: f64,
) -> MovementPattern {
    if max_up > 1.5 && max_down > 1.5 {
        return MovementPattern::HighVolatility;
    }

    if change_5 > 0.8 && change_15 > 1.0 {
        return MovementPattern::BreakoutUp;
    }
    if change_5 < -0.8 && change_15 < -1.0 {
        return MovementPattern::BreakoutDown;
    }

    if change_5 > 0.3 && change_15 > 0.5 {
        return MovementPattern::TrendUp;
    }
    if change_5 < -0.3 && change_15 < -0.5 {
        return MovementPattern::TrendDown;
    }

    if change_5 < -0.3 && change_15 > 0.2 {
        return MovementPattern::ReversalUp;
    }
    if change_5 > 0.3 && change_15 < -0.2 {
        return MovementPattern::ReversalDown;
    }

    if change_15.abs() < 0.3 {
        return MovementPattern::Consolidation;
    }

    MovementPattern::Unknown
}

fn completed(fingerprint: SituationFingerprint, update: OutcomeUpdate) -> HistoricalOutcome {
    let mut outcome = HistoricalOutcome::pending(fingerprint);
    apply_update(&mut outcome, update);
    outcome
}

fn apply_update(outcome: &mut HistoricalOutcome, update: OutcomeUpdate) {
    outcome.price_change_5min = update.price_change_5min;
    outcome.price_change_15min = update.price_change_15min;
    outcome.price_change_30min = update.price_change_30min;
    outcome.max_up_5min = update.max_up_5min;
    outcome.max_down_5min = update.max_down_5min;
    outcome.max_up_15min = update.max_up_15min;
    outcome.max_down_15min = update.max_down_15min;
    outcome.pattern = classify_pattern(
        update.price_change_5min,
        update.price_change_15min,
        update.max_up_5min,
        update.max_down_5min,
    );
}

fn aggregate(
    current: SituationFingerprint,
    matches: &[&HistoricalOutcome],
    min_matches: usize,
) -> PatternMatchResult {
    let n = matches.len();
    let nf = n as f64;

    let changes_5: Vec<f64> = matches.iter().map(|m| m.price_change_5min).collect();
    let changes_15: Vec<f64> = matches.iter().map(|m| m.price_change_15min).collect();
    let ups_15: Vec<f64> = matches.iter().map(|m| m.max_up_15min).collect();
    let downs_15: Vec<f64> = matches.iter().map(|m| m.max_down_15min).collect();

    let mut pattern_counts: HashMap<MovementPattern, usize> = HashMap::new();
    for m in matches {
        *pattern_counts.entry(m.pattern).or_insert(0) += 1;
    }
    let dominant_pattern = pattern_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(pattern, _)| pattern)
        .unwrap_or(MovementPattern::Unknown);

    let confidence = if n >= min_matches {
        let std_5 = if changes_5.len() > 1 {
            sample_stdev(&changes_5)
        } else {
            1.0
        };
        let consistency = 1.0 / (1.0 + std_5);
        let count_factor = (nf / (min_matches as f64 * 2.0)).min(1.0);
        consistency * 0.6 + count_factor * 0.4
    } else {
        nf / min_matches as f64 * 0.5
    };

    PatternMatchResult {
        current_fingerprint: current,
        match_count: n,
        expected_5min_change: mean(&changes_5),
        expected_15min_change: mean(&changes_15),
        confidence: confidence.clamp(0.0, 1.0),
        prob_up_5min: fraction_positive(&changes_5),
        prob_down_5min: changes_5.iter().filter(|c| **c < 0.0).count() as f64 / nf,
        prob_up_15min: fraction_positive(&changes_15),
        prob_down_15min: changes_15.iter().filter(|c| **c < 0.0).count() as f64 / nf,
        expected_max_up: mean(&ups_15),
        expected_max_down: mean(&downs_15),
        dominant_pattern,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn sample_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

fn fraction_positive(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.5;
    }
    values.iter().filter(|v| **v > 0.0).count() as f64 / values.len() as f64
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fingerprint(symbol: &str, minute: u32) -> SituationFingerprint {
        SituationFingerprint {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 12, 15, minute, 0).unwrap(),
            symbol: symbol.to_string(),
            price_position_in_range: 60.0,
            atr_pct: 1.2,
            volatility_regime: VolatilityRegime::Medium,
            volume_ratio: 1.1,
            volume_condition: VolumeCondition::Normal,
            short_term_trend: 0.4,
            medium_term_trend: 0.2,
            trading_phase: TradingPhase::Morning,
            minutes_since_open: 75,
            last_candle_body_pct: 0.1,
            last_candle_range_pct: 0.3,
        }
    }

    fn matcher() -> PatternMatcher {
        PatternMatcher::new(
            0.75,
            30,
            Clock::fixed_ny(2024, 3, 12, 11, 30, 0),
            std::env::temp_dir().join("gridpilot-pattern-tests"),
        )
    }

    fn trend_up_update() -> OutcomeUpdate {
        OutcomeUpdate {
            price_change_5min: 0.5,
            price_change_15min: 1.0,
            price_change_30min: 1.2,
            max_up_5min: 0.6,
            max_down_5min: 0.05,
            max_up_15min: 1.1,
            max_down_15min: 0.1,
        }
    }

    #[test]
    fn similarity_identity_and_symmetry() {
        let a = fingerprint("ACME", 0).to_vector();
        let mut b = fingerprint("ACME", 0);
        b.atr_pct = 2.5;
        b.short_term_trend = -1.0;
        let b = b.to_vector();

        assert!((similarity(&a, &a) - 1.0).abs() < 1e-12);
        assert!((similarity(&a, &b) - similarity(&b, &a)).abs() < 1e-12);
        assert!(similarity(&a, &b) < 1.0);
    }

    #[test]
    fn pattern_classification_table() {
        assert_eq!(
            classify_pattern(0.9, 1.1, 1.0, 0.1),
            MovementPattern::BreakoutUp
        );
        assert_eq!(
            classify_pattern(-0.9, -1.1, 0.1, 1.2),
            MovementPattern::BreakoutDown
        );
        assert_eq!(classify_pattern(0.5, 0.7, 0.8, 0.1), MovementPattern::TrendUp);
        assert_eq!(
            classify_pattern(-0.5, -0.7, 0.1, 0.8),
            MovementPattern::TrendDown
        );
        assert_eq!(
            classify_pattern(-0.5, 0.3, 0.4, 0.6),
            MovementPattern::ReversalUp
        );
        assert_eq!(
            classify_pattern(0.5, -0.3, 0.6, 0.4),
            MovementPattern::ReversalDown
        );
        assert_eq!(
            classify_pattern(0.1, 0.1, 0.2, 0.2),
            MovementPattern::Consolidation
        );
        assert_eq!(
            classify_pattern(0.0, 0.0, 2.0, 2.0),
            MovementPattern::HighVolatility
        );
    }

    #[test]
    fn empty_history_gives_empty_result() {
        let m = matcher();
        let result = m.find_similar(&fingerprint("ACME", 0));
        assert_eq!(result.match_count, 0);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn consistent_history_yields_confident_prediction() {
        let mut m = matcher();
        for i in 0..10 {
            m.record(fingerprint("ACME", i), Some(trend_up_update()));
        }

        let result = m.find_similar(&fingerprint("ACME", 30));

        assert_eq!(result.match_count, 10);
        assert!((result.expected_15min_change - 1.0).abs() < 1e-9);
        assert!((result.prob_up_15min - 1.0).abs() < 1e-9);
        assert_eq!(result.dominant_pattern, MovementPattern::TrendUp);
        // Zero variance and a full match count give the maximum confidence.
        assert!(result.confidence >= 0.7);
    }

    #[test]
    fn placeholders_are_excluded_from_matching() {
        let mut m = matcher();
        for i in 0..10 {
            m.record(fingerprint("ACME", i), None);
        }
        let result = m.find_similar(&fingerprint("ACME", 30));
        assert_eq!(result.match_count, 0);
    }

    #[test]
    fn update_outcome_completes_pending_record() {
        let mut m = matcher();
        let fp = fingerprint("ACME", 5);
        m.record(fp.clone(), None);

        // 30 seconds off still matches the +-60 s window.
        let near = fp.timestamp + Duration::seconds(30);
        assert!(m.update_outcome("ACME", near, trend_up_update()));

        let result = m.find_similar(&fingerprint("ACME", 30));
        assert_eq!(result.match_count, 1);
        assert_eq!(result.dominant_pattern, MovementPattern::TrendUp);
    }

    #[test]
    fn update_outcome_outside_window_is_rejected() {
        let mut m = matcher();
        let fp = fingerprint("ACME", 5);
        m.record(fp.clone(), None);

        let far = fp.timestamp + Duration::seconds(120);
        assert!(!m.update_outcome("ACME", far, trend_up_update()));
    }

    #[test]
    fn lookback_filters_stale_records() {
        let mut m = matcher();
        let mut old = fingerprint("ACME", 0);
        old.timestamp = Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 0).unwrap();
        m.record(old, Some(trend_up_update()));

        let result = m.find_similar(&fingerprint("ACME", 30));
        assert_eq!(result.match_count, 0);
    }

    #[test]
    fn dissimilar_situations_do_not_match() {
        let mut m = matcher();
        let mut other = fingerprint("ACME", 0);
        other.price_position_in_range = 2.0;
        other.atr_pct = 3.0;
        other.short_term_trend = -4.0;
        other.medium_term_trend = -4.0;
        m.record(other, Some(trend_up_update()));

        let result = m.find_similar(&fingerprint("ACME", 30));
        assert_eq!(result.match_count, 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut m = matcher();
        for i in 0..1100u32 {
            m.record(fingerprint("ACME", i % 60), Some(trend_up_update()));
        }
        assert_eq!(m.record_count("ACME"), 1000);
    }

    #[test]
    fn outcome_roundtrip_preserves_vector() {
        let outcome = completed(fingerprint("ACME", 7), trend_up_update());
        let json = serde_json::to_string(&outcome).unwrap();
        let back: HistoricalOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(
            outcome.fingerprint.to_vector(),
            back.fingerprint.to_vector()
        );
        assert_eq!(outcome, back);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!(
            "gridpilot-pattern-roundtrip-{}",
            uuid::Uuid::new_v4()
        ));
        let clock = Clock::fixed_ny(2024, 3, 12, 11, 30, 0);
        let mut m = PatternMatcher::new(0.75, 30, clock.clone(), dir.clone());
        for i in 0..4 {
            m.record(fingerprint("ACME", i), Some(trend_up_update()));
        }
        m.save_history("ACME").unwrap();

        let mut fresh = PatternMatcher::new(0.75, 30, clock, dir.clone());
        assert_eq!(fresh.load_history("ACME"), 4);
        assert_eq!(fresh.record_count("ACME"), 4);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_store_loads_as_empty() {
        let dir = std::env::temp_dir().join(format!(
            "gridpilot-pattern-corrupt-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ACME_patterns.json"), "{ not json").unwrap();

        let mut m = PatternMatcher::new(0.75, 30, Clock::fixed_ny(2024, 3, 12, 11, 0, 0), dir.clone());
        assert_eq!(m.load_history("ACME"), 0);
        assert_eq!(m.record_count("ACME"), 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn statistics_cover_valid_records_only() {
        let mut m = matcher();
        m.record(fingerprint("ACME", 0), Some(trend_up_update()));
        m.record(fingerprint("ACME", 1), None);

        let stats = m.statistics("ACME");
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.valid_records, 1);
        assert!((stats.avg_15min_change - 1.0).abs() < 1e-9);
        assert!((stats.up_probability_5min - 1.0).abs() < 1e-9);
    }
}
