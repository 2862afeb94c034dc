// =============================================================================
// Level Scorer - multi-factor scoring of a level against the market context
// =============================================================================
//
// Each level is scored across eight weighted categories; the weighted sum is
// the total. Every category records its raw score, weight, and a reason
// string so decisions stay auditable. A level is "recommended" only when the
// total clears the threshold AND the hard gates hold (distance, profit,
// volume not extreme, caution below maximum).
//
// Scores are cached per level identity for a few seconds because the
// controller may score the same pool several times within one cycle.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::pattern_matcher::MovementPattern;
use crate::analysis::time_profile::TradingPhase;
use crate::analysis::volume_analyzer::VolumeCondition;
use crate::clock::Clock;
use crate::level_pool::{LevelKey, PoolLevel};
use crate::types::{Side, VolatilityRegime};

/// The eight score categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScoreCategory {
    PriceProximity,
    VolatilityFit,
    ProfitPotential,
    RiskReward,
    PatternMatch,
    TimeSuitability,
    VolumeContext,
    TrendAlignment,
}

impl std::fmt::Display for ScoreCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceProximity => write!(f, "PRICE_PROXIMITY"),
            Self::VolatilityFit => write!(f, "VOLATILITY_FIT"),
            Self::ProfitPotential => write!(f, "PROFIT_POTENTIAL"),
            Self::RiskReward => write!(f, "RISK_REWARD"),
            Self::PatternMatch => write!(f, "PATTERN_MATCH"),
            Self::TimeSuitability => write!(f, "TIME_SUITABILITY"),
            Self::VolumeContext => write!(f, "VOLUME_CONTEXT"),
            Self::TrendAlignment => write!(f, "TREND_ALIGNMENT"),
        }
    }
}

/// One category's contribution to a level score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub category: ScoreCategory,
    pub raw_score: f64,
    pub weight: f64,
    pub weighted_score: f64,
    pub reason: String,
}

/// Full scoring result for one level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelScore {
    pub key: LevelKey,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,

    pub total_score: f64,
    pub breakdowns: Vec<ScoreBreakdown>,

    pub timestamp: DateTime<Utc>,
    pub is_recommended: bool,
    pub rejection_reason: String,

    pub profit_pct: f64,
    pub risk_pct: f64,
    pub distance_pct: f64,
}

impl LevelScore {
    fn push(&mut self, category: ScoreCategory, raw_score: f64, weight: f64, reason: String) {
        self.breakdowns.push(ScoreBreakdown {
            category,
            raw_score,
            weight,
            weighted_score: raw_score * weight,
            reason,
        });
        self.total_score = self.breakdowns.iter().map(|b| b.weighted_score).sum();
    }
}

/// Scorer configuration: weights, recommendation gates, proximity and
/// commission parameters.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub weights: HashMap<ScoreCategory, f64>,

    pub min_score_for_recommendation: f64,
    pub max_distance_pct: f64,
    pub min_profit_pct: f64,

    pub optimal_distance_pct: f64,
    pub too_close_pct: f64,

    /// level size / ATR ratio considered ideal in a high-volatility regime.
    pub optimal_level_size_atr_ratio: f64,

    /// Flat commission per trade leg, account currency.
    pub commission_per_trade: f64,

    pub cache_ttl_secs: i64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        use ScoreCategory::*;
        let weights = [
            (PriceProximity, 1.0),
            (VolatilityFit, 0.8),
            (ProfitPotential, 0.9),
            (RiskReward, 0.7),
            (PatternMatch, 0.6),
            (TimeSuitability, 0.5),
            (VolumeContext, 0.4),
            (TrendAlignment, 0.7),
        ]
        .into_iter()
        .collect();

        Self {
            weights,
            min_score_for_recommendation: 30.0,
            max_distance_pct: 3.0,
            min_profit_pct: 0.1,
            optimal_distance_pct: 0.3,
            too_close_pct: 0.05,
            optimal_level_size_atr_ratio: 1.5,
            commission_per_trade: 1.0,
            cache_ttl_secs: 5,
        }
    }
}

/// Market context a level is scored against.
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub current_price: f64,
    pub atr_short: f64,
    pub atr_medium: f64,
    pub atr_long: f64,
    pub volatility_regime: VolatilityRegime,
    pub volume_ratio: f64,
    pub volume_condition: VolumeCondition,
    pub trading_phase: TradingPhase,
    pub caution_level: u8,
    pub short_term_trend: f64,
    pub medium_term_trend: f64,
    pub pattern_prediction: Option<MovementPattern>,
    pub pattern_confidence: f64,
}

impl MarketContext {
    /// Neutral context for tests and cold starts.
    pub fn neutral(current_price: f64) -> Self {
        Self {
            current_price,
            atr_short: 0.0,
            atr_medium: 0.0,
            atr_long: 0.0,
            volatility_regime: VolatilityRegime::Medium,
            volume_ratio: 1.0,
            volume_condition: VolumeCondition::Normal,
            trading_phase: TradingPhase::Midday,
            caution_level: 0,
            short_term_trend: 0.0,
            medium_term_trend: 0.0,
            pattern_prediction: None,
            pattern_confidence: 0.0,
        }
    }
}

/// Multi-factor level scorer with a short-lived per-level cache.
pub struct LevelScorer {
    config: ScorerConfig,
    clock: Clock,
    cache: HashMap<LevelKey, (DateTime<Utc>, LevelScore)>,
}

impl LevelScorer {
    pub fn new(config: ScorerConfig, clock: Clock) -> Self {
        Self {
            config,
            clock,
            cache: HashMap::new(),
        }
    }

    /// Score one level against the context. Cached results younger than the
    /// TTL are returned as-is.
    pub fn score_level(&mut self, level: &PoolLevel, context: &MarketContext) -> LevelScore {
        let now = self.clock.now_utc();

        if let Some((at, cached)) = self.cache.get(&level.key) {
            if (now - *at).num_seconds() < self.config.cache_ttl_secs {
                return cached.clone();
            }
        }

        let score = self.compute(level, context, now);
        self.cache
            .insert(level.key.clone(), (now, score.clone()));
        score
    }

    /// Score many levels, sorted by total score descending.
    pub fn score_levels(
        &mut self,
        levels: &[PoolLevel],
        context: &MarketContext,
    ) -> Vec<LevelScore> {
        let mut scores: Vec<LevelScore> = levels
            .iter()
            .map(|level| self.score_level(level, context))
            .collect();
        scores.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scores
    }

    /// The best recommended levels, at most `max_levels`.
    pub fn recommended_levels(
        &mut self,
        levels: &[PoolLevel],
        context: &MarketContext,
        max_levels: usize,
    ) -> Vec<LevelScore> {
        self.score_levels(levels, context)
            .into_iter()
            .filter(|s| s.is_recommended)
            .take(max_levels)
            .collect()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn update_weights(&mut self, weights: HashMap<ScoreCategory, f64>) {
        self.config.weights.extend(weights);
        self.clear_cache();
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    fn compute(
        &self,
        level: &PoolLevel,
        context: &MarketContext,
        now: DateTime<Utc>,
    ) -> LevelScore {
        // Levels carry percentages; absolute prices are derived against the
        // live price so the grid tracks the market between activations.
        let entry_price = context.current_price * (1.0 + level.entry_pct / 100.0);
        let exit_price = context.current_price * (1.0 + level.exit_pct / 100.0);

        let mut score = LevelScore {
            key: level.key.clone(),
            symbol: level.symbol.clone(),
            side: level.key.side,
            entry_price,
            exit_price,
            total_score: 0.0,
            breakdowns: Vec::with_capacity(8),
            timestamp: now,
            is_recommended: false,
            rejection_reason: String::new(),
            profit_pct: 0.0,
            risk_pct: 0.0,
            distance_pct: 0.0,
        };

        if context.current_price <= 0.0 || entry_price <= 0.0 || exit_price <= 0.0 {
            score.rejection_reason = "invalid price data".into();
            return score;
        }

        score.distance_pct = (entry_price - context.current_price).abs()
            / context.current_price
            * 100.0;
        score.profit_pct = match level.key.side {
            Side::Long => (exit_price - entry_price) / entry_price * 100.0,
            Side::Short => (entry_price - exit_price) / entry_price * 100.0,
        };
        // Risk proxy: the distance the market must travel against us before
        // the entry would have been better skipped.
        score.risk_pct = score.distance_pct;

        let cfg = &self.config;
        let weight = |cat: ScoreCategory| cfg.weights.get(&cat).copied().unwrap_or(0.0);

        let (raw, reason) = score_price_proximity(score.distance_pct, cfg);
        score.push(ScoreCategory::PriceProximity, raw, weight(ScoreCategory::PriceProximity), reason);

        let (raw, reason) = score_volatility_fit(&score, level, context, cfg);
        score.push(ScoreCategory::VolatilityFit, raw, weight(ScoreCategory::VolatilityFit), reason);

        let (raw, reason) = score_profit_potential(&score, level, cfg);
        score.push(ScoreCategory::ProfitPotential, raw, weight(ScoreCategory::ProfitPotential), reason);

        let (raw, reason) = score_risk_reward(score.risk_pct, score.profit_pct);
        score.push(ScoreCategory::RiskReward, raw, weight(ScoreCategory::RiskReward), reason);

        let (raw, reason) = score_pattern_match(level.key.side, context);
        score.push(ScoreCategory::PatternMatch, raw, weight(ScoreCategory::PatternMatch), reason);

        let (raw, reason) = score_time_suitability(context);
        score.push(ScoreCategory::TimeSuitability, raw, weight(ScoreCategory::TimeSuitability), reason);

        let (raw, reason) = score_volume_context(context);
        score.push(ScoreCategory::VolumeContext, raw, weight(ScoreCategory::VolumeContext), reason);

        let (raw, reason) = score_trend_alignment(level.key.side, context);
        score.push(ScoreCategory::TrendAlignment, raw, weight(ScoreCategory::TrendAlignment), reason);

        self.determine_recommendation(&mut score, context);
        score
    }

    fn determine_recommendation(&self, score: &mut LevelScore, context: &MarketContext) {
        let cfg = &self.config;
        let mut reasons = Vec::new();

        if score.total_score < cfg.min_score_for_recommendation {
            reasons.push(format!("score too low ({:.1})", score.total_score));
        }
        if score.distance_pct > cfg.max_distance_pct {
            reasons.push(format!("too far from entry ({:.2}%)", score.distance_pct));
        }
        if score.profit_pct < cfg.min_profit_pct {
            reasons.push(format!("profit too small ({:.2}%)", score.profit_pct));
        }
        if context.volume_condition == VolumeCondition::Extreme {
            reasons.push("extreme volume".into());
        }
        if context.caution_level >= 3 {
            reasons.push(format!("caution level {}", context.caution_level));
        }

        if reasons.is_empty() {
            score.is_recommended = true;
        } else {
            score.is_recommended = false;
            score.rejection_reason = reasons.join("; ");
        }
    }
}

// =============================================================================
// Category scoring
// =============================================================================

fn score_price_proximity(distance: f64, cfg: &ScorerConfig) -> (f64, String) {
    let optimal = cfg.optimal_distance_pct;
    let too_close = cfg.too_close_pct;
    let max_dist = cfg.max_distance_pct;

    if distance < too_close {
        (
            -50.0 + (distance / too_close) * 30.0,
            format!("too close to entry ({distance:.2}%), spread risk"),
        )
    } else if distance <= optimal {
        (
            80.0 + (1.0 - distance / optimal) * 20.0,
            format!("good distance ({distance:.2}%)"),
        )
    } else if distance <= optimal * 2.0 {
        let excess = distance - optimal;
        (
            80.0 - (excess / optimal) * 40.0,
            format!("acceptable distance ({distance:.2}%)"),
        )
    } else if distance <= max_dist {
        let excess = distance - optimal * 2.0;
        let max_excess = max_dist - optimal * 2.0;
        let raw = if max_excess > 0.0 {
            40.0 - (excess / max_excess) * 40.0
        } else {
            20.0
        };
        (raw, format!("wide distance ({distance:.2}%)"))
    } else {
        (-30.0, format!("too far away ({distance:.2}%)"))
    }
}

fn score_volatility_fit(
    score: &LevelScore,
    _level: &PoolLevel,
    context: &MarketContext,
    cfg: &ScorerConfig,
) -> (f64, String) {
    let level_size = (score.exit_price - score.entry_price).abs();
    let level_size_pct = level_size / score.entry_price * 100.0;

    let atr = if context.atr_medium > 0.0 {
        context.atr_medium
    } else {
        context.atr_short
    };

    if atr <= 0.0 {
        return (0.0, "no volatility data available".into());
    }

    let ratio = level_size_pct / atr;
    let optimal = cfg.optimal_level_size_atr_ratio;

    match context.volatility_regime {
        VolatilityRegime::High => {
            if ratio >= optimal {
                (80.0, format!("level size fits high volatility (ratio {ratio:.1})"))
            } else if ratio >= 1.0 {
                (60.0, "level size acceptable in high volatility".into())
            } else {
                (
                    20.0 - (1.0 - ratio) * 40.0,
                    "level too small for high volatility".into(),
                )
            }
        }
        VolatilityRegime::Low => {
            if ratio <= 1.0 {
                (80.0, "level size fits low volatility".into())
            } else if ratio <= optimal {
                (60.0, "level size acceptable in low volatility".into())
            } else {
                (
                    40.0 - (ratio - optimal) * 20.0,
                    "level too large for low volatility".into(),
                )
            }
        }
        VolatilityRegime::Medium | VolatilityRegime::Unknown => {
            let deviation = (ratio - optimal).abs();
            (
                (70.0 - deviation * 20.0).max(0.0),
                format!("medium volatility, ratio {ratio:.1}"),
            )
        }
    }
}

fn score_profit_potential(score: &LevelScore, level: &PoolLevel, cfg: &ScorerConfig) -> (f64, String) {
    let min_profit = cfg.min_profit_pct;

    let trade_value = score.entry_price * level.shares as f64;
    let commission_pct = if trade_value > 0.0 {
        cfg.commission_per_trade * 2.0 / trade_value * 100.0
    } else {
        0.0
    };
    let net = score.profit_pct - commission_pct;

    if net < min_profit {
        (-20.0, format!("profit too small after costs ({net:.2}%)"))
    } else if net < min_profit * 2.0 {
        (30.0, format!("minimal profit ({net:.2}%)"))
    } else if net < min_profit * 5.0 {
        (60.0, format!("good profit ({net:.2}%)"))
    } else {
        ((60.0 + net * 5.0).min(90.0), format!("high profit ({net:.2}%)"))
    }
}

fn score_risk_reward(risk: f64, reward: f64) -> (f64, String) {
    if risk <= 0.0 {
        return (0.0, "no risk defined".into());
    }

    let ratio = reward / risk;
    if ratio >= 2.0 {
        (90.0, format!("excellent r/r ({ratio:.1}:1)"))
    } else if ratio >= 1.5 {
        (70.0, format!("good r/r ({ratio:.1}:1)"))
    } else if ratio >= 1.0 {
        (50.0, format!("balanced r/r ({ratio:.1}:1)"))
    } else if ratio >= 0.5 {
        (20.0, format!("weak r/r ({ratio:.1}:1)"))
    } else {
        (-20.0, format!("poor r/r ({ratio:.1}:1)"))
    }
}

fn score_pattern_match(side: Side, context: &MarketContext) -> (f64, String) {
    let confidence = context.pattern_confidence;
    let Some(pattern) = context.pattern_prediction else {
        return (0.0, "no reliable pattern detected".into());
    };
    if confidence < 0.3 {
        return (0.0, "no reliable pattern detected".into());
    }

    match (side, pattern.is_bullish(), pattern.is_bearish()) {
        (Side::Long, true, _) => (
            confidence * 100.0,
            format!("bullish pattern {pattern} supports long ({:.0}%)", confidence * 100.0),
        ),
        (Side::Short, _, true) => (
            confidence * 100.0,
            format!("bearish pattern {pattern} supports short ({:.0}%)", confidence * 100.0),
        ),
        (Side::Long, _, true) => (
            -confidence * 50.0,
            format!("bearish pattern {pattern} against long ({:.0}%)", confidence * 100.0),
        ),
        (Side::Short, true, _) => (
            -confidence * 50.0,
            format!("bullish pattern {pattern} against short ({:.0}%)", confidence * 100.0),
        ),
        _ => (0.0, format!("pattern {pattern} neutral")),
    }
}

fn score_time_suitability(context: &MarketContext) -> (f64, String) {
    let base: f64 = match context.trading_phase {
        TradingPhase::PreMarket => 20.0,
        TradingPhase::MarketOpen => 40.0,
        TradingPhase::Morning => 80.0,
        TradingPhase::Midday => 60.0,
        TradingPhase::Afternoon => 70.0,
        TradingPhase::MarketClose => 30.0,
        TradingPhase::AfterHours => 10.0,
    };

    let raw = (base - context.caution_level as f64 * 15.0).max(-20.0);
    (
        raw,
        format!(
            "phase {}, caution level {}",
            context.trading_phase, context.caution_level
        ),
    )
}

fn score_volume_context(context: &MarketContext) -> (f64, String) {
    let ratio = context.volume_ratio;
    match context.volume_condition {
        VolumeCondition::Extreme => (-30.0, format!("extreme volume, news risk ({ratio:.1}x)")),
        VolumeCondition::Spike => (-10.0, format!("volume spike ({ratio:.1}x)")),
        VolumeCondition::High => (60.0, format!("good volume ({ratio:.1}x)")),
        VolumeCondition::Normal => (50.0, "normal volume".into()),
        VolumeCondition::Low => (20.0, format!("low volume ({ratio:.1}x)")),
        VolumeCondition::VeryLow => (-10.0, format!("very low volume ({ratio:.1}x)")),
    }
}

fn score_trend_alignment(side: Side, context: &MarketContext) -> (f64, String) {
    let combined = context.short_term_trend * 0.6 + context.medium_term_trend * 0.4;

    match side {
        Side::Long => {
            if combined > 0.3 {
                (
                    (50.0 + combined * 50.0).min(80.0),
                    format!("long with uptrend (+{combined:.1}%)"),
                )
            } else if combined < -0.3 {
                (
                    (-20.0 - combined.abs() * 30.0).max(-40.0),
                    format!("long against downtrend ({combined:.1}%)"),
                )
            } else {
                (30.0, "long in sideways market".into())
            }
        }
        Side::Short => {
            if combined < -0.3 {
                (
                    (50.0 + combined.abs() * 50.0).min(80.0),
                    format!("short with downtrend ({combined:.1}%)"),
                )
            } else if combined > 0.3 {
                (
                    (-20.0 - combined * 30.0).max(-40.0),
                    format!("short against uptrend (+{combined:.1}%)"),
                )
            } else {
                (30.0, "short in sideways market".into())
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::level_pool::PoolLevel;

    fn level(num: u32, side: Side, entry_pct: f64, exit_pct: f64) -> PoolLevel {
        PoolLevel::new(
            LevelKey {
                scenario_id: "scn-1".into(),
                level_num: num,
                side,
            },
            "Base Grid",
            "ACME",
            entry_pct,
            exit_pct,
            100,
        )
    }

    fn scorer() -> LevelScorer {
        LevelScorer::new(ScorerConfig::default(), Clock::fixed_ny(2024, 3, 12, 10, 45, 0))
    }

    fn morning_context() -> MarketContext {
        MarketContext {
            atr_medium: 0.5,
            atr_short: 0.4,
            trading_phase: TradingPhase::Morning,
            ..MarketContext::neutral(100.0)
        }
    }

    fn breakdown(score: &LevelScore, category: ScoreCategory) -> &ScoreBreakdown {
        score
            .breakdowns
            .iter()
            .find(|b| b.category == category)
            .expect("category present")
    }

    #[test]
    fn closer_level_scores_higher_proximity() {
        let mut scorer = scorer();
        let context = morning_context();

        let near = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &context);
        let far = scorer.score_level(&level(2, Side::Long, -0.6, 0.5), &context);

        let near_prox = breakdown(&near, ScoreCategory::PriceProximity).raw_score;
        let far_prox = breakdown(&far, ScoreCategory::PriceProximity).raw_score;
        assert!(near_prox > far_prox, "{near_prox} <= {far_prox}");
        // Exactly at the optimal distance.
        assert!((near_prox - 80.0).abs() < 1e-9);
        assert!((far_prox - 40.0).abs() < 1e-9);
    }

    #[test]
    fn every_category_contributes_a_breakdown() {
        let mut scorer = scorer();
        let score = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &morning_context());
        assert_eq!(score.breakdowns.len(), 8);

        let expected_total: f64 = score.breakdowns.iter().map(|b| b.weighted_score).sum();
        assert!((score.total_score - expected_total).abs() < 1e-9);
    }

    #[test]
    fn weighted_scores_use_configured_weights() {
        let mut scorer = scorer();
        let score = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &morning_context());
        let volume = breakdown(&score, ScoreCategory::VolumeContext);
        assert!((volume.weight - 0.4).abs() < f64::EPSILON);
        assert!((volume.weighted_score - volume.raw_score * 0.4).abs() < 1e-9);
    }

    #[test]
    fn reasonable_level_is_recommended_in_calm_morning() {
        let mut scorer = scorer();
        let score = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &morning_context());
        assert!(score.is_recommended, "rejected: {}", score.rejection_reason);
        assert!(score.rejection_reason.is_empty());
    }

    #[test]
    fn extreme_volume_blocks_recommendation() {
        let mut scorer = scorer();
        let context = MarketContext {
            volume_condition: VolumeCondition::Extreme,
            volume_ratio: 3.4,
            ..morning_context()
        };
        let score = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &context);
        assert!(!score.is_recommended);
        assert!(score.rejection_reason.contains("extreme volume"));
    }

    #[test]
    fn maximum_caution_blocks_recommendation() {
        let mut scorer = scorer();
        let context = MarketContext {
            caution_level: 3,
            trading_phase: TradingPhase::MarketClose,
            ..morning_context()
        };
        let score = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &context);
        assert!(!score.is_recommended);
        assert!(score.rejection_reason.contains("caution level 3"));
    }

    #[test]
    fn distant_level_is_rejected_with_reason() {
        let mut scorer = scorer();
        let score = scorer.score_level(&level(1, Side::Long, -4.0, 0.5), &morning_context());
        assert!(!score.is_recommended);
        assert!(score.rejection_reason.contains("too far from entry"));
    }

    #[test]
    fn pattern_alignment_sign() {
        let bullish = MarketContext {
            pattern_prediction: Some(MovementPattern::TrendUp),
            pattern_confidence: 0.8,
            ..morning_context()
        };

        let (long_raw, _) = score_pattern_match(Side::Long, &bullish);
        assert!((long_raw - 80.0).abs() < 1e-9);

        let (short_raw, _) = score_pattern_match(Side::Short, &bullish);
        assert!((short_raw + 40.0).abs() < 1e-9);

        let weak = MarketContext {
            pattern_confidence: 0.2,
            ..bullish
        };
        let (weak_raw, _) = score_pattern_match(Side::Long, &weak);
        assert_eq!(weak_raw, 0.0);
    }

    #[test]
    fn trend_alignment_symmetry() {
        let rising = MarketContext {
            short_term_trend: 1.0,
            medium_term_trend: 0.5,
            ..morning_context()
        };
        let (long_raw, _) = score_trend_alignment(Side::Long, &rising);
        let (short_raw, _) = score_trend_alignment(Side::Short, &rising);
        assert!(long_raw > 0.0);
        assert!(short_raw < 0.0);

        let falling = MarketContext {
            short_term_trend: -1.0,
            medium_term_trend: -0.5,
            ..morning_context()
        };
        let (long_raw_down, _) = score_trend_alignment(Side::Long, &falling);
        let (short_raw_down, _) = score_trend_alignment(Side::Short, &falling);
        assert!((long_raw_down - short_raw).abs() < 1e-9);
        assert!((short_raw_down - long_raw).abs() < 1e-9);
    }

    #[test]
    fn risk_reward_buckets() {
        assert_eq!(score_risk_reward(0.3, 0.8).0, 90.0);
        assert_eq!(score_risk_reward(0.4, 0.6).0, 70.0);
        assert_eq!(score_risk_reward(0.5, 0.5).0, 50.0);
        assert_eq!(score_risk_reward(1.0, 0.6).0, 20.0);
        assert_eq!(score_risk_reward(1.0, 0.3).0, -20.0);
        assert_eq!(score_risk_reward(0.0, 0.5).0, 0.0);
    }

    #[test]
    fn profit_accounts_for_commission() {
        let mut scorer = scorer();
        // 0.8% gross on a $99.70 x 100 share trade: commission 2/9970 ~ 0.02%.
        let score = scorer.score_level(&level(1, Side::Long, -0.3, 0.5), &morning_context());
        let profit = breakdown(&score, ScoreCategory::ProfitPotential);
        // Net ~0.78% >= 5 * 0.1% minimum.
        assert!((profit.raw_score - 63.9).abs() < 0.2, "raw {}", profit.raw_score);
    }

    #[test]
    fn invalid_prices_reject_without_breakdowns() {
        let mut scorer = scorer();
        let score = scorer.score_level(
            &level(1, Side::Long, -0.3, 0.5),
            &MarketContext::neutral(0.0),
        );
        assert!(!score.is_recommended);
        assert_eq!(score.rejection_reason, "invalid price data");
        assert!(score.breakdowns.is_empty());
    }

    #[test]
    fn cache_serves_within_ttl_and_expires_after() {
        let clock = Clock::fixed_ny(2024, 3, 12, 10, 45, 0);
        let mut scorer = LevelScorer::new(ScorerConfig::default(), clock.clone());
        let lvl = level(1, Side::Long, -0.3, 0.5);

        let first = scorer.score_level(&lvl, &morning_context());

        // Context changed, but the cache still answers inside the TTL.
        let shifted = MarketContext {
            short_term_trend: 2.0,
            ..morning_context()
        };
        let cached = scorer.score_level(&lvl, &shifted);
        assert!((cached.total_score - first.total_score).abs() < 1e-12);

        clock.advance(chrono::Duration::seconds(6));
        let fresh = scorer.score_level(&lvl, &shifted);
        assert!((fresh.total_score - first.total_score).abs() > 1e-6);
    }

    #[test]
    fn score_levels_sorts_descending() {
        let mut scorer = scorer();
        let levels = vec![
            level(2, Side::Long, -0.6, 0.5),
            level(1, Side::Long, -0.3, 0.5),
            level(3, Side::Long, -2.9, 0.5),
        ];
        let scores = scorer.score_levels(&levels, &morning_context());
        assert!(scores[0].total_score >= scores[1].total_score);
        assert!(scores[1].total_score >= scores[2].total_score);
        assert_eq!(scores[0].key.level_num, 1);
    }
}
