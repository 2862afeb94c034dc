// =============================================================================
// Price Predictor - four-horizon fusion of pattern/momentum/volume/time
// =============================================================================
//
// For each horizon (5/15/30/60 minutes) four signals in [-1, 1] are computed
// and fused with fixed weights (pattern 0.35, momentum 0.30, volume 0.20,
// time 0.15). The fused signal is scaled by a volatility multiplier into an
// expected percent change with a confidence-derived range. Shorter horizons
// lean on trend continuation, longer ones on mean reversion.
//
// The summary weighs the horizons 0.4/0.3/0.2/0.1 into a dominant direction
// and only suggests BUY/SELL when the average confidence clears 0.6.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::pattern_matcher::MovementPattern;
use crate::analysis::time_profile::TradingPhase;
use crate::analysis::volume_analyzer::{VolumeCondition, VolumeTrend};
use crate::types::VolatilityRegime;

/// Prediction horizons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredictionHorizon {
    Min5,
    Min15,
    Min30,
    Hour1,
}

impl PredictionHorizon {
    pub const ALL: [PredictionHorizon; 4] = [Self::Min5, Self::Min15, Self::Min30, Self::Hour1];

    fn timeframe_factor(self) -> f64 {
        match self {
            Self::Min5 => 0.3,
            Self::Min15 => 0.5,
            Self::Min30 => 0.7,
            Self::Hour1 => 1.0,
        }
    }

    fn summary_weight(self) -> f64 {
        match self {
            Self::Min5 => 0.4,
            Self::Min15 => 0.3,
            Self::Min30 => 0.2,
            Self::Hour1 => 0.1,
        }
    }
}

impl std::fmt::Display for PredictionHorizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min5 => write!(f, "5min"),
            Self::Min15 => write!(f, "15min"),
            Self::Min30 => write!(f, "30min"),
            Self::Hour1 => write!(f, "1h"),
        }
    }
}

/// Directional bias bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectionBias {
    StrongUp,
    Up,
    Neutral,
    Down,
    StrongDown,
}

impl DirectionBias {
    pub fn is_bullish(self) -> bool {
        matches!(self, Self::StrongUp | Self::Up)
    }

    pub fn is_bearish(self) -> bool {
        matches!(self, Self::StrongDown | Self::Down)
    }
}

impl std::fmt::Display for DirectionBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrongUp => write!(f, "STRONG_UP"),
            Self::Up => write!(f, "UP"),
            Self::Neutral => write!(f, "NEUTRAL"),
            Self::Down => write!(f, "DOWN"),
            Self::StrongDown => write!(f, "STRONG_DOWN"),
        }
    }
}

/// Trade suggestion derived from the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestedAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Prediction for a single horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementPrediction {
    pub horizon: PredictionHorizon,
    pub direction: DirectionBias,
    pub expected_change_pct: f64,
    pub confidence: f64,
    pub range_low_pct: f64,
    pub range_high_pct: f64,

    pub pattern_signal: f64,
    pub momentum_signal: f64,
    pub volume_signal: f64,
    pub time_signal: f64,
}

/// Inputs for one prediction round.
#[derive(Debug, Clone)]
pub struct PredictionContext {
    pub symbol: String,
    pub current_price: f64,
    pub timestamp: DateTime<Utc>,

    pub atr_short: f64,
    pub atr_medium: f64,
    pub volatility_regime: VolatilityRegime,

    pub volume_ratio: f64,
    pub volume_condition: VolumeCondition,
    pub volume_trend: VolumeTrend,

    pub price_change_1min: f64,
    pub price_change_5min: f64,
    pub price_change_15min: f64,

    pub trading_phase: TradingPhase,
    pub minutes_since_open: i64,

    pub pattern_prediction: Option<MovementPattern>,
    pub pattern_confidence: f64,
    pub expected_5min_change: f64,
    pub expected_15min_change: f64,
}

/// Full prediction result with summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub predictions: Vec<MovementPrediction>,

    pub dominant_direction: DirectionBias,
    pub average_confidence: f64,

    pub suggested_action: SuggestedAction,
    pub action_confidence: f64,
    pub action_reason: String,
}

impl PredictionResult {
    pub fn prediction(&self, horizon: PredictionHorizon) -> Option<&MovementPrediction> {
        self.predictions.iter().find(|p| p.horizon == horizon)
    }
}

/// Signal fusion weights.
#[derive(Debug, Clone, Copy)]
struct SignalWeights {
    pattern: f64,
    momentum: f64,
    volume: f64,
    time: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            pattern: 0.35,
            momentum: 0.30,
            volume: 0.20,
            time: 0.15,
        }
    }
}

const PREDICTION_HISTORY_SIZE: usize = 100;

/// Multi-horizon price movement predictor.
pub struct PricePredictor {
    weights: SignalWeights,
    history: HashMap<String, VecDeque<PredictionResult>>,
}

impl PricePredictor {
    pub fn new() -> Self {
        Self {
            weights: SignalWeights::default(),
            history: HashMap::new(),
        }
    }

    /// Predict all horizons and summarise.
    pub fn predict(&mut self, context: &PredictionContext) -> PredictionResult {
        let predictions: Vec<MovementPrediction> = PredictionHorizon::ALL
            .iter()
            .map(|horizon| self.predict_horizon(context, *horizon))
            .collect();

        let result = summarize(context, predictions);

        let entry = self.history.entry(context.symbol.clone()).or_default();
        entry.push_back(result.clone());
        while entry.len() > PREDICTION_HISTORY_SIZE {
            entry.pop_front();
        }

        result
    }

    /// Single-horizon prediction without summary or history tracking.
    pub fn predict_single(
        &self,
        context: &PredictionContext,
        horizon: PredictionHorizon,
    ) -> MovementPrediction {
        self.predict_horizon(context, horizon)
    }

    /// Blend of the 5- and 15-minute horizons for trade gating.
    /// Returns NEUTRAL when the blended confidence is below `min_confidence`.
    pub fn direction_for_trade(
        &mut self,
        context: &PredictionContext,
        min_confidence: f64,
    ) -> (DirectionBias, f64) {
        let result = self.predict(context);

        let (Some(p5), Some(p15)) = (
            result.prediction(PredictionHorizon::Min5),
            result.prediction(PredictionHorizon::Min15),
        ) else {
            return (DirectionBias::Neutral, 0.0);
        };

        let combined_signal = p5.expected_change_pct * 0.6 + p15.expected_change_pct * 0.4;
        let combined_confidence = p5.confidence * 0.6 + p15.confidence * 0.4;

        if combined_confidence < min_confidence {
            return (DirectionBias::Neutral, combined_confidence);
        }

        (signal_to_direction(combined_signal), combined_confidence)
    }

    pub fn recent_predictions(&self, symbol: &str, count: usize) -> Vec<PredictionResult> {
        match self.history.get(symbol) {
            Some(entries) => {
                let start = entries.len().saturating_sub(count);
                entries.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn clear_history(&mut self, symbol: Option<&str>) {
        match symbol {
            Some(sym) => {
                self.history.remove(sym);
            }
            None => self.history.clear(),
        }
    }

    // -------------------------------------------------------------------------
    // Horizon prediction
    // -------------------------------------------------------------------------

    fn predict_horizon(
        &self,
        context: &PredictionContext,
        horizon: PredictionHorizon,
    ) -> MovementPrediction {
        let pattern_signal = pattern_signal(context, horizon);
        let momentum_signal = momentum_signal(context, horizon);
        let volume_signal = volume_signal(context);
        let time_signal = time_signal(context);

        let w = &self.weights;
        let fused = pattern_signal * w.pattern
            + momentum_signal * w.momentum
            + volume_signal * w.volume
            + time_signal * w.time;

        let multiplier = volatility_multiplier(context, horizon);
        let expected_change = fused * multiplier;

        let confidence = confidence(
            pattern_signal,
            momentum_signal,
            volume_signal,
            time_signal,
            context,
        );

        let range_width = multiplier * (1.0 - confidence) * 2.0;

        MovementPrediction {
            horizon,
            direction: signal_to_direction(fused),
            expected_change_pct: expected_change,
            confidence,
            range_low_pct: expected_change - range_width / 2.0,
            range_high_pct: expected_change + range_width / 2.0,
            pattern_signal,
            momentum_signal,
            volume_signal,
            time_signal,
        }
    }
}

impl Default for PricePredictor {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Signals
// =============================================================================

fn pattern_signal(context: &PredictionContext, horizon: PredictionHorizon) -> f64 {
    if context.pattern_prediction.is_none() || context.pattern_confidence < 0.3 {
        return 0.0;
    }

    let expected = match horizon {
        PredictionHorizon::Min5 => context.expected_5min_change,
        PredictionHorizon::Min15 | PredictionHorizon::Min30 => context.expected_15min_change,
        PredictionHorizon::Hour1 => context.expected_15min_change * 1.5,
    };

    // Normalise assuming a 2% move is a full-strength signal.
    let signal = (expected / 2.0).clamp(-1.0, 1.0);
    signal * context.pattern_confidence
}

fn momentum_signal(context: &PredictionContext, horizon: PredictionHorizon) -> f64 {
    let short = context.price_change_5min;
    let medium = context.price_change_15min;

    let signal = match horizon {
        // Short horizons continue the move; long horizons lean mean-reversion.
        PredictionHorizon::Min5 => short * 0.5,
        PredictionHorizon::Min15 => short * 0.3 + medium * 0.2,
        PredictionHorizon::Min30 => medium * 0.2 - short * 0.1,
        PredictionHorizon::Hour1 => medium * 0.1 - short * 0.2,
    };

    signal.clamp(-1.0, 1.0)
}

fn volume_signal(context: &PredictionContext) -> f64 {
    let mut signal: f64 = match context.volume_condition {
        VolumeCondition::High => 0.1,
        VolumeCondition::Spike => 0.15,
        _ => 0.0,
    };

    match context.volume_trend {
        VolumeTrend::Increasing => signal += 0.1,
        VolumeTrend::Decreasing => signal -= 0.05,
        VolumeTrend::Stable => {}
    }

    // Elevated volume confirming the short-term move is directional.
    if context.volume_ratio > 1.2 {
        if context.price_change_5min > 0.0 {
            signal += 0.15;
        } else if context.price_change_5min < 0.0 {
            signal -= 0.15;
        }
    }

    signal.clamp(-1.0, 1.0)
}

fn time_signal(context: &PredictionContext) -> f64 {
    let mut tendency: f64 = match context.trading_phase {
        TradingPhase::MarketOpen => 0.1,
        TradingPhase::Morning => 0.05,
        TradingPhase::MarketClose => -0.1,
        _ => 0.0,
    };

    if context.minutes_since_open < 30 {
        tendency *= 1.5;
    }
    if context.trading_phase == TradingPhase::MarketClose && context.minutes_since_open > 360 {
        tendency *= 1.3;
    }

    tendency
}

fn volatility_multiplier(context: &PredictionContext, horizon: PredictionHorizon) -> f64 {
    let atr = if context.atr_medium > 0.0 {
        context.atr_medium
    } else {
        0.5
    };

    let regime_factor = match context.volatility_regime {
        VolatilityRegime::High => 1.5,
        VolatilityRegime::Medium => 1.0,
        VolatilityRegime::Low => 0.6,
        VolatilityRegime::Unknown => 1.0,
    };

    atr * horizon.timeframe_factor() * regime_factor
}

fn confidence(
    pattern: f64,
    momentum: f64,
    volume: f64,
    time: f64,
    context: &PredictionContext,
) -> f64 {
    let mut confidence: f64 = 0.4;

    let signals = [pattern, momentum, volume, time];
    let non_zero: Vec<f64> = signals.iter().copied().filter(|s| s.abs() > 0.1).collect();

    if non_zero.len() >= 2 {
        let positive = non_zero.iter().filter(|s| **s > 0.0).count();
        let negative = non_zero.len() - positive;

        if positive == non_zero.len() || negative == non_zero.len() {
            confidence += 0.2;
        } else if positive.abs_diff(negative) >= 2 {
            confidence += 0.1;
        }
    }

    if context.pattern_confidence > 0.0 {
        confidence += context.pattern_confidence * 0.2;
    }

    match context.volatility_regime {
        VolatilityRegime::High => confidence -= 0.1,
        VolatilityRegime::Low => confidence += 0.05,
        _ => {}
    }

    if context.volume_condition == VolumeCondition::Extreme {
        confidence -= 0.2;
    }

    if matches!(
        context.trading_phase,
        TradingPhase::MarketOpen | TradingPhase::MarketClose
    ) {
        confidence -= 0.1;
    }

    confidence.clamp(0.1, 0.95)
}

fn signal_to_direction(signal: f64) -> DirectionBias {
    if signal > 0.5 {
        DirectionBias::StrongUp
    } else if signal > 0.15 {
        DirectionBias::Up
    } else if signal < -0.5 {
        DirectionBias::StrongDown
    } else if signal < -0.15 {
        DirectionBias::Down
    } else {
        DirectionBias::Neutral
    }
}

fn summarize(context: &PredictionContext, predictions: Vec<MovementPrediction>) -> PredictionResult {
    let average_confidence =
        predictions.iter().map(|p| p.confidence).sum::<f64>() / predictions.len() as f64;

    let weighted_signal: f64 = predictions
        .iter()
        .map(|p| p.expected_change_pct * p.horizon.summary_weight())
        .sum();
    let dominant_direction = signal_to_direction(weighted_signal);

    let (suggested_action, action_confidence, action_reason) = if average_confidence >= 0.6 {
        if dominant_direction.is_bullish() {
            (
                SuggestedAction::Buy,
                average_confidence,
                format!(
                    "bullish signals at {:.0}% confidence",
                    average_confidence * 100.0
                ),
            )
        } else if dominant_direction.is_bearish() {
            (
                SuggestedAction::Sell,
                average_confidence,
                format!(
                    "bearish signals at {:.0}% confidence",
                    average_confidence * 100.0
                ),
            )
        } else {
            (SuggestedAction::Hold, 0.0, "no clear direction".into())
        }
    } else {
        (
            SuggestedAction::Hold,
            average_confidence,
            format!("low confidence ({:.0}%)", average_confidence * 100.0),
        )
    };

    PredictionResult {
        symbol: context.symbol.clone(),
        timestamp: context.timestamp,
        predictions,
        dominant_direction,
        average_confidence,
        suggested_action,
        action_confidence,
        action_reason,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_context() -> PredictionContext {
        PredictionContext {
            symbol: "ACME".into(),
            current_price: 100.0,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 12, 15, 0, 0).unwrap(),
            atr_short: 0.4,
            atr_medium: 0.5,
            volatility_regime: VolatilityRegime::Medium,
            volume_ratio: 1.0,
            volume_condition: VolumeCondition::Normal,
            volume_trend: VolumeTrend::Stable,
            price_change_1min: 0.0,
            price_change_5min: 0.0,
            price_change_15min: 0.0,
            trading_phase: TradingPhase::Morning,
            minutes_since_open: 75,
            pattern_prediction: None,
            pattern_confidence: 0.0,
            expected_5min_change: 0.0,
            expected_15min_change: 0.0,
        }
    }

    fn bullish_context() -> PredictionContext {
        PredictionContext {
            atr_medium: 2.0,
            volatility_regime: VolatilityRegime::High,
            volume_ratio: 1.5,
            volume_condition: VolumeCondition::High,
            volume_trend: VolumeTrend::Increasing,
            price_change_5min: 0.8,
            price_change_15min: 1.2,
            pattern_prediction: Some(MovementPattern::TrendUp),
            pattern_confidence: 0.8,
            expected_5min_change: 1.0,
            expected_15min_change: 1.5,
            ..base_context()
        }
    }

    #[test]
    fn direction_buckets() {
        assert_eq!(signal_to_direction(0.6), DirectionBias::StrongUp);
        assert_eq!(signal_to_direction(0.3), DirectionBias::Up);
        assert_eq!(signal_to_direction(0.0), DirectionBias::Neutral);
        assert_eq!(signal_to_direction(-0.3), DirectionBias::Down);
        assert_eq!(signal_to_direction(-0.6), DirectionBias::StrongDown);
    }

    #[test]
    fn neutral_context_holds() {
        let mut predictor = PricePredictor::new();
        let result = predictor.predict(&base_context());

        assert_eq!(result.dominant_direction, DirectionBias::Neutral);
        assert_eq!(result.suggested_action, SuggestedAction::Hold);
        assert_eq!(result.predictions.len(), 4);
    }

    #[test]
    fn aligned_bullish_signals_suggest_buy() {
        let mut predictor = PricePredictor::new();
        let result = predictor.predict(&bullish_context());

        assert!(result.dominant_direction.is_bullish());
        assert!(result.average_confidence >= 0.6, "{}", result.average_confidence);
        assert_eq!(result.suggested_action, SuggestedAction::Buy);
        assert!(result.action_reason.contains("bullish"));
    }

    #[test]
    fn signals_are_bounded() {
        let mut wild = bullish_context();
        wild.price_change_5min = 50.0;
        wild.price_change_15min = -80.0;
        wild.expected_15min_change = 40.0;

        let predictor = PricePredictor::new();
        for horizon in PredictionHorizon::ALL {
            let p = predictor.predict_single(&wild, horizon);
            assert!(p.pattern_signal.abs() <= 1.0);
            assert!(p.momentum_signal.abs() <= 1.0);
            assert!(p.volume_signal.abs() <= 1.0);
            assert!(p.time_signal.abs() <= 1.0);
            assert!(p.confidence >= 0.1 && p.confidence <= 0.95);
        }
    }

    #[test]
    fn long_horizons_lean_mean_reversion() {
        let mut context = base_context();
        context.price_change_5min = 1.0;
        context.price_change_15min = 0.2;

        let predictor = PricePredictor::new();
        let p5 = predictor.predict_single(&context, PredictionHorizon::Min5);
        let p60 = predictor.predict_single(&context, PredictionHorizon::Hour1);

        assert!(p5.momentum_signal > 0.0);
        assert!(p60.momentum_signal < 0.0);
    }

    #[test]
    fn weak_pattern_contributes_nothing() {
        let mut context = bullish_context();
        context.pattern_confidence = 0.2;

        let predictor = PricePredictor::new();
        let p = predictor.predict_single(&context, PredictionHorizon::Min5);
        assert_eq!(p.pattern_signal, 0.0);
    }

    #[test]
    fn extreme_volume_cuts_confidence() {
        let calm = PricePredictor::new().predict_single(&base_context(), PredictionHorizon::Min5);

        let mut context = base_context();
        context.volume_condition = VolumeCondition::Extreme;
        let nervous = PricePredictor::new().predict_single(&context, PredictionHorizon::Min5);

        assert!((calm.confidence - nervous.confidence - 0.2).abs() < 1e-9);
    }

    #[test]
    fn range_straddles_expected_change() {
        let predictor = PricePredictor::new();
        let p = predictor.predict_single(&bullish_context(), PredictionHorizon::Min15);
        assert!(p.range_low_pct <= p.expected_change_pct);
        assert!(p.expected_change_pct <= p.range_high_pct);
    }

    #[test]
    fn expected_change_scales_with_horizon() {
        // Identical fused signal, longer horizon, bigger expected move.
        let context = bullish_context();
        let predictor = PricePredictor::new();
        let p5 = predictor.predict_single(&context, PredictionHorizon::Min5);
        let p30 = predictor.predict_single(&context, PredictionHorizon::Min30);
        assert!(p30.expected_change_pct.abs() > p5.expected_change_pct.abs());
    }

    #[test]
    fn direction_for_trade_gates_on_confidence() {
        let mut predictor = PricePredictor::new();
        let (direction, _) = predictor.direction_for_trade(&base_context(), 0.9);
        assert_eq!(direction, DirectionBias::Neutral);
    }

    #[test]
    fn history_is_bounded() {
        let mut predictor = PricePredictor::new();
        for _ in 0..120 {
            predictor.predict(&base_context());
        }
        assert_eq!(predictor.recent_predictions("ACME", 500).len(), 100);

        predictor.clear_history(Some("ACME"));
        assert!(predictor.recent_predictions("ACME", 10).is_empty());
    }
}
