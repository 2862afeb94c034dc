// =============================================================================
// Level Optimizer - constrained subset selection over scored candidates
// =============================================================================
//
// Given scored candidates and the currently armed set, selects the best
// combination under the configured constraints: global/per-symbol/per-side
// caps, a long/short ratio band, minimum spacing between entries, a score
// threshold, and a per-price-zone concentration cap.
//
// Constraint checks run in a fixed order and short-circuit on the first
// violation; the reason is recorded with the rejected candidate. Strategy
// variants never mutate the shared constraints: they clone, adjust the
// clone, and run.
// =============================================================================

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::level_pool::LevelKey;
use crate::types::Side;

use super::level_scorer::LevelScore;

/// Selection constraints.
#[derive(Debug, Clone)]
pub struct OptimizationConstraints {
    pub max_levels_total: usize,
    pub max_levels_per_symbol: usize,
    pub max_levels_per_side: usize,

    /// Long share of the selection must stay inside [min, max] once both
    /// sides are represented.
    pub long_short_ratio_min: f64,
    pub long_short_ratio_max: f64,

    pub min_distance_between_levels_pct: f64,
    pub min_score_threshold: f64,

    /// Maximum share of the selection inside one price zone, percent.
    pub max_exposure_per_price_zone_pct: f64,
}

impl Default for OptimizationConstraints {
    fn default() -> Self {
        Self {
            max_levels_total: 20,
            max_levels_per_symbol: 10,
            max_levels_per_side: 15,
            long_short_ratio_min: 0.3,
            long_short_ratio_max: 0.7,
            min_distance_between_levels_pct: 0.1,
            min_score_threshold: 30.0,
            max_exposure_per_price_zone_pct: 30.0,
        }
    }
}

/// Selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationStrategy {
    /// Best scores first.
    Greedy,
    /// Interleave long and short candidates for balance.
    Balanced,
    /// Higher score bar, half the level budget.
    Conservative,
    /// Lower score bar and tighter spacing allowed.
    Aggressive,
}

impl std::fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Greedy => write!(f, "GREEDY"),
            Self::Balanced => write!(f, "BALANCED"),
            Self::Conservative => write!(f, "CONSERVATIVE"),
            Self::Aggressive => write!(f, "AGGRESSIVE"),
        }
    }
}

/// A candidate for selection, distilled from a level score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelCandidate {
    pub key: LevelKey,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub score: f64,
    pub is_recommended: bool,
    pub distance_pct: f64,
    pub profit_pct: f64,
}

impl LevelCandidate {
    pub fn from_score(score: &LevelScore) -> Self {
        Self {
            key: score.key.clone(),
            symbol: score.symbol.clone(),
            side: score.side,
            entry_price: score.entry_price,
            exit_price: score.exit_price,
            score: score.total_score,
            is_recommended: score.is_recommended,
            distance_pct: score.distance_pct,
            profit_pct: score.profit_pct,
        }
    }

    /// Logarithmic bucket whose width is one percent of price at any price
    /// level, so "zone" means the same thing at $5 and at $500.
    pub fn price_zone(&self) -> i64 {
        if self.entry_price <= 0.0 {
            return 0;
        }
        (self.entry_price.ln() * 100.0).floor() as i64
    }
}

/// Result of one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub selected: Vec<LevelCandidate>,
    pub rejected: Vec<(LevelCandidate, String)>,

    pub total_score: f64,
    pub long_count: usize,
    pub short_count: usize,
    pub long_ratio: f64,
    pub symbols: BTreeSet<String>,

    pub strategy: OptimizationStrategy,
    pub iterations: usize,
    pub elapsed_ms: f64,
}

impl OptimizationResult {
    fn new(strategy: OptimizationStrategy) -> Self {
        Self {
            selected: Vec::new(),
            rejected: Vec::new(),
            total_score: 0.0,
            long_count: 0,
            short_count: 0,
            long_ratio: 0.5,
            symbols: BTreeSet::new(),
            strategy,
            iterations: 0,
            elapsed_ms: 0.0,
        }
    }

    pub fn selected_count(&self) -> usize {
        self.selected.len()
    }
}

/// Constrained level selection.
pub struct LevelOptimizer {
    constraints: OptimizationConstraints,
    strategy: OptimizationStrategy,
}

impl LevelOptimizer {
    pub fn new(constraints: OptimizationConstraints, strategy: OptimizationStrategy) -> Self {
        Self {
            constraints,
            strategy,
        }
    }

    pub fn set_strategy(&mut self, strategy: OptimizationStrategy) {
        self.strategy = strategy;
    }

    pub fn constraints(&self) -> &OptimizationConstraints {
        &self.constraints
    }

    pub fn update_constraints(&mut self, constraints: OptimizationConstraints) {
        self.constraints = constraints;
    }

    /// Select the optimal subset of `candidates`, given the already-armed
    /// set (`current_active` is excluded from re-selection).
    pub fn optimize(
        &self,
        candidates: &[LevelCandidate],
        current_active: &[LevelCandidate],
    ) -> OptimizationResult {
        let started = Instant::now();
        let mut result = OptimizationResult::new(self.strategy);

        // Strategy variants work on a private copy of the constraints.
        let constraints = match self.strategy {
            OptimizationStrategy::Conservative => {
                let mut c = self.constraints.clone();
                c.min_score_threshold *= 1.5;
                c.max_levels_total = (self.constraints.max_levels_total / 2).min(10);
                c
            }
            OptimizationStrategy::Aggressive => {
                let mut c = self.constraints.clone();
                c.min_score_threshold = (c.min_score_threshold * 0.5).max(10.0);
                c.min_distance_between_levels_pct *= 0.5;
                c
            }
            _ => self.constraints.clone(),
        };

        let active_keys: HashSet<&LevelKey> = current_active.iter().map(|c| &c.key).collect();

        let mut filtered: Vec<&LevelCandidate> = candidates
            .iter()
            .filter(|c| c.is_recommended || c.score >= constraints.min_score_threshold * 1.2)
            .filter(|c| !active_keys.contains(&c.key))
            .collect();
        filtered.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        match self.strategy {
            OptimizationStrategy::Greedy | OptimizationStrategy::Aggressive => {
                select_greedy(&filtered, &constraints, &mut result);
            }
            OptimizationStrategy::Balanced | OptimizationStrategy::Conservative => {
                select_balanced(&filtered, &constraints, &mut result);
            }
        }

        finalize_statistics(&mut result);
        result.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        result
    }

    /// Diff the optimal selection against the currently armed set.
    /// Returns (to_add, to_remove), both by identity.
    pub fn suggest_changes(
        &self,
        candidates: &[LevelCandidate],
        current_active: &[LevelCandidate],
    ) -> (Vec<LevelCandidate>, Vec<LevelCandidate>) {
        let optimal = self.optimize(candidates, current_active);

        let optimal_keys: HashSet<&LevelKey> = optimal.selected.iter().map(|c| &c.key).collect();
        let current_keys: HashSet<&LevelKey> = current_active.iter().map(|c| &c.key).collect();

        let to_add = optimal
            .selected
            .iter()
            .filter(|c| !current_keys.contains(&c.key))
            .cloned()
            .collect();
        let to_remove = current_active
            .iter()
            .filter(|c| !optimal_keys.contains(&c.key))
            .cloned()
            .collect();

        (to_add, to_remove)
    }
}

// =============================================================================
// Selection strategies
// =============================================================================

fn select_greedy(
    candidates: &[&LevelCandidate],
    constraints: &OptimizationConstraints,
    result: &mut OptimizationResult,
) {
    for candidate in candidates {
        result.iterations += 1;

        match check_constraints(candidate, &result.selected, constraints) {
            Some(violation) => result.rejected.push(((*candidate).clone(), violation)),
            None => {
                result.selected.push((*candidate).clone());
                if result.selected.len() >= constraints.max_levels_total {
                    break;
                }
            }
        }
    }
}

fn select_balanced(
    candidates: &[&LevelCandidate],
    constraints: &OptimizationConstraints,
    result: &mut OptimizationResult,
) {
    let longs: Vec<&&LevelCandidate> =
        candidates.iter().filter(|c| c.side == Side::Long).collect();
    let shorts: Vec<&&LevelCandidate> =
        candidates.iter().filter(|c| c.side == Side::Short).collect();

    let mut long_idx = 0;
    let mut short_idx = 0;
    let mut prefer_long = true;

    while result.selected.len() < constraints.max_levels_total {
        result.iterations += 1;

        let candidate = if prefer_long && long_idx < longs.len() {
            long_idx += 1;
            *longs[long_idx - 1]
        } else if !prefer_long && short_idx < shorts.len() {
            short_idx += 1;
            *shorts[short_idx - 1]
        } else if long_idx < longs.len() {
            long_idx += 1;
            *longs[long_idx - 1]
        } else if short_idx < shorts.len() {
            short_idx += 1;
            *shorts[short_idx - 1]
        } else {
            break;
        };

        match check_constraints(candidate, &result.selected, constraints) {
            Some(violation) => result.rejected.push((candidate.clone(), violation)),
            None => {
                result.selected.push(candidate.clone());
                prefer_long = !prefer_long;
            }
        }
    }
}

// =============================================================================
// Constraint checking
// =============================================================================

/// Check all constraints for one candidate against the selection so far.
/// Returns the first violated constraint as a human-readable reason.
fn check_constraints(
    candidate: &LevelCandidate,
    selected: &[LevelCandidate],
    constraints: &OptimizationConstraints,
) -> Option<String> {
    // 1. Score threshold.
    if candidate.score < constraints.min_score_threshold {
        return Some(format!("score too low ({:.1})", candidate.score));
    }

    // 2. Global cap.
    if selected.len() >= constraints.max_levels_total {
        return Some("max levels reached".into());
    }

    // 3. Per-side cap.
    let side_count = selected.iter().filter(|l| l.side == candidate.side).count();
    if side_count >= constraints.max_levels_per_side {
        return Some(format!("max {} levels reached", candidate.side));
    }

    // 4. Long/short ratio band (with the candidate included).
    if !selected.is_empty() {
        let mut longs = selected.iter().filter(|l| l.side == Side::Long).count();
        let mut shorts = selected.len() - longs;
        match candidate.side {
            Side::Long => longs += 1,
            Side::Short => shorts += 1,
        }
        let long_ratio = longs as f64 / (longs + shorts) as f64;

        if long_ratio > constraints.long_short_ratio_max {
            return Some(format!("long ratio too high ({:.0}%)", long_ratio * 100.0));
        }
        // Below the minimum only counts once shorts actually exist, so a
        // single-sided pool can still bootstrap.
        if long_ratio < constraints.long_short_ratio_min && shorts > 0 {
            return Some(format!("long ratio too low ({:.0}%)", long_ratio * 100.0));
        }
    }

    // 5. Per-symbol cap.
    let symbol_count = selected
        .iter()
        .filter(|l| l.symbol == candidate.symbol)
        .count();
    if symbol_count >= constraints.max_levels_per_symbol {
        return Some(format!("max levels for {} reached", candidate.symbol));
    }

    // 6. Spacing against already selected entries.
    for existing in selected {
        let distance =
            (candidate.entry_price - existing.entry_price).abs() / candidate.entry_price * 100.0;
        if distance < constraints.min_distance_between_levels_pct {
            return Some(format!("too close to selected level ({distance:.2}%)"));
        }
    }

    // 7. Price-zone concentration. Each zone may hold at most the capped
    // share of the selection, with a floor of one level so small selections
    // remain possible. The allowance only grows as the selection grows, so
    // a level admitted early can never break the cap later.
    let total_after = selected.len() + 1;
    let allowed = ((total_after as f64 * constraints.max_exposure_per_price_zone_pct / 100.0)
        .floor() as usize)
        .max(1);
    let zone = candidate.price_zone();
    let zone_count = selected.iter().filter(|l| l.price_zone() == zone).count();
    if zone_count + 1 > allowed {
        return Some(format!(
            "price zone {zone} overloaded ({} of {total_after})",
            zone_count + 1
        ));
    }

    None
}

fn finalize_statistics(result: &mut OptimizationResult) {
    if result.selected.is_empty() {
        return;
    }

    result.total_score = result.selected.iter().map(|l| l.score).sum();
    result.long_count = result
        .selected
        .iter()
        .filter(|l| l.side == Side::Long)
        .count();
    result.short_count = result.selected.len() - result.long_count;
    result.long_ratio = result.long_count as f64 / result.selected.len() as f64;
    result.symbols = result
        .selected
        .iter()
        .map(|l| l.symbol.clone())
        .collect();
}
