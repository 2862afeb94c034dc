// =============================================================================
// Risk Manager - limits, exposure, drawdown, black-swan detection
// =============================================================================
//
// Owns the running risk counters and the recent event/snapshot history.
// Every limit carries a soft and a hard threshold with an advisory action;
// the controller decides how to apply it (typically by refusing new trades
// or enqueuing deactivations).
//
// The emergency flag is one-shot: once tripped (hard breach, emergency loss
// threshold, or the black-swan detector) only a deliberate manual
// `reset_emergency` clears it.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::runtime_config::RiskLimitsConfig;
use crate::types::Side;

/// Overall risk level, derived from the active warnings and breaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Normal,
    Elevated,
    Warning,
    Critical,
    Emergency,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "NORMAL"),
            Self::Elevated => write!(f, "ELEVATED"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
            Self::Emergency => write!(f, "EMERGENCY"),
        }
    }
}

/// The tracked limit kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    DailyLoss,
    TotalExposure,
    SymbolExposure,
    PositionCount,
    LevelCount,
    Drawdown,
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLoss => write!(f, "DAILY_LOSS"),
            Self::TotalExposure => write!(f, "TOTAL_EXPOSURE"),
            Self::SymbolExposure => write!(f, "SYMBOL_EXPOSURE"),
            Self::PositionCount => write!(f, "POSITION_COUNT"),
            Self::LevelCount => write!(f, "LEVEL_COUNT"),
            Self::Drawdown => write!(f, "DRAWDOWN"),
        }
    }
}

/// Advisory action attached to a limit threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskAction {
    LogOnly,
    ReduceActivity,
    StopNewTrades,
    CloseLosers,
    CloseAll,
    EmergencyStop,
}

impl std::fmt::Display for RiskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LogOnly => write!(f, "LOG_ONLY"),
            Self::ReduceActivity => write!(f, "REDUCE_ACTIVITY"),
            Self::StopNewTrades => write!(f, "STOP_NEW_TRADES"),
            Self::CloseLosers => write!(f, "CLOSE_LOSERS"),
            Self::CloseAll => write!(f, "CLOSE_ALL"),
            Self::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

/// Soft/hard thresholds and actions for one limit.
#[derive(Debug, Clone, Serialize)]
pub struct LimitConfig {
    pub limit_type: LimitType,
    pub soft_value: f64,
    pub hard_value: f64,
    pub soft_action: RiskAction,
    pub hard_action: RiskAction,
    pub enabled: bool,
    pub description: &'static str,
}

/// What kind of risk event occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskEventKind {
    SoftLimitWarning,
    HardLimitBreach,
    EmergencyStop,
}

impl std::fmt::Display for RiskEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SoftLimitWarning => write!(f, "SOFT_LIMIT_WARNING"),
            Self::HardLimitBreach => write!(f, "HARD_LIMIT_BREACH"),
            Self::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

/// One recorded risk event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: RiskEventKind,
    pub limit_type: Option<LimitType>,
    pub current_value: f64,
    pub threshold_value: f64,
    pub action: RiskAction,
    pub message: String,
}

/// Snapshot of the risk situation after one check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub timestamp: DateTime<Utc>,
    pub risk_level: RiskLevel,

    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_pnl: f64,
    pub daily_loss: f64,

    pub total_exposure: f64,
    pub long_exposure: f64,
    pub short_exposure: f64,
    pub net_exposure: f64,

    pub position_count: usize,
    pub active_level_count: usize,

    pub limits_breached: Vec<String>,
    pub warnings_active: Vec<String>,

    pub peak_pnl: f64,
    pub current_drawdown: f64,
    pub max_drawdown_today: f64,
}

/// Open position as seen by the risk manager: signed share count and the
/// latest price.
#[derive(Debug, Clone, Copy)]
pub struct PositionInfo {
    pub size: i64,
    pub price: f64,
}

/// Samples kept for the black-swan window (one minute at 1 Hz updates).
const PRICE_WINDOW: usize = 60;
const EVENT_HISTORY: usize = 1000;
const SNAPSHOT_HISTORY: usize = 100;

struct Inner {
    current_level: RiskLevel,
    emergency_triggered: bool,
    emergency_reason: Option<String>,

    peak_pnl: f64,
    max_drawdown: f64,

    events: VecDeque<RiskEvent>,
    snapshots: VecDeque<RiskSnapshot>,

    price_history: HashMap<String, VecDeque<(DateTime<Utc>, f64)>>,
    symbol_exposure: HashMap<String, f64>,
}

/// Central risk supervision. All calls serialise on the internal lock.
pub struct RiskManager {
    limits: Mutex<HashMap<LimitType, LimitConfig>>,
    inner: Mutex<Inner>,

    emergency_loss_threshold: f64,
    black_swan_threshold: f64,
}

impl RiskManager {
    /// Build from the configured risk limits. Soft thresholds sit at
    /// `soft_limit_threshold` of the hard value; total exposure allows five
    /// symbols at full size.
    pub fn new(config: &RiskLimitsConfig) -> Self {
        let soft = config.soft_limit_threshold;
        let max_total_exposure = config.max_exposure_per_symbol * 5.0;

        let limit = |limit_type, hard: f64, soft_value: f64, soft_action, hard_action, description| {
            (
                limit_type,
                LimitConfig {
                    limit_type,
                    soft_value,
                    hard_value: hard,
                    soft_action,
                    hard_action,
                    enabled: true,
                    description,
                },
            )
        };

        let limits = HashMap::from([
            limit(
                LimitType::DailyLoss,
                config.max_daily_loss,
                config.max_daily_loss * soft,
                RiskAction::ReduceActivity,
                RiskAction::StopNewTrades,
                "maximum daily loss",
            ),
            limit(
                LimitType::TotalExposure,
                max_total_exposure,
                max_total_exposure * soft,
                RiskAction::LogOnly,
                RiskAction::StopNewTrades,
                "maximum total exposure",
            ),
            limit(
                LimitType::SymbolExposure,
                config.max_exposure_per_symbol,
                config.max_exposure_per_symbol * soft,
                RiskAction::LogOnly,
                RiskAction::StopNewTrades,
                "maximum exposure per symbol",
            ),
            limit(
                LimitType::PositionCount,
                config.max_open_positions as f64,
                config.max_open_positions as f64 * soft,
                RiskAction::LogOnly,
                RiskAction::StopNewTrades,
                "maximum open positions",
            ),
            limit(
                LimitType::LevelCount,
                config.max_active_levels as f64,
                config.max_active_levels as f64 * soft,
                RiskAction::LogOnly,
                RiskAction::StopNewTrades,
                "maximum active levels",
            ),
            limit(
                LimitType::Drawdown,
                config.max_daily_loss,
                config.max_daily_loss * 0.5,
                RiskAction::ReduceActivity,
                RiskAction::CloseLosers,
                "maximum drawdown",
            ),
        ]);

        Self {
            limits: Mutex::new(limits),
            inner: Mutex::new(Inner {
                current_level: RiskLevel::Normal,
                emergency_triggered: false,
                emergency_reason: None,
                peak_pnl: 0.0,
                max_drawdown: 0.0,
                events: VecDeque::new(),
                snapshots: VecDeque::new(),
                price_history: HashMap::new(),
                symbol_exposure: HashMap::new(),
            }),
            emergency_loss_threshold: config.emergency_loss_threshold,
            black_swan_threshold: config.sudden_drop_threshold,
        }
    }

    // -------------------------------------------------------------------------
    // Main check
    // -------------------------------------------------------------------------

    /// Full risk check against the current PnL, position map, and active
    /// level count. Returns the snapshot; warnings and breaches are also
    /// recorded as events.
    pub fn check_risks(
        &self,
        realized_pnl: f64,
        unrealized_pnl: f64,
        positions: &HashMap<String, PositionInfo>,
        active_levels: usize,
        now: DateTime<Utc>,
    ) -> RiskSnapshot {
        let limits = self.limits.lock().clone();
        let mut inner = self.inner.lock();

        let total_pnl = realized_pnl + unrealized_pnl;

        // Exposure from the position map.
        let mut long_exposure = 0.0;
        let mut short_exposure = 0.0;
        inner.symbol_exposure.clear();
        for (symbol, pos) in positions {
            let value = (pos.size as f64 * pos.price).abs();
            if pos.size > 0 {
                long_exposure += value;
            } else {
                short_exposure += value;
            }
            inner.symbol_exposure.insert(symbol.clone(), value);
        }
        let total_exposure = long_exposure + short_exposure;

        // Peak and drawdown move monotonically until the daily reset.
        if total_pnl > inner.peak_pnl {
            inner.peak_pnl = total_pnl;
        }
        let current_drawdown = inner.peak_pnl - total_pnl;
        if current_drawdown > inner.max_drawdown {
            inner.max_drawdown = current_drawdown;
        }

        let daily_loss = if total_pnl < 0.0 { -total_pnl } else { 0.0 };

        let mut snapshot = RiskSnapshot {
            timestamp: now,
            risk_level: RiskLevel::Normal,
            realized_pnl,
            unrealized_pnl,
            total_pnl,
            daily_loss,
            total_exposure,
            long_exposure,
            short_exposure,
            net_exposure: long_exposure - short_exposure,
            position_count: positions.len(),
            active_level_count: active_levels,
            limits_breached: Vec::new(),
            warnings_active: Vec::new(),
            peak_pnl: inner.peak_pnl,
            current_drawdown,
            max_drawdown_today: inner.max_drawdown,
        };

        let position_total: i64 = positions.values().map(|p| p.size.abs()).sum();

        let checks = [
            (LimitType::DailyLoss, daily_loss),
            (LimitType::TotalExposure, total_exposure),
            (LimitType::PositionCount, position_total as f64),
            (LimitType::LevelCount, active_levels as f64),
            (LimitType::Drawdown, current_drawdown),
        ];
        for (limit_type, value) in checks {
            if let Some(config) = limits.get(&limit_type) {
                check_limit(&mut inner, config, value, &mut snapshot, now);
            }
        }

        // Per-symbol exposure checks.
        if let Some(config) = limits.get(&LimitType::SymbolExposure) {
            let exposures: Vec<(String, f64)> = inner
                .symbol_exposure
                .iter()
                .map(|(s, v)| (s.clone(), *v))
                .collect();
            for (_, value) in exposures {
                check_limit(&mut inner, config, value, &mut snapshot, now);
            }
        }

        // Runaway loss fires the emergency directly.
        if daily_loss >= self.emergency_loss_threshold {
            trigger_emergency_locked(
                &mut inner,
                format!("emergency loss threshold reached ({daily_loss:.2})"),
                now,
            );
        }

        snapshot.risk_level = derive_risk_level(&inner, &snapshot);
        inner.current_level = snapshot.risk_level;

        inner.snapshots.push_back(snapshot.clone());
        while inner.snapshots.len() > SNAPSHOT_HISTORY {
            inner.snapshots.pop_front();
        }

        snapshot
    }

    /// Gate for new trades: emergency, critical risk, and prospective
    /// exposure limits.
    pub fn can_open_new_trade(
        &self,
        symbol: &str,
        _side: Side,
        size: u32,
        entry_price: f64,
    ) -> (bool, String) {
        let limits = self.limits.lock().clone();
        let inner = self.inner.lock();

        if inner.emergency_triggered {
            return (
                false,
                format!(
                    "emergency stop active: {}",
                    inner.emergency_reason.as_deref().unwrap_or("unknown")
                ),
            );
        }

        if inner.current_level == RiskLevel::Emergency {
            return (false, "emergency risk level".into());
        }
        if inner.current_level == RiskLevel::Critical {
            return (false, "critical risk level, no new trades".into());
        }

        let trade_value = size as f64 * entry_price;

        if let Some(limit) = limits.get(&LimitType::SymbolExposure) {
            let current = inner.symbol_exposure.get(symbol).copied().unwrap_or(0.0);
            let prospective = current + trade_value;
            if prospective > limit.hard_value {
                return (
                    false,
                    format!("symbol exposure limit exceeded ({prospective:.0})"),
                );
            }
        }

        if let Some(limit) = limits.get(&LimitType::TotalExposure) {
            let current: f64 = inner.symbol_exposure.values().sum();
            let prospective = current + trade_value;
            if prospective > limit.hard_value {
                return (
                    false,
                    format!("total exposure limit exceeded ({prospective:.0})"),
                );
            }
        }

        (true, String::new())
    }

    // -------------------------------------------------------------------------
    // Black swan
    // -------------------------------------------------------------------------

    /// Push a price into the black-swan window and check for a sudden move.
    pub fn record_price(&self, symbol: &str, price: f64, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();

        let window = inner
            .price_history
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(PRICE_WINDOW));
        window.push_back((now, price));
        while window.len() > PRICE_WINDOW {
            window.pop_front();
        }

        if window.len() < 10 {
            return;
        }

        let oldest = window.front().map(|(_, p)| *p).unwrap_or(0.0);
        let newest = window.back().map(|(_, p)| *p).unwrap_or(0.0);
        if oldest <= 0.0 {
            return;
        }

        let change_pct = (newest - oldest).abs() / oldest * 100.0;
        if change_pct >= self.black_swan_threshold {
            trigger_emergency_locked(
                &mut inner,
                format!("black swan: {symbol} moved {change_pct:.1}% inside the window"),
                now,
            );
        }
    }

    // -------------------------------------------------------------------------
    // Emergency lifecycle
    // -------------------------------------------------------------------------

    pub fn trigger_emergency(&self, reason: impl Into<String>, now: DateTime<Utc>) {
        trigger_emergency_locked(&mut self.inner.lock(), reason.into(), now);
    }

    /// Clear the emergency flag. Deliberately manual; nothing in the engine
    /// calls this on its own.
    pub fn reset_emergency(&self) {
        let mut inner = self.inner.lock();
        inner.emergency_triggered = false;
        inner.emergency_reason = None;
        inner.current_level = RiskLevel::Normal;
        warn!("emergency flag manually reset");
    }

    /// Reset the daily tracking (peak, drawdown, per-symbol exposure).
    pub fn reset_daily(&self) {
        let mut inner = self.inner.lock();
        inner.peak_pnl = 0.0;
        inner.max_drawdown = 0.0;
        inner.symbol_exposure.clear();
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn is_emergency(&self) -> bool {
        self.inner.lock().emergency_triggered
    }

    pub fn emergency_reason(&self) -> Option<String> {
        self.inner.lock().emergency_reason.clone()
    }

    pub fn current_level(&self) -> RiskLevel {
        self.inner.lock().current_level
    }

    pub fn latest_snapshot(&self) -> Option<RiskSnapshot> {
        self.inner.lock().snapshots.back().cloned()
    }

    pub fn recent_events(&self, count: usize) -> Vec<RiskEvent> {
        let inner = self.inner.lock();
        let start = inner.events.len().saturating_sub(count);
        inner.events.iter().skip(start).cloned().collect()
    }

    /// Tune one limit's thresholds at runtime.
    pub fn update_limit(&self, limit_type: LimitType, soft: f64, hard: f64) {
        let mut limits = self.limits.lock();
        if let Some(config) = limits.get_mut(&limit_type) {
            config.soft_value = soft;
            config.hard_value = hard;
        }
    }
}

// =============================================================================
// Internals
// =============================================================================

fn check_limit(
    inner: &mut Inner,
    config: &LimitConfig,
    current_value: f64,
    snapshot: &mut RiskSnapshot,
    now: DateTime<Utc>,
) {
    if !config.enabled {
        return;
    }

    if current_value >= config.hard_value {
        if !snapshot.limits_breached.contains(&config.limit_type.to_string()) {
            snapshot.limits_breached.push(config.limit_type.to_string());
        }
        record_breach(inner, config, current_value, true, now);
    } else if current_value >= config.soft_value {
        if !snapshot.warnings_active.contains(&config.limit_type.to_string()) {
            snapshot.warnings_active.push(config.limit_type.to_string());
        }
        record_breach(inner, config, current_value, false, now);
    }
}

fn record_breach(
    inner: &mut Inner,
    config: &LimitConfig,
    current_value: f64,
    is_hard: bool,
    now: DateTime<Utc>,
) {
    let (threshold, action, kind) = if is_hard {
        (
            config.hard_value,
            config.hard_action,
            RiskEventKind::HardLimitBreach,
        )
    } else {
        (
            config.soft_value,
            config.soft_action,
            RiskEventKind::SoftLimitWarning,
        )
    };

    let event = RiskEvent {
        timestamp: now,
        kind,
        limit_type: Some(config.limit_type),
        current_value,
        threshold_value: threshold,
        action,
        message: format!(
            "{}: {:.2} >= {:.2}",
            config.description, current_value, threshold
        ),
    };

    if is_hard {
        error!(limit = %config.limit_type, value = current_value, threshold, "hard limit breached");
    } else {
        warn!(limit = %config.limit_type, value = current_value, threshold, "soft limit warning");
    }

    push_event(inner, event);

    if action == RiskAction::EmergencyStop {
        trigger_emergency_locked(
            inner,
            format!("{} limit demanded emergency stop", config.limit_type),
            now,
        );
    }
}

fn trigger_emergency_locked(inner: &mut Inner, reason: String, now: DateTime<Utc>) {
    if inner.emergency_triggered {
        return; // one-shot
    }

    inner.emergency_triggered = true;
    inner.emergency_reason = Some(reason.clone());
    inner.current_level = RiskLevel::Emergency;

    error!(reason = %reason, "EMERGENCY STOP triggered");

    push_event(
        inner,
        RiskEvent {
            timestamp: now,
            kind: RiskEventKind::EmergencyStop,
            limit_type: None,
            current_value: 0.0,
            threshold_value: 0.0,
            action: RiskAction::EmergencyStop,
            message: format!("emergency stop: {reason}"),
        },
    );
}

fn push_event(inner: &mut Inner, event: RiskEvent) {
    inner.events.push_back(event);
    while inner.events.len() > EVENT_HISTORY {
        inner.events.pop_front();
    }
}

fn derive_risk_level(inner: &Inner, snapshot: &RiskSnapshot) -> RiskLevel {
    if inner.emergency_triggered {
        RiskLevel::Emergency
    } else if !snapshot.limits_breached.is_empty() {
        RiskLevel::Critical
    } else if snapshot.warnings_active.len() >= 3 {
        RiskLevel::Warning
    } else if !snapshot.warnings_active.is_empty() {
        RiskLevel::Elevated
    } else {
        RiskLevel::Normal
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 12, 15, 0, 0).unwrap()
    }

    fn manager() -> RiskManager {
        RiskManager::new(&RiskLimitsConfig::default())
    }

    fn positions(entries: &[(&str, i64, f64)]) -> HashMap<String, PositionInfo> {
        entries
            .iter()
            .map(|(symbol, size, price)| {
                (
                    symbol.to_string(),
                    PositionInfo {
                        size: *size,
                        price: *price,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn calm_book_is_normal() {
        let rm = manager();
        let snap = rm.check_risks(50.0, 25.0, &positions(&[("ACME", 100, 50.0)]), 3, now());

        assert_eq!(snap.risk_level, RiskLevel::Normal);
        assert!(snap.limits_breached.is_empty());
        assert!((snap.total_pnl - 75.0).abs() < f64::EPSILON);
        assert!((snap.long_exposure - 5_000.0).abs() < f64::EPSILON);
        assert_eq!(snap.position_count, 1);
    }

    #[test]
    fn exposure_splits_long_and_short() {
        let rm = manager();
        let snap = rm.check_risks(
            0.0,
            0.0,
            &positions(&[("ACME", 100, 50.0), ("ZORB", -40, 25.0)]),
            0,
            now(),
        );

        assert!((snap.long_exposure - 5_000.0).abs() < f64::EPSILON);
        assert!((snap.short_exposure - 1_000.0).abs() < f64::EPSILON);
        assert!((snap.net_exposure - 4_000.0).abs() < f64::EPSILON);
        assert!((snap.total_exposure - 6_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn soft_daily_loss_elevates() {
        let rm = manager();
        // 80% of the 500 daily loss limit.
        let snap = rm.check_risks(-400.0, 0.0, &HashMap::new(), 0, now());

        assert_eq!(snap.risk_level, RiskLevel::Elevated);
        assert!(snap.warnings_active.contains(&"DAILY_LOSS".to_string()));
        assert!(snap.limits_breached.is_empty());

        let events = rm.recent_events(10);
        assert!(events
            .iter()
            .any(|e| e.kind == RiskEventKind::SoftLimitWarning));
    }

    #[test]
    fn hard_daily_loss_is_critical() {
        let rm = manager();
        let snap = rm.check_risks(-550.0, 0.0, &HashMap::new(), 0, now());

        assert_eq!(snap.risk_level, RiskLevel::Critical);
        assert!(snap.limits_breached.contains(&"DAILY_LOSS".to_string()));

        let (allowed, reason) = rm.can_open_new_trade("ACME", Side::Long, 100, 50.0);
        assert!(!allowed);
        assert!(reason.contains("critical"));
    }

    #[test]
    fn risk_level_is_monotone_in_active_events() {
        let rm = manager();

        // No events: NORMAL. One warning: ELEVATED. Breach: CRITICAL.
        let normal = rm.check_risks(0.0, 0.0, &HashMap::new(), 0, now());
        let elevated = rm.check_risks(-400.0, 0.0, &HashMap::new(), 0, now());
        let critical = rm.check_risks(-550.0, 0.0, &HashMap::new(), 0, now());

        assert!(normal.risk_level < elevated.risk_level);
        assert!(elevated.risk_level < critical.risk_level);

        // Resolving the loss brings the level back down (no sticky state
        // below emergency).
        let recovered = rm.check_risks(0.0, 0.0, &HashMap::new(), 0, now());
        assert_eq!(recovered.risk_level, RiskLevel::Normal);
    }

    #[test]
    fn three_warnings_reach_warning_level() {
        let rm = manager();
        // Daily loss soft (400), drawdown soft (250), level count soft (16).
        let snap = rm.check_risks(-400.0, 0.0, &HashMap::new(), 16, now());

        assert!(snap.warnings_active.len() >= 3, "{:?}", snap.warnings_active);
        assert_eq!(snap.risk_level, RiskLevel::Warning);
    }

    #[test]
    fn drawdown_tracks_peak_monotonically() {
        let rm = manager();

        rm.check_risks(0.0, 300.0, &HashMap::new(), 0, now());
        let snap = rm.check_risks(0.0, 100.0, &HashMap::new(), 0, now());

        assert!((snap.peak_pnl - 300.0).abs() < f64::EPSILON);
        assert!((snap.current_drawdown - 200.0).abs() < f64::EPSILON);

        // Recovery shrinks the current drawdown but not the daily maximum.
        let snap = rm.check_risks(0.0, 250.0, &HashMap::new(), 0, now());
        assert!((snap.current_drawdown - 50.0).abs() < f64::EPSILON);
        assert!((snap.max_drawdown_today - 200.0).abs() < f64::EPSILON);

        rm.reset_daily();
        let snap = rm.check_risks(0.0, 0.0, &HashMap::new(), 0, now());
        assert!((snap.max_drawdown_today - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn emergency_loss_threshold_trips_emergency() {
        let rm = manager();
        let snap = rm.check_risks(-1_050.0, 0.0, &HashMap::new(), 0, now());

        assert_eq!(snap.risk_level, RiskLevel::Emergency);
        assert!(rm.is_emergency());
    }

    #[test]
    fn black_swan_ten_percent_drop() {
        let rm = manager();

        for i in 0..60 {
            rm.record_price("ACME", 50.0, now() + chrono::Duration::seconds(i));
        }
        assert!(!rm.is_emergency());

        rm.record_price("ACME", 45.0, now() + chrono::Duration::seconds(60));

        assert!(rm.is_emergency());
        let reason = rm.emergency_reason().unwrap();
        assert!(reason.contains("ACME"));
        assert!(reason.contains("10.0%"));
        assert_eq!(rm.current_level(), RiskLevel::Emergency);
    }

    #[test]
    fn black_swan_needs_window_history() {
        let rm = manager();
        rm.record_price("ACME", 50.0, now());
        rm.record_price("ACME", 40.0, now() + chrono::Duration::seconds(1));
        // Only two samples: the detector stays quiet.
        assert!(!rm.is_emergency());
    }

    #[test]
    fn emergency_is_one_shot_and_needs_manual_reset() {
        let rm = manager();
        rm.trigger_emergency("first", now());
        rm.trigger_emergency("second", now());

        assert_eq!(rm.emergency_reason().unwrap(), "first");

        let (allowed, reason) = rm.can_open_new_trade("ACME", Side::Long, 10, 10.0);
        assert!(!allowed);
        assert!(reason.contains("emergency stop active"));

        rm.reset_emergency();
        assert!(!rm.is_emergency());
        let (allowed, _) = rm.can_open_new_trade("ACME", Side::Long, 10, 10.0);
        assert!(allowed);
    }

    #[test]
    fn prospective_exposure_blocks_trades() {
        let rm = manager();
        // Existing 9k exposure in ACME; hard cap is 10k per symbol.
        rm.check_risks(0.0, 0.0, &positions(&[("ACME", 180, 50.0)]), 0, now());

        let (allowed, reason) = rm.can_open_new_trade("ACME", Side::Long, 40, 50.0);
        assert!(!allowed);
        assert!(reason.contains("symbol exposure"));

        // A different symbol is fine.
        let (allowed, _) = rm.can_open_new_trade("ZORB", Side::Long, 40, 50.0);
        assert!(allowed);
    }

    #[test]
    fn snapshots_are_bounded_and_ordered() {
        let rm = manager();
        for i in 0..120 {
            rm.check_risks(0.0, i as f64, &HashMap::new(), 0, now() + chrono::Duration::seconds(i));
        }
        let latest = rm.latest_snapshot().unwrap();
        assert!((latest.unrealized_pnl - 119.0).abs() < f64::EPSILON);
    }
}
