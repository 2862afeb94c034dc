// =============================================================================
// Controller State - runtime bookkeeping with periodic persistence
// =============================================================================
//
// Everything the controller knows at runtime: per-symbol market states, the
// armed level records it manages, the decision audit trail, performance
// counters (including the anti-overtrading hourly change budget), and the
// pending alerts of ALERT mode.
//
// The on-disk snapshot is schema-tagged and bounded (last 100 decisions);
// a corrupt snapshot loads as a fresh state.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::level_pool::LevelKey;
use crate::types::{ControllerStatus, Side, VolatilityRegime};

/// Latest market view for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketState {
    pub symbol: String,
    pub current_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub spread_pct: f64,
    pub volume_today: u64,
    pub volume_1min: u64,

    pub atr_short: f64,
    pub atr_medium: f64,
    pub atr_long: f64,
    pub volatility_regime: VolatilityRegime,
    pub candle_range_pct: f64,

    pub price_change_1min: f64,
    pub price_change_5min: f64,
    pub price_change_15min: f64,

    pub last_update: Option<DateTime<Utc>>,
}

impl MarketState {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            current_price: 0.0,
            bid: 0.0,
            ask: 0.0,
            spread_pct: 0.0,
            volume_today: 0,
            volume_1min: 0,
            atr_short: 0.0,
            atr_medium: 0.0,
            atr_long: 0.0,
            volatility_regime: VolatilityRegime::Unknown,
            candle_range_pct: 0.0,
            price_change_1min: 0.0,
            price_change_5min: 0.0,
            price_change_15min: 0.0,
            last_update: None,
        }
    }
}

/// Controller-side record of an armed level. References the pool entry by
/// identity; never a long-lived handle into the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveLevel {
    pub key: LevelKey,
    pub scenario_name: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub shares: u32,

    pub is_active: bool,
    pub has_entry_order: bool,
    pub has_exit_order: bool,
    pub entry_filled: bool,
    pub position_qty: i64,

    pub activated_at: DateTime<Utc>,
    /// Total score at activation time.
    pub score: f64,
    pub reason: String,
}

/// What kind of decision the controller made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionType {
    ActivateLevel,
    DeactivateLevel,
    StopTrade,
    ClosePosition,
    CloseOrphan,
    EmergencyStop,
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ActivateLevel => write!(f, "ACTIVATE_LEVEL"),
            Self::DeactivateLevel => write!(f, "DEACTIVATE_LEVEL"),
            Self::StopTrade => write!(f, "STOP_TRADE"),
            Self::ClosePosition => write!(f, "CLOSE_POSITION"),
            Self::CloseOrphan => write!(f, "CLOSE_ORPHAN"),
            Self::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

/// One audited controller decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub decision_type: DecisionType,
    pub symbol: String,
    pub level: Option<LevelKey>,
    pub reason: String,
    pub market_snapshot: Option<MarketState>,

    pub executed: bool,
    pub execution_result: Option<String>,
    /// Only meaningful in ALERT mode; None when no confirmation was needed.
    pub confirmed: Option<bool>,
}

/// Daily performance counters plus the hourly change budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub decisions_today: u32,
    pub activations_today: u32,
    pub deactivations_today: u32,
    pub trades_stopped_today: u32,
    pub positions_closed_today: u32,

    pub realized_pnl_today: f64,
    pub unrealized_pnl: f64,

    pub last_decision_at: Option<DateTime<Utc>>,

    pub changes_this_hour: u32,
    pub hour_started: Option<DateTime<Utc>>,
}

impl PerformanceStats {
    /// Count a level change against the hourly anti-overtrading budget.
    /// The counter resets when the wall-clock hour rolls over.
    pub fn record_change(&mut self, now: DateTime<Utc>) {
        let same_hour = self
            .hour_started
            .is_some_and(|started| started.hour() == now.hour() && (now - started).num_hours() < 1);

        if same_hour {
            self.changes_this_hour += 1;
        } else {
            self.hour_started = Some(now);
            self.changes_this_hour = 1;
        }
    }
}

/// A decision awaiting user confirmation in ALERT mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAlert {
    pub alert_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decision: DecisionRecord,
    pub confirmed: Option<bool>,
    pub response_at: Option<DateTime<Utc>>,
}

const MAX_DECISION_HISTORY: usize = 1000;
const PERSISTED_DECISIONS: usize = 100;
const STATE_STORE_VERSION: &str = "1.0";

/// The controller's complete runtime state.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub status: ControllerStatus,
    pub status_message: String,
    pub last_heartbeat: Option<DateTime<Utc>>,

    pub market_states: HashMap<String, MarketState>,
    pub active_levels: HashMap<LevelKey, ActiveLevel>,
    pub decision_history: Vec<DecisionRecord>,
    pub performance: PerformanceStats,
    pub pending_alerts: HashMap<String, PendingAlert>,

    pub session_id: String,
    pub session_start: Option<DateTime<Utc>>,

    pub is_market_hours: bool,
    pub emergency_stop_triggered: bool,
    pub soft_limit_warning: bool,
}

impl ControllerState {
    pub fn new(session_id: String, session_start: DateTime<Utc>) -> Self {
        Self {
            status: ControllerStatus::Stopped,
            status_message: String::new(),
            last_heartbeat: None,
            market_states: HashMap::new(),
            active_levels: HashMap::new(),
            decision_history: Vec::new(),
            performance: PerformanceStats::default(),
            pending_alerts: HashMap::new(),
            session_id,
            session_start: Some(session_start),
            is_market_hours: false,
            emergency_stop_triggered: false,
            soft_limit_warning: false,
        }
    }

    /// Append a decision to the bounded history and bump the counters.
    pub fn add_decision(&mut self, decision: DecisionRecord) {
        self.performance.decisions_today += 1;
        self.performance.last_decision_at = Some(decision.timestamp);

        self.decision_history.push(decision);
        if self.decision_history.len() > MAX_DECISION_HISTORY {
            let excess = self.decision_history.len() - MAX_DECISION_HISTORY;
            self.decision_history.drain(..excess);
        }
    }

    pub fn active_levels_for_symbol(&self, symbol: &str) -> Vec<&ActiveLevel> {
        self.active_levels
            .values()
            .filter(|l| l.symbol == symbol && l.is_active)
            .collect()
    }

    pub fn active_side_count(&self, symbol: &str, side: Side) -> usize {
        self.active_levels_for_symbol(symbol)
            .iter()
            .filter(|l| l.side == side)
            .count()
    }

    /// Heartbeat timestamps only ever move forward.
    pub fn update_heartbeat(&mut self, now: DateTime<Utc>) {
        if self.last_heartbeat.map_or(true, |last| now > last) {
            self.last_heartbeat = Some(now);
        }
    }

    pub fn reset_daily_stats(&mut self) {
        self.performance = PerformanceStats::default();
        self.decision_history.clear();
        self.emergency_stop_triggered = false;
        self.soft_limit_warning = false;
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let store = ControllerStateStore {
            version: STATE_STORE_VERSION.to_string(),
            status: self.status,
            status_message: self.status_message.clone(),
            last_heartbeat: self.last_heartbeat,
            market_states: self.market_states.values().cloned().collect(),
            active_levels: self.active_levels.values().cloned().collect(),
            decision_history: self
                .decision_history
                .iter()
                .rev()
                .take(PERSISTED_DECISIONS)
                .rev()
                .cloned()
                .collect(),
            performance: self.performance.clone(),
            pending_alerts: self.pending_alerts.values().cloned().collect(),
            session_id: self.session_id.clone(),
            session_start: self.session_start,
            is_market_hours: self.is_market_hours,
            emergency_stop_triggered: self.emergency_stop_triggered,
            soft_limit_warning: self.soft_limit_warning,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let content =
            serde_json::to_string_pretty(&store).context("failed to serialise controller state")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename to {}", path.display()))?;

        Ok(())
    }

    /// Load a previously saved state. Missing or corrupt stores yield a
    /// fresh state built from `fallback_session_id` / `now`.
    pub fn load(
        path: impl AsRef<Path>,
        fallback_session_id: String,
        now: DateTime<Utc>,
    ) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::new(fallback_session_id, now);
        }

        let store: Option<ControllerStateStore> = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());

        match store {
            Some(store) => Self {
                status: store.status,
                status_message: store.status_message,
                last_heartbeat: store.last_heartbeat,
                market_states: store
                    .market_states
                    .into_iter()
                    .map(|ms| (ms.symbol.clone(), ms))
                    .collect(),
                active_levels: store
                    .active_levels
                    .into_iter()
                    .map(|al| (al.key.clone(), al))
                    .collect(),
                decision_history: store.decision_history,
                performance: store.performance,
                pending_alerts: store
                    .pending_alerts
                    .into_iter()
                    .map(|pa| (pa.alert_id.clone(), pa))
                    .collect(),
                session_id: store.session_id,
                session_start: store.session_start,
                is_market_hours: store.is_market_hours,
                emergency_stop_triggered: store.emergency_stop_triggered,
                soft_limit_warning: store.soft_limit_warning,
            },
            None => {
                warn!(path = %path.display(), "corrupt controller state store, starting fresh");
                Self::new(fallback_session_id, now)
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ControllerStateStore {
    version: String,
    status: ControllerStatus,
    status_message: String,
    last_heartbeat: Option<DateTime<Utc>>,
    market_states: Vec<MarketState>,
    active_levels: Vec<ActiveLevel>,
    decision_history: Vec<DecisionRecord>,
    performance: PerformanceStats,
    pending_alerts: Vec<PendingAlert>,
    session_id: String,
    session_start: Option<DateTime<Utc>>,
    is_market_hours: bool,
    emergency_stop_triggered: bool,
    soft_limit_warning: bool,
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

    fn key(num: u32) -> LevelKey {
        LevelKey {
            scenario_id: "scn-1".into(),
            level_num: num,
            side: Side::Long,
        }
    }

    fn active_level(num: u32, symbol: &str) -> ActiveLevel {
        ActiveLevel {
            key: key(num),
            scenario_name: "Base Grid".into(),
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: 99.7,
            exit_price: 100.5,
            shares: 100,
            is_active: true,
            has_entry_order: true,
            has_exit_order: false,
            entry_filled: false,
            position_qty: 0,
            activated_at: now(),
            score: 50.0,
            reason: "test".into(),
        }
    }

    fn decision(decision_type: DecisionType) -> DecisionRecord {
        DecisionRecord {
            timestamp: now(),
            decision_type,
            symbol: "ACME".into(),
            level: Some(key(1)),
            reason: "test".into(),
            market_snapshot: None,
            executed: true,
            execution_result: None,
            confirmed: None,
        }
    }

    #[test]
    fn decision_history_is_bounded() {
        let mut state = ControllerState::new("sess".into(), now());
        for _ in 0..1100 {
            state.add_decision(decision(DecisionType::ActivateLevel));
        }
        assert_eq!(state.decision_history.len(), 1000);
        assert_eq!(state.performance.decisions_today, 1100);
    }

    #[test]
    fn heartbeat_is_monotone() {
        let mut state = ControllerState::new("sess".into(), now());
        state.update_heartbeat(now());
        state.update_heartbeat(now() - chrono::Duration::seconds(10));
        assert_eq!(state.last_heartbeat, Some(now()));

        state.update_heartbeat(now() + chrono::Duration::seconds(5));
        assert_eq!(
            state.last_heartbeat,
            Some(now() + chrono::Duration::seconds(5))
        );
    }

    #[test]
    fn hourly_change_budget_rolls_over() {
        let mut perf = PerformanceStats::default();
        let base = Utc.with_ymd_and_hms(2024, 3, 12, 14, 10, 0).unwrap();

        perf.record_change(base);
        perf.record_change(base + chrono::Duration::minutes(5));
        assert_eq!(perf.changes_this_hour, 2);

        // New wall-clock hour resets the budget.
        perf.record_change(Utc.with_ymd_and_hms(2024, 3, 12, 15, 1, 0).unwrap());
        assert_eq!(perf.changes_this_hour, 1);
    }

    #[test]
    fn active_level_queries_by_symbol_and_side() {
        let mut state = ControllerState::new("sess".into(), now());
        state.active_levels.insert(key(1), active_level(1, "ACME"));
        state.active_levels.insert(key(2), active_level(2, "ACME"));
        state.active_levels.insert(key(3), active_level(3, "ZORB"));

        assert_eq!(state.active_levels_for_symbol("ACME").len(), 2);
        assert_eq!(state.active_side_count("ACME", Side::Long), 2);
        assert_eq!(state.active_side_count("ACME", Side::Short), 0);
    }

    #[test]
    fn reset_daily_clears_counters_and_flags() {
        let mut state = ControllerState::new("sess".into(), now());
        state.add_decision(decision(DecisionType::ActivateLevel));
        state.emergency_stop_triggered = true;
        state.soft_limit_warning = true;

        state.reset_daily_stats();

        assert_eq!(state.performance.decisions_today, 0);
        assert!(state.decision_history.is_empty());
        assert!(!state.emergency_stop_triggered);
        assert!(!state.soft_limit_warning);
    }

    #[test]
    fn persistence_roundtrip_bounds_decisions() {
        let dir = std::env::temp_dir().join(format!("gridpilot-state-{}", uuid::Uuid::new_v4()));
        let path = dir.join("controller_state.json");

        let mut state = ControllerState::new("sess-1".into(), now());
        state.status = ControllerStatus::Running;
        state.market_states.insert("ACME".into(), MarketState::new("ACME"));
        state.active_levels.insert(key(1), active_level(1, "ACME"));
        for _ in 0..250 {
            state.add_decision(decision(DecisionType::ActivateLevel));
        }
        state.save(&path).unwrap();

        let restored = ControllerState::load(&path, "fallback".into(), now());
        assert_eq!(restored.session_id, "sess-1");
        assert_eq!(restored.status, ControllerStatus::Running);
        assert_eq!(restored.active_levels.len(), 1);
        assert!(restored.market_states.contains_key("ACME"));
        // Only the last 100 decisions are persisted.
        assert_eq!(restored.decision_history.len(), 100);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_state_store_loads_fresh() {
        let dir = std::env::temp_dir().join(format!("gridpilot-state-bad-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("controller_state.json");
        std::fs::write(&path, "nope").unwrap();

        let state = ControllerState::load(&path, "fresh".into(), now());
        assert_eq!(state.session_id, "fresh");
        assert_eq!(state.status, ControllerStatus::Stopped);

        let _ = std::fs::remove_dir_all(dir);
    }
}
