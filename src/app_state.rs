// =============================================================================
// Central Application State - GridPilot engine hub
// =============================================================================
//
// Ties every subsystem together behind one Arc: the controller (and its
// internal analysis stack), the level pool, the execution manager, the risk
// manager, the watchdog, and the broker port. Provides a monotonically
// increasing state version and a serialisable engine snapshot for consumers.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot locks for the controller and the error ring.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::broker::BrokerAdapter;
use crate::clock::Clock;
use crate::controller::Controller;
use crate::events::EventBus;
use crate::execution::{ExecutionManager, ExecutionStats};
use crate::level_pool::{LevelPool, PoolStatistics};
use crate::risk::risk_manager::{RiskManager, RiskSnapshot};
use crate::risk::watchdog::Watchdog;
use crate::state::{ActiveLevel, DecisionRecord, MarketState};
use crate::types::{ControllerMode, ControllerStatus};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the status feed.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Central engine state shared across all tasks via `Arc<AppState>`.
pub struct AppState {
    /// Incremented on every meaningful state mutation; consumers use it to
    /// detect fresh data.
    pub state_version: AtomicU64,

    pub clock: Clock,
    pub events: EventBus,

    pub controller: Mutex<Controller>,
    pub pool: Arc<LevelPool>,
    pub execution: Arc<ExecutionManager>,
    pub risk: Arc<RiskManager>,
    pub watchdog: Arc<Watchdog>,
    pub broker: Arc<dyn BrokerAdapter>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Clock,
        events: EventBus,
        controller: Controller,
        pool: Arc<LevelPool>,
        execution: Arc<ExecutionManager>,
        risk: Arc<RiskManager>,
        watchdog: Arc<Watchdog>,
        broker: Arc<dyn BrokerAdapter>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            clock,
            events,
            controller: Mutex::new(controller),
            pool,
            execution,
            risk,
            watchdog,
            broker,
            recent_errors: RwLock::new(Vec::new()),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error for the status feed; the ring is capped.
    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: message.into(),
            at: self.clock.now_utc(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Build the full serialisable engine snapshot.
    pub fn build_snapshot(&self) -> EngineSnapshot {
        let controller = self.controller.lock();

        EngineSnapshot {
            state_version: self.current_state_version(),
            server_time: self.clock.now_utc(),
            status: controller.state.status,
            status_message: controller.state.status_message.clone(),
            mode: controller.mode(),
            session_id: controller.state.session_id.clone(),
            is_market_hours: controller.state.is_market_hours,
            emergency_stop_triggered: controller.state.emergency_stop_triggered,
            market_states: controller.state.market_states.values().cloned().collect(),
            active_levels: controller.state.active_levels.values().cloned().collect(),
            recent_decisions: controller
                .state
                .decision_history
                .iter()
                .rev()
                .take(20)
                .rev()
                .cloned()
                .collect(),
            pending_alert_count: controller.state.pending_alerts.len(),
            pool: self.pool.statistics(),
            risk: self.risk.latest_snapshot(),
            execution: self.execution.stats(),
            execution_queue_len: self.execution.queue_len(),
            watchdog_status: self.watchdog.status().to_string(),
            broker_connected: self.broker.is_connected(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// Full engine snapshot for status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub server_time: DateTime<Utc>,

    pub status: ControllerStatus,
    pub status_message: String,
    pub mode: ControllerMode,
    pub session_id: String,
    pub is_market_hours: bool,
    pub emergency_stop_triggered: bool,

    pub market_states: Vec<MarketState>,
    pub active_levels: Vec<ActiveLevel>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub pending_alert_count: usize,

    pub pool: PoolStatistics,
    pub risk: Option<RiskSnapshot>,
    pub execution: ExecutionStats,
    pub execution_queue_len: usize,
    pub watchdog_status: String,
    pub broker_connected: bool,

    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::risk::watchdog::WatchdogConfigValues;
    use crate::runtime_config::ControllerConfig;

    fn app_state() -> AppState {
        let clock = Clock::fixed_ny(2024, 3, 12, 10, 45, 0);
        let events = EventBus::new(64);
        let broker = Arc::new(PaperBroker::new(clock.clone(), 100_000.0));
        let pool = Arc::new(LevelPool::new());
        let execution = Arc::new(ExecutionManager::new(100, clock.clone()));
        let config = ControllerConfig::default();
        let risk = Arc::new(RiskManager::new(&config.risk_limits));
        let watchdog = Watchdog::new(WatchdogConfigValues::default(), clock.clone());
        let data_dir = std::env::temp_dir().join(format!("gridpilot-app-{}", uuid::Uuid::new_v4()));

        let controller = Controller::new(
            config,
            clock.clone(),
            events.clone(),
            broker.clone() as Arc<dyn BrokerAdapter>,
            pool.clone(),
            execution.clone(),
            risk.clone(),
            watchdog.clone(),
            data_dir,
        );

        AppState::new(
            clock,
            events,
            controller,
            pool,
            execution,
            risk,
            watchdog,
            broker as Arc<dyn BrokerAdapter>,
        )
    }

    #[test]
    fn version_counter_increments() {
        let state = app_state();
        let before = state.current_state_version();
        state.increment_version();
        assert_eq!(state.current_state_version(), before + 1);
    }

    #[test]
    fn error_ring_is_bounded() {
        let state = app_state();
        for i in 0..60 {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 50);
        assert_eq!(errors.last().unwrap().message, "error 59");
    }

    #[test]
    fn snapshot_reflects_subsystems() {
        let state = app_state();
        let snapshot = state.build_snapshot();

        assert_eq!(snapshot.mode, ControllerMode::Off);
        assert_eq!(snapshot.pool.total_levels, 0);
        assert!(snapshot.broker_connected);
        assert_eq!(snapshot.execution_queue_len, 0);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("state_version"));
    }
}
