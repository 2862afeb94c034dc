// =============================================================================
// Watchdog - heartbeat supervision with recovery escalation
// =============================================================================
//
// The controller publishes a heartbeat every cycle; the watchdog ages it on
// an independent timer. Escalation ladder:
//
//   heartbeat late (> 2x interval)     -> WARNING
//   3 consecutive misses               -> ALERT, recovery attempt
//   recovery succeeds                  -> back to MONITORING
//   max_recovery_attempts exhausted    -> TRIGGERED (terminal until reset)
//
// Registered health checks run on their own timer; any FAILED result
// degrades the status to WARNING. Both timers are tokio tasks that are
// aborted on `stop()`, so stopping the watchdog cancels pending timers.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;

/// Watchdog status ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchdogStatus {
    Inactive,
    Monitoring,
    Warning,
    Alert,
    Triggered,
}

impl std::fmt::Display for WatchdogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "INACTIVE"),
            Self::Monitoring => write!(f, "MONITORING"),
            Self::Warning => write!(f, "WARNING"),
            Self::Alert => write!(f, "ALERT"),
            Self::Triggered => write!(f, "TRIGGERED"),
        }
    }
}

/// Result of one health check invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckResult {
    Ok,
    Warning,
    Failed,
    Timeout,
}

impl std::fmt::Display for HealthCheckResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warning => write!(f, "WARNING"),
            Self::Failed => write!(f, "FAILED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Latest result of one registered health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub component: String,
    pub status: HealthCheckResult,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: f64,
}

/// Watchdog timings and escalation bounds.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfigValues {
    pub heartbeat_interval_sec: u64,
    pub heartbeat_timeout_sec: u64,
    pub health_check_interval_sec: u64,
    pub max_recovery_attempts: u32,
    /// A single health check exceeding this budget is marked TIMEOUT.
    pub health_check_timeout_ms: f64,
}

impl Default for WatchdogConfigValues {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: 5,
            heartbeat_timeout_sec: 30,
            health_check_interval_sec: 60,
            max_recovery_attempts: 3,
            health_check_timeout_ms: 1_000.0,
        }
    }
}

type HealthCheckFn = Box<dyn Fn() -> HealthCheckResult + Send + Sync>;
type RecoveryFn = Box<dyn Fn() -> bool + Send + Sync>;
type EmergencyFn = Box<dyn Fn(&str) + Send + Sync>;

const MAX_ALERT_LOG: usize = 100;

struct State {
    status: WatchdogStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    heartbeat_count: u64,
    missed_heartbeats: u32,
    recovery_attempts: u32,
    last_health_check: Option<DateTime<Utc>>,
    health_results: HashMap<String, HealthStatus>,
    alerts: Vec<String>,
    active: bool,
}

impl State {
    fn new() -> Self {
        Self {
            status: WatchdogStatus::Inactive,
            last_heartbeat: None,
            heartbeat_count: 0,
            missed_heartbeats: 0,
            recovery_attempts: 0,
            last_health_check: None,
            health_results: HashMap::new(),
            alerts: Vec::new(),
            active: false,
        }
    }

    fn log_alert(&mut self, now: DateTime<Utc>, message: &str) {
        if self.alerts.len() < MAX_ALERT_LOG {
            self.alerts.push(format!("{now}: {message}"));
        }
    }
}

/// Fail-safe supervisor over the controller loop.
pub struct Watchdog {
    config: WatchdogConfigValues,
    clock: Clock,
    state: Mutex<State>,
    health_checks: Mutex<HashMap<String, HealthCheckFn>>,
    on_recovery_needed: Mutex<Option<RecoveryFn>>,
    on_emergency: Mutex<Option<EmergencyFn>>,
    timer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfigValues, clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            state: Mutex::new(State::new()),
            health_checks: Mutex::new(HashMap::new()),
            on_recovery_needed: Mutex::new(None),
            on_emergency: Mutex::new(None),
            timer_handles: Mutex::new(Vec::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start monitoring: spawns the heartbeat and health-check timers.
    pub fn start(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.active {
                return;
            }
            state.active = true;
            state.status = WatchdogStatus::Monitoring;
            state.last_heartbeat = Some(self.clock.now_utc());
        }

        let heartbeat_me = Arc::clone(&self);
        let heartbeat_task = tokio::spawn(async move {
            let period = std::time::Duration::from_secs(heartbeat_me.config.heartbeat_interval_sec);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !heartbeat_me.is_active() {
                    break;
                }
                heartbeat_me.check_heartbeat();
            }
        });

        let health_me = Arc::clone(&self);
        let health_task = tokio::spawn(async move {
            let period =
                std::time::Duration::from_secs(health_me.config.health_check_interval_sec);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !health_me.is_active() {
                    break;
                }
                health_me.run_health_checks();
            }
        });

        let mut handles = self.timer_handles.lock();
        handles.push(heartbeat_task);
        handles.push(health_task);

        info!(
            heartbeat_interval = self.config.heartbeat_interval_sec,
            heartbeat_timeout = self.config.heartbeat_timeout_sec,
            "watchdog started"
        );
    }

    /// Stop monitoring and cancel pending timers.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.active = false;
            state.status = WatchdogStatus::Inactive;
        }
        for handle in self.timer_handles.lock().drain(..) {
            handle.abort();
        }
        info!("watchdog stopped");
    }

    /// Controller-side heartbeat. Restores WARNING back to MONITORING.
    pub fn receive_heartbeat(&self) {
        let mut state = self.state.lock();
        state.last_heartbeat = Some(self.clock.now_utc());
        state.heartbeat_count += 1;
        state.missed_heartbeats = 0;

        if state.status == WatchdogStatus::Warning {
            state.status = WatchdogStatus::Monitoring;
            state.recovery_attempts = 0;
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        let active = state.active;
        *state = State::new();
        state.active = active;
        if active {
            state.status = WatchdogStatus::Monitoring;
            state.last_heartbeat = Some(self.clock.now_utc());
        }
    }

    // -------------------------------------------------------------------------
    // Heartbeat supervision (one timer tick)
    // -------------------------------------------------------------------------

    /// Age the last heartbeat and escalate. Called by the heartbeat timer;
    /// public so tests can drive ticks deterministically.
    pub fn check_heartbeat(&self) {
        let now = self.clock.now_utc();
        let mut state = self.state.lock();
        if !state.active || state.status == WatchdogStatus::Triggered {
            return;
        }

        let elapsed = match state.last_heartbeat {
            Some(last) => (now - last).num_seconds() as u64,
            None => u64::MAX,
        };

        if elapsed > self.config.heartbeat_timeout_sec {
            state.missed_heartbeats += 1;
            let reason = format!("heartbeat timeout: {elapsed}s since last heartbeat");

            if state.missed_heartbeats >= 3 {
                if state.recovery_attempts < self.config.max_recovery_attempts {
                    self.attempt_recovery(&mut state, now, &reason);
                } else {
                    self.trigger(&mut state, now, &format!(
                        "heartbeat lost after {} recovery attempts: {reason}",
                        self.config.max_recovery_attempts
                    ));
                }
            } else {
                self.note_warning(&mut state, now, &reason);
            }
        } else if elapsed > self.config.heartbeat_interval_sec * 2 {
            state.missed_heartbeats += 1;
            let reason = format!(
                "heartbeat late: {elapsed}s (expected every {}s)",
                self.config.heartbeat_interval_sec
            );
            self.note_warning(&mut state, now, &reason);
        }
    }

    fn attempt_recovery(&self, state: &mut State, now: DateTime<Utc>, reason: &str) {
        state.status = WatchdogStatus::Alert;
        state.recovery_attempts += 1;
        let attempt = state.recovery_attempts;
        state.log_alert(now, &format!("recovery attempt {attempt}: {reason}"));
        warn!(attempt, reason, "watchdog attempting recovery");

        let recovered = self
            .on_recovery_needed
            .lock()
            .as_ref()
            .map(|recover| recover())
            .unwrap_or(false);

        if recovered {
            state.status = WatchdogStatus::Monitoring;
            state.missed_heartbeats = 0;
            state.last_heartbeat = Some(now);
            info!(attempt, "watchdog recovery succeeded");
        } else {
            self.note_warning(state, now, &format!("recovery failed: {reason}"));
        }
    }

    fn trigger(&self, state: &mut State, now: DateTime<Utc>, reason: &str) {
        state.status = WatchdogStatus::Triggered;
        state.log_alert(now, &format!("EMERGENCY: {reason}"));
        error!(reason, "watchdog triggered emergency");

        if let Some(emergency) = self.on_emergency.lock().as_ref() {
            emergency(reason);
        }
    }

    fn note_warning(&self, state: &mut State, now: DateTime<Utc>, message: &str) {
        if state.status == WatchdogStatus::Monitoring {
            state.status = WatchdogStatus::Warning;
        }
        state.log_alert(now, &format!("WARNING: {message}"));
        warn!(message, "watchdog warning");
    }

    // -------------------------------------------------------------------------
    // Health checks
    // -------------------------------------------------------------------------

    pub fn register_health_check(
        &self,
        name: impl Into<String>,
        check: impl Fn() -> HealthCheckResult + Send + Sync + 'static,
    ) {
        self.health_checks.lock().insert(name.into(), Box::new(check));
    }

    pub fn unregister_health_check(&self, name: &str) {
        self.health_checks.lock().remove(name);
    }

    /// Run all registered checks once. Called by the health timer; public so
    /// tests can drive it.
    pub fn run_health_checks(&self) {
        let now = self.clock.now_utc();
        let checks = self.health_checks.lock();

        let mut results = HashMap::new();
        let mut failed: Vec<String> = Vec::new();

        for (name, check) in checks.iter() {
            let started = Instant::now();
            let mut result = check();
            let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

            if response_time_ms > self.config.health_check_timeout_ms {
                result = HealthCheckResult::Timeout;
            }

            if matches!(result, HealthCheckResult::Failed | HealthCheckResult::Timeout) {
                failed.push(name.clone());
            }

            results.insert(
                name.clone(),
                HealthStatus {
                    component: name.clone(),
                    status: result,
                    last_check: now,
                    response_time_ms,
                },
            );
        }
        drop(checks);

        let mut state = self.state.lock();
        if !state.active {
            return;
        }
        state.last_health_check = Some(now);
        state.health_results.extend(results);

        if !failed.is_empty() {
            let message = format!("health checks failed: {}", failed.join(", "));
            self.note_warning(&mut state, now, &message);
        }
    }

    // -------------------------------------------------------------------------
    // Callbacks & accessors
    // -------------------------------------------------------------------------

    pub fn set_on_recovery_needed(&self, recover: impl Fn() -> bool + Send + Sync + 'static) {
        *self.on_recovery_needed.lock() = Some(Box::new(recover));
    }

    pub fn set_on_emergency(&self, emergency: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_emergency.lock() = Some(Box::new(emergency));
    }

    pub fn status(&self) -> WatchdogStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_healthy(&self) -> bool {
        matches!(
            self.status(),
            WatchdogStatus::Inactive | WatchdogStatus::Monitoring
        )
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.state.lock().heartbeat_count
    }

    pub fn seconds_since_heartbeat(&self) -> f64 {
        match self.state.lock().last_heartbeat {
            Some(last) => (self.clock.now_utc() - last).num_milliseconds() as f64 / 1000.0,
            None => f64::INFINITY,
        }
    }

    pub fn health_results(&self) -> HashMap<String, HealthStatus> {
        self.state.lock().health_results.clone()
    }

    pub fn alerts(&self) -> Vec<String> {
        self.state.lock().alerts.clone()
    }
}
