// =============================================================================
// GridPilot - Main Entry Point
// =============================================================================
//
// The engine starts in OFF mode for safety. Operators must explicitly switch
// to ALERT or AUTONOMOUS (GRIDPILOT_MODE) for the controller to act on its
// decisions.
// =============================================================================

// -- Module declarations ------------------------------------------------------
mod analysis;
mod app_state;
mod broker;
mod clock;
mod controller;
mod decision;
mod events;
mod execution;
mod level_pool;
mod market_data;
mod risk;
mod runtime_config;
mod state;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::{BrokerAdapter, PaperBroker};
use crate::clock::Clock;
use crate::controller::Controller;
use crate::events::EventBus;
use crate::execution::ExecutionManager;
use crate::level_pool::{LevelPool, ScenarioLevel, ScenarioSpec};
use crate::market_data::Candle;
use crate::risk::risk_manager::RiskManager;
use crate::risk::watchdog::{Watchdog, WatchdogConfigValues};
use crate::runtime_config::ControllerConfig;
use crate::types::{ControllerMode, Side};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -- 1. Environment & config -----------------------------------------
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("GridPilot starting up");

    let data_dir = std::env::var("GRIDPILOT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./gridpilot-data"));
    let config_path = data_dir.join("controller_config.json");

    let mut config = ControllerConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        ControllerConfig::default()
    });

    // SAFETY: the engine always boots in OFF mode; any persisted mode is
    // discarded and re-selected explicitly.
    config.mode = ControllerMode::Off;
    if let Ok(mode) = std::env::var("GRIDPILOT_MODE") {
        config.mode = match mode.to_uppercase().as_str() {
            "ALERT" => ControllerMode::Alert,
            "AUTONOMOUS" => ControllerMode::Autonomous,
            _ => ControllerMode::Off,
        };
    }

    info!(mode = %config.mode, data_dir = %data_dir.display(), "configuration ready");

    // -- 2. Build subsystems ----------------------------------------------
    let clock = Clock::system();
    let events = EventBus::new(1024);

    let broker: Arc<PaperBroker> = Arc::new(PaperBroker::new(clock.clone(), 100_000.0));

    let pool = Arc::new(LevelPool::new());
    let pool_path = data_dir.join("level_pool.json");
    let loaded = pool.load(&pool_path);
    if loaded > 0 {
        info!(levels = loaded, "level pool restored from disk");
    } else {
        let imported = pool.import_from_scenarios(&demo_scenarios());
        info!(levels = imported, "seeded demo scenario into empty pool");
    }

    let execution = Arc::new(ExecutionManager::new(100, clock.clone()));
    let risk = Arc::new(RiskManager::new(&config.risk_limits));
    let watchdog = Watchdog::new(
        WatchdogConfigValues {
            heartbeat_interval_sec: config.watchdog.heartbeat_interval_sec,
            heartbeat_timeout_sec: config.watchdog.heartbeat_timeout_sec,
            ..WatchdogConfigValues::default()
        },
        clock.clone(),
    );

    let reevaluation_interval = config.analysis.reevaluation_interval_sec;

    let mut controller = Controller::new(
        config,
        clock.clone(),
        events.clone(),
        broker.clone() as Arc<dyn BrokerAdapter>,
        pool.clone(),
        execution.clone(),
        risk.clone(),
        watchdog.clone(),
        data_dir.clone(),
    );
    controller.start();

    let state = Arc::new(AppState::new(
        clock.clone(),
        events.clone(),
        controller,
        pool.clone(),
        execution.clone(),
        risk.clone(),
        watchdog.clone(),
        broker.clone() as Arc<dyn BrokerAdapter>,
    ));

    // -- 3. Watchdog ------------------------------------------------------
    {
        let emergency_exec = execution.clone();
        let emergency_events = events.clone();
        watchdog.set_on_emergency(move |reason| {
            error!(reason, "watchdog escalated to emergency");
            emergency_exec.clear_queue(true);
            emergency_exec.emergency_stop(reason.to_string());
            emergency_events.publish(crate::events::ControllerEvent::EmergencyStopRequested {
                reason: reason.to_string(),
            });
        });

        let heartbeat_state = state.clone();
        watchdog.set_on_recovery_needed(move || {
            // Recovery: nudge the controller out of a pause and see whether
            // the heartbeat comes back on the next cycle. try_lock, because
            // a held lock means the cycle is running and alive anyway.
            match heartbeat_state.controller.try_lock() {
                Some(mut controller) => {
                    controller.resume();
                    true
                }
                None => true,
            }
        });

        let freshness_broker = broker.clone();
        watchdog.register_health_check("broker_connection", move || {
            if freshness_broker.is_connected() {
                crate::risk::watchdog::HealthCheckResult::Ok
            } else {
                crate::risk::watchdog::HealthCheckResult::Failed
            }
        });

        watchdog.clone().start();
    }

    // -- 4. Paper price feed ----------------------------------------------
    // A deterministic oscillation around each symbol's base price keeps the
    // paper session alive end-to-end without an exchange connection.
    {
        let feed_broker = broker.clone();
        let feed_state = state.clone();
        let feed_clock = clock.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            let mut tick: u64 = 0;
            loop {
                interval.tick().await;
                tick += 1;

                let symbols: Vec<(String, f64)> = feed_state
                    .pool
                    .all()
                    .into_iter()
                    .map(|l| l.symbol)
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .map(|s| (s, 100.0))
                    .collect();

                for (symbol, base) in symbols {
                    let phase = tick as f64 / 7.0;
                    let price = base * (1.0 + 0.004 * phase.sin() + 0.001 * (phase * 3.1).cos());
                    let open = base * (1.0 + 0.004 * ((tick - 1) as f64 / 7.0).sin());
                    feed_broker.push_price(&symbol, price, 10_000);

                    let candle = Candle {
                        timestamp: feed_clock.now_utc(),
                        open,
                        high: open.max(price) * 1.0003,
                        low: open.min(price) * 0.9997,
                        close: price,
                        volume: 10_000,
                    };
                    feed_state.controller.lock().ingest_candle(&symbol, candle);
                }
            }
        });
    }

    // -- 5. Controller cycle ----------------------------------------------
    {
        let cycle_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                reevaluation_interval.max(1),
            ));
            loop {
                interval.tick().await;
                cycle_state.controller.lock().run_cycle();
                cycle_state.increment_version();
            }
        });
    }

    // -- 6. Execution worker ----------------------------------------------
    {
        let worker_exec = execution.clone();
        let worker_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
            loop {
                interval.tick().await;
                while let Some(command) = worker_exec.execute_next() {
                    if !command.success && command.status == crate::execution::CommandStatus::Failed
                    {
                        worker_state.push_error(format!(
                            "command {} failed: {}",
                            command.command_id, command.last_error
                        ));
                    }
                }
            }
        });
    }

    // -- 7. Status heartbeat ----------------------------------------------
    {
        let snapshot_state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let snapshot = snapshot_state.build_snapshot();
                info!(
                    status = %snapshot.status,
                    mode = %snapshot.mode,
                    market_hours = snapshot.is_market_hours,
                    active_levels = snapshot.active_levels.len(),
                    pool_levels = snapshot.pool.total_levels,
                    queue = snapshot.execution_queue_len,
                    watchdog = %snapshot.watchdog_status,
                    "engine status"
                );
            }
        });
    }

    // -- 8. Event log bridge ----------------------------------------------
    {
        let mut receiver = events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                if let crate::events::ControllerEvent::HardLimitBreached { limit } = event {
                    error!(limit = %limit, "hard limit breached");
                }
            }
        });
    }

    info!("all subsystems running, ctrl-c to stop");

    // -- 9. Graceful shutdown ---------------------------------------------
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    watchdog.stop();

    {
        let controller = state.controller.lock();
        if let Err(e) = controller.state.save(data_dir.join("controller_state.json")) {
            error!(error = %e, "failed to save controller state on shutdown");
        }
    }
    if let Err(e) = pool.save(&pool_path, clock.now_utc()) {
        error!(error = %e, "failed to save level pool on shutdown");
    }

    info!("GridPilot shut down complete");
    Ok(())
}

/// Default demo grid used when no pool snapshot exists on disk.
fn demo_scenarios() -> Vec<ScenarioSpec> {
    let level = |num, side, entry_pct, exit_pct| ScenarioLevel {
        level_num: num,
        side,
        entry_pct,
        exit_pct,
        guardian_pct: None,
        shares: 100,
    };

    vec![ScenarioSpec {
        scenario_id: "demo-1".into(),
        scenario_name: "Demo Grid".into(),
        symbol: "ACME".into(),
        tags: vec!["demo".into()],
        levels: vec![
            level(1, Side::Long, -0.3, 0.5),
            level(2, Side::Long, -0.6, 0.3),
            level(3, Side::Long, -1.0, 0.2),
            level(4, Side::Short, 0.3, -0.5),
            level(5, Side::Short, 0.6, -0.3),
            level(6, Side::Short, 1.0, -0.2),
        ],
    }]
}
