// =============================================================================
// Controller - the decision-execution-safety cycle
// =============================================================================
//
// One cooperative worker drives a cycle every reevaluation interval:
//
//   1. heartbeat to the watchdog
//   2. market-hours gate
//   3. broker event application (fills, rejects, cancels)
//   4. market data refresh per tracked symbol
//   5. per-symbol analysis (volatility, volume, time, pattern fingerprint)
//   6. per-symbol decisions (predict, score, optimize, diff)
//   7. dispatch (AUTONOMOUS executes, ALERT parks confirmable decisions)
//   8. risk check
//   9. alert timeouts
//  10. orphan monitoring and periodic persistence
//
// The controller holds level identities, never references into the pool;
// every cross-read goes through a pool method. It enqueues broker-bound work
// into the execution manager and returns; no lock is held across a broker
// call.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::pattern_matcher::{PatternMatchResult, PatternMatcher, SituationFingerprint};
use crate::analysis::time_profile::TimeProfile;
use crate::analysis::volatility_monitor::VolatilityMonitor;
use crate::analysis::volume_analyzer::{VolumeAnalyzer, VolumeCondition, VolumeTrend};
use crate::broker::{BrokerAdapter, BrokerEvent};
use crate::clock::Clock;
use crate::decision::level_scorer::{LevelScorer, MarketContext, ScorerConfig};
use crate::decision::optimizer::{
    LevelCandidate, LevelOptimizer, OptimizationConstraints, OptimizationStrategy,
};
use crate::decision::predictor::{PredictionContext, PricePredictor};
use crate::events::{ControllerEvent, EventBus, LogLevel};
use crate::execution::{CommandPayload, ExecutionManager, ExecutionPriority};
use crate::level_pool::{LevelKey, LevelPool, LevelStatus};
use crate::market_data::{BarTimeframe, Candle};
use crate::risk::risk_manager::{PositionInfo, RiskLevel, RiskManager};
use crate::risk::watchdog::Watchdog;
use crate::runtime_config::ControllerConfig;
use crate::state::{
    ActiveLevel, ControllerState, DecisionRecord, DecisionType, MarketState, PendingAlert,
};
use crate::types::{ControllerMode, ControllerStatus, OrderType, Side};

/// Cooldown before a deactivated level returns to the available pool.
const LEVEL_COOLDOWN_SECS: i64 = 60;
/// Situations are sampled for pattern learning at most this often per symbol.
const SITUATION_SAMPLE_SECS: i64 = 60;
/// State snapshots are persisted at most this often.
const PERSIST_INTERVAL_SECS: i64 = 30;

/// The orchestrating worker.
pub struct Controller {
    config: ControllerConfig,
    clock: Clock,
    events: EventBus,

    broker: Arc<dyn BrokerAdapter>,
    pool: Arc<LevelPool>,
    execution: Arc<ExecutionManager>,
    risk: Arc<RiskManager>,
    watchdog: Arc<Watchdog>,

    volatility: VolatilityMonitor,
    volume: VolumeAnalyzer,
    time_profile: TimeProfile,
    patterns: PatternMatcher,
    scorer: LevelScorer,
    optimizer: LevelOptimizer,
    predictor: PricePredictor,

    pub state: ControllerState,

    last_decision_time: HashMap<String, DateTime<Utc>>,
    last_situation_record: HashMap<String, DateTime<Utc>>,
    last_pattern_result: HashMap<String, PatternMatchResult>,

    state_path: PathBuf,
    last_persist: Option<DateTime<Utc>>,
    paused: bool,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        clock: Clock,
        events: EventBus,
        broker: Arc<dyn BrokerAdapter>,
        pool: Arc<LevelPool>,
        execution: Arc<ExecutionManager>,
        risk: Arc<RiskManager>,
        watchdog: Arc<Watchdog>,
        data_dir: PathBuf,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string()[..8].to_string();
        let now = clock.now_utc();

        let scorer_config = ScorerConfig {
            min_profit_pct: config.decision.min_profit_margin_pct,
            ..ScorerConfig::default()
        };

        let constraints = OptimizationConstraints {
            max_levels_total: config.risk_limits.max_active_levels as usize,
            max_levels_per_symbol: config.decision.max_levels_per_decision,
            long_short_ratio_min: config.decision.long_short_ratio_min,
            long_short_ratio_max: config.decision.long_short_ratio_max,
            min_distance_between_levels_pct: config.decision.min_level_distance_pct,
            ..OptimizationConstraints::default()
        };

        let mut state = ControllerState::new(session_id, now);
        state.status = ControllerStatus::Stopped;

        let controller = Self {
            volatility: VolatilityMonitor::new(
                config.analysis.atr_period_short,
                config.analysis.atr_period_medium,
                config.analysis.atr_period_long,
            ),
            volume: VolumeAnalyzer::new(
                config.analysis.volume_ma_period,
                config.analysis.volume_spike_threshold,
            ),
            time_profile: TimeProfile::new(clock.clone()),
            patterns: PatternMatcher::new(
                config.analysis.pattern_similarity_threshold,
                config.analysis.pattern_lookback_days,
                clock.clone(),
                data_dir.join("pattern_history"),
            ),
            scorer: LevelScorer::new(scorer_config, clock.clone()),
            optimizer: LevelOptimizer::new(constraints, OptimizationStrategy::Balanced),
            predictor: PricePredictor::new(),
            state,
            last_decision_time: HashMap::new(),
            last_situation_record: HashMap::new(),
            last_pattern_result: HashMap::new(),
            state_path: data_dir.join("controller_state.json"),
            last_persist: None,
            paused: false,
            config,
            clock,
            events,
            broker,
            pool,
            execution,
            risk,
            watchdog,
        };
        controller.register_execution_handlers();
        controller
    }

    /// Wire the execution manager's handlers to the broker adapter. Only
    /// these closures ever touch the broker boundary with side effects.
    fn register_execution_handlers(&self) {
        let broker = Arc::clone(&self.broker);
        self.execution
            .register_handler(crate::execution::CommandType::ActivateLevel, move |payload| {
                let CommandPayload::ActivateLevel {
                    key,
                    symbol,
                    side,
                    entry_price,
                    exit_price,
                    shares,
                    ..
                } = payload
                else {
                    return Err("payload mismatch".into());
                };
                broker
                    .activate_level(&crate::broker::ArmLevelRequest {
                        key: key.clone(),
                        symbol: symbol.clone(),
                        side: *side,
                        entry_price: *entry_price,
                        exit_price: *exit_price,
                        shares: *shares,
                    })
                    .map(|_| format!("level {key} armed"))
                    .map_err(|e| e.to_string())
            });

        let broker = Arc::clone(&self.broker);
        self.execution.register_handler(
            crate::execution::CommandType::DeactivateLevel,
            move |payload| {
                let CommandPayload::DeactivateLevel {
                    key,
                    reason,
                    keep_position,
                } = payload
                else {
                    return Err("payload mismatch".into());
                };
                let result = if *keep_position {
                    broker.deactivate_level_keep_position(key, reason)
                } else {
                    broker.deactivate_level(key)
                };
                result
                    .map(|_| format!("level {key} deactivated"))
                    .map_err(|e| e.to_string())
            },
        );

        let broker = Arc::clone(&self.broker);
        self.execution
            .register_handler(crate::execution::CommandType::StopTrade, move |payload| {
                let CommandPayload::StopTrade { key, .. } = payload else {
                    return Err("payload mismatch".into());
                };
                broker
                    .stop_trade(key)
                    .map(|_| format!("trade {key} stopped"))
                    .map_err(|e| e.to_string())
            });

        let broker = Arc::clone(&self.broker);
        self.execution.register_handler(
            crate::execution::CommandType::ClosePosition,
            move |payload| {
                let CommandPayload::ClosePosition {
                    symbol,
                    quantity,
                    order_type,
                    ..
                } = payload
                else {
                    return Err("payload mismatch".into());
                };
                broker
                    .close_position(symbol, *quantity, *order_type)
                    .map(|_| format!("position {symbol} closed ({quantity})"))
                    .map_err(|e| e.to_string())
            },
        );

        let broker = Arc::clone(&self.broker);
        self.execution.register_handler(
            crate::execution::CommandType::ModifyLevel,
            move |payload| {
                let CommandPayload::ModifyLevel {
                    key,
                    entry_price,
                    exit_price,
                } = payload
                else {
                    return Err("payload mismatch".into());
                };
                // Re-arm with the new prices; the paper semantics of modify.
                let armed = broker
                    .active_levels()
                    .into_iter()
                    .find(|l| &l.key == key)
                    .ok_or_else(|| format!("level {key} is not armed"))?;
                broker.deactivate_level(key).map_err(|e| e.to_string())?;
                broker
                    .activate_level(&crate::broker::ArmLevelRequest {
                        key: key.clone(),
                        symbol: armed.symbol,
                        side: armed.side,
                        entry_price: *entry_price,
                        exit_price: *exit_price,
                        shares: armed.shares,
                    })
                    .map(|_| format!("level {key} modified"))
                    .map_err(|e| e.to_string())
            },
        );

        let broker = Arc::clone(&self.broker);
        self.execution.register_handler(
            crate::execution::CommandType::EmergencyStop,
            move |payload| {
                let CommandPayload::EmergencyStop { reason } = payload else {
                    return Err("payload mismatch".into());
                };
                broker
                    .emergency_stop()
                    .map(|_| format!("emergency stop executed: {reason}"))
                    .map_err(|e| e.to_string())
            },
        );
    }

    // -------------------------------------------------------------------------
    // Lifecycle & external API
    // -------------------------------------------------------------------------

    pub fn start(&mut self) {
        self.set_status(ControllerStatus::Starting, "initialising");
        self.bootstrap();
        self.set_status(ControllerStatus::Running, "ready");
        info!(session = %self.state.session_id, mode = %self.config.mode, "controller started");
    }

    /// Replay historical bars into the analysis stack and load pattern
    /// history for every pooled symbol.
    fn bootstrap(&mut self) {
        for symbol in self.tracked_symbols() {
            let loaded = self.patterns.load_history(&symbol);
            if loaded > 0 {
                info!(symbol = %symbol, records = loaded, "pattern history loaded");
            }

            let bars = self.broker.historical_bars(
                &symbol,
                self.config.analysis.pattern_lookback_days as u32,
                BarTimeframe::Min1,
            );
            if bars.is_empty() {
                debug!(symbol = %symbol, "no historical bars for backfill");
                continue;
            }
            let count = bars.len();
            for bar in bars {
                self.ingest_candle(&symbol, bar);
            }
            info!(symbol = %symbol, candles = count, "historical backfill complete");
        }
    }

    pub fn set_mode(&mut self, mode: ControllerMode) {
        self.config.mode = mode;
        self.log(LogLevel::Info, format!("mode set to {mode}"));
    }

    pub fn mode(&self) -> ControllerMode {
        self.config.mode
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.set_status(ControllerStatus::Paused, "paused");
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.set_status(ControllerStatus::Running, "resumed");
    }

    /// Manual emergency reset: clears the risk flag, leaves the queue's
    /// emergency mode, and returns the controller to RUNNING.
    pub fn reset_emergency(&mut self) {
        self.risk.reset_emergency();
        self.execution.exit_emergency_mode();
        self.state.emergency_stop_triggered = false;
        self.set_status(ControllerStatus::Running, "emergency manually reset");
        self.log(LogLevel::Warning, "emergency manually reset".to_string());
    }

    /// Feed one closed candle into the analysis stack (market-data path).
    pub fn ingest_candle(&mut self, symbol: &str, candle: Candle) {
        let body_pct = candle.body_pct();
        let volume = candle.volume;
        let timestamp = candle.timestamp;
        self.volatility.append_candle(symbol, candle);
        self.volume.append(symbol, volume, body_pct, timestamp);
    }

    // -------------------------------------------------------------------------
    // The cycle
    // -------------------------------------------------------------------------

    /// One full controller cycle. Driven by the periodic worker loop; also
    /// called directly by tests.
    pub fn run_cycle(&mut self) {
        if self.paused {
            return;
        }

        let now = self.clock.now_utc();

        // 1. Heartbeat.
        self.state.update_heartbeat(now);
        self.watchdog.receive_heartbeat();
        self.events.publish(ControllerEvent::Heartbeat { at: now });

        // 2. Market hours.
        self.check_trading_hours();
        if !self.state.is_market_hours || self.config.mode == ControllerMode::Off {
            self.persist_if_due(now);
            return;
        }

        // 3. Broker events first so statuses are fresh for the decisions.
        self.apply_broker_events();

        // Recycle cooled-down levels.
        self.pool.check_cooldowns(LEVEL_COOLDOWN_SECS, now);

        // 4. Market data refresh.
        self.refresh_market_data();

        // 5. Analysis.
        let symbols = self.tracked_symbols();
        for symbol in &symbols {
            self.analyze_symbol(symbol);
        }

        // 6. + 7. Decisions and dispatch.
        for symbol in &symbols {
            self.decide_for_symbol(symbol);
        }

        // 8. Risk.
        self.check_risk();

        // 9. Alert timeouts.
        self.expire_pending_alerts(now);

        // 10. Orphans and persistence.
        self.monitor_orphans();
        self.persist_if_due(now);
    }

    fn check_trading_hours(&mut self) {
        if self.config.trading_hours.ignore_trading_hours {
            if !self.state.is_market_hours {
                self.state.is_market_hours = true;
                self.log(LogLevel::Info, "extended hours mode: trading hours ignored".into());
            }
            return;
        }

        let ny = self.clock.now_ny();
        let t = ny.time();
        let mut open = t >= self.config.trading_hours.market_open
            && t <= self.config.trading_hours.market_close;

        let weekday = chrono::Datelike::weekday(&ny);
        if weekday.number_from_monday() > 5 && !self.config.trading_hours.ignore_weekends {
            open = false;
        }

        if open != self.state.is_market_hours {
            self.state.is_market_hours = open;
            self.log(
                LogLevel::Info,
                if open {
                    "market hours started".into()
                } else {
                    "market hours ended".into()
                },
            );
        }
    }

    fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .pool
            .all()
            .into_iter()
            .map(|l| l.symbol)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for level in self.state.active_levels.values() {
            if !symbols.contains(&level.symbol) {
                symbols.push(level.symbol.clone());
            }
        }
        symbols
    }

    // -------------------------------------------------------------------------
    // Broker events
    // -------------------------------------------------------------------------

    fn apply_broker_events(&mut self) {
        let now = self.clock.now_utc();
        for event in self.broker.poll_events() {
            match event {
                BrokerEvent::EntryFilled {
                    key,
                    fill_price,
                    quantity,
                    ..
                } => {
                    if self.state.active_levels.contains_key(&key) {
                        self.pool.set_status(&key, LevelStatus::InPosition);
                        let record = self.state.active_levels.get_mut(&key).expect("present");
                        record.entry_filled = true;
                        record.has_entry_order = false;
                        record.has_exit_order = true;
                        record.position_qty = quantity;
                        self.log(
                            LogLevel::Success,
                            format!("{key}: entry filled at {fill_price:.2} ({quantity})"),
                        );
                    } else {
                        // Active record is gone but the broker filled anyway:
                        // keep the pool honest, drop nothing silently.
                        error!(key = %key, "entry fill for unknown active level");
                    }
                }
                BrokerEvent::ExitFilled {
                    key, fill_price, ..
                } => {
                    if let Some(record) = self.state.active_levels.remove(&key) {
                        let pnl = match record.side {
                            Side::Long => {
                                (fill_price - record.entry_price) * record.shares as f64
                            }
                            Side::Short => {
                                (record.entry_price - fill_price) * record.shares as f64
                            }
                        };
                        self.state.performance.realized_pnl_today += pnl;
                        self.log(
                            LogLevel::Success,
                            format!("{key}: exit filled at {fill_price:.2}, pnl {pnl:.2}"),
                        );
                    }
                    // The round trip succeeded: record the outcome, cool
                    // down, recycle later.
                    self.pool.mark_deactivated(&key, true, now);
                }
                BrokerEvent::EntryRejected { key, reason } => {
                    // Release the guard and put the level back on the shelf.
                    self.state.active_levels.remove(&key);
                    self.pool.set_status(&key, LevelStatus::Available);
                    self.log(LogLevel::Warning, format!("{key}: entry rejected: {reason}"));
                }
                BrokerEvent::ExitRejected { key, reason } => {
                    if let Some(record) = self.state.active_levels.get_mut(&key) {
                        record.has_exit_order = false;
                    }
                    self.log(LogLevel::Warning, format!("{key}: exit rejected: {reason}"));
                }
                BrokerEvent::OrderCancelled { key, was_entry } => {
                    if was_entry {
                        if let Some(record) = self.state.active_levels.get(&key) {
                            if !record.entry_filled {
                                // Cancel at WAITING recycles the level.
                                self.state.active_levels.remove(&key);
                                self.pool.set_status(&key, LevelStatus::Available);
                            }
                        } else {
                            // Deactivations we initiated ourselves; the pool
                            // transition already happened.
                            debug!(key = %key, "entry cancel for untracked level");
                        }
                    } else if let Some(record) = self.state.active_levels.get_mut(&key) {
                        record.has_exit_order = false;
                    }
                }
                BrokerEvent::Disconnected => {
                    self.log(LogLevel::Warning, "broker disconnected".into());
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Market data & analysis
    // -------------------------------------------------------------------------

    fn refresh_market_data(&mut self) {
        let now = self.clock.now_utc();
        for symbol in self.tracked_symbols() {
            self.state
                .market_states
                .entry(symbol.clone())
                .or_insert_with(|| MarketState::new(symbol.as_str()));

            let Some(quote) = self.broker.market_data(&symbol) else {
                continue;
            };

            let ms = self.state.market_states.get_mut(&symbol).expect("present");
            ms.current_price = quote.price;
            ms.bid = quote.bid;
            ms.ask = quote.ask;
            ms.volume_today = quote.volume;
            if quote.bid > 0.0 && quote.ask > 0.0 {
                ms.spread_pct = (quote.ask - quote.bid) / quote.bid * 100.0;
            }
            ms.last_update = Some(now);

            self.volatility.append_tick(&symbol, quote.price, now);
            self.risk.record_price(&symbol, quote.price, now);
        }
    }

    fn analyze_symbol(&mut self, symbol: &str) {
        let Some(ms) = self.state.market_states.get(symbol).cloned() else {
            return;
        };
        if ms.current_price <= 0.0 {
            return;
        }

        let time_snapshot = self.time_profile.snapshot();

        let Some(vol_snapshot) = self.volatility.snapshot(symbol) else {
            return;
        };
        let volume_snapshot = self.volume.snapshot(symbol);

        // Fold the analysis into the market state; emit on regime flips.
        let old_regime = ms.volatility_regime;
        {
            let ms = self.state.market_states.get_mut(symbol).expect("present");
            ms.atr_short = vol_snapshot.atr_short;
            ms.atr_medium = vol_snapshot.atr_medium;
            ms.atr_long = vol_snapshot.atr_long;
            ms.price_change_1min = vol_snapshot.price_change_1min;
            ms.price_change_5min = vol_snapshot.price_change_5min;
            ms.price_change_15min = vol_snapshot.price_change_15min;
            ms.candle_range_pct = vol_snapshot.avg_candle_range_pct;
            ms.volatility_regime = vol_snapshot.regime;
            if let Some(vs) = &volume_snapshot {
                ms.volume_1min = vs.current_volume;
            }
        }

        if old_regime != vol_snapshot.regime {
            self.events.publish(ControllerEvent::RegimeChanged {
                symbol: symbol.to_string(),
                regime: vol_snapshot.regime,
            });
            self.log(
                LogLevel::Info,
                format!("{symbol}: volatility regime -> {}", vol_snapshot.regime),
            );
        }

        if let Some(vs) = &volume_snapshot {
            if vs.is_spike {
                self.log(
                    LogLevel::Warning,
                    format!("{symbol}: volume spike ({:.1}x normal)", vs.spike_magnitude),
                );
            }
        }

        let fingerprint = SituationFingerprint {
            timestamp: self.clock.now_utc(),
            symbol: symbol.to_string(),
            price_position_in_range: 50.0,
            atr_pct: vol_snapshot.atr_medium,
            volatility_regime: vol_snapshot.regime,
            volume_ratio: volume_snapshot.as_ref().map_or(1.0, |v| v.volume_ratio),
            volume_condition: volume_snapshot
                .as_ref()
                .map_or(VolumeCondition::Normal, |v| v.condition),
            short_term_trend: vol_snapshot.price_change_5min,
            medium_term_trend: vol_snapshot.price_change_15min,
            trading_phase: time_snapshot.phase,
            minutes_since_open: time_snapshot.minutes_since_open,
            last_candle_body_pct: 0.0,
            last_candle_range_pct: vol_snapshot.avg_candle_range_pct,
        };

        let pattern_result = self.patterns.find_similar(&fingerprint);
        self.events.publish(ControllerEvent::MarketAnalysis {
            symbol: symbol.to_string(),
            price: ms.current_price,
            regime: vol_snapshot.regime,
            atr_14: vol_snapshot.atr_medium,
            price_change_5min: vol_snapshot.price_change_5min,
            volume_ratio: volume_snapshot.as_ref().map_or(1.0, |v| v.volume_ratio),
            trading_phase: time_snapshot.phase.to_string(),
        });
        self.last_pattern_result
            .insert(symbol.to_string(), pattern_result);

        // Sampled learning: record the situation and the phase observation.
        let now = self.clock.now_utc();
        let due = self
            .last_situation_record
            .get(symbol)
            .map_or(true, |last| (now - *last).num_seconds() >= SITUATION_SAMPLE_SECS);
        if due {
            self.last_situation_record.insert(symbol.to_string(), now);
            self.patterns.record(fingerprint, None);
            self.time_profile.record_observation(
                symbol,
                vol_snapshot.atr_medium,
                vol_snapshot.avg_candle_range_pct,
            );
        }
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    fn decide_for_symbol(&mut self, symbol: &str) {
        // Anti-overtrading: hourly budget and per-symbol combination hold.
        if self.state.performance.changes_this_hour >= self.config.decision.max_changes_per_hour {
            return;
        }

        let now = self.clock.now_utc();
        if let Some(last) = self.last_decision_time.get(symbol) {
            if (now - *last).num_seconds() < self.config.decision.min_combination_hold_time_sec {
                return;
            }
        }

        let Some(ms) = self.state.market_states.get(symbol).cloned() else {
            return;
        };
        if ms.current_price <= 0.0 {
            return;
        }

        // Volume anomaly gate.
        let (pause, pause_reason) = self.volume.should_pause_trading(symbol);
        if pause {
            self.log(LogLevel::Warning, format!("{symbol}: {pause_reason}"));
            return;
        }

        let available = self.pool.available(Some(symbol));
        if available.is_empty() {
            return;
        }

        let time_snapshot = self.time_profile.snapshot();
        let volume_snapshot = self.volume.snapshot(symbol);
        let pattern = self.last_pattern_result.get(symbol);

        let context = MarketContext {
            current_price: ms.current_price,
            atr_short: ms.atr_short,
            atr_medium: ms.atr_medium,
            atr_long: ms.atr_long,
            volatility_regime: ms.volatility_regime,
            volume_ratio: volume_snapshot.as_ref().map_or(1.0, |v| v.volume_ratio),
            volume_condition: volume_snapshot
                .as_ref()
                .map_or(VolumeCondition::Normal, |v| v.condition),
            trading_phase: time_snapshot.phase,
            caution_level: time_snapshot.caution_level,
            short_term_trend: ms.price_change_5min,
            medium_term_trend: ms.price_change_15min,
            pattern_prediction: pattern.map(|p| p.dominant_pattern),
            pattern_confidence: pattern.map_or(0.0, |p| p.confidence),
        };

        // Predictor view: published for consumers and recorded alongside the
        // decision trail.
        let prediction_context = PredictionContext {
            symbol: symbol.to_string(),
            current_price: ms.current_price,
            timestamp: now,
            atr_short: ms.atr_short,
            atr_medium: ms.atr_medium,
            volatility_regime: ms.volatility_regime,
            volume_ratio: context.volume_ratio,
            volume_condition: context.volume_condition,
            volume_trend: volume_snapshot
                .as_ref()
                .map_or(VolumeTrend::Stable, |v| v.trend),
            price_change_1min: ms.price_change_1min,
            price_change_5min: ms.price_change_5min,
            price_change_15min: ms.price_change_15min,
            trading_phase: time_snapshot.phase,
            minutes_since_open: time_snapshot.minutes_since_open,
            pattern_prediction: context.pattern_prediction,
            pattern_confidence: context.pattern_confidence,
            expected_5min_change: pattern.map_or(0.0, |p| p.expected_5min_change),
            expected_15min_change: pattern.map_or(0.0, |p| p.expected_15min_change),
        };
        let prediction = self.predictor.predict(&prediction_context);
        self.events.publish(ControllerEvent::Prediction {
            symbol: symbol.to_string(),
            dominant_direction: prediction.dominant_direction.to_string(),
            average_confidence: prediction.average_confidence,
            suggested_action: prediction.suggested_action.to_string(),
        });

        let scores = self.scorer.score_levels(&available, &context);
        let recommended = scores.iter().filter(|s| s.is_recommended).count();
        self.events.publish(ControllerEvent::LevelScores {
            symbol: symbol.to_string(),
            scored: scores.len(),
            recommended,
            best_score: scores.first().map_or(0.0, |s| s.total_score),
        });

        let candidates: Vec<LevelCandidate> =
            scores.iter().map(LevelCandidate::from_score).collect();

        let current: Vec<LevelCandidate> = self
            .state
            .active_levels_for_symbol(symbol)
            .into_iter()
            .map(|active| LevelCandidate {
                key: active.key.clone(),
                symbol: active.symbol.clone(),
                side: active.side,
                entry_price: active.entry_price,
                exit_price: active.exit_price,
                score: active.score,
                is_recommended: true,
                distance_pct: 0.0,
                profit_pct: 0.0,
            })
            .collect();

        let (to_add, to_remove) = self.optimizer.suggest_changes(&candidates, &current);

        let mut changed = false;

        for candidate in to_add
            .into_iter()
            .take(self.config.decision.max_levels_per_decision)
        {
            let (allowed, deny_reason) = self.risk.can_open_new_trade(
                symbol,
                candidate.side,
                self.pool.get(&candidate.key).map_or(0, |l| l.shares),
                candidate.entry_price,
            );
            if !allowed {
                self.log(
                    LogLevel::Warning,
                    format!("{}: activation blocked: {deny_reason}", candidate.key),
                );
                continue;
            }

            let decision = DecisionRecord {
                timestamp: now,
                decision_type: DecisionType::ActivateLevel,
                symbol: symbol.to_string(),
                level: Some(candidate.key.clone()),
                reason: format!(
                    "score {:.1} in {} volatility",
                    candidate.score, ms.volatility_regime
                ),
                market_snapshot: Some(ms.clone()),
                executed: false,
                execution_result: None,
                confirmed: None,
            };
            self.dispatch_decision(decision, Some(candidate));
            changed = true;
        }

        for stale in to_remove {
            let Some(active) = self.state.active_levels.get(&stale.key) else {
                continue;
            };
            // A level must stand its minimum hold time before removal.
            if (now - active.activated_at).num_seconds()
                < self.config.decision.min_level_hold_time_sec
            {
                continue;
            }

            let decision = DecisionRecord {
                timestamp: now,
                decision_type: DecisionType::DeactivateLevel,
                symbol: symbol.to_string(),
                level: Some(stale.key.clone()),
                reason: "no longer optimal for the current analysis".into(),
                market_snapshot: None,
                executed: false,
                execution_result: None,
                confirmed: None,
            };
            self.dispatch_decision(decision, None);
            changed = true;
        }

        if changed {
            self.last_decision_time.insert(symbol.to_string(), now);
        }
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Route a decision: execute directly, or park it as a pending alert
    /// when ALERT mode requires confirmation for its type.
    fn dispatch_decision(&mut self, decision: DecisionRecord, candidate: Option<LevelCandidate>) {
        let needs_confirmation = self.config.mode == ControllerMode::Alert
            && match decision.decision_type {
                DecisionType::ActivateLevel => self.config.alerts.confirm_activate_level,
                DecisionType::DeactivateLevel => self.config.alerts.confirm_deactivate_level,
                DecisionType::StopTrade => self.config.alerts.confirm_stop_trade,
                DecisionType::ClosePosition | DecisionType::CloseOrphan => {
                    self.config.alerts.confirm_close_position
                }
                DecisionType::EmergencyStop => self.config.alerts.confirm_emergency_stop,
            };

        if needs_confirmation {
            self.create_alert(decision);
        } else {
            self.execute_decision(decision, candidate);
        }
    }

    fn execute_decision(&mut self, mut decision: DecisionRecord, candidate: Option<LevelCandidate>) {
        match decision.decision_type {
            DecisionType::ActivateLevel => {
                let Some(candidate) = candidate.or_else(|| {
                    // Confirmed alerts re-derive the candidate from the pool.
                    let key = decision.level.clone()?;
                    let level = self.pool.get(&key)?;
                    let price = self
                        .state
                        .market_states
                        .get(&level.symbol)
                        .map(|ms| ms.current_price)?;
                    Some(LevelCandidate {
                        key,
                        symbol: level.symbol.clone(),
                        side: level.key.side,
                        entry_price: price * (1.0 + level.entry_pct / 100.0),
                        exit_price: price * (1.0 + level.exit_pct / 100.0),
                        score: level.last_score,
                        is_recommended: true,
                        distance_pct: 0.0,
                        profit_pct: 0.0,
                    })
                }) else {
                    return;
                };
                self.apply_activation(&candidate, &mut decision);
            }
            DecisionType::DeactivateLevel => {
                if let Some(key) = decision.level.clone() {
                    self.apply_deactivation(&key, &mut decision);
                }
            }
            DecisionType::StopTrade => {
                if let Some(key) = decision.level.clone() {
                    self.apply_stop_trade(&key, &mut decision);
                }
            }
            DecisionType::ClosePosition | DecisionType::CloseOrphan => {
                // Routed directly where they originate (orphan monitor);
                // confirmed alerts land here.
                decision.executed = true;
            }
            DecisionType::EmergencyStop => {
                self.trigger_emergency_stop(decision.reason.clone());
                decision.executed = true;
            }
        }

        self.events.publish(ControllerEvent::DecisionMade {
            decision_type: decision.decision_type.to_string(),
            symbol: decision.symbol.clone(),
            reason: decision.reason.clone(),
            executed: decision.executed,
        });
        if self.config.logging.log_all_decisions {
            self.log(
                LogLevel::Info,
                format!(
                    "decision {} {} executed={}",
                    decision.decision_type, decision.symbol, decision.executed
                ),
            );
        }
        self.state.add_decision(decision);
    }

    fn apply_activation(&mut self, candidate: &LevelCandidate, decision: &mut DecisionRecord) {
        let now = self.clock.now_utc();
        let key = &candidate.key;

        let Some(level) = self.pool.get(key) else {
            error!(key = %key, "activation candidate references a missing pool level");
            decision.execution_result = Some("missing pool level".into());
            return;
        };
        if self.state.active_levels.contains_key(key) {
            decision.execution_result = Some("already active".into());
            return;
        }

        // Fix absolute prices against the live price, then arm.
        let Some(price) = self
            .state
            .market_states
            .get(&level.symbol)
            .map(|ms| ms.current_price)
        else {
            return;
        };
        self.pool.set_prices(key, price);
        self.pool.mark_activated(key, candidate.score, now);
        // Entry order is on its way: the level waits for its fill.
        self.pool.set_status(key, LevelStatus::Waiting);

        self.state.active_levels.insert(
            key.clone(),
            ActiveLevel {
                key: key.clone(),
                scenario_name: level.scenario_name.clone(),
                symbol: level.symbol.clone(),
                side: level.key.side,
                entry_price: candidate.entry_price,
                exit_price: candidate.exit_price,
                shares: level.shares,
                is_active: true,
                has_entry_order: true,
                has_exit_order: false,
                entry_filled: false,
                position_qty: 0,
                activated_at: now,
                score: candidate.score,
                reason: decision.reason.clone(),
            },
        );

        let submitted = self.execution.submit(
            CommandPayload::ActivateLevel {
                key: key.clone(),
                symbol: level.symbol.clone(),
                side: level.key.side,
                entry_price: candidate.entry_price,
                exit_price: candidate.exit_price,
                shares: level.shares,
                score: candidate.score,
                reason: decision.reason.clone(),
            },
            ExecutionPriority::Normal,
        );

        match submitted {
            Some(_) => {
                decision.executed = true;
                decision.execution_result = Some("activation enqueued".into());
                self.state.performance.activations_today += 1;
                self.state.performance.record_change(now);
                self.events.publish(ControllerEvent::ActivateRequested {
                    symbol: level.symbol.clone(),
                    side: level.key.side,
                    level_num: key.level_num,
                });
                self.log(
                    LogLevel::Success,
                    format!("level activated: {} (score {:.1})", key, candidate.score),
                );
            }
            None => {
                // Queue overflow: roll the bookkeeping back and treat this
                // as an analysis-only cycle for the level.
                self.state.active_levels.remove(key);
                self.pool.set_status(key, LevelStatus::Available);
                decision.execution_result = Some("execution queue full".into());
                self.log(LogLevel::Warning, format!("{key}: activation dropped, queue full"));
            }
        }
    }

    fn apply_deactivation(&mut self, key: &LevelKey, decision: &mut DecisionRecord) {
        let now = self.clock.now_utc();
        let Some(active) = self.state.active_levels.get(key).cloned() else {
            decision.execution_result = Some("not active".into());
            return;
        };

        let keep_position = active.entry_filled && active.position_qty != 0;

        self.state.active_levels.remove(key);
        self.pool.mark_deactivated(key, false, now);

        let submitted = self.execution.submit(
            CommandPayload::DeactivateLevel {
                key: key.clone(),
                reason: decision.reason.clone(),
                keep_position,
            },
            ExecutionPriority::Normal,
        );

        if submitted.is_some() {
            decision.executed = true;
            decision.execution_result = Some(if keep_position {
                "deactivation enqueued, position kept as orphan".into()
            } else {
                "deactivation enqueued".into()
            });
            self.state.performance.deactivations_today += 1;
            self.state.performance.record_change(now);
            self.events.publish(ControllerEvent::DeactivateRequested {
                symbol: active.symbol.clone(),
                side: active.side,
                level_num: key.level_num,
            });
            self.log(LogLevel::Info, format!("level deactivated: {key}"));
        } else {
            decision.execution_result = Some("execution queue full".into());
        }
    }

    fn apply_stop_trade(&mut self, key: &LevelKey, decision: &mut DecisionRecord) {
        let Some(active) = self.state.active_levels.get(key) else {
            decision.execution_result = Some("not active".into());
            return;
        };
        if active.entry_filled {
            decision.execution_result =
                Some("entry already filled; stop-trade does not close positions".into());
            return;
        }

        let symbol = active.symbol.clone();
        let side = active.side;
        let submitted = self.execution.submit(
            CommandPayload::StopTrade {
                key: key.clone(),
                reason: decision.reason.clone(),
            },
            ExecutionPriority::High,
        );

        if submitted.is_some() {
            decision.executed = true;
            self.state.performance.trades_stopped_today += 1;
            self.events.publish(ControllerEvent::StopTradeRequested {
                symbol,
                side,
                level_num: key.level_num,
            });
        }
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    fn create_alert(&mut self, decision: DecisionRecord) {
        let now = self.clock.now_utc();
        let alert_id = Uuid::new_v4().to_string()[..8].to_string();
        let expires_at = now + Duration::seconds(self.config.alerts.confirmation_timeout_sec);

        let alert = PendingAlert {
            alert_id: alert_id.clone(),
            created_at: now,
            expires_at,
            decision: decision.clone(),
            confirmed: None,
            response_at: None,
        };

        self.state.pending_alerts.insert(alert_id.clone(), alert);
        self.set_status(ControllerStatus::AlertPending, "awaiting confirmation");

        self.events.publish(ControllerEvent::AlertCreated {
            alert_id,
            decision_type: decision.decision_type.to_string(),
            symbol: decision.symbol.clone(),
            expires_at,
        });
        self.log(
            LogLevel::Warning,
            format!("alert created: {} awaits confirmation", decision.decision_type),
        );
    }

    /// Confirm or reject a pending alert (external API).
    pub fn confirm_alert(&mut self, alert_id: &str, confirmed: bool) {
        let Some(mut alert) = self.state.pending_alerts.remove(alert_id) else {
            return;
        };
        let now = self.clock.now_utc();
        alert.confirmed = Some(confirmed);
        alert.response_at = Some(now);

        let mut decision = alert.decision;
        decision.confirmed = Some(confirmed);

        if confirmed {
            self.execute_decision(decision, None);
        } else {
            self.state.add_decision(decision);
        }

        if self.state.pending_alerts.is_empty()
            && self.state.status == ControllerStatus::AlertPending
        {
            self.set_status(ControllerStatus::Running, "alerts resolved");
        }
    }

    fn expire_pending_alerts(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .state
            .pending_alerts
            .values()
            .filter(|alert| now > alert.expires_at)
            .map(|alert| alert.alert_id.clone())
            .collect();

        for alert_id in expired {
            let Some(alert) = self.state.pending_alerts.remove(&alert_id) else {
                continue;
            };
            // A timeout counts as a rejection.
            let mut decision = alert.decision;
            decision.confirmed = Some(false);
            decision.executed = false;
            self.log(
                LogLevel::Warning,
                format!("alert timeout: {} rejected", decision.decision_type),
            );
            self.state.add_decision(decision);
        }

        if self.state.pending_alerts.is_empty()
            && self.state.status == ControllerStatus::AlertPending
        {
            self.set_status(ControllerStatus::Running, "alerts expired");
        }
    }

    // -------------------------------------------------------------------------
    // Risk
    // -------------------------------------------------------------------------

    fn check_risk(&mut self) {
        let now = self.clock.now_utc();
        let positions = self.broker.open_positions();

        let mut position_map = HashMap::new();
        let mut unrealized = 0.0;
        for (symbol, position) in &positions {
            let price = self
                .state
                .market_states
                .get(symbol)
                .map(|ms| ms.current_price)
                .filter(|p| *p > 0.0)
                .unwrap_or(position.current_price);
            unrealized += (price - position.avg_price) * position.quantity as f64;
            position_map.insert(
                symbol.clone(),
                PositionInfo {
                    size: position.quantity,
                    price,
                },
            );
        }
        self.state.performance.unrealized_pnl = unrealized;

        let realized = self.state.performance.realized_pnl_today;
        let engaged = self.pool.engaged(None).len();

        let snapshot = self
            .risk
            .check_risks(realized, unrealized, &position_map, engaged, now);

        for warning in &snapshot.warnings_active {
            if !self.state.soft_limit_warning {
                self.events.publish(ControllerEvent::SoftLimitWarning {
                    limit: warning.clone(),
                    current_value: snapshot.daily_loss,
                });
            }
        }
        self.state.soft_limit_warning = !snapshot.warnings_active.is_empty();

        for breach in &snapshot.limits_breached {
            self.events.publish(ControllerEvent::HardLimitBreached {
                limit: breach.clone(),
            });
        }

        if snapshot.risk_level == RiskLevel::Emergency && !self.state.emergency_stop_triggered {
            let reason = self
                .risk
                .emergency_reason()
                .unwrap_or_else(|| "risk emergency".into());
            self.trigger_emergency_stop(reason);
        }
    }

    /// One-shot emergency stop: clears the non-critical queue, enqueues the
    /// emergency command, and releases every armed level.
    pub fn trigger_emergency_stop(&mut self, reason: String) {
        if self.state.emergency_stop_triggered {
            return;
        }
        self.state.emergency_stop_triggered = true;

        let now = self.clock.now_utc();
        self.risk.trigger_emergency(reason.clone(), now);
        self.set_status(ControllerStatus::Emergency, &reason);
        self.log(LogLevel::Error, format!("EMERGENCY STOP: {reason}"));

        self.execution.clear_queue(true);
        self.execution.emergency_stop(reason.clone());
        self.events
            .publish(ControllerEvent::EmergencyStopRequested { reason });

        // Every armed level comes down; positions surface as orphans once
        // the broker confirms.
        let keys: Vec<LevelKey> = self.state.active_levels.keys().cloned().collect();
        for key in keys {
            self.state.active_levels.remove(&key);
            self.pool.mark_deactivated(&key, false, now);
        }
    }

    // -------------------------------------------------------------------------
    // Orphans
    // -------------------------------------------------------------------------

    fn monitor_orphans(&mut self) {
        let orphans = self.broker.orphan_positions();
        if orphans.is_empty() {
            return;
        }

        // Refresh orphan marks from the market states we already track.
        let prices: HashMap<String, f64> = orphans
            .iter()
            .filter_map(|orphan| {
                self.state
                    .market_states
                    .get(&orphan.symbol)
                    .filter(|ms| ms.current_price > 0.0)
                    .map(|ms| (orphan.symbol.clone(), ms.current_price))
            })
            .collect();
        self.broker.update_orphan_prices(&prices);

        let min_profit = self.config.decision.min_orphan_profit_cents / 100.0;
        let now = self.clock.now_utc();

        for orphan in self.broker.orphan_positions() {
            let take_profit =
                orphan.profit_per_share >= min_profit || self.broker.should_close_orphan(&orphan);
            if !take_profit {
                continue;
            }

            match self.broker.close_orphan(&orphan.id) {
                Ok(()) => {
                    let total = orphan.profit_per_share * orphan.shares as f64;
                    self.state.performance.positions_closed_today += 1;
                    self.log(
                        LogLevel::Success,
                        format!(
                            "orphan {} closed: {:.4}/share ({:.2} total)",
                            orphan.symbol, orphan.profit_per_share, total
                        ),
                    );
                    self.state.add_decision(DecisionRecord {
                        timestamp: now,
                        decision_type: DecisionType::CloseOrphan,
                        symbol: orphan.symbol.clone(),
                        level: None,
                        reason: format!(
                            "profit per share {:.4} above threshold",
                            orphan.profit_per_share
                        ),
                        market_snapshot: None,
                        executed: true,
                        execution_result: Some("orphan closed".into()),
                        confirmed: None,
                    });
                    self.events.publish(ControllerEvent::ClosePositionRequested {
                        symbol: orphan.symbol,
                        quantity: orphan.shares,
                    });
                }
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        format!("failed to close orphan {}: {e}", orphan.id),
                    );
                }
            }
        }
    }

    /// Manually close part of a position at market (external API). Distinct
    /// from stop-trade by design.
    pub fn request_close_position(&mut self, symbol: &str, quantity: i64, reason: String) {
        let decision = DecisionRecord {
            timestamp: self.clock.now_utc(),
            decision_type: DecisionType::ClosePosition,
            symbol: symbol.to_string(),
            level: None,
            reason: reason.clone(),
            market_snapshot: None,
            executed: false,
            execution_result: None,
            confirmed: None,
        };

        if self.config.mode == ControllerMode::Alert && self.config.alerts.confirm_close_position {
            self.create_alert(decision);
            return;
        }

        let submitted = self.execution.submit(
            CommandPayload::ClosePosition {
                symbol: symbol.to_string(),
                quantity,
                order_type: OrderType::Market,
                reason,
            },
            ExecutionPriority::High,
        );
        let mut decision = decision;
        decision.executed = submitted.is_some();
        self.state.performance.positions_closed_today += u32::from(decision.executed);
        self.events.publish(ControllerEvent::ClosePositionRequested {
            symbol: symbol.to_string(),
            quantity,
        });
        self.state.add_decision(decision);
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    fn persist_if_due(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_persist
            .map_or(true, |last| (now - last).num_seconds() >= PERSIST_INTERVAL_SECS);
        if !due {
            return;
        }
        self.last_persist = Some(now);
        if let Err(e) = self.state.save(&self.state_path) {
            warn!(error = %e, "failed to persist controller state");
        }
    }

    fn set_status(&mut self, status: ControllerStatus, message: &str) {
        self.state.status = status;
        self.state.status_message = message.to_string();
        self.events.publish(ControllerEvent::StatusChanged {
            status,
            message: message.to_string(),
        });
    }

    fn log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => error!("{message}"),
            LogLevel::Warning => warn!("{message}"),
            _ => info!("{message}"),
        }
        self.events.publish(ControllerEvent::Log { level, message });
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::level_pool::{ScenarioLevel, ScenarioSpec};
    use crate::risk::watchdog::WatchdogConfigValues;
    use crate::runtime_config::ControllerConfig;

    struct Harness {
        controller: Controller,
        broker: Arc<PaperBroker>,
        execution: Arc<ExecutionManager>,
        pool: Arc<LevelPool>,
        clock: Clock,
        events: tokio::sync::broadcast::Receiver<ControllerEvent>,
    }

    fn scenario(levels: Vec<ScenarioLevel>) -> ScenarioSpec {
        ScenarioSpec {
            scenario_id: "scn-1".into(),
            scenario_name: "Base Grid".into(),
            symbol: "ACME".into(),
            tags: vec![],
            levels,
        }
    }

    fn long_level(num: u32, entry_pct: f64, exit_pct: f64) -> ScenarioLevel {
        ScenarioLevel {
            level_num: num,
            side: Side::Long,
            entry_pct,
            exit_pct,
            guardian_pct: None,
            shares: 100,
        }
    }

    fn key(num: u32, side: Side) -> LevelKey {
        LevelKey {
            scenario_id: "scn-1".into(),
            level_num: num,
            side,
        }
    }

    /// Tuesday 2024-03-12, 10:45 New York: mid-morning on a weekday.
    fn harness_with(config: ControllerConfig, levels: Vec<ScenarioLevel>) -> Harness {
        let clock = Clock::fixed_ny(2024, 3, 12, 10, 45, 0);
        let events = EventBus::new(1024);
        let receiver = events.subscribe();

        let broker = Arc::new(PaperBroker::new(clock.clone(), 100_000.0));
        let pool = Arc::new(LevelPool::new());
        pool.import_from_scenarios(&[scenario(levels)]);

        let execution = Arc::new(ExecutionManager::new(100, clock.clone()));
        let risk = Arc::new(RiskManager::new(&config.risk_limits));
        let watchdog = Watchdog::new(WatchdogConfigValues::default(), clock.clone());

        let data_dir =
            std::env::temp_dir().join(format!("gridpilot-ctl-{}", uuid::Uuid::new_v4()));

        let mut controller = Controller::new(
            config,
            clock.clone(),
            events,
            broker.clone() as Arc<dyn BrokerAdapter>,
            pool.clone(),
            execution.clone(),
            risk,
            watchdog,
            data_dir,
        );
        controller.state.status = ControllerStatus::Running;

        Harness {
            controller,
            broker,
            execution,
            pool,
            clock,
            events: receiver,
        }
    }

    fn autonomous_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.mode = ControllerMode::Autonomous;
        config
    }

    /// Feed 30 calm one-minute candles around `price` ending now.
    fn feed_calm_candles(h: &mut Harness, price: f64) {
        let end = h.clock.now_utc();
        for i in 0..30 {
            let ts = end - Duration::minutes(30 - i);
            h.controller.ingest_candle(
                "ACME",
                Candle {
                    timestamp: ts,
                    open: price,
                    high: price + 0.05,
                    low: price - 0.05,
                    close: price + 0.01,
                    volume: 10_000,
                },
            );
        }
    }

    fn drain_events(h: &mut Harness) -> Vec<ControllerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn cold_start_selects_the_closer_long_level() {
        let mut h = harness_with(
            autonomous_config(),
            vec![long_level(1, -0.3, 0.5), long_level(2, -0.6, 0.5)],
        );
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();

        // The long-only pool can arm exactly one level under the ratio band,
        // and the closer level wins.
        assert_eq!(h.controller.state.active_levels.len(), 1);
        assert!(h.controller.state.active_levels.contains_key(&key(1, Side::Long)));

        let pending = h.execution.pending_commands();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].command_type(),
            crate::execution::CommandType::ActivateLevel
        );

        // Pool lifecycle: the armed level waits for its entry fill.
        assert_eq!(
            h.pool.get(&key(1, Side::Long)).unwrap().status,
            LevelStatus::Waiting
        );
        assert_eq!(
            h.pool.get(&key(2, Side::Long)).unwrap().status,
            LevelStatus::Available
        );

        let events = drain_events(&mut h);
        assert!(events
            .iter()
            .any(|e| matches!(e, ControllerEvent::ActivateRequested { level_num: 1, .. })));
    }

    #[test]
    fn full_round_trip_recycles_the_level() {
        let mut h = harness_with(autonomous_config(), vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();
        h.execution.execute_all_pending();

        // Entry fill.
        h.broker.push_price("ACME", 99.6, 5_000);
        h.clock.advance(Duration::seconds(30));
        h.controller.run_cycle();

        let k = key(1, Side::Long);
        assert_eq!(h.pool.get(&k).unwrap().status, LevelStatus::InPosition);
        let record = &h.controller.state.active_levels[&k];
        assert!(record.entry_filled);
        assert_eq!(record.position_qty, 100);

        // Exit fill: position closes with profit, level cools down.
        h.broker.push_price("ACME", 100.6, 5_000);
        h.clock.advance(Duration::seconds(30));
        h.controller.run_cycle();

        assert!(h.controller.state.active_levels.is_empty());
        let cooled = h.pool.get(&k).unwrap();
        assert_eq!(cooled.status, LevelStatus::Cooldown);
        assert_eq!(cooled.success_count, 1);
        assert!(h.controller.state.performance.realized_pnl_today > 0.0);

        // After the cooldown the level is available again.
        h.clock.advance(Duration::seconds(LEVEL_COOLDOWN_SECS));
        h.controller.run_cycle();
        assert_eq!(h.pool.get(&k).unwrap().status, LevelStatus::Available);
    }

    #[test]
    fn regime_change_event_fires_exactly_once() {
        let mut h = harness_with(autonomous_config(), vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();
        drain_events(&mut h);

        // Five wide, fast candles flip the regime to HIGH.
        let mut price = 100.0;
        for i in 0..5u32 {
            let open = price;
            price *= 1.012;
            h.controller.ingest_candle(
                "ACME",
                Candle {
                    timestamp: h.clock.now_utc() + Duration::minutes(i as i64),
                    open,
                    high: open * 1.025,
                    low: open,
                    close: price,
                    volume: 12_000,
                },
            );
        }
        h.clock.advance(Duration::minutes(6));
        h.broker.push_price("ACME", price, 5_000);
        h.controller.run_cycle();
        h.clock.advance(Duration::seconds(30));
        h.controller.run_cycle();

        let regime_changes: Vec<_> = drain_events(&mut h)
            .into_iter()
            .filter(|e| matches!(e, ControllerEvent::RegimeChanged { .. }))
            .collect();
        assert_eq!(regime_changes.len(), 1);
        match &regime_changes[0] {
            ControllerEvent::RegimeChanged { symbol, regime } => {
                assert_eq!(symbol, "ACME");
                assert_eq!(*regime, crate::types::VolatilityRegime::High);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn alert_mode_parks_activation_and_times_out_as_rejected() {
        let mut config = ControllerConfig::default();
        config.mode = ControllerMode::Alert;
        config.alerts.confirm_activate_level = true;
        config.alerts.confirmation_timeout_sec = 2;

        let mut h = harness_with(config, vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();

        // Parked, not executed.
        assert_eq!(h.controller.state.pending_alerts.len(), 1);
        assert_eq!(h.controller.state.status, ControllerStatus::AlertPending);
        assert_eq!(h.execution.queue_len(), 0);
        assert!(h.controller.state.active_levels.is_empty());

        // Timeout: purged and recorded as rejected.
        h.clock.advance(Duration::seconds(3));
        h.controller.run_cycle();

        assert!(h.controller.state.pending_alerts.is_empty());
        assert_eq!(h.controller.state.status, ControllerStatus::Running);
        let rejected = h
            .controller
            .state
            .decision_history
            .iter()
            .find(|d| d.decision_type == DecisionType::ActivateLevel)
            .unwrap();
        assert_eq!(rejected.confirmed, Some(false));
        assert!(!rejected.executed);
    }

    #[test]
    fn confirmed_alert_executes_the_activation() {
        let mut config = ControllerConfig::default();
        config.mode = ControllerMode::Alert;
        config.alerts.confirm_activate_level = true;

        let mut h = harness_with(config, vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();
        let alert_id = h
            .controller
            .state
            .pending_alerts
            .keys()
            .next()
            .unwrap()
            .clone();

        h.controller.confirm_alert(&alert_id, true);

        assert!(h.controller.state.pending_alerts.is_empty());
        assert_eq!(h.controller.state.status, ControllerStatus::Running);
        assert_eq!(h.controller.state.active_levels.len(), 1);
        assert_eq!(h.execution.queue_len(), 1);
    }

    #[test]
    fn black_swan_price_feed_triggers_emergency() {
        let mut h = harness_with(autonomous_config(), vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 50.0);

        // 60 stable prices, then a 10% drop inside the window.
        for _ in 0..60 {
            h.broker.push_price("ACME", 50.0, 100);
            h.clock.advance(Duration::seconds(1));
            h.controller.run_cycle();
        }
        h.broker.push_price("ACME", 45.0, 100);
        h.clock.advance(Duration::seconds(1));
        h.controller.run_cycle();

        assert_eq!(h.controller.state.status, ControllerStatus::Emergency);
        assert!(h.controller.state.emergency_stop_triggered);
        assert!(h.execution.is_emergency());

        // Only the emergency command survives in the queue.
        let pending = h.execution.pending_commands();
        assert!(pending
            .iter()
            .all(|c| c.priority == ExecutionPriority::Critical));
        assert!(pending
            .iter()
            .any(|c| c.command_type() == crate::execution::CommandType::EmergencyStop));

        // The emergency handler runs once; the queue is then empty.
        let executed = h.execution.execute_all_pending();
        let emergencies: Vec<_> = executed
            .iter()
            .filter(|c| c.command_type() == crate::execution::CommandType::EmergencyStop)
            .collect();
        assert_eq!(emergencies.len(), 1);
        assert!(emergencies[0].success);

        let events = drain_events(&mut h);
        assert!(events.iter().any(|e| matches!(
            e,
            ControllerEvent::EmergencyStopRequested { reason } if reason.contains("ACME")
        )));
    }

    #[test]
    fn orphan_closes_on_profit_threshold() {
        let mut h = harness_with(autonomous_config(), vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        // Arm and fill the entry.
        h.controller.run_cycle();
        h.execution.execute_all_pending();
        h.broker.push_price("ACME", 99.6, 5_000);
        h.clock.advance(Duration::seconds(30));
        h.controller.run_cycle();

        // Deactivate while in position: the position becomes an orphan.
        let k = key(1, Side::Long);
        let mut decision = DecisionRecord {
            timestamp: h.clock.now_utc(),
            decision_type: DecisionType::DeactivateLevel,
            symbol: "ACME".into(),
            level: Some(k.clone()),
            reason: "manual".into(),
            market_snapshot: None,
            executed: false,
            execution_result: None,
            confirmed: None,
        };
        h.controller.apply_deactivation(&k, &mut decision);
        h.execution.execute_all_pending();
        assert_eq!(h.broker.orphan_positions().len(), 1);

        // Price rises past the three-cent threshold: the orphan closes.
        h.broker.push_price("ACME", 99.76, 5_000);
        h.clock.advance(Duration::seconds(400));
        h.controller.run_cycle();

        assert!(h.broker.orphan_positions().is_empty());
        assert_eq!(h.controller.state.performance.positions_closed_today, 1);
        assert!(h
            .controller
            .state
            .decision_history
            .iter()
            .any(|d| d.decision_type == DecisionType::CloseOrphan));
    }

    #[test]
    fn entry_cancel_recycles_the_level() {
        let mut h = harness_with(autonomous_config(), vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();
        h.execution.execute_all_pending();

        let k = key(1, Side::Long);
        // The broker cancels the pending entry (e.g. end-of-day purge).
        h.broker.stop_trade(&k).unwrap();
        h.clock.advance(Duration::seconds(30));
        h.controller.run_cycle();

        assert!(h.controller.state.active_levels.is_empty());
        assert_eq!(h.pool.get(&k).unwrap().status, LevelStatus::Available);
    }

    #[test]
    fn off_mode_skips_all_work() {
        let mut config = ControllerConfig::default();
        config.mode = ControllerMode::Off;

        let mut h = harness_with(config, vec![long_level(1, -0.3, 0.5)]);
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();

        assert!(h.controller.state.active_levels.is_empty());
        assert_eq!(h.execution.queue_len(), 0);
        // The heartbeat still beats in OFF mode.
        assert!(h.controller.state.last_heartbeat.is_some());
    }

    #[test]
    fn outside_market_hours_no_decisions() {
        let clock_off_hours = Clock::fixed_ny(2024, 3, 12, 7, 0, 0);
        let events = EventBus::new(64);
        let broker = Arc::new(PaperBroker::new(clock_off_hours.clone(), 100_000.0));
        let pool = Arc::new(LevelPool::new());
        pool.import_from_scenarios(&[scenario(vec![long_level(1, -0.3, 0.5)])]);
        let execution = Arc::new(ExecutionManager::new(100, clock_off_hours.clone()));
        let config = autonomous_config();
        let risk = Arc::new(RiskManager::new(&config.risk_limits));
        let watchdog = Watchdog::new(WatchdogConfigValues::default(), clock_off_hours.clone());
        let data_dir = std::env::temp_dir().join(format!("gridpilot-ctl-{}", uuid::Uuid::new_v4()));

        let mut controller = Controller::new(
            config,
            clock_off_hours,
            events,
            broker.clone() as Arc<dyn BrokerAdapter>,
            pool,
            execution.clone(),
            risk,
            watchdog,
            data_dir,
        );

        broker.push_price("ACME", 100.0, 5_000);
        controller.run_cycle();

        assert!(!controller.state.is_market_hours);
        assert_eq!(execution.queue_len(), 0);
    }

    #[test]
    fn hourly_change_budget_limits_decisions() {
        let mut config = autonomous_config();
        config.decision.max_changes_per_hour = 1;
        // Allow immediate re-decisions so only the hourly budget gates.
        config.decision.min_combination_hold_time_sec = 0;

        let mut h = harness_with(
            config,
            vec![long_level(1, -0.3, 0.5), long_level(2, -2.0, 0.5)],
        );
        feed_calm_candles(&mut h, 100.0);
        h.broker.push_price("ACME", 100.0, 5_000);

        h.controller.run_cycle();
        assert_eq!(h.controller.state.performance.changes_this_hour, 1);

        // Second cycle: the budget is spent, nothing further changes.
        h.clock.advance(Duration::seconds(30));
        h.controller.run_cycle();
        assert_eq!(h.controller.state.performance.changes_this_hour, 1);
    }

    #[test]
    fn reset_emergency_restores_running() {
        let mut h = harness_with(autonomous_config(), vec![long_level(1, -0.3, 0.5)]);
        h.controller.trigger_emergency_stop("test emergency".into());
        assert_eq!(h.controller.state.status, ControllerStatus::Emergency);

        h.controller.reset_emergency();
        assert_eq!(h.controller.state.status, ControllerStatus::Running);
        assert!(!h.controller.state.emergency_stop_triggered);
        assert!(!h.execution.is_emergency());
    }
}
