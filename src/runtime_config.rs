// =============================================================================
// Runtime Configuration - hot-reloadable controller settings with atomic save
// =============================================================================
//
// Every tunable knob of the controller lives here, split into the sections
// the rest of the engine consumes (risk limits, trading hours, analysis,
// decision, alerts, watchdog, logging).
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file. Invalid values are not fatal: each
// violation is logged and the field falls back to its default.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::ControllerMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_max_daily_loss() -> f64 {
    500.0
}

fn default_max_open_positions() -> u32 {
    2000
}

fn default_max_exposure_per_symbol() -> f64 {
    10_000.0
}

fn default_max_active_levels() -> u32 {
    20
}

fn default_soft_limit_threshold() -> f64 {
    0.8
}

fn default_emergency_loss_threshold() -> f64 {
    1_000.0
}

fn default_sudden_drop_threshold() -> f64 {
    5.0
}

fn default_market_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 30, 0).unwrap()
}

fn default_market_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap()
}

fn default_atr_period_short() -> usize {
    5
}

fn default_atr_period_medium() -> usize {
    14
}

fn default_atr_period_long() -> usize {
    50
}

fn default_candle_timeframe_min() -> u32 {
    1
}

fn default_volume_ma_period() -> usize {
    20
}

fn default_volume_spike_threshold() -> f64 {
    2.0
}

fn default_pattern_lookback_days() -> i64 {
    30
}

fn default_pattern_similarity_threshold() -> f64 {
    0.75
}

fn default_reevaluation_interval_sec() -> u64 {
    30
}

fn default_max_levels_per_decision() -> usize {
    10
}

fn default_min_level_distance_pct() -> f64 {
    0.1
}

fn default_long_short_ratio_min() -> f64 {
    0.3
}

fn default_long_short_ratio_max() -> f64 {
    0.7
}

fn default_min_level_hold_time_sec() -> i64 {
    60
}

fn default_min_combination_hold_time_sec() -> i64 {
    300
}

fn default_max_changes_per_hour() -> u32 {
    10
}

fn default_assumed_slippage_pct() -> f64 {
    0.05
}

fn default_min_profit_margin_pct() -> f64 {
    0.1
}

fn default_confirmation_timeout_sec() -> i64 {
    60
}

fn default_heartbeat_interval_sec() -> u64 {
    5
}

fn default_heartbeat_timeout_sec() -> u64 {
    30
}

fn default_min_orphan_profit_cents() -> f64 {
    3.0
}

// =============================================================================
// Config sections
// =============================================================================

/// Hard and soft risk limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    /// Maximum daily loss in account currency before new trades stop.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Maximum open position count (shares across all symbols).
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    /// Maximum exposure per symbol in account currency.
    #[serde(default = "default_max_exposure_per_symbol")]
    pub max_exposure_per_symbol: f64,

    /// Maximum simultaneously active levels.
    #[serde(default = "default_max_active_levels")]
    pub max_active_levels: u32,

    /// Soft limits fire at this fraction of the hard value.
    #[serde(default = "default_soft_limit_threshold")]
    pub soft_limit_threshold: f64,

    /// Loss at which the emergency stop fires regardless of anything else.
    #[serde(default = "default_emergency_loss_threshold")]
    pub emergency_loss_threshold: f64,

    /// Percent move inside the black-swan window that triggers emergency.
    #[serde(default = "default_sudden_drop_threshold")]
    pub sudden_drop_threshold: f64,
}

impl Default for RiskLimitsConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_open_positions: default_max_open_positions(),
            max_exposure_per_symbol: default_max_exposure_per_symbol(),
            max_active_levels: default_max_active_levels(),
            soft_limit_threshold: default_soft_limit_threshold(),
            emergency_loss_threshold: default_emergency_loss_threshold(),
            sudden_drop_threshold: default_sudden_drop_threshold(),
        }
    }
}

/// Trading-hours boundaries (exchange local time) and override flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingHoursConfig {
    #[serde(default = "default_market_open")]
    pub market_open: NaiveTime,

    #[serde(default = "default_market_close")]
    pub market_close: NaiveTime,

    /// Run the cycle regardless of market hours (paper sessions, tests).
    #[serde(default)]
    pub ignore_trading_hours: bool,

    /// Treat weekends as trading days.
    #[serde(default)]
    pub ignore_weekends: bool,
}

impl Default for TradingHoursConfig {
    fn default() -> Self {
        Self {
            market_open: default_market_open(),
            market_close: default_market_close(),
            ignore_trading_hours: false,
            ignore_weekends: false,
        }
    }
}

/// Analysis stack parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_atr_period_short")]
    pub atr_period_short: usize,

    #[serde(default = "default_atr_period_medium")]
    pub atr_period_medium: usize,

    #[serde(default = "default_atr_period_long")]
    pub atr_period_long: usize,

    /// Candle timeframe fed to the analysis stack, in minutes.
    #[serde(default = "default_candle_timeframe_min")]
    pub candle_timeframe_min: u32,

    #[serde(default = "default_volume_ma_period")]
    pub volume_ma_period: usize,

    #[serde(default = "default_volume_spike_threshold")]
    pub volume_spike_threshold: f64,

    #[serde(default = "default_pattern_lookback_days")]
    pub pattern_lookback_days: i64,

    #[serde(default = "default_pattern_similarity_threshold")]
    pub pattern_similarity_threshold: f64,

    /// Controller cycle interval in seconds.
    #[serde(default = "default_reevaluation_interval_sec")]
    pub reevaluation_interval_sec: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            atr_period_short: default_atr_period_short(),
            atr_period_medium: default_atr_period_medium(),
            atr_period_long: default_atr_period_long(),
            candle_timeframe_min: default_candle_timeframe_min(),
            volume_ma_period: default_volume_ma_period(),
            volume_spike_threshold: default_volume_spike_threshold(),
            pattern_lookback_days: default_pattern_lookback_days(),
            pattern_similarity_threshold: default_pattern_similarity_threshold(),
            reevaluation_interval_sec: default_reevaluation_interval_sec(),
        }
    }
}

/// Decision / anti-overtrading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Maximum levels armed per symbol in one decision.
    #[serde(default = "default_max_levels_per_decision")]
    pub max_levels_per_decision: usize,

    /// Minimum entry-price spacing between armed levels, percent.
    #[serde(default = "default_min_level_distance_pct")]
    pub min_level_distance_pct: f64,

    #[serde(default = "default_long_short_ratio_min")]
    pub long_short_ratio_min: f64,

    #[serde(default = "default_long_short_ratio_max")]
    pub long_short_ratio_max: f64,

    /// A level must stay armed at least this long before deactivation.
    #[serde(default = "default_min_level_hold_time_sec")]
    pub min_level_hold_time_sec: i64,

    /// A symbol's level combination must stand at least this long before
    /// the next re-decision.
    #[serde(default = "default_min_combination_hold_time_sec")]
    pub min_combination_hold_time_sec: i64,

    #[serde(default = "default_max_changes_per_hour")]
    pub max_changes_per_hour: u32,

    #[serde(default = "default_assumed_slippage_pct")]
    pub assumed_slippage_pct: f64,

    /// Minimum profit after commission for a level to be worth arming.
    #[serde(default = "default_min_profit_margin_pct")]
    pub min_profit_margin_pct: f64,

    /// Orphan positions auto-close once profit per share reaches this many
    /// cents.
    #[serde(default = "default_min_orphan_profit_cents")]
    pub min_orphan_profit_cents: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            max_levels_per_decision: default_max_levels_per_decision(),
            min_level_distance_pct: default_min_level_distance_pct(),
            long_short_ratio_min: default_long_short_ratio_min(),
            long_short_ratio_max: default_long_short_ratio_max(),
            min_level_hold_time_sec: default_min_level_hold_time_sec(),
            min_combination_hold_time_sec: default_min_combination_hold_time_sec(),
            max_changes_per_hour: default_max_changes_per_hour(),
            assumed_slippage_pct: default_assumed_slippage_pct(),
            min_profit_margin_pct: default_min_profit_margin_pct(),
            min_orphan_profit_cents: default_min_orphan_profit_cents(),
        }
    }
}

/// Which decision types require confirmation in ALERT mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default)]
    pub confirm_activate_level: bool,

    #[serde(default)]
    pub confirm_deactivate_level: bool,

    #[serde(default = "default_true")]
    pub confirm_stop_trade: bool,

    #[serde(default = "default_true")]
    pub confirm_close_position: bool,

    /// Emergency stops always execute immediately.
    #[serde(default)]
    pub confirm_emergency_stop: bool,

    /// Unconfirmed alerts expire (and count as rejected) after this long.
    #[serde(default = "default_confirmation_timeout_sec")]
    pub confirmation_timeout_sec: i64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            confirm_activate_level: false,
            confirm_deactivate_level: false,
            confirm_stop_trade: true,
            confirm_close_position: true,
            confirm_emergency_stop: false,
            confirmation_timeout_sec: default_confirmation_timeout_sec(),
        }
    }
}

/// Watchdog timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,

    #[serde(default = "default_heartbeat_timeout_sec")]
    pub heartbeat_timeout_sec: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            heartbeat_timeout_sec: default_heartbeat_timeout_sec(),
        }
    }
}

/// Logging verbosity for decision and analysis paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub log_all_decisions: bool,

    #[serde(default)]
    pub log_analysis_details: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_all_decisions: true,
            log_analysis_details: false,
        }
    }
}

// =============================================================================
// ControllerConfig
// =============================================================================

/// Top-level runtime configuration for the GridPilot controller.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerConfig {
    /// Operating mode. Defaults to OFF: the engine never trades on boot
    /// without an explicit mode switch.
    #[serde(default)]
    pub mode: ControllerMode,

    #[serde(default)]
    pub risk_limits: RiskLimitsConfig,

    #[serde(default)]
    pub trading_hours: TradingHoursConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub decision: DecisionConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub watchdog: WatchdogConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ControllerConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Missing file is an error so the caller can fall back to defaults with
    /// a warning; a parse failure likewise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        let violations = config.sanitize();
        for violation in &violations {
            warn!(violation = %violation, "invalid config value replaced by default");
        }

        info!(
            path = %path.display(),
            mode = %config.mode,
            "controller config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration using an atomic write (tmp + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "controller config saved (atomic)");
        Ok(())
    }

    /// Replace out-of-range values with their defaults.
    ///
    /// Returns one human-readable line per violation; an empty vector means
    /// the configuration was valid as loaded.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut violations = Vec::new();

        if self.risk_limits.max_daily_loss <= 0.0 {
            violations.push(format!(
                "risk_limits.max_daily_loss must be positive (was {})",
                self.risk_limits.max_daily_loss
            ));
            self.risk_limits.max_daily_loss = default_max_daily_loss();
        }

        if self.risk_limits.max_open_positions == 0 {
            violations.push("risk_limits.max_open_positions must be positive (was 0)".into());
            self.risk_limits.max_open_positions = default_max_open_positions();
        }

        if !(self.risk_limits.soft_limit_threshold > 0.0
            && self.risk_limits.soft_limit_threshold <= 1.0)
        {
            violations.push(format!(
                "risk_limits.soft_limit_threshold must be in (0, 1] (was {})",
                self.risk_limits.soft_limit_threshold
            ));
            self.risk_limits.soft_limit_threshold = default_soft_limit_threshold();
        }

        let ratio_min = self.decision.long_short_ratio_min;
        let ratio_max = self.decision.long_short_ratio_max;
        if !(0.0..=1.0).contains(&ratio_min)
            || !(0.0..=1.0).contains(&ratio_max)
            || ratio_min > ratio_max
        {
            violations.push(format!(
                "decision.long_short_ratio bounds must satisfy 0 <= min <= max <= 1 \
                 (was {ratio_min}..{ratio_max})"
            ));
            self.decision.long_short_ratio_min = default_long_short_ratio_min();
            self.decision.long_short_ratio_max = default_long_short_ratio_max();
        }

        if self.decision.max_changes_per_hour == 0 {
            violations.push("decision.max_changes_per_hour must be positive (was 0)".into());
            self.decision.max_changes_per_hour = default_max_changes_per_hour();
        }

        if self.trading_hours.market_open >= self.trading_hours.market_close {
            violations.push(format!(
                "trading_hours.market_open must precede market_close ({} >= {})",
                self.trading_hours.market_open, self.trading_hours.market_close
            ));
            self.trading_hours.market_open = default_market_open();
            self.trading_hours.market_close = default_market_close();
        }

        if self.analysis.reevaluation_interval_sec == 0 {
            violations.push("analysis.reevaluation_interval_sec must be positive (was 0)".into());
            self.analysis.reevaluation_interval_sec = default_reevaluation_interval_sec();
        }

        if !(0.0..=1.0).contains(&self.analysis.pattern_similarity_threshold) {
            violations.push(format!(
                "analysis.pattern_similarity_threshold must be in [0, 1] (was {})",
                self.analysis.pattern_similarity_threshold
            ));
            self.analysis.pattern_similarity_threshold = default_pattern_similarity_threshold();
        }

        violations
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_knobs() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.mode, ControllerMode::Off);
        assert!((cfg.risk_limits.max_daily_loss - 500.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk_limits.max_open_positions, 2000);
        assert!((cfg.risk_limits.max_exposure_per_symbol - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk_limits.max_active_levels, 20);
        assert!((cfg.risk_limits.soft_limit_threshold - 0.8).abs() < f64::EPSILON);
        assert!((cfg.risk_limits.sudden_drop_threshold - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.analysis.atr_period_short, 5);
        assert_eq!(cfg.analysis.atr_period_medium, 14);
        assert_eq!(cfg.analysis.atr_period_long, 50);
        assert_eq!(cfg.analysis.reevaluation_interval_sec, 30);
        assert_eq!(cfg.decision.max_levels_per_decision, 10);
        assert!((cfg.decision.long_short_ratio_max - 0.7).abs() < f64::EPSILON);
        assert!(!cfg.alerts.confirm_activate_level);
        assert!(cfg.alerts.confirm_stop_trade);
        assert!(cfg.alerts.confirm_close_position);
        assert_eq!(cfg.alerts.confirmation_timeout_sec, 60);
        assert_eq!(cfg.watchdog.heartbeat_interval_sec, 5);
        assert_eq!(cfg.watchdog.heartbeat_timeout_sec, 30);
        assert!(cfg.logging.log_all_decisions);
        assert!(!cfg.logging.log_analysis_details);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: ControllerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, ControllerMode::Off);
        assert_eq!(cfg.risk_limits.max_active_levels, 20);
        assert_eq!(cfg.decision.max_changes_per_hour, 10);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "Autonomous", "risk_limits": { "max_daily_loss": 250.0 } }"#;
        let cfg: ControllerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, ControllerMode::Autonomous);
        assert!((cfg.risk_limits.max_daily_loss - 250.0).abs() < f64::EPSILON);
        assert_eq!(cfg.risk_limits.max_open_positions, 2000);
    }

    #[test]
    fn sanitize_replaces_invalid_values() {
        let mut cfg = ControllerConfig::default();
        cfg.risk_limits.max_daily_loss = -5.0;
        cfg.decision.long_short_ratio_min = 0.9;
        cfg.decision.long_short_ratio_max = 0.2;
        cfg.analysis.reevaluation_interval_sec = 0;

        let violations = cfg.sanitize();

        assert_eq!(violations.len(), 3);
        assert!((cfg.risk_limits.max_daily_loss - 500.0).abs() < f64::EPSILON);
        assert!((cfg.decision.long_short_ratio_min - 0.3).abs() < f64::EPSILON);
        assert!((cfg.decision.long_short_ratio_max - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.analysis.reevaluation_interval_sec, 30);
    }

    #[test]
    fn sanitize_is_quiet_on_valid_config() {
        let mut cfg = ControllerConfig::default();
        assert!(cfg.sanitize().is_empty());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = ControllerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: ControllerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(
            cfg.trading_hours.market_open,
            cfg2.trading_hours.market_open
        );
        assert_eq!(
            cfg.decision.min_combination_hold_time_sec,
            cfg2.decision.min_combination_hold_time_sec
        );
    }
}
