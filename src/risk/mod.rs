pub mod risk_manager;
pub mod watchdog;

pub use risk_manager::{
    LimitType, PositionInfo, RiskAction, RiskEvent, RiskEventKind, RiskLevel, RiskManager,
    RiskSnapshot,
};
pub use watchdog::{HealthCheckResult, Watchdog, WatchdogConfigValues, WatchdogStatus};
