// =============================================================================
// Shared types used across the GridPilot engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a grid level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite side.
    pub fn flipped(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Operating mode of the controller.
///
/// In `Alert` mode, decisions that are configured to require confirmation are
/// parked as pending alerts until the user confirms or the alert times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerMode {
    Off,
    Alert,
    Autonomous,
}

impl Default for ControllerMode {
    fn default() -> Self {
        Self::Off
    }
}

impl std::fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "OFF"),
            Self::Alert => write!(f, "ALERT"),
            Self::Autonomous => write!(f, "AUTONOMOUS"),
        }
    }
}

/// Runtime status of the controller worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerStatus {
    Stopped,
    Starting,
    Running,
    Paused,
    AlertPending,
    Emergency,
    Error,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl std::fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::AlertPending => write!(f, "ALERT_PENDING"),
            Self::Emergency => write!(f, "EMERGENCY"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Volatility regime classification for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolatilityRegime {
    High,
    Medium,
    Low,
    Unknown,
}

impl Default for VolatilityRegime {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Order type for position-closing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Typed error taxonomy for the controller core.
///
/// Analysis errors never cross the cycle boundary and execution errors never
/// cross the execution manager boundary; what remains are the conditions a
/// caller can actually react to.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Connectivity hiccup or missing acknowledgement on a broker call.
    /// Retried by the execution manager.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// Broker reported a hard rejection for an order.
    #[error("order rejected: {0}")]
    OrderRejected(String),

    /// Invalid configuration detected at load time.
    #[error("config error: {0}")]
    Config(String),

    /// Data freshness check failed; trading is held until resolved.
    #[error("stale data: {0}")]
    StaleData(String),

    /// A hard risk limit was breached.
    #[error("limit breach: {0}")]
    LimitBreach(String),

    /// Emergency stop is active and blocks the requested action.
    #[error("emergency active: {0}")]
    Emergency(String),

    /// Internal bookkeeping contradiction, e.g. an active level record that
    /// references a missing pool entry. Logged and dropped, never fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_display_and_flip() {
        assert_eq!(format!("{}", Side::Long), "LONG");
        assert_eq!(format!("{}", Side::Short), "SHORT");
        assert_eq!(Side::Long.flipped(), Side::Short);
        assert_eq!(Side::Short.flipped(), Side::Long);
    }

    #[test]
    fn mode_defaults_to_off() {
        assert_eq!(ControllerMode::default(), ControllerMode::Off);
    }

    #[test]
    fn status_display_uppercase() {
        assert_eq!(format!("{}", ControllerStatus::AlertPending), "ALERT_PENDING");
        assert_eq!(format!("{}", ControllerStatus::Emergency), "EMERGENCY");
    }

    #[test]
    fn regime_serde_roundtrip() {
        let json = serde_json::to_string(&VolatilityRegime::High).unwrap();
        let back: VolatilityRegime = serde_json::from_str(&json).unwrap();
        assert_eq!(back, VolatilityRegime::High);
    }
}
