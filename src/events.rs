// =============================================================================
// Controller events - the outbound signal surface
// =============================================================================
//
// Everything a GUI or supervisor needs to observe flows through one typed
// broadcast channel. The bus handle is passed explicitly to the components
// that publish; subscribers attach independently and lagging subscribers
// simply miss events (broadcast semantics), which is acceptable for a status
// feed.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{ControllerStatus, Side, VolatilityRegime};

/// Severity tag for log events forwarded to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
            Self::Success => write!(f, "SUCCESS"),
        }
    }
}

/// Every externally observable lifecycle signal emitted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControllerEvent {
    StatusChanged {
        status: ControllerStatus,
        message: String,
    },
    Heartbeat {
        at: DateTime<Utc>,
    },
    DecisionMade {
        decision_type: String,
        symbol: String,
        reason: String,
        executed: bool,
    },
    AlertCreated {
        alert_id: String,
        decision_type: String,
        symbol: String,
        expires_at: DateTime<Utc>,
    },
    ActivateRequested {
        symbol: String,
        side: Side,
        level_num: u32,
    },
    DeactivateRequested {
        symbol: String,
        side: Side,
        level_num: u32,
    },
    StopTradeRequested {
        symbol: String,
        side: Side,
        level_num: u32,
    },
    ClosePositionRequested {
        symbol: String,
        quantity: i64,
    },
    EmergencyStopRequested {
        reason: String,
    },
    MarketAnalysis {
        symbol: String,
        price: f64,
        regime: VolatilityRegime,
        atr_14: f64,
        price_change_5min: f64,
        volume_ratio: f64,
        trading_phase: String,
    },
    RegimeChanged {
        symbol: String,
        regime: VolatilityRegime,
    },
    LevelScores {
        symbol: String,
        scored: usize,
        recommended: usize,
        best_score: f64,
    },
    Prediction {
        symbol: String,
        dominant_direction: String,
        average_confidence: f64,
        suggested_action: String,
    },
    SoftLimitWarning {
        limit: String,
        current_value: f64,
    },
    HardLimitBreached {
        limit: String,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Broadcast handle for controller events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Silently drops when no subscriber is attached.
    pub fn publish(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.publish(ControllerEvent::Heartbeat { at: Utc::now() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(ControllerEvent::RegimeChanged {
            symbol: "ACME".into(),
            regime: VolatilityRegime::High,
        });
        match rx.try_recv().unwrap() {
            ControllerEvent::RegimeChanged { symbol, regime } => {
                assert_eq!(symbol, "ACME");
                assert_eq!(regime, VolatilityRegime::High);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn events_are_serialisable() {
        let event = ControllerEvent::SoftLimitWarning {
            limit: "DAILY_LOSS".into(),
            current_value: 412.5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("DAILY_LOSS"));
    }
}
