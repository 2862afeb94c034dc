// =============================================================================
// Clock - the single time source for the engine
// =============================================================================
//
// Every component that cares about "now" (time profile, pattern lookback,
// cooldowns, alert deadlines) reads it from a Clock handle instead of calling
// the system clock directly. In production the handle is a thin wrapper over
// `Utc::now()`; in tests it is a frozen instant that can be set or advanced,
// which makes phase boundaries and timeout paths deterministic.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;
use parking_lot::RwLock;

/// Cheap-to-clone time source handle.
#[derive(Clone)]
pub struct Clock {
    manual: Option<Arc<RwLock<DateTime<Utc>>>>,
}

impl Clock {
    /// System clock. Used by the live engine.
    pub fn system() -> Self {
        Self { manual: None }
    }

    /// Frozen clock starting at `start`. Time only moves via `set` / `advance`.
    pub fn fixed(start: DateTime<Utc>) -> Self {
        Self {
            manual: Some(Arc::new(RwLock::new(start))),
        }
    }

    /// Frozen clock initialised from a New York wall-clock time.
    pub fn fixed_ny(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        let ny = New_York
            .with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .expect("unambiguous NY time");
        Self::fixed(ny.with_timezone(&Utc))
    }

    /// Current instant in UTC.
    pub fn now_utc(&self) -> DateTime<Utc> {
        match &self.manual {
            Some(t) => *t.read(),
            None => Utc::now(),
        }
    }

    /// Current instant projected to the exchange zone (America/New_York).
    pub fn now_ny(&self) -> DateTime<Tz> {
        self.now_utc().with_timezone(&New_York)
    }

    /// Move a frozen clock to an absolute instant. No-op on a system clock.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Some(t) = &self.manual {
            *t.write() = to;
        }
    }

    /// Advance a frozen clock. No-op on a system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(t) = &self.manual {
            let mut guard = t.write();
            *guard += by;
        }
    }

    /// True when this handle is frozen (test mode).
    pub fn is_fixed(&self) -> bool {
        self.manual.is_some()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.manual {
            Some(t) => write!(f, "Clock::fixed({})", t.read()),
            None => write!(f, "Clock::system"),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}
