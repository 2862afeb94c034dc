// =============================================================================
// Market data primitives
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV candle. Immutable once appended to an analysis buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Candle {
    /// Absolute range (high - low).
    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Range as a percentage of the open.
    pub fn range_pct(&self) -> f64 {
        if self.open > 0.0 {
            self.range() / self.open * 100.0
        } else {
            0.0
        }
    }

    /// Candle body (close - open). Positive for bullish candles.
    pub fn body(&self) -> f64 {
        self.close - self.open
    }

    /// Body as a percentage of the open.
    pub fn body_pct(&self) -> f64 {
        if self.open > 0.0 {
            self.body() / self.open * 100.0
        } else {
            0.0
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> f64 {
        self.open.min(self.close) - self.low
    }
}

/// Bar timeframes the broker adapter can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BarTimeframe {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Day1,
}

impl BarTimeframe {
    pub fn minutes(self) -> u32 {
        match self {
            Self::Min1 => 1,
            Self::Min5 => 5,
            Self::Min15 => 15,
            Self::Min30 => 30,
            Self::Hour1 => 60,
            Self::Day1 => 1440,
        }
    }
}

impl std::fmt::Display for BarTimeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min1 => write!(f, "1m"),
            Self::Min5 => write!(f, "5m"),
            Self::Min15 => write!(f, "15m"),
            Self::Min30 => write!(f, "30m"),
            Self::Hour1 => write!(f, "1h"),
            Self::Day1 => write!(f, "1d"),
        }
    }
}

/// Cached-recent quote returned by the broker adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketQuote {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: u64,
    pub high: f64,
    pub low: f64,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 12, 14, 45, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn derived_metrics() {
        let c = candle(100.0, 101.0, 99.0, 100.5);
        assert!((c.range() - 2.0).abs() < 1e-10);
        assert!((c.range_pct() - 2.0).abs() < 1e-10);
        assert!((c.body() - 0.5).abs() < 1e-10);
        assert!((c.body_pct() - 0.5).abs() < 1e-10);
        assert!(c.is_bullish());
        assert!((c.upper_wick() - 0.5).abs() < 1e-10);
        assert!((c.lower_wick() - 1.0).abs() < 1e-10);
    }

    #[test]
    fn zero_open_yields_zero_percentages() {
        let c = candle(0.0, 1.0, 0.0, 0.5);
        assert_eq!(c.range_pct(), 0.0);
        assert_eq!(c.body_pct(), 0.0);
    }

    #[test]
    fn timeframe_display() {
        assert_eq!(format!("{}", BarTimeframe::Min1), "1m");
        assert_eq!(format!("{}", BarTimeframe::Hour1), "1h");
        assert_eq!(BarTimeframe::Min15.minutes(), 15);
    }
}
