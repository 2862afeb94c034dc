pub mod pattern_matcher;
pub mod time_profile;
pub mod volatility_monitor;
pub mod volume_analyzer;

pub use pattern_matcher::{
    HistoricalOutcome, MovementPattern, PatternMatchResult, PatternMatcher, SituationFingerprint,
};
pub use time_profile::{TimeProfile, TimeProfileSnapshot, TradingPhase};
pub use volatility_monitor::{VolatilityMonitor, VolatilitySnapshot};
pub use volume_analyzer::{VolumeAnalyzer, VolumeCondition, VolumeSnapshot, VolumeTrend};
