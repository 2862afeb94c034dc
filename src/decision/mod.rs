pub mod level_scorer;
pub mod optimizer;
pub mod predictor;

pub use level_scorer::{LevelScore, LevelScorer, MarketContext, ScoreCategory, ScorerConfig};
pub use optimizer::{
    LevelCandidate, LevelOptimizer, OptimizationConstraints, OptimizationResult,
    OptimizationStrategy,
};
pub use predictor::{
    DirectionBias, MovementPrediction, PredictionContext, PredictionHorizon, PredictionResult,
    PricePredictor, SuggestedAction,
};
