pub mod analyzer;
pub mod overlap;
pub mod recommend;

pub use analyzer::{
    AnalysisResult, CategoryFailure, CategoryOutcome, CategoryState, OverlapAnalyzer, PreparedJob,
};
pub use recommend::{RecommendationEngine, RecommendationOptions};
