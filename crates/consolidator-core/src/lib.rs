pub mod analysis;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod progress;
pub mod service;
pub mod storage;

pub use analysis::{AnalysisResult, CategoryFailure, CategoryState, OverlapAnalyzer};
pub use cache::{AnalysisCache, CategoryReport};
pub use catalog::FeatureCatalog;
pub use config::AppConfig;
pub use error::Error;
pub use progress::{ProgressReporter, ProgressTracker, SilentReporter};
pub use service::{JobTicket, RedundancyService};
pub use storage::Database;
