use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Analysis already running for company {company_id} (job {job_id})")]
    Conflict { company_id: String, job_id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition for recommendation {id}: {from} -> {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("Feature tag {tag_id} is referenced by analysis results and cannot be renamed")]
    TagImmutable { tag_id: i64 },

    #[error("Feature enrichment unavailable: {0}")]
    Dependency(String),

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that only degrade data quality and must not abort a job.
    pub fn is_dependency(&self) -> bool {
        matches!(self, Error::Dependency(_))
    }
}
