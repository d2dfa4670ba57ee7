use crate::analysis::{AnalysisResult, OverlapAnalyzer};
use crate::cache::{AnalysisCache, CategoryReport};
use crate::config::AppConfig;
use crate::enrichment::{ChainEnricher, FeatureEnricher};
use crate::error::Error;
use crate::progress::{ProgressReporter, ProgressTracker, SilentReporter};
use crate::storage::models::{
    AnalysisProgress, ConsolidationRecommendation, JobStatus, RecommendationStatus,
};
use crate::storage::{now_timestamp, Database};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Handle for an analysis started in the background.
pub struct JobTicket {
    pub company_id: String,
    /// `None` when there was nothing to analyze.
    pub job_id: Option<String>,
    pub items_total: i64,
    handle: Option<JoinHandle<Result<AnalysisResult, Error>>>,
}

impl JobTicket {
    /// Block until the background job finishes.
    pub fn join(self) -> Result<AnalysisResult, Error> {
        match self.handle {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Other("analysis worker panicked".into()))?,
            None => Ok(AnalysisResult::empty(&self.company_id)),
        }
    }
}

/// The operations exposed to callers: trigger, poll, cancel, read results,
/// review recommendations.
pub struct RedundancyService {
    config: AppConfig,
    db_path: PathBuf,
    enricher: Option<Arc<dyn FeatureEnricher>>,
}

impl RedundancyService {
    pub fn new(config: AppConfig) -> Result<Self, Error> {
        config.validate()?;
        let enricher: Option<Arc<dyn FeatureEnricher>> = if config.enrichment.enabled {
            Some(Arc::new(ChainEnricher::from_config(&config.enrichment)?))
        } else {
            None
        };
        Ok(Self {
            db_path: PathBuf::from(&config.database_path),
            config,
            enricher,
        })
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn FeatureEnricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// A fresh connection to the shared store. Each call site owns its own.
    pub fn open_db(&self) -> Result<Database, Error> {
        Ok(Database::open(&self.db_path)?)
    }

    fn tracker<'d>(&self, db: &'d Database) -> ProgressTracker<'d> {
        ProgressTracker::new(
            db,
            self.config.max_job_duration(),
            self.config.progress_retention(),
        )
    }

    /// Create the progress record and run the job on a background thread.
    /// Conflicts with a running job are reported before anything starts.
    pub fn start_analysis(&self, company_id: &str) -> Result<JobTicket, Error> {
        let db = self.open_db()?;
        let prepared = {
            let mut analyzer = OverlapAnalyzer::new(&db, &self.config);
            if let Some(enricher) = &self.enricher {
                analyzer = analyzer.with_enricher(enricher.as_ref());
            }
            analyzer.prepare(company_id)?
        };

        let Some(job) = prepared else {
            return Ok(JobTicket {
                company_id: company_id.to_string(),
                job_id: None,
                items_total: 0,
                handle: None,
            });
        };

        let job_id = job.progress.job_id.clone();
        let items_total = job.progress.items_total;
        let config = self.config.clone();
        let db_path = self.db_path.clone();
        let enricher = self.enricher.clone();
        let thread_job_id = job_id.clone();

        let handle = std::thread::Builder::new()
            .name(format!("analysis-{company_id}"))
            .spawn(move || {
                let mut analyzer = OverlapAnalyzer::new(&db, &config).with_db_path(db_path);
                if let Some(enricher) = &enricher {
                    analyzer = analyzer.with_enricher(enricher.as_ref());
                }
                let result = analyzer.execute(job, &SilentReporter);
                if let Err(e) = &result {
                    error!(job_id = %thread_job_id, "Background analysis failed: {}", e);
                }
                result
            })?;

        info!(company_id, job_id = %job_id, items_total, "Analysis started in background");
        Ok(JobTicket {
            company_id: company_id.to_string(),
            job_id: Some(job_id),
            items_total,
            handle: Some(handle),
        })
    }

    /// Run the analyzer (and the recommendation pass) in the calling thread.
    pub fn run_analysis(
        &self,
        company_id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<AnalysisResult, Error> {
        let db = self.open_db()?;
        let mut analyzer = OverlapAnalyzer::new(&db, &self.config).with_db_path(&self.db_path);
        if let Some(enricher) = &self.enricher {
            analyzer = analyzer.with_enricher(enricher.as_ref());
        }
        analyzer.analyze_company(company_id, reporter)
    }

    pub fn progress(&self, company_id: &str) -> Result<AnalysisProgress, Error> {
        let db = self.open_db()?;
        self.tracker(&db).get_progress(company_id)
    }

    /// Idempotent; succeeds whether or not a job is running.
    pub fn cancel(&self, company_id: &str) -> Result<(), Error> {
        let db = self.open_db()?;
        self.tracker(&db).request_cancellation(company_id)
    }

    pub fn categories(
        &self,
        company_id: &str,
        include_pairs: bool,
    ) -> Result<Vec<CategoryReport>, Error> {
        let db = self.open_db()?;
        AnalysisCache::new(&db)
            .with_priority(self.config.priority)
            .category_reports(company_id, include_pairs)
    }

    /// Return authoritative results, re-running the analysis first when any
    /// category is stale. While another job is running the cached view is
    /// returned as-is, with its stale flags.
    pub fn ensure_fresh(
        &self,
        company_id: &str,
        include_pairs: bool,
        reporter: &dyn ProgressReporter,
    ) -> Result<Vec<CategoryReport>, Error> {
        let stale = {
            let db = self.open_db()?;
            AnalysisCache::new(&db).stale_categories(company_id)?
        };
        if !stale.is_empty() {
            info!(company_id, stale = ?stale, "Stale categories, re-running analysis");
            match self.run_analysis(company_id, reporter) {
                Ok(result) if result.status == JobStatus::Cancelled => return Err(Error::Cancelled),
                Ok(result) if result.status == JobStatus::Failed => {
                    return Err(Error::Other(
                        result.error.unwrap_or_else(|| "analysis failed".to_string()),
                    ))
                }
                Ok(_) => {}
                Err(Error::Conflict { job_id, .. }) => {
                    warn!(company_id, job_id = %job_id, "Analysis already running; serving cached results");
                }
                Err(e) => return Err(e),
            }
        }
        self.categories(company_id, include_pairs)
    }

    pub fn recommendations(
        &self,
        company_id: &str,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<ConsolidationRecommendation>, Error> {
        let db = self.open_db()?;
        Ok(db.get_recommendations(company_id, status)?)
    }

    /// Accept or dismiss a recommendation. No other status, and no other field,
    /// can be changed by callers.
    pub fn set_recommendation_status(
        &self,
        id: i64,
        status: RecommendationStatus,
    ) -> Result<ConsolidationRecommendation, Error> {
        let db = self.open_db()?;
        let current = db
            .get_recommendation(id)?
            .ok_or_else(|| Error::NotFound(format!("recommendation {id}")))?;
        if status == RecommendationStatus::Pending {
            return Err(Error::InvalidTransition {
                id,
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }
        if current.status != status {
            db.set_recommendation_status_row(id, status, &now_timestamp())?;
            info!(id, from = %current.status, to = %status, "Recommendation reviewed");
        }
        db.get_recommendation(id)?
            .ok_or_else(|| Error::NotFound(format!("recommendation {id}")))
    }
}
