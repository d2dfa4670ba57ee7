use crate::analysis::overlap::{self, round_to};
use crate::analysis::recommend::{RecommendationEngine, RecommendationInput, RecommendationOptions};
use crate::catalog::{FeatureCatalog, SOURCE_ENRICHMENT};
use crate::config::AppConfig;
use crate::enrichment::FeatureEnricher;
use crate::error::Error;
use crate::progress::{ProgressReporter, ProgressTracker, BUDGET_EXCEEDED};
use crate::storage::models::{
    ActivityKind, AnalysisProgress, CategorySummary, FeatureTag, JobStatus, OverlapPair,
    SoftwareProduct, Stage, SummaryStatus,
};
use crate::storage::{now_timestamp, Database};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const STOP_NONE: u8 = 0;
const STOP_CANCELLED: u8 = 1;
const STOP_BUDGET: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryState {
    Completed,
    /// Interrupted mid-category; the pairs computed so far were persisted.
    Partial,
    /// Never started because the job was stopped first.
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CategoryOutcome {
    pub category: String,
    pub state: CategoryState,
    pub total_software_count: usize,
    pub pairs: Vec<OverlapPair>,
    pub redundant_pairs_count: usize,
    pub total_potential_savings: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryFailure {
    pub category: String,
    pub error: String,
}

#[derive(Debug)]
pub struct AnalysisResult {
    pub company_id: String,
    /// `None` when there was nothing to analyze and no job was created.
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub items_total: i64,
    pub items_processed: i64,
    pub categories: Vec<CategoryOutcome>,
    pub failed_categories: Vec<CategoryFailure>,
    pub enrichment_failures: usize,
    pub recommendations_written: usize,
    pub error: Option<String>,
    pub duration: Duration,
}

impl AnalysisResult {
    pub(crate) fn empty(company_id: &str) -> Self {
        Self {
            company_id: company_id.to_string(),
            job_id: None,
            status: JobStatus::Completed,
            items_total: 0,
            items_processed: 0,
            categories: Vec::new(),
            failed_categories: Vec::new(),
            enrichment_failures: 0,
            recommendations_written: 0,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.job_id.is_none()
    }

    pub fn pairs(&self) -> impl Iterator<Item = &OverlapPair> {
        self.categories.iter().flat_map(|c| c.pairs.iter())
    }

    pub fn total_potential_savings(&self) -> f64 {
        round_to(
            self.categories
                .iter()
                .filter(|c| c.state == CategoryState::Completed)
                .map(|c| c.total_potential_savings)
                .sum(),
            2,
        )
    }
}

/// Consistent read of everything one run compares.
#[derive(Debug)]
struct Snapshot {
    products: Vec<SoftwareProduct>,
    features: BTreeMap<String, BTreeSet<FeatureTag>>,
    revisions: HashMap<String, i64>,
}

impl Snapshot {
    fn load(db: &Database, company_id: &str) -> Result<Self, Error> {
        let tx = db.connection().unchecked_transaction()?;
        let products = db.get_active_products(company_id)?;
        let features = db.get_company_features(company_id)?;
        let revisions = db.get_category_revisions(company_id)?;
        tx.commit()?;
        Ok(Self {
            products,
            features,
            revisions,
        })
    }

    fn features_of(&self, software_id: &str) -> Option<&BTreeSet<FeatureTag>> {
        self.features.get(software_id)
    }

    fn has_feature_data(&self) -> bool {
        self.products
            .iter()
            .any(|p| self.features_of(&p.id).is_some_and(|f| !f.is_empty()))
    }

    fn lacking_features(&self) -> Vec<&SoftwareProduct> {
        self.products
            .iter()
            .filter(|p| self.features_of(&p.id).map_or(true, |f| f.is_empty()))
            .collect()
    }

    /// Categories with at least one active product; products keep id order.
    fn category_plans(&self) -> Vec<CategoryPlan<'_>> {
        let mut grouped: BTreeMap<&str, Vec<&SoftwareProduct>> = BTreeMap::new();
        for product in &self.products {
            grouped.entry(product.category.as_str()).or_default().push(product);
        }
        grouped
            .into_iter()
            .map(|(name, products)| CategoryPlan {
                name,
                revision: self.revisions.get(name).copied().unwrap_or(0),
                products,
            })
            .collect()
    }

    fn pair_total(&self) -> usize {
        self.category_plans()
            .iter()
            .map(|plan| overlap::pair_count(plan.products.len()))
            .sum()
    }
}

struct CategoryPlan<'s> {
    name: &'s str,
    revision: i64,
    products: Vec<&'s SoftwareProduct>,
}

/// A job whose progress record exists and which is ready to execute,
/// possibly on another thread.
pub struct PreparedJob {
    pub progress: AnalysisProgress,
    snapshot: Snapshot,
    started: Instant,
}

/// Shared by every category worker of one job.
struct JobContext<'a> {
    company_id: &'a str,
    job_id: &'a str,
    threshold: f64,
    budget: Duration,
    started: Instant,
    stop: AtomicU8,
    reporter: &'a dyn ProgressReporter,
    features: &'a BTreeMap<String, BTreeSet<FeatureTag>>,
    empty: BTreeSet<FeatureTag>,
}

impl JobContext<'_> {
    fn stop_reason(&self) -> u8 {
        self.stop.load(Ordering::SeqCst)
    }

    fn stopped(&self) -> bool {
        self.stop_reason() != STOP_NONE
    }

    fn request_stop(&self, reason: u8) {
        let _ = self
            .stop
            .compare_exchange(STOP_NONE, reason, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn features_of(&self, software_id: &str) -> &BTreeSet<FeatureTag> {
        self.features.get(software_id).unwrap_or(&self.empty)
    }

    /// Cooperative stop check, run after every pair.
    fn checkpoint(&self, tracker: &ProgressTracker<'_>) {
        if self.started.elapsed() > self.budget {
            self.request_stop(STOP_BUDGET);
            return;
        }
        match tracker.is_cancellation_requested(self.job_id) {
            Ok(true) => self.request_stop(STOP_CANCELLED),
            Ok(false) => {}
            Err(e) => warn!(job_id = self.job_id, "Failed to read cancellation flag: {}", e),
        }
    }
}

pub struct OverlapAnalyzer<'a> {
    db: &'a Database,
    db_path: Option<PathBuf>,
    config: &'a AppConfig,
    enricher: Option<&'a dyn FeatureEnricher>,
}

impl<'a> OverlapAnalyzer<'a> {
    pub fn new(db: &'a Database, config: &'a AppConfig) -> Self {
        Self {
            db,
            db_path: None,
            config,
            enricher: None,
        }
    }

    /// Path of the shared store. Required for parallel category workers,
    /// each of which opens its own connection.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_enricher(mut self, enricher: &'a dyn FeatureEnricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    fn tracker<'d>(&self, db: &'d Database) -> ProgressTracker<'d> {
        ProgressTracker::new(
            db,
            self.config.max_job_duration(),
            self.config.progress_retention(),
        )
    }

    /// Run a full analysis for a company in the calling thread.
    pub fn analyze_company(
        &self,
        company_id: &str,
        reporter: &dyn ProgressReporter,
    ) -> Result<AnalysisResult, Error> {
        match self.prepare(company_id)? {
            Some(job) => self.execute(job, reporter),
            None => Ok(AnalysisResult::empty(company_id)),
        }
    }

    /// Read the inventory snapshot and create the `running` progress record.
    ///
    /// Returns `None` (and creates no record) when the company has nothing to
    /// compare. Read failures abort here, before any record exists.
    pub fn prepare(&self, company_id: &str) -> Result<Option<PreparedJob>, Error> {
        let snapshot = Snapshot::load(self.db, company_id)?;
        let can_enrich = self.enricher.is_some() && !snapshot.lacking_features().is_empty();
        if snapshot.products.is_empty() || (!snapshot.has_feature_data() && !can_enrich) {
            info!(company_id, "No active products with feature data; nothing to analyze");
            return Ok(None);
        }

        let items_total = snapshot.pair_total() as i64;
        let progress = self.tracker(self.db).begin(company_id, items_total)?;
        Ok(Some(PreparedJob {
            progress,
            snapshot,
            started: Instant::now(),
        }))
    }

    /// Run a prepared job to a terminal state. An error raised after the
    /// progress record exists fails the job before it is returned, so the
    /// record never stays `running`.
    pub fn execute(
        &self,
        job: PreparedJob,
        reporter: &dyn ProgressReporter,
    ) -> Result<AnalysisResult, Error> {
        let company_id = job.progress.company_id.clone();
        let job_id = job.progress.job_id.clone();
        let started = job.started;

        match self.run_job(job, reporter) {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(company_id = %company_id, job_id = %job_id, "Analysis job failed: {}", e);
                if let Err(record_err) = self.tracker(self.db).fail(&job_id, &e.to_string()) {
                    error!(job_id = %job_id, "Failed to record job failure: {}", record_err);
                }
                reporter.on_analysis_complete(JobStatus::Failed, started.elapsed().as_secs_f64());
                Err(e)
            }
        }
    }

    fn run_job(
        &self,
        job: PreparedJob,
        reporter: &dyn ProgressReporter,
    ) -> Result<AnalysisResult, Error> {
        let PreparedJob {
            progress,
            mut snapshot,
            started,
        } = job;
        let company_id = progress.company_id.as_str();
        let job_id = progress.job_id.as_str();
        let tracker = self.tracker(self.db);

        reporter.on_analysis_start(job_id, progress.items_total as usize);

        let mut enrichment_failures = 0;
        if let Some(enricher) = self.enricher {
            let (failures, enriched_any) = self.enrich_missing(&snapshot, job_id, enricher, reporter)?;
            enrichment_failures = failures;
            if enriched_any {
                snapshot = Snapshot::load(self.db, company_id)
                    .map_err(|e| Error::Other(format!("failed to reload inventory: {e}")))?;
                tracker.set_items_total(job_id, snapshot.pair_total() as i64)?;
            }
        }

        let plans = if snapshot.has_feature_data() {
            snapshot.category_plans()
        } else {
            info!(company_id, job_id, "No feature data after enrichment");
            Vec::new()
        };

        tracker.set_stage(job_id, Stage::Comparing, None, "Comparing products")?;
        let ctx = JobContext {
            company_id,
            job_id,
            threshold: self.config.redundancy_threshold,
            budget: self.config.max_job_duration(),
            started,
            stop: AtomicU8::new(STOP_NONE),
            reporter,
            features: &snapshot.features,
            empty: BTreeSet::new(),
        };

        let (budget, retention) = (
            self.config.max_job_duration(),
            self.config.progress_retention(),
        );
        let outcomes: Vec<CategoryOutcome> = match &self.db_path {
            // Connections are not shareable across threads; each worker opens its own.
            Some(path) if self.config.parallel_categories && plans.len() > 1 => plans
                .par_iter()
                .map(|plan| match Database::open(path) {
                    Ok(worker_db) => {
                        let worker_tracker = ProgressTracker::new(&worker_db, budget, retention);
                        process_category(&worker_db, &ctx, plan, worker_tracker)
                    }
                    Err(e) => CategoryOutcome::failed(plan, format!("failed to open database: {e}")),
                })
                .collect(),
            _ => plans
                .iter()
                .map(|plan| process_category(self.db, &ctx, plan, self.tracker(self.db)))
                .collect(),
        };

        let mut failed_categories = Vec::new();
        for outcome in outcomes.iter().filter(|o| o.state == CategoryState::Failed) {
            let error = outcome.error.clone().unwrap_or_default();
            if let Err(e) = self.db.mark_category_failed(company_id, &outcome.category, &error) {
                error!(category = %outcome.category, "Failed to record category failure: {}", e);
            }
            failed_categories.push(CategoryFailure {
                category: outcome.category.clone(),
                error,
            });
        }
        let degraded: Vec<String> = failed_categories.iter().map(|f| f.category.clone()).collect();

        tracker.set_stage(job_id, Stage::Summarizing, None, "Updating category summaries")?;
        let active: BTreeSet<&str> = plans.iter().map(|p| p.name).collect();
        self.prune_retired_categories(company_id, &active)?;

        let mut recommendations_written = 0;
        let mut error_message = None;
        match ctx.stop_reason() {
            STOP_BUDGET => {
                warn!(company_id, job_id, "Analysis exceeded its wall-clock budget");
                tracker.fail(job_id, BUDGET_EXCEEDED)?;
                error_message = Some(BUDGET_EXCEEDED.to_string());
            }
            STOP_CANCELLED => {
                info!(company_id, job_id, "Analysis cancelled");
                tracker.cancel(job_id, &degraded)?;
            }
            _ => {
                tracker.set_stage(job_id, Stage::Recommending, None, "Generating recommendations")?;
                let completed_pairs: Vec<OverlapPair> = outcomes
                    .iter()
                    .filter(|o| o.state == CategoryState::Completed)
                    .flat_map(|o| o.pairs.iter().cloned())
                    .collect();
                let engine = RecommendationEngine::new(
                    self.db,
                    RecommendationOptions {
                        redundancy_threshold: self.config.redundancy_threshold,
                        tie_break: self.config.keep_tie_break,
                    },
                );
                let run = engine
                    .generate_and_store(&RecommendationInput {
                        company_id,
                        pairs: &completed_pairs,
                        products: &snapshot.products,
                        features: &snapshot.features,
                    })
                    .map_err(|e| Error::Other(format!("recommendation generation failed: {e}")))?;
                recommendations_written = run.written();
                reporter.on_recommendations(recommendations_written);
                tracker.log_activity(
                    job_id,
                    ActivityKind::Info,
                    &format!("{recommendations_written} recommendations written"),
                );
                tracker.complete(job_id, &degraded)?;
            }
        }

        // A reader may have expired the job meanwhile; the stored record is authoritative.
        let final_record = tracker.get_job(job_id)?;
        let duration = started.elapsed();
        reporter.on_analysis_complete(final_record.status, duration.as_secs_f64());
        info!(
            company_id,
            job_id,
            status = %final_record.status,
            processed = final_record.items_processed,
            total = final_record.items_total,
            failed = failed_categories.len(),
            "Analysis finished in {:.2}s",
            duration.as_secs_f64()
        );

        Ok(AnalysisResult {
            company_id: company_id.to_string(),
            job_id: Some(job_id.to_string()),
            status: final_record.status,
            items_total: final_record.items_total,
            items_processed: final_record.items_processed,
            categories: outcomes,
            failed_categories,
            enrichment_failures,
            recommendations_written,
            error: final_record.error.or(error_message),
            duration,
        })
    }

    /// Ask the enrichment collaborator for products that have no features.
    /// Failures only count against data quality; they never abort the job.
    fn enrich_missing(
        &self,
        snapshot: &Snapshot,
        job_id: &str,
        enricher: &dyn FeatureEnricher,
        reporter: &dyn ProgressReporter,
    ) -> Result<(usize, bool), Error> {
        let missing = snapshot.lacking_features();
        if missing.is_empty() {
            return Ok((0, false));
        }

        let tracker = self.tracker(self.db);
        tracker.set_stage(
            job_id,
            Stage::Enriching,
            None,
            &format!("Enriching {} products", missing.len()),
        )?;
        tracker.log_activity(
            job_id,
            ActivityKind::Info,
            &format!("Enriching {} products without features", missing.len()),
        );
        reporter.on_enrichment(missing.len());

        let catalog = FeatureCatalog::new(self.db);
        let mut failures = 0;
        let mut enriched_any = false;
        for product in missing {
            if tracker.is_cancellation_requested(job_id)? {
                break;
            }
            match enricher.enrich(product) {
                Ok(found) => {
                    for name in &found.features {
                        match catalog.assign_named_feature(&product.id, name, SOURCE_ENRICHMENT) {
                            Ok((_, true)) => enriched_any = true,
                            Ok((_, false)) => {}
                            Err(e) => warn!(software_id = %product.id, feature = %name, "Failed to store enriched feature: {}", e),
                        }
                    }
                    debug!(software_id = %product.id, method = found.method, count = found.features.len(), "Product enriched");
                }
                Err(e) => {
                    failures += 1;
                    warn!(software_id = %product.id, "Enrichment unavailable: {}", e);
                    tracker.log_activity(
                        job_id,
                        ActivityKind::Warning,
                        &format!("No features found for {}: {e}", product.id),
                    );
                }
            }
        }
        Ok((failures, enriched_any))
    }

    fn prune_retired_categories(&self, company_id: &str, active: &BTreeSet<&str>) -> Result<(), Error> {
        for summary in self.db.get_category_summaries(company_id)? {
            if !active.contains(summary.category.as_str()) {
                debug!(company_id, category = %summary.category, "Pruning results for category without active products");
                self.db.delete_category_results(company_id, &summary.category)?;
            }
        }
        Ok(())
    }
}

impl CategoryOutcome {
    fn failed(plan: &CategoryPlan<'_>, error: String) -> Self {
        Self {
            category: plan.name.to_string(),
            state: CategoryState::Failed,
            total_software_count: plan.products.len(),
            pairs: Vec::new(),
            redundant_pairs_count: 0,
            total_potential_savings: 0.0,
            error: Some(error),
        }
    }

    fn skipped(plan: &CategoryPlan<'_>) -> Self {
        Self {
            state: CategoryState::Skipped,
            error: None,
            ..Self::failed(plan, String::new())
        }
    }
}

/// Compare every pair of one category in ascending id order, then persist the
/// pairs and the category summary. Errors are captured in the outcome so one
/// category never takes down the job.
fn process_category(
    db: &Database,
    ctx: &JobContext<'_>,
    plan: &CategoryPlan<'_>,
    tracker: ProgressTracker<'_>,
) -> CategoryOutcome {
    ctx.checkpoint(&tracker);
    if ctx.stopped() {
        return CategoryOutcome::skipped(plan);
    }

    let category = plan.name;
    let index_pairs = overlap::enumerate_pairs(plan.products.len());
    ctx.reporter.on_category_start(category, index_pairs.len());
    if let Err(e) = tracker.set_stage(
        ctx.job_id,
        Stage::Comparing,
        Some(category),
        &format!("Comparing {category}"),
    ) {
        warn!(category, "Failed to update progress stage: {}", e);
    }

    let category_start = Instant::now();
    let computed_at = now_timestamp();
    let mut pairs = Vec::with_capacity(index_pairs.len());
    let mut interrupted = false;

    for (i, j) in index_pairs {
        if ctx.stopped() {
            interrupted = true;
            break;
        }
        let (a, b) = (plan.products[i], plan.products[j]);
        let comparison = overlap::compare(
            (a, ctx.features_of(&a.id)),
            (b, ctx.features_of(&b.id)),
        );
        pairs.push(OverlapPair {
            company_id: ctx.company_id.to_string(),
            category: category.to_string(),
            software_id_a: comparison.software_id_a,
            software_id_b: comparison.software_id_b,
            overlap_percentage: comparison.overlap_percentage,
            shared_features: comparison.shared_features,
            cost_implication: comparison.cost_implication,
            insufficient_data: comparison.insufficient_data,
            job_id: ctx.job_id.to_string(),
            computed_at: computed_at.clone(),
        });

        if let Err(e) = tracker.record_processed(ctx.job_id, 1) {
            warn!(category, "Failed to record progress: {}", e);
        }
        ctx.reporter.on_pair_processed(category);
        ctx.checkpoint(&tracker);
    }

    if let Err(e) = db.replace_category_pairs(ctx.company_id, category, &pairs) {
        error!(company_id = ctx.company_id, category, "Failed to persist overlap pairs: {}", e);
        return category_failed(ctx, plan, &tracker, e.to_string());
    }

    let redundant: Vec<&OverlapPair> = pairs
        .iter()
        .filter(|p| !p.insufficient_data && p.overlap_percentage >= ctx.threshold)
        .collect();
    let savings = round_to(redundant.iter().map(|p| p.cost_implication).sum(), 2);

    let summary = if interrupted {
        let previous = db
            .get_category_summary(ctx.company_id, category)
            .ok()
            .flatten();
        let (status, last_error) = if ctx.stop_reason() == STOP_BUDGET {
            (SummaryStatus::Failed, Some(BUDGET_EXCEEDED.to_string()))
        } else {
            (SummaryStatus::Cancelled, None)
        };
        CategorySummary {
            company_id: ctx.company_id.to_string(),
            category: category.to_string(),
            total_software_count: plan.products.len() as i64,
            redundant_pairs_count: redundant.len() as i64,
            total_potential_savings: savings,
            last_analyzed_at: previous.as_ref().and_then(|s| s.last_analyzed_at.clone()),
            analyzed_revision: previous.as_ref().and_then(|s| s.analyzed_revision),
            analysis_status: status,
            last_error,
        }
    } else {
        CategorySummary {
            company_id: ctx.company_id.to_string(),
            category: category.to_string(),
            total_software_count: plan.products.len() as i64,
            redundant_pairs_count: redundant.len() as i64,
            total_potential_savings: savings,
            last_analyzed_at: Some(now_timestamp()),
            analyzed_revision: Some(plan.revision),
            analysis_status: SummaryStatus::Completed,
            last_error: None,
        }
    };

    if let Err(e) = db.upsert_category_summary(&summary) {
        error!(company_id = ctx.company_id, category, "Failed to write category summary: {}", e);
        return category_failed(ctx, plan, &tracker, e.to_string());
    }

    let redundant_pairs_count = redundant.len();
    if interrupted {
        tracker.log_activity(
            ctx.job_id,
            ActivityKind::Warning,
            &format!("{category}: stopped after {} of {} pairs", pairs.len(), plan_pair_count(plan)),
        );
    } else {
        tracker.log_activity(
            ctx.job_id,
            ActivityKind::Success,
            &format!("{category}: {redundant_pairs_count} redundant pairs, ${savings:.2} potential savings"),
        );
    }
    ctx.reporter.on_category_complete(
        category,
        redundant_pairs_count,
        category_start.elapsed().as_secs_f64(),
    );
    debug!(
        company_id = ctx.company_id,
        category,
        pairs = pairs.len(),
        redundant = redundant_pairs_count,
        savings,
        interrupted,
        "Category processed"
    );

    CategoryOutcome {
        category: category.to_string(),
        state: if interrupted {
            CategoryState::Partial
        } else {
            CategoryState::Completed
        },
        total_software_count: plan.products.len(),
        pairs,
        redundant_pairs_count,
        total_potential_savings: savings,
        error: None,
    }
}

fn plan_pair_count(plan: &CategoryPlan<'_>) -> usize {
    overlap::pair_count(plan.products.len())
}

fn category_failed(
    ctx: &JobContext<'_>,
    plan: &CategoryPlan<'_>,
    tracker: &ProgressTracker<'_>,
    error: String,
) -> CategoryOutcome {
    ctx.reporter.on_category_failed(plan.name, &error);
    tracker.log_activity(
        ctx.job_id,
        ActivityKind::Error,
        &format!("{}: {error}", plan.name),
    );
    CategoryOutcome::failed(plan, error)
}
