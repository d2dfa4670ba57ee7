use crate::error::Error;
use crate::storage::models::{ActivityEntry, ActivityKind, AnalysisProgress, JobStatus, Stage};
use crate::storage::{now_timestamp, timestamp, Database};
use chrono::{DateTime, Utc};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

/// Observer for in-process analysis progress.
///
/// The CLI implements it with indicatif; the persisted [`ProgressTracker`] is
/// what other processes poll. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_analysis_start(&self, _job_id: &str, _items_total: usize) {}
    fn on_enrichment(&self, _products: usize) {}
    fn on_category_start(&self, _category: &str, _pairs: usize) {}
    fn on_pair_processed(&self, _category: &str) {}
    fn on_category_complete(&self, _category: &str, _redundant_pairs: usize, _duration_secs: f64) {}
    fn on_category_failed(&self, _category: &str, _error: &str) {}
    fn on_recommendations(&self, _written: usize) {}
    fn on_analysis_complete(&self, _status: JobStatus, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

pub const BUDGET_EXCEEDED: &str = "exceeded wall-clock budget";

/// Entries kept per job; older ones are dropped as new ones arrive.
pub const ACTIVITY_LOG_CAP: usize = 50;

static JOB_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique, sortable job id: start time plus a short hash of company, process and sequence.
pub fn new_job_id(company_id: &str) -> String {
    let now = Utc::now();
    let seq = JOB_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(company_id.as_bytes());
    hasher.write_u32(std::process::id());
    hasher.write_u64(seq);
    hasher.write_i64(now.timestamp_nanos_opt().unwrap_or_default());
    format!(
        "job-{}-{:08x}",
        now.format("%Y%m%d%H%M%S%3f"),
        hasher.finish() as u32
    )
}

/// Persisted job lifecycle: `running → {completed | cancelled | failed}`.
///
/// Backed by the shared SQLite store, never by process-local memory: the
/// process that polls or cancels is not necessarily the one running the job.
/// Every terminal transition is a conditional `UPDATE ... WHERE status = 'running'`,
/// so a slow writer can never move a terminal record back or overwrite it.
pub struct ProgressTracker<'a> {
    db: &'a Database,
    max_job_duration: Duration,
    retention: Duration,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(db: &'a Database, max_job_duration: Duration, retention: Duration) -> Self {
        Self {
            db,
            max_job_duration,
            retention,
        }
    }

    /// Create the `running` record for a new job. Single-flight per company:
    /// a second concurrent start gets `Error::Conflict` with the running job id.
    pub fn begin(&self, company_id: &str, items_total: i64) -> Result<AnalysisProgress, Error> {
        self.expire_overdue(company_id)?;

        let now = now_timestamp();
        let progress = AnalysisProgress {
            job_id: new_job_id(company_id),
            company_id: company_id.to_string(),
            stage: Stage::Comparing,
            items_total,
            items_processed: 0,
            cancellation_requested: false,
            status: JobStatus::Running,
            current_category: None,
            message: "Analysis started".to_string(),
            error: None,
            degraded_categories: Vec::new(),
            started_at: now.clone(),
            updated_at: now,
            finished_at: None,
            activity: Vec::new(),
        };

        match self.db.insert_progress(&progress) {
            Ok(()) => {
                info!(company_id, job_id = %progress.job_id, items_total, "Analysis job started");
                self.log_activity(
                    &progress.job_id,
                    ActivityKind::Info,
                    &format!("Analysis started with {items_total} comparisons"),
                );
                Ok(progress)
            }
            Err(e) if is_constraint_violation(&e) => {
                let job_id = self
                    .db
                    .get_running_progress(company_id)?
                    .map(|p| p.job_id)
                    .unwrap_or_default();
                Err(Error::Conflict {
                    company_id: company_id.to_string(),
                    job_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_stage(
        &self,
        job_id: &str,
        stage: Stage,
        current_category: Option<&str>,
        message: &str,
    ) -> Result<bool, Error> {
        Ok(self
            .db
            .update_stage(job_id, stage, current_category, message, &now_timestamp())?)
    }

    pub fn set_items_total(&self, job_id: &str, items_total: i64) -> Result<bool, Error> {
        Ok(self
            .db
            .set_items_total(job_id, items_total, &now_timestamp())?)
    }

    /// Atomically add to `items_processed`. Safe across concurrent category workers.
    pub fn record_processed(&self, job_id: &str, delta: i64) -> Result<bool, Error> {
        Ok(self
            .db
            .add_items_processed(job_id, delta, &now_timestamp())?)
    }

    pub fn is_cancellation_requested(&self, job_id: &str) -> Result<bool, Error> {
        Ok(self.db.is_cancellation_requested(job_id)?)
    }

    pub fn complete(&self, job_id: &str, degraded_categories: &[String]) -> Result<bool, Error> {
        let message = if degraded_categories.is_empty() {
            "Analysis completed".to_string()
        } else {
            format!(
                "Analysis completed with {} degraded categories",
                degraded_categories.len()
            )
        };
        self.finish(job_id, JobStatus::Completed, &message, None, degraded_categories)
    }

    pub fn cancel(&self, job_id: &str, degraded_categories: &[String]) -> Result<bool, Error> {
        self.finish(
            job_id,
            JobStatus::Cancelled,
            "Analysis cancelled",
            None,
            degraded_categories,
        )
    }

    pub fn fail(&self, job_id: &str, reason: &str) -> Result<bool, Error> {
        self.finish(job_id, JobStatus::Failed, reason, Some(reason), &[])
    }

    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        message: &str,
        error: Option<&str>,
        degraded_categories: &[String],
    ) -> Result<bool, Error> {
        let changed = self.db.finish_job(
            job_id,
            status,
            message,
            error,
            degraded_categories,
            &now_timestamp(),
        )?;
        if changed {
            debug!(job_id, %status, "Job reached terminal state");
            let kind = match status {
                JobStatus::Completed if degraded_categories.is_empty() => ActivityKind::Success,
                JobStatus::Completed | JobStatus::Cancelled | JobStatus::Running => ActivityKind::Warning,
                JobStatus::Failed => ActivityKind::Error,
            };
            self.log_activity(job_id, kind, message);
        } else {
            warn!(job_id, %status, "Job already terminal; transition ignored");
        }
        Ok(changed)
    }

    /// Append to the job's activity log. Never fails the caller: the log is
    /// informational and a lost entry must not stop a job.
    pub fn log_activity(&self, job_id: &str, kind: ActivityKind, message: &str) {
        if let Err(e) =
            self.db
                .insert_activity(job_id, kind, message, &now_timestamp(), ACTIVITY_LOG_CAP)
        {
            warn!(job_id, "Failed to append activity entry: {}", e);
        }
    }

    pub fn activity(&self, job_id: &str) -> Result<Vec<ActivityEntry>, Error> {
        Ok(self.db.get_activity(job_id)?)
    }

    /// Latest job record for the company, with its activity log. NotFound when
    /// none ever ran or the last record outlived the retention window.
    pub fn get_progress(&self, company_id: &str) -> Result<AnalysisProgress, Error> {
        self.expire_overdue(company_id)?;
        self.purge_expired()?;
        let mut progress = self
            .db
            .get_latest_progress(company_id)?
            .ok_or_else(|| Error::NotFound(format!("no analysis progress for company {company_id}")))?;
        progress.activity = self.activity(&progress.job_id)?;
        Ok(progress)
    }

    pub fn get_job(&self, job_id: &str) -> Result<AnalysisProgress, Error> {
        let mut progress = self
            .db
            .get_progress_by_job(job_id)?
            .ok_or_else(|| Error::NotFound(format!("analysis job {job_id}")))?;
        progress.activity = self.activity(job_id)?;
        Ok(progress)
    }

    /// Flag the running job for cooperative cancellation. Idempotent; a no-op
    /// when nothing is running.
    pub fn request_cancellation(&self, company_id: &str) -> Result<(), Error> {
        let flagged = self.db.flag_cancellation(company_id, &now_timestamp())?;
        if flagged > 0 {
            info!(company_id, "Cancellation requested");
            if let Some(running) = self.db.get_running_progress(company_id)? {
                self.log_activity(&running.job_id, ActivityKind::Warning, "Cancellation requested");
            }
        } else {
            debug!(company_id, "Cancellation requested with no running job");
        }
        Ok(())
    }

    /// Whether a job started at `started_at` has used up its budget.
    pub fn is_over_budget(&self, started_at: &str) -> bool {
        crate::storage::parse_timestamp(started_at)
            .map(|started| {
                let elapsed = Utc::now().signed_duration_since(started);
                elapsed.to_std().unwrap_or_default() > self.max_job_duration
            })
            .unwrap_or(false)
    }

    /// A running record older than the budget reads as failed, whether or not
    /// the worker ever reported back.
    fn expire_overdue(&self, company_id: &str) -> Result<(), Error> {
        let Some(running) = self.db.get_running_progress(company_id)? else {
            return Ok(());
        };
        if self.is_over_budget(&running.started_at)
            && self.finish(
                &running.job_id,
                JobStatus::Failed,
                BUDGET_EXCEEDED,
                Some(BUDGET_EXCEEDED),
                &running.degraded_categories,
            )?
        {
            warn!(company_id, job_id = %running.job_id, "Marked overdue analysis job as failed");
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<(), Error> {
        let cutoff = cutoff_before(self.retention);
        let purged = self.db.purge_finished_progress(&cutoff)?;
        if purged > 0 {
            debug!(purged, "Purged expired progress records");
        }
        Ok(())
    }
}

/// Timestamp `window` ago, saturating at the earliest representable instant.
fn cutoff_before(window: Duration) -> String {
    let now = Utc::now();
    let cutoff = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    timestamp(cutoff)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(db: &Database) -> ProgressTracker<'_> {
        ProgressTracker::new(db, Duration::from_secs(300), Duration::from_secs(1800))
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = new_job_id("acme");
        let b = new_job_id("acme");
        assert_ne!(a, b);
        assert!(a.starts_with("job-"));
    }

    #[test]
    fn test_begin_then_complete() {
        let db = Database::open_in_memory().unwrap();
        let tracker = tracker(&db);
        let job = tracker.begin("acme", 3).unwrap();
        assert_eq!(job.status, JobStatus::Running);

        assert!(tracker.record_processed(&job.job_id, 1).unwrap());
        assert!(tracker.complete(&job.job_id, &[]).unwrap());

        let progress = tracker.get_progress("acme").unwrap();
        assert_eq!(progress.status, JobStatus::Completed);
        assert_eq!(progress.items_processed, 1);
        assert!(progress.finished_at.is_some());
    }

    #[test]
    fn test_terminal_state_is_not_overwritten() {
        let db = Database::open_in_memory().unwrap();
        let tracker = tracker(&db);
        let job = tracker.begin("acme", 1).unwrap();
        assert!(tracker.cancel(&job.job_id, &[]).unwrap());

        assert!(!tracker.complete(&job.job_id, &[]).unwrap());
        assert!(!tracker.record_processed(&job.job_id, 1).unwrap());
        assert_eq!(
            tracker.get_progress("acme").unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn test_activity_log_is_capped_and_ends_with_outcome() {
        let db = Database::open_in_memory().unwrap();
        let tracker = tracker(&db);
        let job = tracker.begin("acme", 1).unwrap();
        for i in 0..ACTIVITY_LOG_CAP + 10 {
            tracker.log_activity(&job.job_id, ActivityKind::Info, &format!("step {i}"));
        }
        tracker.fail(&job.job_id, "disk full").unwrap();

        let activity = tracker.get_progress("acme").unwrap().activity;
        assert_eq!(activity.len(), ACTIVITY_LOG_CAP);
        let last = activity.last().unwrap();
        assert_eq!(last.kind, ActivityKind::Error);
        assert_eq!(last.message, "disk full");
        // The start entry and the earliest steps were dropped
        assert_eq!(activity[0].message, "step 11");
    }

    #[test]
    fn test_activity_for_unknown_job_is_ignored() {
        let db = Database::open_in_memory().unwrap();
        tracker(&db).log_activity("job-missing", ActivityKind::Info, "hello");
        assert!(tracker(&db).activity("job-missing").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_company_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            tracker(&db).get_progress("nobody"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_cancel_without_job_is_ok() {
        let db = Database::open_in_memory().unwrap();
        assert!(tracker(&db).request_cancellation("nobody").is_ok());
    }
}
