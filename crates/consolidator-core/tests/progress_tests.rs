mod common;

use common::*;
use consolidator_core::progress::BUDGET_EXCEEDED;
use consolidator_core::storage::models::{ActivityKind, AnalysisProgress, JobStatus, Stage};
use consolidator_core::storage::{timestamp, Database};
use consolidator_core::{Error, ProgressTracker};
use std::thread;
use std::time::Duration;

const BUDGET: Duration = Duration::from_secs(300);
const RETENTION: Duration = Duration::from_secs(1800);

fn running_record(job_id: &str, started_at: &str) -> AnalysisProgress {
    AnalysisProgress {
        job_id: job_id.to_string(),
        company_id: COMPANY.to_string(),
        stage: Stage::Comparing,
        items_total: 10,
        items_processed: 3,
        cancellation_requested: false,
        status: JobStatus::Running,
        current_category: Some("CRM".to_string()),
        message: "Comparing CRM".to_string(),
        error: None,
        degraded_categories: Vec::new(),
        started_at: started_at.to_string(),
        updated_at: started_at.to_string(),
        finished_at: None,
        activity: Vec::new(),
    }
}

#[test]
fn test_second_start_conflicts_with_running_job() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, BUDGET, RETENTION);

    let first = tracker.begin(COMPANY, 4).unwrap();
    match tracker.begin(COMPANY, 4) {
        Err(Error::Conflict { company_id, job_id }) => {
            assert_eq!(company_id, COMPANY);
            assert_eq!(job_id, first.job_id);
        }
        other => panic!("expected Conflict, got {:?}", other.map(|p| p.job_id)),
    }

    // Other companies are independent
    assert!(tracker.begin("globex", 1).is_ok());

    // Once terminal, a new job may start
    assert!(tracker.complete(&first.job_id, &[]).unwrap());
    let next = tracker.begin(COMPANY, 2).unwrap();
    assert_ne!(next.job_id, first.job_id);
}

#[test]
fn test_conflict_is_visible_across_connections() {
    let store = temp_store();
    let other = Database::open(&store.path).unwrap();

    let first = ProgressTracker::new(&store.db, BUDGET, RETENTION)
        .begin(COMPANY, 1)
        .unwrap();
    let err = ProgressTracker::new(&other, BUDGET, RETENTION)
        .begin(COMPANY, 1)
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { ref job_id, .. } if *job_id == first.job_id));
}

#[test]
fn test_counters_and_stage_updates() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, BUDGET, RETENTION);
    let job = tracker.begin(COMPANY, 5).unwrap();

    tracker
        .set_stage(&job.job_id, Stage::Comparing, Some("CRM"), "Comparing CRM")
        .unwrap();
    for _ in 0..3 {
        assert!(tracker.record_processed(&job.job_id, 1).unwrap());
    }

    let progress = tracker.get_progress(COMPANY).unwrap();
    assert_eq!(progress.status, JobStatus::Running);
    assert_eq!(progress.items_processed, 3);
    assert_eq!(progress.items_total, 5);
    assert_eq!(progress.current_category.as_deref(), Some("CRM"));
    assert_eq!(progress.percent(), 60.0);

    assert!(tracker.complete(&job.job_id, &[]).unwrap());
    // Terminal records no longer move
    assert!(!tracker.record_processed(&job.job_id, 1).unwrap());
    assert!(!tracker
        .set_stage(&job.job_id, Stage::Summarizing, None, "late")
        .unwrap());
    let done = tracker.get_job(&job.job_id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.stage, Stage::Done);
    assert_eq!(done.items_processed, 3);
    assert!(done.finished_at.is_some());
}

#[test]
fn test_terminal_status_is_never_overwritten() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, BUDGET, RETENTION);
    let job = tracker.begin(COMPANY, 1).unwrap();

    assert!(tracker.cancel(&job.job_id, &[]).unwrap());
    assert!(!tracker.complete(&job.job_id, &[]).unwrap());
    assert!(!tracker.fail(&job.job_id, "late failure").unwrap());
    assert_eq!(tracker.get_job(&job.job_id).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn test_overdue_job_reads_as_failed() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, Duration::from_secs(60), RETENTION);

    let long_ago = timestamp(chrono::Utc::now() - chrono::Duration::minutes(10));
    db.insert_progress(&running_record("job-stuck", &long_ago)).unwrap();
    assert!(tracker.is_over_budget(&long_ago));

    let progress = tracker.get_progress(COMPANY).unwrap();
    assert_eq!(progress.job_id, "job-stuck");
    assert_eq!(progress.status, JobStatus::Failed);
    assert_eq!(progress.error.as_deref(), Some(BUDGET_EXCEEDED));

    let last = progress.activity.last().unwrap();
    assert_eq!(last.kind, ActivityKind::Error);
    assert_eq!(last.message, BUDGET_EXCEEDED);

    // The worker reporting back late cannot resurrect it
    assert!(!tracker.complete("job-stuck", &[]).unwrap());
    assert_eq!(tracker.get_job("job-stuck").unwrap().status, JobStatus::Failed);

    // And the company is free to start again
    assert!(tracker.begin(COMPANY, 1).is_ok());
}

#[test]
fn test_cancellation_request_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, BUDGET, RETENTION);

    // Nothing running is not an error
    tracker.request_cancellation(COMPANY).unwrap();

    let job = tracker.begin(COMPANY, 2).unwrap();
    assert!(!tracker.is_cancellation_requested(&job.job_id).unwrap());
    tracker.request_cancellation(COMPANY).unwrap();
    tracker.request_cancellation(COMPANY).unwrap();
    assert!(tracker.is_cancellation_requested(&job.job_id).unwrap());

    let progress = tracker.get_progress(COMPANY).unwrap();
    assert!(progress.cancellation_requested);
    // Only the job itself moves to cancelled
    assert_eq!(progress.status, JobStatus::Running);
}

#[test]
fn test_latest_record_wins_and_expired_records_are_purged() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, BUDGET, Duration::ZERO);

    assert!(matches!(tracker.get_progress(COMPANY), Err(Error::NotFound(_))));

    let job = tracker.begin(COMPANY, 1).unwrap();
    // Running records survive any retention window
    assert_eq!(tracker.get_progress(COMPANY).unwrap().job_id, job.job_id);

    tracker.complete(&job.job_id, &[]).unwrap();
    thread::sleep(Duration::from_millis(5));
    assert!(matches!(tracker.get_progress(COMPANY), Err(Error::NotFound(_))));
}

#[test]
fn test_degraded_categories_are_recorded() {
    let db = Database::open_in_memory().unwrap();
    let tracker = ProgressTracker::new(&db, BUDGET, RETENTION);
    let job = tracker.begin(COMPANY, 3).unwrap();

    let degraded = vec!["Messaging".to_string()];
    tracker.complete(&job.job_id, &degraded).unwrap();

    let progress = tracker.get_progress(COMPANY).unwrap();
    assert_eq!(progress.status, JobStatus::Completed);
    assert_eq!(progress.degraded_categories, degraded);
    assert!(progress.message.contains("1 degraded"));
}
