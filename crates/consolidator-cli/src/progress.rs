use consolidator_core::storage::models::{AnalysisProgress, JobStatus};
use consolidator_core::ProgressReporter;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

fn pair_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "  {spinner:.cyan} Comparing [{bar:30.cyan/dim}] {pos}/{len} pairs {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS),
    );
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// CLI progress reporter using an indicatif bar over the pair count.
///
/// Category workers may run in parallel; indicatif bars are thread-safe, the
/// mutex only guards swapping the bar itself.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                f(pb);
            }
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_analysis_start(&self, job_id: &str, items_total: usize) {
        let pb = pair_bar(items_total as u64);
        pb.set_message(job_id.to_string());
        self.set_bar(pb);
    }

    fn on_enrichment(&self, products: usize) {
        self.with_bar(|pb| pb.set_message(format!("enriching {} products", products)));
    }

    fn on_category_start(&self, category: &str, _pairs: usize) {
        self.with_bar(|pb| pb.set_message(category.to_string()));
    }

    fn on_pair_processed(&self, _category: &str) {
        self.with_bar(|pb| pb.inc(1));
    }

    fn on_category_complete(&self, category: &str, redundant_pairs: usize, duration_secs: f64) {
        self.with_bar(|pb| {
            pb.println(format!(
                "  \x1b[32m✓\x1b[0m {}: {} redundant pairs in {:.2}s",
                category, redundant_pairs, duration_secs
            ))
        });
    }

    fn on_category_failed(&self, category: &str, error: &str) {
        self.with_bar(|pb| pb.println(format!("  \x1b[31m✗\x1b[0m {}: {}", category, error)));
    }

    fn on_recommendations(&self, written: usize) {
        self.with_bar(|pb| pb.set_message(format!("{} recommendations", written)));
    }

    fn on_analysis_complete(&self, status: JobStatus, duration_secs: f64) {
        self.finish_bar();
        let mark = match status {
            JobStatus::Completed => "\x1b[32m✓\x1b[0m",
            JobStatus::Cancelled => "\x1b[33m■\x1b[0m",
            _ => "\x1b[31m✗\x1b[0m",
        };
        eprintln!("  {} Analysis {} in {:.2}s", mark, status, duration_secs);
    }
}

/// Bar driven by polled progress records instead of in-process callbacks.
pub struct PollingBar {
    pb: ProgressBar,
}

impl PollingBar {
    pub fn new() -> Self {
        Self { pb: pair_bar(0) }
    }

    pub fn update(&self, progress: &AnalysisProgress) {
        let total = progress.items_total.max(0) as u64;
        if self.pb.length() != Some(total) {
            self.pb.set_length(total);
        }
        self.pb.set_position(progress.items_processed.max(0) as u64);
        let detail = progress
            .current_category
            .as_deref()
            .unwrap_or(progress.message.as_str());
        self.pb.set_message(format!("{} {}", progress.stage, detail));
    }

    pub fn finish(self) {
        self.pb.finish_and_clear();
    }
}
