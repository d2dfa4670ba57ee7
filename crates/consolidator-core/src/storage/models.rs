use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Text-backed enums stored as lowercase strings in SQLite.
macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Active,
    Retired,
}

text_enum!(ProductStatus, "product status", { Active => "active", Retired => "retired" });

/// An inventory row. Owned by the inventory subsystem; the analyzer only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftwareProduct {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub vendor: String,
    pub category: String,
    pub annual_cost: f64,
    pub status: ProductStatus,
    pub active_users: Option<i64>,
    pub business_critical: bool,
    pub regulatory: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCategory {
    pub id: i64,
    pub name: String,
}

/// A standardized capability label. Ordered by id so sets of tags are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureTag {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRevision {
    pub company_id: String,
    pub category: String,
    pub revision: i64,
    pub changed_at: String,
}

/// Pairwise comparison result. `software_id_a < software_id_b` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlapPair {
    pub company_id: String,
    pub category: String,
    pub software_id_a: String,
    pub software_id_b: String,
    pub overlap_percentage: f64,
    pub shared_features: Vec<FeatureTag>,
    pub cost_implication: f64,
    pub insufficient_data: bool,
    pub job_id: String,
    pub computed_at: String,
}

impl OverlapPair {
    pub fn shared_feature_names(&self) -> Vec<String> {
        self.shared_features.iter().map(|t| t.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    Pending,
    Completed,
    Cancelled,
    Failed,
}

text_enum!(SummaryStatus, "summary status", {
    Pending => "pending",
    Completed => "completed",
    Cancelled => "cancelled",
    Failed => "failed",
});

/// One row per (company, category); written by the analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub company_id: String,
    pub category: String,
    pub total_software_count: i64,
    pub redundant_pairs_count: i64,
    pub total_potential_savings: f64,
    pub last_analyzed_at: Option<String>,
    pub analyzed_revision: Option<i64>,
    pub analysis_status: SummaryStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

text_enum!(JobStatus, "job status", {
    Running => "running",
    Completed => "completed",
    Cancelled => "cancelled",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Enriching,
    Comparing,
    Summarizing,
    Recommending,
    Done,
}

text_enum!(Stage, "stage", {
    Enriching => "enriching",
    Comparing => "comparing",
    Summarizing => "summarizing",
    Recommending => "recommending",
    Done => "done",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisProgress {
    pub job_id: String,
    pub company_id: String,
    pub stage: Stage,
    pub items_total: i64,
    pub items_processed: i64,
    pub cancellation_requested: bool,
    pub status: JobStatus,
    pub current_category: Option<String>,
    pub message: String,
    pub error: Option<String>,
    pub degraded_categories: Vec<String>,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
    /// Most recent entries last. Filled by the tracker's read methods.
    #[serde(default)]
    pub activity: Vec<ActivityEntry>,
}

impl AnalysisProgress {
    pub fn percent(&self) -> f64 {
        if self.items_total <= 0 {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        (self.items_processed as f64 / self.items_total as f64 * 100.0).min(100.0)
    }

    /// Linear extrapolation from the elapsed time and the share of pairs done.
    /// `None` until the first pair lands, and once the job is terminal.
    pub fn estimated_time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status.is_terminal() || self.items_total <= 0 || self.items_processed <= 0 {
            return None;
        }
        let started = super::parse_timestamp(&self.started_at)?;
        let elapsed = now.signed_duration_since(started).to_std().ok()?;
        let remaining = (self.items_total - self.items_processed).max(0) as f64;
        Some(Duration::from_secs_f64(
            elapsed.as_secs_f64() * remaining / self.items_processed as f64,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Info,
    Success,
    Warning,
    Error,
}

text_enum!(ActivityKind, "activity kind", {
    Info => "info",
    Success => "success",
    Warning => "warning",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub kind: ActivityKind,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationStatus {
    Pending,
    Accepted,
    Dismissed,
}

text_enum!(RecommendationStatus, "recommendation status", {
    Pending => "pending",
    Accepted => "accepted",
    Dismissed => "dismissed",
});

/// Three-level ordinal used for migration effort and business risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

text_enum!(Level, "level", { Low => "low", Medium => "medium", High => "high" });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationRecommendation {
    pub id: i64,
    pub company_id: String,
    pub category: String,
    pub cluster_key: String,
    pub software_to_keep_id: String,
    pub software_to_remove_ids: Vec<String>,
    pub annual_savings: f64,
    pub features_covered: Vec<String>,
    pub features_at_risk: Vec<String>,
    pub migration_effort: Level,
    pub business_risk: Level,
    pub recommendation_text: String,
    pub confidence_score: f64,
    pub status: RecommendationStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_only_running_is_non_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    fn progress(status: JobStatus, total: i64, processed: i64, started_at: &str) -> AnalysisProgress {
        AnalysisProgress {
            job_id: "job-1".into(),
            company_id: "acme".into(),
            stage: Stage::Comparing,
            items_total: total,
            items_processed: processed,
            cancellation_requested: false,
            status,
            current_category: None,
            message: String::new(),
            error: None,
            degraded_categories: Vec::new(),
            started_at: started_at.into(),
            updated_at: started_at.into(),
            finished_at: None,
            activity: Vec::new(),
        }
    }

    #[test]
    fn test_eta_extrapolates_from_elapsed_time() {
        let now = super::super::parse_timestamp("2026-01-01T00:01:00.000000Z").unwrap();
        let started = "2026-01-01T00:00:00.000000Z";

        // A quarter done after 60s leaves 180s
        let running = progress(JobStatus::Running, 8, 2, started);
        assert_eq!(running.estimated_time_remaining(now), Some(Duration::from_secs(180)));

        assert_eq!(progress(JobStatus::Running, 8, 0, started).estimated_time_remaining(now), None);
        assert_eq!(progress(JobStatus::Completed, 8, 8, started).estimated_time_remaining(now), None);
        assert_eq!(
            progress(JobStatus::Running, 8, 8, started).estimated_time_remaining(now),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Low < Level::Medium);
        assert!(Level::Medium < Level::High);
        assert_eq!(Level::Low.max(Level::Medium), Level::Medium);
    }
}
