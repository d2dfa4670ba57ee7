use crate::error::Error;
use crate::storage::models::Level;
use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::time::Duration;

/// How to break ties between keep candidates with equal coverage and cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepTieBreak {
    /// Higher active-user count wins, then lexicographic id.
    ActiveUsersThenId,
    /// Lexicographic id only.
    Id,
}

impl Default for KeepTieBreak {
    fn default() -> Self {
        KeepTieBreak::ActiveUsersThenId
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Savings cut points for category priority. A category ranks above a cut
/// point only when its savings strictly exceed it.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    pub high_savings: f64,
    pub medium_savings: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            high_savings: 50_000.0,
            medium_savings: 20_000.0,
        }
    }
}

impl PriorityConfig {
    pub fn level_for(&self, savings: f64) -> Level {
        if savings > self.high_savings {
            Level::High
        } else if savings > self.medium_savings {
            Level::Medium
        } else {
            Level::Low
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub redundancy_threshold: f64,
    pub max_job_duration_secs: u64,
    pub progress_retention_secs: u64,
    pub keep_tie_break: KeepTieBreak,
    pub parallel_categories: bool,
    pub priority: PriorityConfig,
    pub enrichment: EnrichmentConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "consolidator.db".to_string(),
            redundancy_threshold: 40.0,
            max_job_duration_secs: 300,
            progress_retention_secs: 30 * 60,
            keep_tie_break: KeepTieBreak::default(),
            parallel_categories: true,
            priority: PriorityConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn max_job_duration(&self) -> Duration {
        Duration::from_secs(self.max_job_duration_secs)
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(0.0..=100.0).contains(&self.redundancy_threshold) {
            return Err(Error::InvalidInput(format!(
                "redundancy_threshold must be within [0, 100], got {}",
                self.redundancy_threshold
            )));
        }
        if self.max_job_duration_secs == 0 {
            return Err(Error::InvalidInput(
                "max_job_duration_secs must be greater than zero".to_string(),
            ));
        }
        let priority = &self.priority;
        if priority.medium_savings < 0.0 || priority.medium_savings > priority.high_savings {
            return Err(Error::InvalidInput(format!(
                "priority cut points must satisfy 0 <= medium_savings <= high_savings, got {} and {}",
                priority.medium_savings, priority.high_savings
            )));
        }
        if self.enrichment.enabled && self.enrichment.endpoint.trim().is_empty() {
            return Err(Error::InvalidInput(
                "enrichment.endpoint is required when enrichment is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from an optional `Config.toml` (or the given file) and
/// `CONSOLIDATOR_*` environment variables.
pub fn load_configuration(path: Option<&str>) -> Result<AppConfig, ConfigError> {
    let file_source = match path {
        Some(p) => ConfigFile::with_name(p).required(true),
        None => ConfigFile::with_name("Config").required(false),
    };
    let builder = Config::builder()
        .add_source(file_source)
        .add_source(
            Environment::with_prefix("CONSOLIDATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.redundancy_threshold, 40.0);
        assert_eq!(config.max_job_duration(), Duration::from_secs(300));
        assert_eq!(config.keep_tie_break, KeepTieBreak::ActiveUsersThenId);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let config = AppConfig {
            redundancy_threshold: 140.0,
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = AppConfig {
            max_job_duration_secs: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_priority_cut_points_are_exclusive() {
        let priority = PriorityConfig::default();
        assert_eq!(priority.level_for(60_000.0), Level::High);
        assert_eq!(priority.level_for(50_000.0), Level::Medium);
        assert_eq!(priority.level_for(20_000.01), Level::Medium);
        assert_eq!(priority.level_for(20_000.0), Level::Low);
        assert_eq!(priority.level_for(0.0), Level::Low);

        let inverted = AppConfig {
            priority: PriorityConfig {
                high_savings: 10.0,
                medium_savings: 20.0,
            },
            ..AppConfig::default()
        };
        assert!(matches!(inverted.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "redundancy_threshold = 55.0\nkeep_tie_break = \"id\"\n[priority]\nhigh_savings = 80000.0\n[enrichment]\nmodel = \"mistral\"\n",
        )
        .unwrap();

        let config = load_configuration(path.to_str()).unwrap();
        assert_eq!(config.redundancy_threshold, 55.0);
        assert_eq!(config.keep_tie_break, KeepTieBreak::Id);
        assert_eq!(config.enrichment.model, "mistral");
        assert_eq!(config.priority.high_savings, 80_000.0);
        assert_eq!(config.priority.medium_savings, 20_000.0);
        assert!(!config.enrichment.enabled);
        assert_eq!(config.database_path, "consolidator.db");
    }
}
