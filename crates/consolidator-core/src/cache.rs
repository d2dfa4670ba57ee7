//! Cached analysis results and the staleness policy.
//!
//! A summary is stale when it was never completed, or when its category's
//! revision moved past the revision the analyzer read. Revisions are bumped by
//! every catalog write in the same transaction, so unlike wall-clock
//! comparisons this cannot miss a change made within the same instant.

use crate::config::PriorityConfig;
use crate::error::Error;
use crate::storage::models::{CategorySummary, Level, OverlapPair, SummaryStatus};
use crate::storage::Database;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    #[serde(flatten)]
    pub summary: CategorySummary,
    pub stale: bool,
    pub current_revision: i64,
    /// Derived from potential savings against the configured cut points.
    pub priority: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairs: Option<Vec<OverlapPair>>,
}

pub fn is_stale(summary: &CategorySummary, current_revision: i64) -> bool {
    if summary.last_analyzed_at.is_none() || summary.analysis_status != SummaryStatus::Completed {
        return true;
    }
    match summary.analyzed_revision {
        Some(analyzed) => analyzed < current_revision,
        None => true,
    }
}

pub struct AnalysisCache<'a> {
    db: &'a Database,
    priority: PriorityConfig,
}

impl<'a> AnalysisCache<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            priority: PriorityConfig::default(),
        }
    }

    pub fn with_priority(mut self, priority: PriorityConfig) -> Self {
        self.priority = priority;
        self
    }

    /// Every category the company has results or active products for, each
    /// marked with its staleness. Categories never analyzed appear as `pending`
    /// and stale. Ordered by potential savings, highest first.
    pub fn category_reports(
        &self,
        company_id: &str,
        include_pairs: bool,
    ) -> Result<Vec<CategoryReport>, Error> {
        let tx = self.db.connection().unchecked_transaction()?;
        let summaries = self.db.get_category_summaries(company_id)?;
        let revisions = self.db.get_category_revisions(company_id)?;
        let products = self.db.get_active_products(company_id)?;
        let mut pairs_by_category: BTreeMap<String, Vec<OverlapPair>> = BTreeMap::new();
        if include_pairs {
            for pair in self.db.get_overlap_pairs(company_id, None)? {
                pairs_by_category
                    .entry(pair.category.clone())
                    .or_default()
                    .push(pair);
            }
        }
        tx.commit()?;

        let summarized: BTreeSet<String> = summaries.iter().map(|s| s.category.clone()).collect();
        let mut unanalyzed: BTreeMap<String, i64> = BTreeMap::new();
        for product in products.iter().filter(|p| !summarized.contains(&p.category)) {
            *unanalyzed.entry(product.category.clone()).or_default() += 1;
        }

        let mut reports: Vec<CategoryReport> = summaries
            .into_iter()
            .chain(unanalyzed.into_iter().map(|(category, count)| CategorySummary {
                company_id: company_id.to_string(),
                category,
                total_software_count: count,
                redundant_pairs_count: 0,
                total_potential_savings: 0.0,
                last_analyzed_at: None,
                analyzed_revision: None,
                analysis_status: SummaryStatus::Pending,
                last_error: None,
            }))
            .map(|summary| {
                let current_revision = revisions.get(&summary.category).copied().unwrap_or(0);
                let pairs = if include_pairs {
                    Some(
                        pairs_by_category
                            .remove(&summary.category)
                            .unwrap_or_default(),
                    )
                } else {
                    None
                };
                CategoryReport {
                    stale: is_stale(&summary, current_revision),
                    current_revision,
                    priority: self.priority.level_for(summary.total_potential_savings),
                    summary,
                    pairs,
                }
            })
            .collect();

        reports.sort_by(|a, b| {
            b.summary
                .total_potential_savings
                .total_cmp(&a.summary.total_potential_savings)
                .then_with(|| a.summary.category.cmp(&b.summary.category))
        });
        debug!(
            company_id,
            categories = reports.len(),
            stale = reports.iter().filter(|r| r.stale).count(),
            "Loaded category reports"
        );
        Ok(reports)
    }

    pub fn stale_categories(&self, company_id: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .category_reports(company_id, false)?
            .into_iter()
            .filter(|r| r.stale)
            .map(|r| r.summary.category)
            .collect())
    }

    pub fn is_fresh(&self, company_id: &str) -> Result<bool, Error> {
        Ok(self.stale_categories(company_id)?.is_empty())
    }
}
