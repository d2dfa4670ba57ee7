use super::models::*;
use super::sqlite::Database;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Result, Row};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;
use tracing::debug;

const PRODUCT_COLUMNS: &str = "id, company_id, name, vendor, category, annual_cost, status, \
     active_users, business_critical, regulatory, updated_at";

const PROGRESS_COLUMNS: &str = "job_id, company_id, stage, items_total, items_processed, \
     cancellation_requested, status, current_category, message, error, degraded_categories, \
     started_at, updated_at, finished_at";

const SUMMARY_COLUMNS: &str = "company_id, category, total_software_count, redundant_pairs_count, \
     total_potential_savings, last_analyzed_at, analyzed_revision, analysis_status, last_error";

const RECOMMENDATION_COLUMNS: &str = "id, company_id, category, cluster_key, software_to_keep_id, \
     software_to_remove_ids, annual_savings, features_covered, features_at_risk, \
     migration_effort, business_risk, recommendation_text, confidence_score, status, \
     created_at, updated_at";

/// Outcome of writing a generated recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationWrite {
    Inserted(i64),
    Updated(i64),
    /// An accepted/dismissed row already exists for the key and was left untouched.
    Preserved(i64),
}

impl RecommendationWrite {
    pub fn id(&self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Preserved(id) => *id,
        }
    }
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn product_from_row(row: &Row<'_>) -> Result<SoftwareProduct> {
    Ok(SoftwareProduct {
        id: row.get(0)?,
        company_id: row.get(1)?,
        name: row.get(2)?,
        vendor: row.get(3)?,
        category: row.get(4)?,
        annual_cost: row.get(5)?,
        status: enum_col(row, 6)?,
        active_users: row.get(7)?,
        business_critical: row.get(8)?,
        regulatory: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn progress_from_row(row: &Row<'_>) -> Result<AnalysisProgress> {
    Ok(AnalysisProgress {
        job_id: row.get(0)?,
        company_id: row.get(1)?,
        stage: enum_col(row, 2)?,
        items_total: row.get(3)?,
        items_processed: row.get(4)?,
        cancellation_requested: row.get(5)?,
        status: enum_col(row, 6)?,
        current_category: row.get(7)?,
        message: row.get(8)?,
        error: row.get(9)?,
        degraded_categories: json_col(row, 10)?,
        started_at: row.get(11)?,
        updated_at: row.get(12)?,
        finished_at: row.get(13)?,
        activity: Vec::new(),
    })
}

fn summary_from_row(row: &Row<'_>) -> Result<CategorySummary> {
    Ok(CategorySummary {
        company_id: row.get(0)?,
        category: row.get(1)?,
        total_software_count: row.get(2)?,
        redundant_pairs_count: row.get(3)?,
        total_potential_savings: row.get(4)?,
        last_analyzed_at: row.get(5)?,
        analyzed_revision: row.get(6)?,
        analysis_status: enum_col(row, 7)?,
        last_error: row.get(8)?,
    })
}

fn recommendation_from_row(row: &Row<'_>) -> Result<ConsolidationRecommendation> {
    Ok(ConsolidationRecommendation {
        id: row.get(0)?,
        company_id: row.get(1)?,
        category: row.get(2)?,
        cluster_key: row.get(3)?,
        software_to_keep_id: row.get(4)?,
        software_to_remove_ids: json_col(row, 5)?,
        annual_savings: row.get(6)?,
        features_covered: json_col(row, 7)?,
        features_at_risk: json_col(row, 8)?,
        migration_effort: enum_col(row, 9)?,
        business_risk: enum_col(row, 10)?,
        recommendation_text: row.get(11)?,
        confidence_score: row.get(12)?,
        status: enum_col(row, 13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl Database {
    // ── Feature Taxonomy ─────────────────────────────────────────

    pub fn upsert_feature_category(&self, name: &str) -> Result<FeatureCategory> {
        self.connection().execute(
            "INSERT INTO feature_category (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        self.connection().query_row(
            "SELECT id, name FROM feature_category WHERE name = ?1",
            params![name],
            |row| {
                Ok(FeatureCategory {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
    }

    pub fn get_or_create_tag(&self, category_id: i64, name: &str) -> Result<FeatureTag> {
        self.connection().execute(
            "INSERT INTO feature_tag (category_id, name) VALUES (?1, ?2) \
             ON CONFLICT(category_id, name) DO NOTHING",
            params![category_id, name],
        )?;
        self.connection().query_row(
            "SELECT id, category_id, name FROM feature_tag WHERE category_id = ?1 AND name = ?2",
            params![category_id, name],
            |row| {
                Ok(FeatureTag {
                    id: row.get(0)?,
                    category_id: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
    }

    pub fn get_feature_tag(&self, tag_id: i64) -> Result<Option<FeatureTag>> {
        self.connection()
            .query_row(
                "SELECT id, category_id, name FROM feature_tag WHERE id = ?1",
                params![tag_id],
                |row| {
                    Ok(FeatureTag {
                        id: row.get(0)?,
                        category_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()
    }

    /// True when any stored comparison result lists the tag as shared.
    pub fn is_tag_referenced(&self, tag_id: i64) -> Result<bool> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM overlap_pair_feature WHERE feature_tag_id = ?1",
            params![tag_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn rename_tag_row(&self, tag_id: i64, new_name: &str) -> Result<usize> {
        self.connection().execute(
            "UPDATE feature_tag SET name = ?1 WHERE id = ?2",
            params![new_name, tag_id],
        )
    }

    // ── Inventory ────────────────────────────────────────────────

    pub fn upsert_product_row(&self, product: &SoftwareProduct) -> Result<()> {
        self.connection().execute(
            "INSERT INTO software_product \
             (id, company_id, name, vendor, category, annual_cost, status, \
              active_users, business_critical, regulatory, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(id) DO UPDATE SET \
                 company_id = excluded.company_id, \
                 name = excluded.name, \
                 vendor = excluded.vendor, \
                 category = excluded.category, \
                 annual_cost = excluded.annual_cost, \
                 status = excluded.status, \
                 active_users = excluded.active_users, \
                 business_critical = excluded.business_critical, \
                 regulatory = excluded.regulatory, \
                 updated_at = excluded.updated_at",
            params![
                product.id,
                product.company_id,
                product.name,
                product.vendor,
                product.category,
                product.annual_cost,
                product.status.as_str(),
                product.active_users,
                product.business_critical,
                product.regulatory,
                product.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_product(&self, software_id: &str) -> Result<Option<SoftwareProduct>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM software_product WHERE id = ?1");
        self.connection()
            .query_row(&sql, params![software_id], product_from_row)
            .optional()
    }

    pub fn set_product_status_row(
        &self,
        software_id: &str,
        status: ProductStatus,
        updated_at: &str,
    ) -> Result<usize> {
        self.connection().execute(
            "UPDATE software_product SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), updated_at, software_id],
        )
    }

    /// Active products for a company, ordered by id.
    pub fn get_active_products(&self, company_id: &str) -> Result<Vec<SoftwareProduct>> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM software_product \
             WHERE company_id = ?1 AND status = 'active' ORDER BY id"
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let products = stmt
            .query_map(params![company_id], product_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(products)
    }

    // ── Feature Assignments ──────────────────────────────────────

    /// Returns true when a new assignment row was written.
    pub fn insert_assignment(
        &self,
        software_id: &str,
        feature_tag_id: i64,
        source: &str,
        assigned_at: &str,
    ) -> Result<bool> {
        let changed = self.connection().execute(
            "INSERT OR IGNORE INTO product_feature (software_id, feature_tag_id, source, assigned_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![software_id, feature_tag_id, source, assigned_at],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_assignment(&self, software_id: &str, feature_tag_id: i64) -> Result<bool> {
        let changed = self.connection().execute(
            "DELETE FROM product_feature WHERE software_id = ?1 AND feature_tag_id = ?2",
            params![software_id, feature_tag_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_product_features(&self, software_id: &str) -> Result<BTreeSet<FeatureTag>> {
        let mut stmt = self.connection().prepare(
            "SELECT ft.id, ft.category_id, ft.name \
             FROM product_feature pf \
             JOIN feature_tag ft ON ft.id = pf.feature_tag_id \
             WHERE pf.software_id = ?1",
        )?;
        let tags = stmt
            .query_map(params![software_id], |row| {
                Ok(FeatureTag {
                    id: row.get(0)?,
                    category_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })?
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(tags)
    }

    /// Feature sets of every active product of a company, keyed by software id.
    /// Products without assignments map to an empty set.
    pub fn get_company_features(
        &self,
        company_id: &str,
    ) -> Result<BTreeMap<String, BTreeSet<FeatureTag>>> {
        let mut features: BTreeMap<String, BTreeSet<FeatureTag>> = BTreeMap::new();

        let mut product_stmt = self.connection().prepare(
            "SELECT id FROM software_product WHERE company_id = ?1 AND status = 'active'",
        )?;
        let ids = product_stmt
            .query_map(params![company_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>>>()?;
        for id in ids {
            features.entry(id).or_default();
        }

        let mut stmt = self.connection().prepare(
            "SELECT pf.software_id, ft.id, ft.category_id, ft.name \
             FROM product_feature pf \
             JOIN feature_tag ft ON ft.id = pf.feature_tag_id \
             JOIN software_product sp ON sp.id = pf.software_id \
             WHERE sp.company_id = ?1 AND sp.status = 'active'",
        )?;
        let rows = stmt.query_map(params![company_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                FeatureTag {
                    id: row.get(1)?,
                    category_id: row.get(2)?,
                    name: row.get(3)?,
                },
            ))
        })?;
        for row in rows {
            let (software_id, tag) = row?;
            features.entry(software_id).or_default().insert(tag);
        }
        Ok(features)
    }

    // ── Category Revisions ───────────────────────────────────────

    pub fn bump_category_revision(
        &self,
        company_id: &str,
        category: &str,
        changed_at: &str,
    ) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO category_revision (company_id, category, revision, changed_at) \
             VALUES (?1, ?2, 1, ?3) \
             ON CONFLICT(company_id, category) DO UPDATE SET \
                 revision = revision + 1, \
                 changed_at = excluded.changed_at",
            params![company_id, category, changed_at],
        )?;
        self.connection().query_row(
            "SELECT revision FROM category_revision WHERE company_id = ?1 AND category = ?2",
            params![company_id, category],
            |row| row.get(0),
        )
    }

    pub fn get_category_revision(
        &self,
        company_id: &str,
        category: &str,
    ) -> Result<Option<CategoryRevision>> {
        self.connection()
            .query_row(
                "SELECT company_id, category, revision, changed_at FROM category_revision \
                 WHERE company_id = ?1 AND category = ?2",
                params![company_id, category],
                |row| {
                    Ok(CategoryRevision {
                        company_id: row.get(0)?,
                        category: row.get(1)?,
                        revision: row.get(2)?,
                        changed_at: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    pub fn get_category_revisions(&self, company_id: &str) -> Result<HashMap<String, i64>> {
        let mut stmt = self.connection().prepare(
            "SELECT category, revision FROM category_revision WHERE company_id = ?1",
        )?;
        let revisions = stmt
            .query_map(params![company_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<HashMap<String, i64>>>()?;
        Ok(revisions)
    }

    // ── Overlap Pairs ────────────────────────────────────────────

    /// Replace the stored pairs of one category with `pairs` in a single transaction.
    pub fn replace_category_pairs(
        &self,
        company_id: &str,
        category: &str,
        pairs: &[OverlapPair],
    ) -> Result<usize> {
        let tx = self.write_transaction()?;
        tx.execute(
            "DELETE FROM overlap_pair WHERE company_id = ?1 AND category = ?2",
            params![company_id, category],
        )?;
        let mut count = 0;
        {
            let mut pair_stmt = tx.prepare_cached(
                "INSERT INTO overlap_pair \
                 (company_id, category, software_id_a, software_id_b, overlap_percentage, \
                  cost_implication, insufficient_data, job_id, computed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            let mut feature_stmt = tx.prepare_cached(
                "INSERT INTO overlap_pair_feature \
                 (company_id, category, software_id_a, software_id_b, feature_tag_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for pair in pairs {
                count += pair_stmt.execute(params![
                    company_id,
                    category,
                    pair.software_id_a,
                    pair.software_id_b,
                    pair.overlap_percentage,
                    pair.cost_implication,
                    pair.insufficient_data,
                    pair.job_id,
                    pair.computed_at,
                ])?;
                for tag in &pair.shared_features {
                    feature_stmt.execute(params![
                        company_id,
                        category,
                        pair.software_id_a,
                        pair.software_id_b,
                        tag.id
                    ])?;
                }
            }
        }
        tx.commit()?;
        debug!(
            "Stored {} overlap pairs for company {} category '{}'",
            count, company_id, category
        );
        Ok(count)
    }

    /// Pairs for a company, optionally restricted to one category, in canonical order.
    pub fn get_overlap_pairs(
        &self,
        company_id: &str,
        category: Option<&str>,
    ) -> Result<Vec<OverlapPair>> {
        let mut stmt = self.connection().prepare(
            "SELECT company_id, category, software_id_a, software_id_b, overlap_percentage, \
                    cost_implication, insufficient_data, job_id, computed_at \
             FROM overlap_pair \
             WHERE company_id = ?1 AND (?2 IS NULL OR category = ?2) \
             ORDER BY category, software_id_a, software_id_b",
        )?;
        let mut pairs = stmt
            .query_map(params![company_id, category], |row| {
                Ok(OverlapPair {
                    company_id: row.get(0)?,
                    category: row.get(1)?,
                    software_id_a: row.get(2)?,
                    software_id_b: row.get(3)?,
                    overlap_percentage: row.get(4)?,
                    shared_features: Vec::new(),
                    cost_implication: row.get(5)?,
                    insufficient_data: row.get(6)?,
                    job_id: row.get(7)?,
                    computed_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;

        let mut feature_stmt = self.connection().prepare(
            "SELECT opf.category, opf.software_id_a, opf.software_id_b, \
                    ft.id, ft.category_id, ft.name \
             FROM overlap_pair_feature opf \
             JOIN feature_tag ft ON ft.id = opf.feature_tag_id \
             WHERE opf.company_id = ?1 AND (?2 IS NULL OR opf.category = ?2) \
             ORDER BY ft.id",
        )?;
        let mut shared: HashMap<(String, String, String), Vec<FeatureTag>> = HashMap::new();
        let rows = feature_stmt.query_map(params![company_id, category], |row| {
            Ok((
                (row.get(0)?, row.get(1)?, row.get(2)?),
                FeatureTag {
                    id: row.get(3)?,
                    category_id: row.get(4)?,
                    name: row.get(5)?,
                },
            ))
        })?;
        for row in rows {
            let (key, tag) = row?;
            shared.entry(key).or_default().push(tag);
        }

        for pair in &mut pairs {
            let key = (
                pair.category.clone(),
                pair.software_id_a.clone(),
                pair.software_id_b.clone(),
            );
            if let Some(tags) = shared.remove(&key) {
                pair.shared_features = tags;
            }
        }
        Ok(pairs)
    }

    /// Drop stored pairs and summary for a category that no longer has active products.
    pub fn delete_category_results(&self, company_id: &str, category: &str) -> Result<()> {
        let tx = self.write_transaction()?;
        tx.execute(
            "DELETE FROM overlap_pair WHERE company_id = ?1 AND category = ?2",
            params![company_id, category],
        )?;
        tx.execute(
            "DELETE FROM category_summary WHERE company_id = ?1 AND category = ?2",
            params![company_id, category],
        )?;
        tx.commit()
    }

    // ── Category Summaries ───────────────────────────────────────

    pub fn upsert_category_summary(&self, summary: &CategorySummary) -> Result<()> {
        self.connection().execute(
            "INSERT INTO category_summary \
             (company_id, category, total_software_count, redundant_pairs_count, \
              total_potential_savings, last_analyzed_at, analyzed_revision, \
              analysis_status, last_error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(company_id, category) DO UPDATE SET \
                 total_software_count = excluded.total_software_count, \
                 redundant_pairs_count = excluded.redundant_pairs_count, \
                 total_potential_savings = excluded.total_potential_savings, \
                 last_analyzed_at = excluded.last_analyzed_at, \
                 analyzed_revision = excluded.analyzed_revision, \
                 analysis_status = excluded.analysis_status, \
                 last_error = excluded.last_error",
            params![
                summary.company_id,
                summary.category,
                summary.total_software_count,
                summary.redundant_pairs_count,
                summary.total_potential_savings,
                summary.last_analyzed_at,
                summary.analyzed_revision,
                summary.analysis_status.as_str(),
                summary.last_error,
            ],
        )?;
        Ok(())
    }

    /// Flag a category as failed without touching its last good aggregates.
    pub fn mark_category_failed(&self, company_id: &str, category: &str, error: &str) -> Result<()> {
        self.connection().execute(
            "INSERT INTO category_summary (company_id, category, analysis_status, last_error) \
             VALUES (?1, ?2, 'failed', ?3) \
             ON CONFLICT(company_id, category) DO UPDATE SET \
                 analysis_status = 'failed', \
                 last_error = excluded.last_error",
            params![company_id, category, error],
        )?;
        Ok(())
    }

    pub fn get_category_summary(
        &self,
        company_id: &str,
        category: &str,
    ) -> Result<Option<CategorySummary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM category_summary WHERE company_id = ?1 AND category = ?2"
        );
        self.connection()
            .query_row(&sql, params![company_id, category], summary_from_row)
            .optional()
    }

    pub fn get_category_summaries(&self, company_id: &str) -> Result<Vec<CategorySummary>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM category_summary WHERE company_id = ?1 \
             ORDER BY total_potential_savings DESC, category ASC"
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let summaries = stmt
            .query_map(params![company_id], summary_from_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(summaries)
    }

    // ── Analysis Progress ────────────────────────────────────────

    pub fn insert_progress(&self, progress: &AnalysisProgress) -> Result<()> {
        self.connection().execute(
            "INSERT INTO analysis_progress \
             (job_id, company_id, stage, items_total, items_processed, cancellation_requested, \
              status, current_category, message, error, degraded_categories, \
              started_at, updated_at, finished_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                progress.job_id,
                progress.company_id,
                progress.stage.as_str(),
                progress.items_total,
                progress.items_processed,
                progress.cancellation_requested,
                progress.status.as_str(),
                progress.current_category,
                progress.message,
                progress.error,
                to_json(&progress.degraded_categories)?,
                progress.started_at,
                progress.updated_at,
                progress.finished_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_progress_by_job(&self, job_id: &str) -> Result<Option<AnalysisProgress>> {
        let sql = format!("SELECT {PROGRESS_COLUMNS} FROM analysis_progress WHERE job_id = ?1");
        self.connection()
            .query_row(&sql, params![job_id], progress_from_row)
            .optional()
    }

    pub fn get_running_progress(&self, company_id: &str) -> Result<Option<AnalysisProgress>> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM analysis_progress \
             WHERE company_id = ?1 AND status = 'running'"
        );
        self.connection()
            .query_row(&sql, params![company_id], progress_from_row)
            .optional()
    }

    pub fn get_latest_progress(&self, company_id: &str) -> Result<Option<AnalysisProgress>> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM analysis_progress \
             WHERE company_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT 1"
        );
        self.connection()
            .query_row(&sql, params![company_id], progress_from_row)
            .optional()
    }

    /// Atomic counter update; a no-op once the job left `running`.
    pub fn add_items_processed(&self, job_id: &str, delta: i64, now: &str) -> Result<bool> {
        let changed = self.connection().execute(
            "UPDATE analysis_progress SET items_processed = items_processed + ?1, updated_at = ?2 \
             WHERE job_id = ?3 AND status = 'running'",
            params![delta, now, job_id],
        )?;
        Ok(changed > 0)
    }

    pub fn is_cancellation_requested(&self, job_id: &str) -> Result<bool> {
        let flag: Option<bool> = self
            .connection()
            .query_row(
                "SELECT cancellation_requested FROM analysis_progress WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(false))
    }

    pub fn flag_cancellation(&self, company_id: &str, now: &str) -> Result<usize> {
        self.connection().execute(
            "UPDATE analysis_progress SET cancellation_requested = 1, \
                 message = 'Cancellation requested', updated_at = ?1 \
             WHERE company_id = ?2 AND status = 'running'",
            params![now, company_id],
        )
    }

    pub fn update_stage(
        &self,
        job_id: &str,
        stage: Stage,
        current_category: Option<&str>,
        message: &str,
        now: &str,
    ) -> Result<bool> {
        let changed = self.connection().execute(
            "UPDATE analysis_progress SET stage = ?1, current_category = ?2, message = ?3, \
                 updated_at = ?4 \
             WHERE job_id = ?5 AND status = 'running'",
            params![stage.as_str(), current_category, message, now, job_id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_items_total(&self, job_id: &str, items_total: i64, now: &str) -> Result<bool> {
        let changed = self.connection().execute(
            "UPDATE analysis_progress SET items_total = ?1, updated_at = ?2 \
             WHERE job_id = ?3 AND status = 'running'",
            params![items_total, now, job_id],
        )?;
        Ok(changed > 0)
    }

    /// Move a running job to a terminal status. Returns false when the job had
    /// already left `running`; terminal rows are never rewritten.
    pub fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        message: &str,
        error: Option<&str>,
        degraded_categories: &[String],
        now: &str,
    ) -> Result<bool> {
        let changed = self.connection().execute(
            "UPDATE analysis_progress SET status = ?1, stage = 'done', message = ?2, error = ?3, \
                 degraded_categories = ?4, current_category = NULL, \
                 finished_at = ?5, updated_at = ?5 \
             WHERE job_id = ?6 AND status = 'running'",
            params![
                status.as_str(),
                message,
                error,
                to_json(degraded_categories)?,
                now,
                job_id
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete terminal progress records that finished before `cutoff`.
    pub fn purge_finished_progress(&self, cutoff: &str) -> Result<usize> {
        self.connection().execute(
            "DELETE FROM analysis_progress WHERE status <> 'running' AND finished_at < ?1",
            params![cutoff],
        )
    }

    // ── Activity Log ─────────────────────────────────────────────

    /// Append an entry and drop the oldest beyond `cap`. A no-op for unknown
    /// (or already purged) jobs.
    pub fn insert_activity(
        &self,
        job_id: &str,
        kind: ActivityKind,
        message: &str,
        now: &str,
        cap: usize,
    ) -> Result<bool> {
        let tx = self.write_transaction()?;
        let inserted = tx.execute(
            "INSERT INTO analysis_activity (job_id, kind, message, created_at) \
             SELECT ?1, ?2, ?3, ?4 \
             WHERE EXISTS (SELECT 1 FROM analysis_progress WHERE job_id = ?1)",
            params![job_id, kind.as_str(), message, now],
        )?;
        if inserted > 0 {
            tx.execute(
                "DELETE FROM analysis_activity WHERE job_id = ?1 AND id NOT IN \
                     (SELECT id FROM analysis_activity WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2)",
                params![job_id, cap as i64],
            )?;
        }
        tx.commit()?;
        Ok(inserted > 0)
    }

    /// Entries of one job, oldest first.
    pub fn get_activity(&self, job_id: &str) -> Result<Vec<ActivityEntry>> {
        let mut stmt = self.connection().prepare(
            "SELECT kind, message, created_at FROM analysis_activity \
             WHERE job_id = ?1 ORDER BY id",
        )?;
        let entries = stmt
            .query_map(params![job_id], |row| {
                Ok(ActivityEntry {
                    kind: enum_col(row, 0)?,
                    message: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }

    // ── Consolidation Recommendations ────────────────────────────

    /// Insert a pending recommendation, or refresh the numbers of an existing
    /// pending row with the same cluster key. Accepted/dismissed rows are preserved.
    pub fn upsert_recommendation(
        &self,
        rec: &ConsolidationRecommendation,
    ) -> Result<RecommendationWrite> {
        let tx = self.write_transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, status FROM consolidation_recommendation \
                 WHERE company_id = ?1 AND cluster_key = ?2",
                params![rec.company_id, rec.cluster_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match existing {
            Some((id, status)) if status != RecommendationStatus::Pending.as_str() => {
                RecommendationWrite::Preserved(id)
            }
            Some((id, _)) => {
                tx.execute(
                    "UPDATE consolidation_recommendation SET \
                         category = ?1, annual_savings = ?2, features_covered = ?3, \
                         features_at_risk = ?4, migration_effort = ?5, business_risk = ?6, \
                         recommendation_text = ?7, confidence_score = ?8, updated_at = ?9 \
                     WHERE id = ?10 AND status = 'pending'",
                    params![
                        rec.category,
                        rec.annual_savings,
                        to_json(&rec.features_covered)?,
                        to_json(&rec.features_at_risk)?,
                        rec.migration_effort.as_str(),
                        rec.business_risk.as_str(),
                        rec.recommendation_text,
                        rec.confidence_score,
                        rec.updated_at,
                        id,
                    ],
                )?;
                RecommendationWrite::Updated(id)
            }
            None => {
                tx.execute(
                    "INSERT INTO consolidation_recommendation \
                     (company_id, category, cluster_key, software_to_keep_id, \
                      software_to_remove_ids, annual_savings, features_covered, \
                      features_at_risk, migration_effort, business_risk, \
                      recommendation_text, confidence_score, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'pending', ?13, ?14)",
                    params![
                        rec.company_id,
                        rec.category,
                        rec.cluster_key,
                        rec.software_to_keep_id,
                        to_json(&rec.software_to_remove_ids)?,
                        rec.annual_savings,
                        to_json(&rec.features_covered)?,
                        to_json(&rec.features_at_risk)?,
                        rec.migration_effort.as_str(),
                        rec.business_risk.as_str(),
                        rec.recommendation_text,
                        rec.confidence_score,
                        rec.created_at,
                        rec.updated_at,
                    ],
                )?;
                RecommendationWrite::Inserted(tx.last_insert_rowid())
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_recommendation(&self, id: i64) -> Result<Option<ConsolidationRecommendation>> {
        let sql = format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM consolidation_recommendation WHERE id = ?1"
        );
        self.connection()
            .query_row(&sql, params![id], recommendation_from_row)
            .optional()
    }

    /// Recommendations ordered by savings (highest first), optionally filtered by status.
    pub fn get_recommendations(
        &self,
        company_id: &str,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<ConsolidationRecommendation>> {
        let sql = format!(
            "SELECT {RECOMMENDATION_COLUMNS} FROM consolidation_recommendation \
             WHERE company_id = ?1 AND (?2 IS NULL OR status = ?2) \
             ORDER BY annual_savings DESC, id ASC"
        );
        let mut stmt = self.connection().prepare(&sql)?;
        let recs = stmt
            .query_map(
                params![company_id, status.map(|s| s.as_str())],
                recommendation_from_row,
            )?
            .collect::<Result<Vec<_>>>()?;
        Ok(recs)
    }

    pub fn set_recommendation_status_row(
        &self,
        id: i64,
        status: RecommendationStatus,
        now: &str,
    ) -> Result<usize> {
        self.connection().execute(
            "UPDATE consolidation_recommendation SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )
    }
}
