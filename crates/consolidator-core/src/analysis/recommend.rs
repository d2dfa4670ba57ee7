use crate::analysis::overlap::round_to;
use crate::config::KeepTieBreak;
use crate::error::Error;
use crate::storage::models::{
    ConsolidationRecommendation, FeatureTag, Level, OverlapPair, RecommendationStatus,
    SoftwareProduct,
};
use crate::storage::queries::RecommendationWrite;
use crate::storage::{now_timestamp, Database};
use ahash::AHashMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::hash::Hasher;
use tracing::{debug, info};
use twox_hash::XxHash64;

#[derive(Debug, Clone, Copy)]
pub struct RecommendationOptions {
    pub redundancy_threshold: f64,
    pub tie_break: KeepTieBreak,
}

/// Inputs for one company. `features` must cover every active product,
/// with an empty set for products lacking feature data.
pub struct RecommendationInput<'a> {
    pub company_id: &'a str,
    pub pairs: &'a [OverlapPair],
    pub products: &'a [SoftwareProduct],
    pub features: &'a BTreeMap<String, BTreeSet<FeatureTag>>,
}

#[derive(Debug, Default)]
pub struct RecommendationRun {
    pub inserted: usize,
    pub updated: usize,
    pub preserved: usize,
    pub recommendations: Vec<ConsolidationRecommendation>,
}

impl RecommendationRun {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Connected groups of products linked by redundant pairs, per category.
/// Deterministic: members sorted, clusters ordered by their smallest id.
pub fn redundant_clusters(pairs: &[OverlapPair], threshold: f64) -> BTreeMap<String, Vec<Vec<String>>> {
    let mut adjacency: BTreeMap<&str, BTreeMap<&str, BTreeSet<&str>>> = BTreeMap::new();
    for pair in pairs {
        if pair.insufficient_data || pair.overlap_percentage < threshold {
            continue;
        }
        let graph = adjacency.entry(pair.category.as_str()).or_default();
        graph
            .entry(pair.software_id_a.as_str())
            .or_default()
            .insert(pair.software_id_b.as_str());
        graph
            .entry(pair.software_id_b.as_str())
            .or_default()
            .insert(pair.software_id_a.as_str());
    }

    let mut clusters = BTreeMap::new();
    for (category, graph) in adjacency {
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut groups = Vec::new();
        for &start in graph.keys() {
            if !visited.insert(start) {
                continue;
            }
            let mut members = BTreeSet::new();
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                members.insert(node.to_string());
                if let Some(neighbors) = graph.get(node) {
                    for &next in neighbors {
                        if visited.insert(next) {
                            queue.push_back(next);
                        }
                    }
                }
            }
            groups.push(members.into_iter().collect::<Vec<_>>());
        }
        clusters.insert(category.to_string(), groups);
    }
    clusters
}

/// Order keep candidates: widest coverage of the cluster's features, then
/// cheapest, then the configured tie break. The first element wins.
fn compare_keep_candidates(
    a: &SoftwareProduct,
    b: &SoftwareProduct,
    coverage: &AHashMap<&str, usize>,
    tie_break: KeepTieBreak,
) -> Ordering {
    let cov_a = coverage.get(a.id.as_str()).copied().unwrap_or(0);
    let cov_b = coverage.get(b.id.as_str()).copied().unwrap_or(0);
    cov_b
        .cmp(&cov_a)
        .then_with(|| a.annual_cost.total_cmp(&b.annual_cost))
        .then_with(|| match tie_break {
            // None sorts below any known count.
            KeepTieBreak::ActiveUsersThenId => b.active_users.cmp(&a.active_users),
            KeepTieBreak::Id => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

pub fn migration_effort(gap_count: usize) -> Level {
    match gap_count {
        0 => Level::Low,
        1..=3 => Level::Medium,
        _ => Level::High,
    }
}

pub fn business_risk(remove: &[&SoftwareProduct]) -> Level {
    let critical = remove.iter().any(|p| p.business_critical);
    let regulatory = remove.iter().any(|p| p.regulatory);
    match (critical, regulatory) {
        (true, true) => Level::High,
        (true, false) | (false, true) => Level::Medium,
        (false, false) => Level::Low,
    }
}

/// Stable identity of a proposal: the keep product plus the sorted remove set.
pub fn cluster_key(keep_id: &str, remove_ids: &[String]) -> String {
    let mut sorted: Vec<&str> = remove_ids.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(keep_id.as_bytes());
    for id in sorted {
        hasher.write_u8(0);
        hasher.write(id.as_bytes());
    }
    format!("{:016x}", hasher.finish())
}

fn format_money(amount: f64) -> String {
    let cents = (amount * 100.0).round() as i64;
    let whole = (cents / 100).to_string();
    let mut grouped = String::new();
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("${}.{:02}", grouped, cents % 100)
}

fn recommendation_text(
    category: &str,
    keep: &SoftwareProduct,
    remove: &[&SoftwareProduct],
    savings: f64,
    at_risk: &[String],
) -> String {
    let names: Vec<&str> = remove.iter().map(|p| p.name.as_str()).collect();
    let mut text = format!(
        "Consolidate {}: keep {} and retire {} to save {} per year.",
        category,
        keep.name,
        names.join(", "),
        format_money(savings)
    );
    if at_risk.is_empty() {
        text.push_str(&format!(" {} covers every feature of the retired tools.", keep.name));
    } else {
        text.push_str(&format!(
            " {} feature(s) not covered by {}: {}.",
            at_risk.len(),
            keep.name,
            at_risk.join(", ")
        ));
    }
    text
}

/// Pure recommendation pass. Same inputs give the same keep/remove split and
/// savings; only `created_at`/`updated_at` carry the clock.
pub fn generate_recommendations(
    input: &RecommendationInput<'_>,
    options: &RecommendationOptions,
) -> Vec<ConsolidationRecommendation> {
    let by_id: AHashMap<&str, &SoftwareProduct> =
        input.products.iter().map(|p| (p.id.as_str(), p)).collect();
    let empty = BTreeSet::new();
    let features_of = |id: &str| input.features.get(id).unwrap_or(&empty);

    let now = now_timestamp();
    let mut out = Vec::new();

    for (category, clusters) in redundant_clusters(input.pairs, options.redundancy_threshold) {
        let lacking_data = input
            .products
            .iter()
            .filter(|p| p.category == category && features_of(&p.id).is_empty())
            .count();

        for members in clusters {
            let products: Vec<&SoftwareProduct> = members
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            if products.len() < 2 {
                continue;
            }

            // Every member's features lie within the cluster's union, so a
            // product's coverage of the union is its own feature count.
            let coverage: AHashMap<&str, usize> = products
                .iter()
                .map(|p| (p.id.as_str(), features_of(&p.id).len()))
                .collect();

            let mut ranked = products.clone();
            ranked.sort_by(|a, b| compare_keep_candidates(a, b, &coverage, options.tie_break));
            let keep = ranked[0];
            let remove: Vec<&SoftwareProduct> = ranked[1..].to_vec();
            let mut remove_ids: Vec<String> = remove.iter().map(|p| p.id.clone()).collect();
            remove_ids.sort();

            let keep_features = features_of(&keep.id);
            let removed_features: BTreeSet<&FeatureTag> = remove
                .iter()
                .flat_map(|p| features_of(&p.id).iter())
                .collect();
            let mut features_covered: Vec<String> = removed_features
                .iter()
                .filter(|t| keep_features.contains(**t))
                .map(|t| t.name.clone())
                .collect();
            let mut features_at_risk: Vec<String> = removed_features
                .iter()
                .filter(|t| !keep_features.contains(**t))
                .map(|t| t.name.clone())
                .collect();
            features_covered.sort();
            features_at_risk.sort();

            let savings = round_to(remove.iter().map(|p| p.annual_cost).sum::<f64>(), 2);
            let confidence = round_to(
                products.len() as f64 / (products.len() + lacking_data) as f64,
                2,
            );

            out.push(ConsolidationRecommendation {
                id: 0,
                company_id: input.company_id.to_string(),
                category: category.clone(),
                cluster_key: cluster_key(&keep.id, &remove_ids),
                software_to_keep_id: keep.id.clone(),
                software_to_remove_ids: remove_ids,
                annual_savings: savings,
                migration_effort: migration_effort(features_at_risk.len()),
                business_risk: business_risk(&remove),
                recommendation_text: recommendation_text(
                    &category,
                    keep,
                    &remove,
                    savings,
                    &features_at_risk,
                ),
                features_covered,
                features_at_risk,
                confidence_score: confidence,
                status: RecommendationStatus::Pending,
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        }
    }

    out.sort_by(|a, b| {
        b.annual_savings
            .total_cmp(&a.annual_savings)
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.software_to_keep_id.cmp(&b.software_to_keep_id))
    });
    out
}

/// Persists generated proposals. Only creates `pending` rows or refreshes
/// existing `pending` rows with the same cluster key; accepted and dismissed
/// rows are never touched and nothing is deleted.
pub struct RecommendationEngine<'a> {
    db: &'a Database,
    options: RecommendationOptions,
}

impl<'a> RecommendationEngine<'a> {
    pub fn new(db: &'a Database, options: RecommendationOptions) -> Self {
        Self { db, options }
    }

    pub fn generate_and_store(
        &self,
        input: &RecommendationInput<'_>,
    ) -> Result<RecommendationRun, Error> {
        let generated = generate_recommendations(input, &self.options);
        let mut run = RecommendationRun::default();

        for rec in &generated {
            let outcome = self.db.upsert_recommendation(rec)?;
            match outcome {
                RecommendationWrite::Inserted(_) => run.inserted += 1,
                RecommendationWrite::Updated(_) => run.updated += 1,
                RecommendationWrite::Preserved(id) => {
                    debug!(id, cluster_key = %rec.cluster_key, "Keeping caller-reviewed recommendation");
                    run.preserved += 1;
                }
            }
            if let Some(stored) = self.db.get_recommendation(outcome.id())? {
                run.recommendations.push(stored);
            }
        }

        info!(
            company_id = input.company_id,
            inserted = run.inserted,
            updated = run.updated,
            preserved = run.preserved,
            "Recommendations generated"
        );
        Ok(run)
    }

    /// Regenerate from the stored pairs of the given categories (all when `None`)
    /// and the current catalog.
    pub fn refresh_from_store(
        &self,
        company_id: &str,
        categories: Option<&[String]>,
    ) -> Result<RecommendationRun, Error> {
        let products = self.db.get_active_products(company_id)?;
        let features = self.db.get_company_features(company_id)?;
        let mut pairs = self.db.get_overlap_pairs(company_id, None)?;
        if let Some(categories) = categories {
            pairs.retain(|p| categories.iter().any(|c| c == &p.category));
        }
        self.generate_and_store(&RecommendationInput {
            company_id,
            pairs: &pairs,
            products: &products,
            features: &features,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::ProductStatus;

    fn tag(id: i64) -> FeatureTag {
        FeatureTag {
            id,
            category_id: 1,
            name: format!("feature-{id}"),
        }
    }

    fn product(id: &str, cost: f64, users: Option<i64>) -> SoftwareProduct {
        SoftwareProduct {
            id: id.to_string(),
            company_id: "acme".into(),
            name: id.to_uppercase(),
            vendor: String::new(),
            category: "CRM".into(),
            annual_cost: cost,
            status: ProductStatus::Active,
            active_users: users,
            business_critical: false,
            regulatory: false,
            updated_at: String::new(),
        }
    }

    fn pair(a: &str, b: &str, overlap: f64) -> OverlapPair {
        OverlapPair {
            company_id: "acme".into(),
            category: "CRM".into(),
            software_id_a: a.into(),
            software_id_b: b.into(),
            overlap_percentage: overlap,
            shared_features: Vec::new(),
            cost_implication: 0.0,
            insufficient_data: false,
            job_id: "job".into(),
            computed_at: String::new(),
        }
    }

    fn options(tie_break: KeepTieBreak) -> RecommendationOptions {
        RecommendationOptions {
            redundancy_threshold: 40.0,
            tie_break,
        }
    }

    #[test]
    fn test_clusters_are_transitive_and_sorted() {
        let pairs = vec![
            pair("c", "d", 50.0),
            pair("a", "b", 80.0),
            pair("b", "c", 45.0),
            pair("e", "f", 10.0),
        ];
        let clusters = redundant_clusters(&pairs, 40.0);
        assert_eq!(clusters["CRM"], vec![vec!["a", "b", "c", "d"]]);
    }

    #[test]
    fn test_insufficient_pairs_never_cluster() {
        let mut p = pair("a", "b", 100.0);
        p.insufficient_data = true;
        assert!(redundant_clusters(&[p], 0.0).is_empty());
    }

    #[test]
    fn test_superset_is_kept_even_when_more_expensive() {
        let products = vec![product("a", 120_000.0, None), product("b", 60_000.0, None)];
        let mut features = BTreeMap::new();
        features.insert("a".to_string(), [tag(1), tag(2), tag(3)].into_iter().collect());
        features.insert("b".to_string(), [tag(2), tag(3)].into_iter().collect());
        let pairs = vec![pair("a", "b", 66.7)];

        let recs = generate_recommendations(
            &RecommendationInput {
                company_id: "acme",
                pairs: &pairs,
                products: &products,
                features: &features,
            },
            &options(KeepTieBreak::ActiveUsersThenId),
        );
        assert_eq!(recs.len(), 1);
        let rec = &recs[0];
        assert_eq!(rec.software_to_keep_id, "a");
        assert_eq!(rec.software_to_remove_ids, vec!["b"]);
        assert_eq!(rec.annual_savings, 60_000.0);
        assert!(rec.features_at_risk.is_empty());
        assert_eq!(rec.features_covered, vec!["feature-2", "feature-3"]);
        assert_eq!(rec.migration_effort, Level::Low);
        assert_eq!(rec.business_risk, Level::Low);
        assert_eq!(rec.confidence_score, 1.0);
    }

    #[test]
    fn test_tie_break_on_active_users_then_id() {
        let products = vec![
            product("a", 100.0, None),
            product("b", 100.0, Some(10)),
            product("c", 100.0, Some(50)),
        ];
        let same: BTreeSet<FeatureTag> = [tag(1), tag(2)].into_iter().collect();
        let features: BTreeMap<String, BTreeSet<FeatureTag>> = ["a", "b", "c"]
            .iter()
            .map(|id| (id.to_string(), same.clone()))
            .collect();
        let pairs = vec![pair("a", "b", 100.0), pair("a", "c", 100.0), pair("b", "c", 100.0)];
        let input = RecommendationInput {
            company_id: "acme",
            pairs: &pairs,
            products: &products,
            features: &features,
        };

        let by_users = generate_recommendations(&input, &options(KeepTieBreak::ActiveUsersThenId));
        assert_eq!(by_users[0].software_to_keep_id, "c");

        let by_id = generate_recommendations(&input, &options(KeepTieBreak::Id));
        assert_eq!(by_id[0].software_to_keep_id, "a");
        assert_eq!(by_id[0].software_to_remove_ids, vec!["b", "c"]);
    }

    #[test]
    fn test_levels() {
        assert_eq!(migration_effort(0), Level::Low);
        assert_eq!(migration_effort(3), Level::Medium);
        assert_eq!(migration_effort(4), Level::High);

        let mut critical = product("x", 1.0, None);
        critical.business_critical = true;
        let mut regulated = product("y", 1.0, None);
        regulated.regulatory = true;
        let plain = product("z", 1.0, None);
        assert_eq!(business_risk(&[&plain]), Level::Low);
        assert_eq!(business_risk(&[&plain, &critical]), Level::Medium);
        assert_eq!(business_risk(&[&critical, &regulated]), Level::High);
    }

    #[test]
    fn test_cluster_key_ignores_remove_order() {
        let k1 = cluster_key("a", &["c".into(), "b".into()]);
        let k2 = cluster_key("a", &["b".into(), "c".into()]);
        assert_eq!(k1, k2);
        assert_ne!(k1, cluster_key("b", &["a".into(), "c".into()]));
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(format_money(60_000.0), "$60,000.00");
        assert_eq!(format_money(1_234_567.891), "$1,234,567.89");
        assert_eq!(format_money(12.5), "$12.50");
    }
}
