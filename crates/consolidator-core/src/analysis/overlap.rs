use crate::storage::models::{FeatureTag, SoftwareProduct};
use std::collections::BTreeSet;

/// Result of comparing two products of the same category. `software_id_a < software_id_b`.
#[derive(Debug, Clone, PartialEq)]
pub struct PairComparison {
    pub software_id_a: String,
    pub software_id_b: String,
    pub overlap_percentage: f64,
    pub shared_features: Vec<FeatureTag>,
    pub cost_implication: f64,
    /// Either side had no assigned features; overlap is reported as 0 and the
    /// pair is ignored for savings and recommendations.
    pub insufficient_data: bool,
}

impl PairComparison {
    pub fn is_redundant(&self, threshold: f64) -> bool {
        !self.insufficient_data && self.overlap_percentage >= threshold
    }
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Jaccard similarity of two feature sets as a percentage, rounded to one decimal.
/// Zero when either set is empty.
pub fn overlap_percentage(a: &BTreeSet<FeatureTag>, b: &BTreeSet<FeatureTag>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    round_to(shared as f64 / union as f64 * 100.0, 1).clamp(0.0, 100.0)
}

/// Redundant spend for a pair, bounded by the cheaper product. Rounded to cents.
pub fn cost_implication(overlap_percentage: f64, cost_a: f64, cost_b: f64) -> f64 {
    let cheaper = cost_a.min(cost_b).max(0.0);
    round_to(overlap_percentage / 100.0 * cheaper, 2).min(cheaper)
}

/// Number of unordered pairs among `n` products.
pub fn pair_count(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Every unordered index pair `(i, j)` with `i < j`, in ascending order.
/// With products sorted by id this is the canonical, reproducible processing order.
pub fn enumerate_pairs(n: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(pair_count(n));
    for i in 0..n {
        for j in (i + 1)..n {
            pairs.push((i, j));
        }
    }
    pairs
}

/// Compare two products. Argument order does not matter; the result is canonical.
pub fn compare(
    first: (&SoftwareProduct, &BTreeSet<FeatureTag>),
    second: (&SoftwareProduct, &BTreeSet<FeatureTag>),
) -> PairComparison {
    let ((a, features_a), (b, features_b)) = if first.0.id <= second.0.id {
        (first, second)
    } else {
        (second, first)
    };

    let insufficient_data = features_a.is_empty() || features_b.is_empty();
    let overlap = overlap_percentage(features_a, features_b);
    let shared_features: Vec<FeatureTag> = if insufficient_data {
        Vec::new()
    } else {
        features_a.intersection(features_b).cloned().collect()
    };
    let cost = if insufficient_data {
        0.0
    } else {
        cost_implication(overlap, a.annual_cost, b.annual_cost)
    };

    PairComparison {
        software_id_a: a.id.clone(),
        software_id_b: b.id.clone(),
        overlap_percentage: overlap,
        shared_features,
        cost_implication: cost,
        insufficient_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::ProductStatus;

    fn tag(id: i64, name: &str) -> FeatureTag {
        FeatureTag {
            id,
            category_id: 1,
            name: name.to_string(),
        }
    }

    fn product(id: &str, cost: f64) -> SoftwareProduct {
        SoftwareProduct {
            id: id.to_string(),
            company_id: "acme".to_string(),
            name: id.to_uppercase(),
            vendor: String::new(),
            category: "CRM".to_string(),
            annual_cost: cost,
            status: ProductStatus::Active,
            active_users: None,
            business_critical: false,
            regulatory: false,
            updated_at: String::new(),
        }
    }

    fn set(tags: &[FeatureTag]) -> BTreeSet<FeatureTag> {
        tags.iter().cloned().collect()
    }

    #[test]
    fn test_crm_example() {
        let (x, y, z) = (tag(1, "x"), tag(2, "y"), tag(3, "z"));
        let a = product("a", 120_000.0);
        let b = product("b", 60_000.0);
        let fa = set(&[x, y.clone(), z.clone()]);
        let fb = set(&[y, z]);

        let result = compare((&a, &fa), (&b, &fb));
        assert_eq!(result.overlap_percentage, 66.7);
        assert_eq!(result.cost_implication, 40_020.0);
        assert_eq!(result.shared_features.len(), 2);
        assert!(!result.insufficient_data);
        assert!(result.is_redundant(40.0));
    }

    #[test]
    fn test_identical_sets_are_full_overlap() {
        let f = set(&[tag(1, "sso"), tag(2, "audit log")]);
        assert_eq!(overlap_percentage(&f, &f), 100.0);
    }

    #[test]
    fn test_disjoint_sets_are_zero() {
        let fa = set(&[tag(1, "a")]);
        let fb = set(&[tag(2, "b")]);
        assert_eq!(overlap_percentage(&fa, &fb), 0.0);
    }

    #[test]
    fn test_empty_side_is_insufficient() {
        let a = product("a", 100.0);
        let b = product("b", 50.0);
        let fa = set(&[tag(1, "a")]);
        let fb = BTreeSet::new();

        let result = compare((&a, &fa), (&b, &fb));
        assert!(result.insufficient_data);
        assert_eq!(result.overlap_percentage, 0.0);
        assert_eq!(result.cost_implication, 0.0);
        assert!(!result.is_redundant(0.0));
    }

    #[test]
    fn test_compare_is_symmetric_and_canonical() {
        let a = product("alpha", 300.0);
        let b = product("beta", 200.0);
        let fa = set(&[tag(1, "a"), tag(2, "b"), tag(3, "c")]);
        let fb = set(&[tag(2, "b"), tag(3, "c"), tag(4, "d"), tag(5, "e")]);

        let ab = compare((&a, &fa), (&b, &fb));
        let ba = compare((&b, &fb), (&a, &fa));
        assert_eq!(ab, ba);
        assert_eq!(ab.software_id_a, "alpha");
        assert_eq!(ab.software_id_b, "beta");
        assert_eq!(ab.overlap_percentage, 40.0);
    }

    #[test]
    fn test_cost_bounded_by_cheaper_product() {
        for overlap in [0.0, 12.5, 66.7, 99.9, 100.0] {
            let cost = cost_implication(overlap, 999.99, 10_000.0);
            assert!(cost <= 999.99);
            assert!(cost >= 0.0);
        }
    }

    #[test]
    fn test_pair_enumeration() {
        assert_eq!(pair_count(0), 0);
        assert_eq!(pair_count(1), 0);
        assert_eq!(pair_count(4), 6);
        assert_eq!(
            enumerate_pairs(3),
            vec![(0, 1), (0, 2), (1, 2)]
        );
        assert!(enumerate_pairs(5).iter().all(|(i, j)| i < j));
    }
}
