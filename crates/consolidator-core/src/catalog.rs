//! Feature Catalog: the global feature taxonomy, the company inventory and the
//! product → feature assignments the analyzer reads.
//!
//! Every mutation that can change a category's comparison input bumps that
//! category's revision inside the same transaction, which is what the
//! staleness policy in [`crate::cache`] compares against.

use crate::error::Error;
use crate::storage::models::{
    CategoryRevision, FeatureCategory, FeatureTag, ProductStatus, SoftwareProduct,
};
use crate::storage::{now_timestamp, Database};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Where an assignment came from.
pub const SOURCE_MANUAL: &str = "manual";
pub const SOURCE_ENRICHMENT: &str = "enrichment";

/// Trim and collapse internal whitespace. Case is preserved for display;
/// lookups are case-insensitive at the storage layer.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct FeatureCatalog<'a> {
    db: &'a Database,
}

impl<'a> FeatureCatalog<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    // ── Taxonomy ─────────────────────────────────────────────────

    pub fn upsert_feature_category(&self, name: &str) -> Result<FeatureCategory, Error> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(Error::InvalidInput("feature category name is empty".into()));
        }
        Ok(self.db.upsert_feature_category(&name)?)
    }

    pub fn get_or_create_tag(&self, category_id: i64, name: &str) -> Result<FeatureTag, Error> {
        let name = normalize_name(name);
        if name.is_empty() {
            return Err(Error::InvalidInput("feature tag name is empty".into()));
        }
        Ok(self.db.get_or_create_tag(category_id, &name)?)
    }

    /// Rename a tag. Refused once any stored comparison result references it;
    /// callers must create a new tag instead.
    pub fn rename_feature_tag(&self, tag_id: i64, new_name: &str) -> Result<FeatureTag, Error> {
        let new_name = normalize_name(new_name);
        if new_name.is_empty() {
            return Err(Error::InvalidInput("feature tag name is empty".into()));
        }

        let tx = self.db.write_transaction()?;
        let mut tag = self
            .db
            .get_feature_tag(tag_id)?
            .ok_or_else(|| Error::NotFound(format!("feature tag {tag_id}")))?;
        if self.db.is_tag_referenced(tag_id)? {
            return Err(Error::TagImmutable { tag_id });
        }
        self.db.rename_tag_row(tag_id, &new_name)?;
        tx.commit()?;

        debug!(tag_id, from = %tag.name, to = %new_name, "Renamed feature tag");
        tag.name = new_name;
        Ok(tag)
    }

    // ── Inventory ────────────────────────────────────────────────

    /// Insert or update an inventory row. Bumps the revision of the product's
    /// category, and of its previous category when it moved.
    pub fn upsert_product(&self, product: &SoftwareProduct) -> Result<SoftwareProduct, Error> {
        validate_product(product)?;

        let now = now_timestamp();
        let mut stored = product.clone();
        stored.name = normalize_name(&product.name);
        stored.category = normalize_name(&product.category);
        stored.updated_at = now.clone();

        let tx = self.db.write_transaction()?;
        let previous = self.db.get_product(&stored.id)?;
        self.db.upsert_product_row(&stored)?;
        self.db
            .bump_category_revision(&stored.company_id, &stored.category, &now)?;
        if let Some(prev) = previous {
            if prev.company_id != stored.company_id || prev.category != stored.category {
                self.db
                    .bump_category_revision(&prev.company_id, &prev.category, &now)?;
            }
        }
        tx.commit()?;

        debug!(software_id = %stored.id, company_id = %stored.company_id, category = %stored.category, "Upserted product");
        Ok(stored)
    }

    pub fn set_product_status(&self, software_id: &str, status: ProductStatus) -> Result<(), Error> {
        let now = now_timestamp();
        let tx = self.db.write_transaction()?;
        let product = self
            .db
            .get_product(software_id)?
            .ok_or_else(|| Error::NotFound(format!("software product {software_id}")))?;
        if product.status == status {
            return Ok(());
        }
        self.db.set_product_status_row(software_id, status, &now)?;
        self.db
            .bump_category_revision(&product.company_id, &product.category, &now)?;
        tx.commit()?;

        info!(software_id, %status, "Product status changed");
        Ok(())
    }

    pub fn get_product(&self, software_id: &str) -> Result<Option<SoftwareProduct>, Error> {
        Ok(self.db.get_product(software_id)?)
    }

    /// Active products for a company, ordered by id.
    pub fn active_products(&self, company_id: &str) -> Result<Vec<SoftwareProduct>, Error> {
        Ok(self.db.get_active_products(company_id)?)
    }

    // ── Assignments ──────────────────────────────────────────────

    /// Assign a tag to a product. Returns false when the assignment already existed
    /// (the pair is unique, so repeating the call is harmless).
    pub fn assign_feature(
        &self,
        software_id: &str,
        feature_tag_id: i64,
        source: &str,
    ) -> Result<bool, Error> {
        let now = now_timestamp();
        let tx = self.db.write_transaction()?;
        let product = self
            .db
            .get_product(software_id)?
            .ok_or_else(|| Error::NotFound(format!("software product {software_id}")))?;
        if self.db.get_feature_tag(feature_tag_id)?.is_none() {
            return Err(Error::NotFound(format!("feature tag {feature_tag_id}")));
        }
        let inserted = self
            .db
            .insert_assignment(software_id, feature_tag_id, source, &now)?;
        if inserted {
            self.db
                .bump_category_revision(&product.company_id, &product.category, &now)?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Assign a feature by name under the taxonomy category named after the
    /// product's own category, creating category and tag on first use.
    pub fn assign_named_feature(
        &self,
        software_id: &str,
        feature_name: &str,
        source: &str,
    ) -> Result<(FeatureTag, bool), Error> {
        let product = self
            .db
            .get_product(software_id)?
            .ok_or_else(|| Error::NotFound(format!("software product {software_id}")))?;
        let category = self.upsert_feature_category(&product.category)?;
        let tag = self.get_or_create_tag(category.id, feature_name)?;
        let inserted = self.assign_feature(software_id, tag.id, source)?;
        Ok((tag, inserted))
    }

    pub fn unassign_feature(&self, software_id: &str, feature_tag_id: i64) -> Result<bool, Error> {
        let now = now_timestamp();
        let tx = self.db.write_transaction()?;
        let product = self
            .db
            .get_product(software_id)?
            .ok_or_else(|| Error::NotFound(format!("software product {software_id}")))?;
        let removed = self.db.delete_assignment(software_id, feature_tag_id)?;
        if removed {
            self.db
                .bump_category_revision(&product.company_id, &product.category, &now)?;
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn product_features(&self, software_id: &str) -> Result<BTreeSet<FeatureTag>, Error> {
        Ok(self.db.get_product_features(software_id)?)
    }

    /// Feature sets for every active product of the company (empty set when a
    /// product has no assignments yet).
    pub fn features_for_company(
        &self,
        company_id: &str,
    ) -> Result<BTreeMap<String, BTreeSet<FeatureTag>>, Error> {
        Ok(self.db.get_company_features(company_id)?)
    }

    // ── Revisions ────────────────────────────────────────────────

    pub fn category_revision(
        &self,
        company_id: &str,
        category: &str,
    ) -> Result<Option<CategoryRevision>, Error> {
        Ok(self.db.get_category_revision(company_id, category)?)
    }
}

fn validate_product(product: &SoftwareProduct) -> Result<(), Error> {
    if product.id.trim().is_empty() {
        return Err(Error::InvalidInput("software id is empty".into()));
    }
    if product.company_id.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "software {} has no company id",
            product.id
        )));
    }
    if normalize_name(&product.category).is_empty() {
        return Err(Error::InvalidInput(format!(
            "software {} has no category",
            product.id
        )));
    }
    if !product.annual_cost.is_finite() || product.annual_cost < 0.0 {
        return Err(Error::InvalidInput(format!(
            "software {} has invalid annual cost {}",
            product.id, product.annual_cost
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_name("  Single   Sign-On "), "Single Sign-On");
        assert_eq!(normalize_name("\tSSO\n"), "SSO");
        assert_eq!(normalize_name("   "), "");
    }

    #[test]
    fn test_negative_cost_rejected() {
        let product = SoftwareProduct {
            id: "p1".into(),
            company_id: "acme".into(),
            name: "Thing".into(),
            vendor: String::new(),
            category: "CRM".into(),
            annual_cost: -1.0,
            status: ProductStatus::Active,
            active_users: None,
            business_critical: false,
            regulatory: false,
            updated_at: String::new(),
        };
        assert!(matches!(
            validate_product(&product),
            Err(Error::InvalidInput(_))
        ));
    }
}
