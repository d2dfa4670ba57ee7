use anyhow::{Context, Result};
use consolidator_core::catalog::{FeatureCatalog, SOURCE_MANUAL};
use consolidator_core::storage::models::{ProductStatus, SoftwareProduct};
use consolidator_core::Database;
use serde::Deserialize;
use std::fs;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
pub struct Inventory {
    pub products: Vec<ProductRecord>,
}

#[derive(Debug, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub company_id: String,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    pub category: String,
    #[serde(default)]
    pub annual_cost: f64,
    #[serde(default = "default_status")]
    pub status: ProductStatus,
    #[serde(default)]
    pub active_users: Option<i64>,
    #[serde(default)]
    pub business_critical: bool,
    #[serde(default)]
    pub regulatory: bool,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_status() -> ProductStatus {
    ProductStatus::Active
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub products: usize,
    pub assignments: usize,
    pub skipped: usize,
}

pub fn import_inventory(db: &Database, path: &str) -> Result<ImportSummary> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let inventory: Inventory =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;

    let catalog = FeatureCatalog::new(db);
    let mut summary = ImportSummary::default();

    for record in inventory.products {
        let product = SoftwareProduct {
            id: record.id,
            company_id: record.company_id,
            name: record.name,
            vendor: record.vendor,
            category: record.category,
            annual_cost: record.annual_cost,
            status: record.status,
            active_users: record.active_users,
            business_critical: record.business_critical,
            regulatory: record.regulatory,
            updated_at: String::new(),
        };
        if let Err(e) = catalog.upsert_product(&product) {
            warn!(software_id = %product.id, "Skipping product: {}", e);
            summary.skipped += 1;
            continue;
        }
        summary.products += 1;

        for feature in &record.features {
            match catalog.assign_named_feature(&product.id, feature, SOURCE_MANUAL) {
                Ok((_, true)) => summary.assignments += 1,
                Ok((_, false)) => {}
                Err(e) => warn!(software_id = %product.id, feature = %feature, "Skipping feature: {}", e),
            }
        }
    }

    info!(
        products = summary.products,
        assignments = summary.assignments,
        skipped = summary.skipped,
        "Inventory imported"
    );
    Ok(summary)
}
