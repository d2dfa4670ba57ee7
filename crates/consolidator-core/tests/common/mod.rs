#![allow(dead_code)]

use consolidator_core::catalog::{FeatureCatalog, SOURCE_MANUAL};
use consolidator_core::config::AppConfig;
use consolidator_core::storage::models::{ProductStatus, SoftwareProduct};
use consolidator_core::storage::Database;
use std::path::PathBuf;
use tempfile::TempDir;

pub const COMPANY: &str = "acme";

pub fn make_product(id: &str, category: &str, cost: f64) -> SoftwareProduct {
    SoftwareProduct {
        id: id.to_string(),
        company_id: COMPANY.to_string(),
        name: id.to_string(),
        vendor: String::new(),
        category: category.to_string(),
        annual_cost: cost,
        status: ProductStatus::Active,
        active_users: None,
        business_critical: false,
        regulatory: false,
        updated_at: String::new(),
    }
}

/// Insert a product and assign it the named features.
pub fn seed(db: &Database, id: &str, category: &str, cost: f64, features: &[&str]) {
    seed_product(db, make_product(id, category, cost), features);
}

pub fn seed_product(db: &Database, product: SoftwareProduct, features: &[&str]) {
    let catalog = FeatureCatalog::new(db);
    catalog.upsert_product(&product).unwrap();
    for feature in features {
        catalog
            .assign_named_feature(&product.id, feature, SOURCE_MANUAL)
            .unwrap();
    }
}

/// A file-backed database, so other connections (and threads) can share it.
pub struct TestStore {
    pub dir: TempDir,
    pub path: PathBuf,
    pub db: Database,
}

pub fn temp_store() -> TestStore {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consolidator.db");
    let db = Database::open(&path).unwrap();
    TestStore { dir, path, db }
}

pub fn test_config(path: &PathBuf) -> AppConfig {
    AppConfig {
        database_path: path.to_string_lossy().into_owned(),
        parallel_categories: false,
        ..AppConfig::default()
    }
}

/// Salesforce/HubSpot share two of three features; Slack/Teams are identical;
/// Zoom sits alone in its category.
pub fn seed_sample_inventory(db: &Database) {
    seed(db, "hubspot", "CRM", 60_000.0, &["Contacts", "Pipelines"]);
    seed(db, "salesforce", "CRM", 120_000.0, &["Contacts", "Pipelines", "Forecasting"]);
    seed(db, "slack", "Messaging", 12_000.0, &["Channels", "Direct messages"]);
    seed(db, "teams", "Messaging", 8_000.0, &["Channels", "Direct messages"]);
    seed(db, "zoom", "Video", 5_000.0, &["Meetings"]);
}
