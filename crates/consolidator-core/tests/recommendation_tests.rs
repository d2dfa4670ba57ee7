mod common;

use common::*;
use consolidator_core::analysis::recommend::{
    generate_recommendations, RecommendationInput, RecommendationOptions,
};
use consolidator_core::analysis::RecommendationEngine;
use consolidator_core::catalog::FeatureCatalog;
use consolidator_core::config::{AppConfig, KeepTieBreak};
use consolidator_core::storage::models::{Level, RecommendationStatus};
use consolidator_core::storage::{now_timestamp, Database};
use consolidator_core::{OverlapAnalyzer, SilentReporter};

fn analyze(db: &Database) {
    let config = AppConfig::default();
    OverlapAnalyzer::new(db, &config)
        .analyze_company(COMPANY, &SilentReporter)
        .unwrap();
}

fn options() -> RecommendationOptions {
    RecommendationOptions {
        redundancy_threshold: 40.0,
        tie_break: KeepTieBreak::ActiveUsersThenId,
    }
}

#[test]
fn test_recommendations_keep_the_widest_product() {
    let db = Database::open_in_memory().unwrap();
    seed_sample_inventory(&db);
    analyze(&db);

    let recs = db.get_recommendations(COMPANY, None).unwrap();
    assert_eq!(recs.len(), 2);

    // Highest savings first
    let crm = &recs[0];
    assert_eq!(crm.category, "CRM");
    assert_eq!(crm.software_to_keep_id, "salesforce");
    assert_eq!(crm.software_to_remove_ids, vec!["hubspot"]);
    assert_eq!(crm.annual_savings, 60_000.0);
    assert_eq!(crm.features_covered, vec!["Contacts", "Pipelines"]);
    assert!(crm.features_at_risk.is_empty());
    assert_eq!(crm.migration_effort, Level::Low);
    assert_eq!(crm.business_risk, Level::Low);
    assert_eq!(crm.confidence_score, 1.0);
    assert_eq!(crm.status, RecommendationStatus::Pending);
    assert!(crm.recommendation_text.contains("$60,000.00"));

    // Equal coverage: the cheaper product stays
    let messaging = &recs[1];
    assert_eq!(messaging.category, "Messaging");
    assert_eq!(messaging.software_to_keep_id, "teams");
    assert_eq!(messaging.software_to_remove_ids, vec!["slack"]);
    assert_eq!(messaging.annual_savings, 12_000.0);
}

#[test]
fn test_gaps_raise_effort_and_critical_products_raise_risk() {
    let db = Database::open_in_memory().unwrap();
    seed(&db, "asana", "Project Management", 10_000.0, &["Tasks", "Boards", "Timeline"]);
    let mut monday = make_product("monday", "Project Management", 6_000.0);
    monday.business_critical = true;
    monday.regulatory = true;
    seed_product(&db, monday, &["Tasks", "Boards", "Automations", "Dashboards"]);
    analyze(&db);

    let recs = db.get_recommendations(COMPANY, None).unwrap();
    assert_eq!(recs.len(), 1);
    let rec = &recs[0];
    // Jaccard 2/5 = 40.0, right at the threshold
    assert_eq!(rec.software_to_keep_id, "monday");
    assert_eq!(rec.software_to_remove_ids, vec!["asana"]);
    assert_eq!(rec.features_at_risk, vec!["Timeline"]);
    assert_eq!(rec.migration_effort, Level::Medium);
    assert_eq!(rec.business_risk, Level::Low);
}

#[test]
fn test_reviewed_recommendations_are_preserved_and_pending_ones_refreshed() {
    let db = Database::open_in_memory().unwrap();
    seed_sample_inventory(&db);
    analyze(&db);

    let recs = db.get_recommendations(COMPANY, None).unwrap();
    let (crm, messaging) = (recs[0].clone(), recs[1].clone());
    db.set_recommendation_status_row(crm.id, RecommendationStatus::Accepted, &now_timestamp())
        .unwrap();

    // Change both clusters' economics and re-run
    let catalog = FeatureCatalog::new(&db);
    catalog.upsert_product(&make_product("hubspot", "CRM", 70_000.0)).unwrap();
    catalog.upsert_product(&make_product("slack", "Messaging", 15_000.0)).unwrap();
    analyze(&db);

    let after = db.get_recommendations(COMPANY, None).unwrap();
    assert_eq!(after.len(), 2);

    let crm_after = after.iter().find(|r| r.id == crm.id).unwrap();
    assert_eq!(crm_after.status, RecommendationStatus::Accepted);
    assert_eq!(crm_after.annual_savings, 60_000.0);
    assert_eq!(crm_after.recommendation_text, crm.recommendation_text);

    let messaging_after = after.iter().find(|r| r.id == messaging.id).unwrap();
    assert_eq!(messaging_after.status, RecommendationStatus::Pending);
    assert_eq!(messaging_after.annual_savings, 15_000.0);
    assert_eq!(messaging_after.cluster_key, messaging.cluster_key);
}

#[test]
fn test_dismissed_recommendation_is_not_recreated() {
    let db = Database::open_in_memory().unwrap();
    seed_sample_inventory(&db);
    analyze(&db);

    let recs = db.get_recommendations(COMPANY, None).unwrap();
    for rec in &recs {
        db.set_recommendation_status_row(rec.id, RecommendationStatus::Dismissed, &now_timestamp())
            .unwrap();
    }
    analyze(&db);

    let after = db.get_recommendations(COMPANY, None).unwrap();
    assert_eq!(after.len(), recs.len());
    assert!(after.iter().all(|r| r.status == RecommendationStatus::Dismissed));
    assert!(db
        .get_recommendations(COMPANY, Some(RecommendationStatus::Pending))
        .unwrap()
        .is_empty());
}

#[test]
fn test_recommendations_outlive_their_cluster() {
    let db = Database::open_in_memory().unwrap();
    seed_sample_inventory(&db);
    analyze(&db);
    let before = db.get_recommendations(COMPANY, None).unwrap();

    // Teams loses its features entirely, so Messaging no longer clusters
    let catalog = FeatureCatalog::new(&db);
    for tag in catalog.product_features("teams").unwrap() {
        catalog.unassign_feature("teams", tag.id).unwrap();
    }
    analyze(&db);

    let after = db.get_recommendations(COMPANY, None).unwrap();
    assert_eq!(after.len(), before.len());
    let messaging_pair = &db.get_overlap_pairs(COMPANY, Some("Messaging")).unwrap()[0];
    assert!(messaging_pair.insufficient_data);
}

#[test]
fn test_generation_is_deterministic() {
    let db = Database::open_in_memory().unwrap();
    seed_sample_inventory(&db);
    seed(&db, "pipedrive", "CRM", 9_000.0, &["Contacts", "Pipelines"]);
    analyze(&db);

    let pairs = db.get_overlap_pairs(COMPANY, None).unwrap();
    let products = db.get_active_products(COMPANY).unwrap();
    let features = db.get_company_features(COMPANY).unwrap();
    let input = RecommendationInput {
        company_id: COMPANY,
        pairs: &pairs,
        products: &products,
        features: &features,
    };

    let first = generate_recommendations(&input, &options());
    let second = generate_recommendations(&input, &options());
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.cluster_key, b.cluster_key);
        assert_eq!(a.software_to_keep_id, b.software_to_keep_id);
        assert_eq!(a.software_to_remove_ids, b.software_to_remove_ids);
        assert_eq!(a.annual_savings, b.annual_savings);
        assert_eq!(a.recommendation_text, b.recommendation_text);
    }

    // Three CRM products form one cluster
    let crm = first.iter().find(|r| r.category == "CRM").unwrap();
    assert_eq!(crm.software_to_keep_id, "salesforce");
    assert_eq!(crm.software_to_remove_ids, vec!["hubspot", "pipedrive"]);
    assert_eq!(crm.annual_savings, 69_000.0);
}

#[test]
fn test_refresh_from_store_is_idempotent() {
    let db = Database::open_in_memory().unwrap();
    seed_sample_inventory(&db);
    analyze(&db);

    let engine = RecommendationEngine::new(&db, options());
    let run = engine.refresh_from_store(COMPANY, None).unwrap();
    assert_eq!(run.inserted, 0);
    assert_eq!(run.updated, 2);

    let only_crm = vec!["CRM".to_string()];
    let run = engine.refresh_from_store(COMPANY, Some(only_crm.as_slice())).unwrap();
    assert_eq!(run.recommendations.len(), 1);
    assert_eq!(db.get_recommendations(COMPANY, None).unwrap().len(), 2);
}
