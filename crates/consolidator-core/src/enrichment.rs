//! Boundary to the feature-enrichment collaborator.
//!
//! Collaborator payloads are loosely shaped (a bare list, an object with a
//! singular or plural key, JSON wrapped in prose). They are validated into
//! [`EnrichedFeatures`] here; anything malformed becomes `Error::Dependency`
//! so the analyzer can treat it as missing feature data.

use crate::catalog::normalize_name;
use crate::config::EnrichmentConfig;
use crate::error::Error;
use crate::storage::models::SoftwareProduct;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Feature names shorter than this are treated as noise.
const MIN_FEATURE_NAME_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedFeatures {
    pub features: Vec<String>,
    pub confidence: Option<f64>,
    pub method: &'static str,
}

pub trait FeatureEnricher: Send + Sync {
    fn name(&self) -> &'static str;
    fn enrich(&self, product: &SoftwareProduct) -> Result<EnrichedFeatures, Error>;
}

// ── Response schema ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<serde_json::Value>),
    One(serde_json::Value),
}

#[derive(Deserialize)]
struct FeatureObject {
    #[serde(alias = "feature")]
    features: OneOrMany,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPayload {
    List(Vec<serde_json::Value>),
    Object(FeatureObject),
}

/// Typed parse of collaborator output.
pub struct EnrichmentSchema;

impl EnrichmentSchema {
    /// Parse a payload that is, or contains, a JSON array of names or an object
    /// with `features`/`feature`. Short names are dropped; duplicates collapse
    /// case-insensitively, keeping the first spelling.
    pub fn parse(text: &str, method: &'static str) -> Result<EnrichedFeatures, Error> {
        let payload = extract_payload(text)?;
        let (values, confidence) = match payload {
            RawPayload::List(values) => (values, None),
            RawPayload::Object(obj) => {
                let values = match obj.features {
                    OneOrMany::Many(values) => values,
                    OneOrMany::One(value) => vec![value],
                };
                (values, obj.confidence)
            }
        };

        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::Dependency(format!(
                    "confidence {c} outside [0, 1]"
                )));
            }
        }

        let mut seen = AHashSet::new();
        let mut features = Vec::new();
        for value in values {
            let raw = value.as_str().ok_or_else(|| {
                Error::Dependency(format!("feature entry is not a string: {value}"))
            })?;
            let name = normalize_name(raw);
            if name.chars().count() < MIN_FEATURE_NAME_LEN {
                continue;
            }
            if seen.insert(name.to_lowercase()) {
                features.push(name);
            }
        }

        if features.is_empty() {
            return Err(Error::Dependency("payload contained no usable features".into()));
        }

        Ok(EnrichedFeatures {
            features,
            confidence,
            method,
        })
    }
}

fn extract_payload(text: &str) -> Result<RawPayload, Error> {
    let trimmed = text.trim();
    if let Ok(payload) = serde_json::from_str::<RawPayload>(trimmed) {
        return Ok(payload);
    }
    // Models often wrap the JSON in prose; try the outermost object, then array.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(payload) = serde_json::from_str::<RawPayload>(&trimmed[start..=end]) {
                    return Ok(payload);
                }
            }
        }
    }
    Err(Error::Dependency(format!(
        "no feature JSON found in collaborator response ({} bytes)",
        text.len()
    )))
}

// ── Ollama-compatible HTTP collaborator ──────────────────────────

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct OllamaEnricher {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl OllamaEnricher {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Dependency(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn prompt(product: &SoftwareProduct) -> String {
        let vendor = if product.vendor.is_empty() {
            "an unknown vendor"
        } else {
            product.vendor.as_str()
        };
        format!(
            "List the key features of the software product below.\n\n\
             Software: {} by {}\nCategory: {}\n\n\
             Return ONLY a JSON array of short feature names, for example:\n\
             [\"Task management\", \"Kanban boards\", \"REST API\"]",
            product.name, vendor, product.category
        )
    }
}

impl FeatureEnricher for OllamaEnricher {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn enrich(&self, product: &SoftwareProduct) -> Result<EnrichedFeatures, Error> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: Self::prompt(product),
            stream: false,
        };

        debug!(endpoint = %self.endpoint, software_id = %product.id, "requesting features");
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| Error::Dependency(format!("enrichment request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(Error::Dependency(format!(
                "enrichment service returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body: GenerateResponse = resp
            .json()
            .map_err(|e| Error::Dependency(format!("malformed enrichment response: {e}")))?;
        let enriched = EnrichmentSchema::parse(&body.response, "ai")?;
        info!(software_id = %product.id, count = enriched.features.len(), "enriched features");
        Ok(enriched)
    }
}

// ── Curated known products ───────────────────────────────────────

const KNOWN_PRODUCTS: &[(&str, &[&str])] = &[
    (
        "Slack",
        &[
            "Instant messaging",
            "Channels/Rooms",
            "Direct messaging",
            "File sharing",
            "Video conferencing",
            "Audio calls",
            "Screen sharing",
            "Threaded conversations",
            "Mentions/Notifications",
            "Third-party integrations",
            "REST API",
            "Webhooks",
            "SSO/SAML",
            "Two-factor authentication",
            "Workflow automation",
        ],
    ),
    (
        "Microsoft Teams",
        &[
            "Instant messaging",
            "Video conferencing",
            "Audio calls",
            "Screen sharing",
            "Channels/Rooms",
            "Direct messaging",
            "File sharing",
            "Threaded conversations",
            "Mentions/Notifications",
            "Document collaboration",
            "SharePoint integration",
            "SSO/SAML",
            "Two-factor authentication",
            "Meeting recording",
            "Live captions",
        ],
    ),
    (
        "Zoom",
        &[
            "Video conferencing",
            "Audio calls",
            "Screen sharing",
            "Meeting recording",
            "Breakout rooms",
            "Virtual backgrounds",
            "Webinars",
            "Live streaming",
            "Chat during meetings",
            "Whiteboard",
            "SSO/SAML",
            "Waiting room",
            "Meeting transcription",
        ],
    ),
    (
        "Asana",
        &[
            "Task management",
            "Project management",
            "Kanban boards",
            "Calendar view",
            "Timeline view",
            "Dependencies",
            "Milestones",
            "Custom fields",
            "Project templates",
            "Workload management",
            "Portfolios",
            "Third-party integrations",
            "REST API",
        ],
    ),
    (
        "Monday.com",
        &[
            "Task management",
            "Project management",
            "Kanban boards",
            "Gantt charts",
            "Timeline view",
            "Calendar view",
            "Custom workflows",
            "Dashboards",
            "Custom fields",
            "Project templates",
            "Time tracking",
            "Resource management",
            "REST API",
        ],
    ),
    (
        "Jira",
        &[
            "Issue tracking",
            "Scrum boards",
            "Kanban boards",
            "Backlog management",
            "Sprint planning",
            "Burndown charts",
            "Custom workflows",
            "Custom fields",
            "Roadmaps",
            "Automation rules",
            "REST API",
        ],
    ),
    (
        "Salesforce",
        &[
            "Contact management",
            "Lead tracking",
            "Opportunity management",
            "Sales pipeline",
            "Account management",
            "Email integration",
            "Reports and dashboards",
            "Workflow automation",
            "Custom objects",
            "Marketing automation",
            "Customer service",
        ],
    ),
];

/// Curated feature lists for well-known products, matched by name case-insensitively.
pub struct KnownProductEnricher;

impl KnownProductEnricher {
    pub fn lookup(name: &str) -> Option<&'static [&'static str]> {
        let name = normalize_name(name);
        KNOWN_PRODUCTS
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(&name))
            .map(|(_, features)| *features)
    }
}

impl FeatureEnricher for KnownProductEnricher {
    fn name(&self) -> &'static str {
        "known"
    }

    fn enrich(&self, product: &SoftwareProduct) -> Result<EnrichedFeatures, Error> {
        let features = Self::lookup(&product.name).ok_or_else(|| {
            Error::Dependency(format!("no curated features for '{}'", product.name))
        })?;
        Ok(EnrichedFeatures {
            features: features.iter().map(|f| f.to_string()).collect(),
            confidence: Some(0.95),
            method: "known",
        })
    }
}

/// Tries each enricher in order and returns the first success.
pub struct ChainEnricher {
    enrichers: Vec<Box<dyn FeatureEnricher>>,
}

impl ChainEnricher {
    pub fn new(enrichers: Vec<Box<dyn FeatureEnricher>>) -> Self {
        Self { enrichers }
    }

    /// Curated table first, then the HTTP collaborator when enabled.
    pub fn from_config(config: &EnrichmentConfig) -> Result<Self, Error> {
        let mut enrichers: Vec<Box<dyn FeatureEnricher>> = vec![Box::new(KnownProductEnricher)];
        if config.enabled {
            enrichers.push(Box::new(OllamaEnricher::new(config)?));
        }
        Ok(Self::new(enrichers))
    }
}

impl FeatureEnricher for ChainEnricher {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn enrich(&self, product: &SoftwareProduct) -> Result<EnrichedFeatures, Error> {
        let mut last_error = None;
        for enricher in &self.enrichers {
            match enricher.enrich(product) {
                Ok(features) => return Ok(features),
                Err(e) => {
                    debug!(enricher = enricher.name(), software_id = %product.id, "enrichment miss: {}", e);
                    last_error = Some(e);
                }
            }
        }
        let err = last_error
            .unwrap_or_else(|| Error::Dependency("no enrichers configured".into()));
        warn!(software_id = %product.id, "feature enrichment failed: {}", err);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::ProductStatus;

    fn product(name: &str) -> SoftwareProduct {
        SoftwareProduct {
            id: "p1".into(),
            company_id: "acme".into(),
            name: name.into(),
            vendor: String::new(),
            category: "Collaboration".into(),
            annual_cost: 0.0,
            status: ProductStatus::Active,
            active_users: None,
            business_critical: false,
            regulatory: false,
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_bare_array() {
        let parsed = EnrichmentSchema::parse(r#"["Task management", "Kanban boards"]"#, "ai").unwrap();
        assert_eq!(parsed.features, vec!["Task management", "Kanban boards"]);
        assert_eq!(parsed.confidence, None);
    }

    #[test]
    fn test_array_wrapped_in_prose() {
        let text = "Sure! Here are the features:\n[\"Video conferencing\", \"Screen sharing\"]\nHope this helps.";
        let parsed = EnrichmentSchema::parse(text, "ai").unwrap();
        assert_eq!(parsed.features.len(), 2);
    }

    #[test]
    fn test_singular_key_with_string() {
        let parsed =
            EnrichmentSchema::parse(r#"{"feature": "Issue tracking", "confidence": 0.7}"#, "ai")
                .unwrap();
        assert_eq!(parsed.features, vec!["Issue tracking"]);
        assert_eq!(parsed.confidence, Some(0.7));
    }

    #[test]
    fn test_short_and_duplicate_names_dropped() {
        let parsed =
            EnrichmentSchema::parse(r#"{"features": ["API", "REST API", "rest  api", "SSO/SAML"]}"#, "ai")
                .unwrap();
        assert_eq!(parsed.features, vec!["REST API", "SSO/SAML"]);
    }

    #[test]
    fn test_malformed_payloads_are_dependency_errors() {
        for bad in [
            "no json here",
            r#"{"features": [1, 2, 3]}"#,
            r#"{"features": []}"#,
            r#"["abc"]"#,
            r#"{"features": ["Kanban boards"], "confidence": 3.0}"#,
            r#"{"capabilities": "Kanban boards"}"#,
        ] {
            let result = EnrichmentSchema::parse(bad, "ai");
            assert!(
                matches!(result, Err(Error::Dependency(_))),
                "expected dependency error for {bad}"
            );
        }
    }

    #[test]
    fn test_known_product_lookup_is_case_insensitive() {
        let enriched = KnownProductEnricher.enrich(&product("  slack ")).unwrap();
        assert!(enriched.features.contains(&"Instant messaging".to_string()));
        assert!(KnownProductEnricher.enrich(&product("Obscure Tool")).is_err());
    }

    #[test]
    fn test_chain_returns_first_success() {
        let chain = ChainEnricher::new(vec![Box::new(KnownProductEnricher)]);
        assert_eq!(chain.enrich(&product("Zoom")).unwrap().method, "known");
        assert!(chain.enrich(&product("Obscure Tool")).unwrap_err().is_dependency());
    }
}
