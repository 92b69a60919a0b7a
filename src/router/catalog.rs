//! Dynamic model catalog.
//!
//! Carries capability metadata (domains, vision, context window) for every
//! model the router can select. A built-in seed covers the default tiers;
//! when a catalog URL is configured the listing is refreshed periodically
//! and merged over the seed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::error::ProviderError;

/// Capability record for one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    pub id: String,
    pub label: String,
    /// Rough cost hint in dollars per million tokens.
    pub cost_per_mtok: f64,
    /// Domains this model is preferred for (e.g. "code", "classification").
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub long_context: bool,
    pub context_window: u32,
}

impl ModelEntry {
    fn basic(id: &str, cost: f64, domains: &[&str], vision: bool, context_window: u32) -> Self {
        Self {
            id: id.to_string(),
            label: id.rsplit('/').next().unwrap_or(id).to_string(),
            cost_per_mtok: cost,
            domains: domains.iter().map(|s| s.to_string()).collect(),
            vision,
            long_context: context_window >= 200_000,
            context_window,
        }
    }

    pub fn serves_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// In-memory model catalog.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelEntry>,
}

impl ModelCatalog {
    /// Built-in seed entries for the default tier models.
    pub fn builtin() -> Self {
        let entries = [
            ModelEntry::basic(
                "openai/gpt-4o-mini",
                0.3,
                &["general", "classification"],
                true,
                128_000,
            ),
            ModelEntry::basic(
                "anthropic/claude-3-5-haiku",
                1.0,
                &["general", "code", "classification"],
                false,
                200_000,
            ),
            ModelEntry::basic(
                "google/gemini-2.0-flash-001",
                0.2,
                &["general", "vision"],
                true,
                1_000_000,
            ),
            ModelEntry::basic(
                "anthropic/claude-sonnet-4",
                6.0,
                &["general", "code", "reasoning"],
                true,
                200_000,
            ),
            ModelEntry::basic("openai/gpt-4o", 5.0, &["general", "vision"], true, 128_000),
            ModelEntry::basic(
                "google/gemini-2.5-pro",
                5.0,
                &["general", "reasoning", "vision"],
                true,
                1_000_000,
            ),
        ];
        let mut catalog = Self::default();
        for entry in entries {
            catalog.models.insert(entry.id.clone(), entry);
        }
        catalog
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.models.get(id)
    }

    /// Entry for a model, falling back to conservative defaults for ids the
    /// catalog has never seen.
    pub fn entry_or_default(&self, id: &str) -> ModelEntry {
        self.models.get(id).cloned().unwrap_or_else(|| ModelEntry {
            id: id.to_string(),
            label: id.rsplit('/').next().unwrap_or(id).to_string(),
            cost_per_mtok: 1.0,
            domains: Vec::new(),
            vision: false,
            long_context: false,
            context_window: 32_000,
        })
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn list(&self) -> Vec<&ModelEntry> {
        let mut entries: Vec<&ModelEntry> = self.models.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Vision-capable models, cheapest first.
    pub fn vision_models(&self) -> Vec<&ModelEntry> {
        let mut entries: Vec<&ModelEntry> =
            self.models.values().filter(|m| m.vision).collect();
        entries.sort_by(|a, b| {
            a.cost_per_mtok
                .partial_cmp(&b.cost_per_mtok)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }

    /// Merge a remote listing (OpenRouter `/models` shape: `{"data": [...]}`)
    /// over the current entries. Returns the number of models merged.
    pub fn merge_remote(&mut self, listing: &serde_json::Value) -> usize {
        let Some(data) = listing.get("data").and_then(|d| d.as_array()) else {
            return 0;
        };
        let mut merged = 0;
        for item in data {
            let Some(id) = item.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let context_window = item
                .get("context_length")
                .and_then(|v| v.as_u64())
                .unwrap_or(32_000) as u32;
            let vision = item
                .get("architecture")
                .and_then(|a| a.get("input_modalities"))
                .and_then(|m| m.as_array())
                .map(|mods| mods.iter().any(|m| m.as_str() == Some("image")))
                .unwrap_or(false);
            let cost = item
                .get("pricing")
                .and_then(|p| p.get("prompt"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok())
                .map(|per_tok| per_tok * 1_000_000.0)
                .unwrap_or(1.0);

            let existing = self.models.get(id);
            let domains = existing.map(|e| e.domains.clone()).unwrap_or_default();
            self.models.insert(
                id.to_string(),
                ModelEntry {
                    id: id.to_string(),
                    label: item
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or(id)
                        .to_string(),
                    cost_per_mtok: cost,
                    domains,
                    vision,
                    long_context: context_window >= 200_000,
                    context_window,
                },
            );
            merged += 1;
        }
        merged
    }
}

/// Shared catalog handle with remote refresh.
pub struct CatalogHandle {
    catalog: RwLock<ModelCatalog>,
    url: Option<String>,
    client: reqwest::Client,
}

impl CatalogHandle {
    pub fn new(url: Option<String>) -> Self {
        Self {
            catalog: RwLock::new(ModelCatalog::builtin()),
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Read access to the current catalog snapshot.
    pub fn snapshot(&self) -> ModelCatalog {
        self.catalog.read().clone()
    }

    pub fn entry_or_default(&self, id: &str) -> ModelEntry {
        self.catalog.read().entry_or_default(id)
    }

    pub fn serves_domain(&self, id: &str, domain: &str) -> bool {
        self.catalog
            .read()
            .get(id)
            .map(|e| e.serves_domain(domain))
            .unwrap_or(false)
    }

    pub fn is_vision_capable(&self, id: &str) -> bool {
        self.catalog.read().get(id).map(|e| e.vision).unwrap_or(false)
    }

    pub fn context_window(&self, id: &str) -> u32 {
        self.catalog.read().entry_or_default(id).context_window
    }

    /// Fetch the remote listing and merge it. No-op without a URL.
    pub async fn refresh(&self) -> Result<usize, ProviderError> {
        let Some(url) = &self.url else {
            return Ok(0);
        };
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("catalog fetch failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }
        let listing: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(format!("bad catalog payload: {e}")))?;

        let merged = self.catalog.write().merge_remote(&listing);
        tracing::info!(merged, "model catalog refreshed");
        Ok(merged)
    }

    /// Merge an already-fetched listing (tests, stdio `list_models refresh`).
    pub fn merge(&self, listing: &serde_json::Value) -> usize {
        self.catalog.write().merge_remote(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_default_tiers() {
        let catalog = ModelCatalog::builtin();
        assert!(catalog.get("openai/gpt-4o-mini").is_some());
        assert!(catalog.get("anthropic/claude-sonnet-4").is_some());
        assert!(!catalog.is_empty());
    }

    #[test]
    fn unknown_model_gets_conservative_defaults() {
        let catalog = ModelCatalog::builtin();
        let entry = catalog.entry_or_default("vendor/unknown-model");
        assert_eq!(entry.context_window, 32_000);
        assert!(!entry.vision);
    }

    #[test]
    fn merge_remote_parses_listing() {
        let mut catalog = ModelCatalog::builtin();
        let listing = serde_json::json!({
            "data": [{
                "id": "vendor/new-model",
                "name": "New Model",
                "context_length": 256000,
                "architecture": { "input_modalities": ["text", "image"] },
                "pricing": { "prompt": "0.000002" }
            }]
        });
        assert_eq!(catalog.merge_remote(&listing), 1);
        let entry = catalog.get("vendor/new-model").unwrap();
        assert!(entry.vision);
        assert!(entry.long_context);
        assert_eq!(entry.context_window, 256_000);
        assert!((entry.cost_per_mtok - 2.0).abs() < 1e-9);
    }

    #[test]
    fn merge_preserves_local_domains() {
        let mut catalog = ModelCatalog::builtin();
        let listing = serde_json::json!({
            "data": [{ "id": "openai/gpt-4o-mini", "context_length": 128000 }]
        });
        catalog.merge_remote(&listing);
        assert!(catalog
            .get("openai/gpt-4o-mini")
            .unwrap()
            .serves_domain("classification"));
    }

    #[test]
    fn vision_models_sorted_by_cost() {
        let catalog = ModelCatalog::builtin();
        let vision = catalog.vision_models();
        assert!(!vision.is_empty());
        for pair in vision.windows(2) {
            assert!(pair[0].cost_per_mtok <= pair[1].cost_per_mtok);
        }
    }
}
