//! Cost- and capability-aware model routing.
//!
//! Selection is deterministic per agent index (round-robin, no randomness)
//! so a request's model assignment is reproducible. Ensembles draw 2–3
//! distinct models from the same tier, supplemented with a vision-capable
//! model when images are present and the primary cannot see them.

pub mod catalog;

use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::types::{Complexity, CostTier};
use catalog::CatalogHandle;

/// Minimum and maximum ensemble sizes.
pub const ENSEMBLE_MIN: usize = 2;
pub const ENSEMBLE_MAX: usize = 3;

/// Router over the configured static tiers and the dynamic catalog.
pub struct ModelRouter {
    very_low_cost: Vec<String>,
    low_cost: Vec<String>,
    high_cost: Vec<String>,
    ensemble_size: usize,
    catalog: Arc<CatalogHandle>,
}

impl ModelRouter {
    pub fn new(config: &OrchestratorConfig, catalog: Arc<CatalogHandle>) -> Self {
        Self {
            very_low_cost: config.very_low_cost_models.clone(),
            low_cost: config.low_cost_models.clone(),
            high_cost: config.high_cost_models.clone(),
            ensemble_size: config.ensemble_size.clamp(ENSEMBLE_MIN, ENSEMBLE_MAX),
            catalog,
        }
    }

    pub fn catalog(&self) -> &Arc<CatalogHandle> {
        &self.catalog
    }

    fn tier(&self, cost: CostTier) -> &[String] {
        let preferred: &[String] = match cost {
            CostTier::Low => &self.low_cost,
            CostTier::High => &self.high_cost,
        };
        if !preferred.is_empty() {
            return preferred;
        }
        // Fall back to any non-empty tier rather than failing the request.
        for tier in [&self.low_cost, &self.high_cost, &self.very_low_cost] {
            if !tier.is_empty() {
                return tier;
            }
        }
        &[]
    }

    fn pick_round_robin<'a>(&self, tier: &'a [String], agent_index: usize) -> Option<&'a String> {
        if tier.is_empty() {
            None
        } else {
            Some(&tier[agent_index % tier.len()])
        }
    }

    fn domain_subset<'a>(&self, tier: &'a [String], domain: Option<&str>) -> Vec<&'a String> {
        let Some(domain) = domain else {
            return Vec::new();
        };
        tier.iter()
            .filter(|id| self.catalog.serves_domain(id, domain))
            .collect()
    }

    /// Select the primary model for one agent.
    ///
    /// Simple queries short-circuit to the very-low-cost tier when one is
    /// configured; otherwise the cost preference picks the tier, preferring
    /// models whose capability list contains the requested domain.
    pub fn get_model(
        &self,
        cost: CostTier,
        agent_index: usize,
        domain: Option<&str>,
        complexity: Complexity,
    ) -> String {
        if complexity == Complexity::Simple && !self.very_low_cost.is_empty() {
            let subset = self.domain_subset(&self.very_low_cost, domain);
            if !subset.is_empty() {
                return subset[agent_index % subset.len()].clone();
            }
            if let Some(id) = self.pick_round_robin(&self.very_low_cost, agent_index) {
                return id.clone();
            }
        }

        let tier = self.tier(cost);
        let subset = self.domain_subset(tier, domain);
        if !subset.is_empty() {
            return subset[agent_index % subset.len()].clone();
        }
        self.pick_round_robin(tier, agent_index)
            .cloned()
            .unwrap_or_else(|| "openai/gpt-4o-mini".to_string())
    }

    /// Alternatives for ensembling: the next distinct models of the same
    /// tier by `(agent_index + i) mod len`.
    pub fn get_alternatives(
        &self,
        primary: &str,
        cost: CostTier,
        agent_index: usize,
        count: usize,
    ) -> Vec<String> {
        let tier = self.tier(cost);
        let mut out = Vec::new();
        if tier.is_empty() {
            return out;
        }
        for i in 1..=tier.len() {
            if out.len() >= count {
                break;
            }
            let candidate = &tier[(agent_index + i) % tier.len()];
            if candidate != primary && !out.contains(candidate) {
                out.push(candidate.clone());
            }
        }
        out
    }

    /// Full ensemble for one sub-query: primary plus alternatives, clamped
    /// to [2, 3] distinct models. With `needs_vision`, at least one member
    /// is vision-capable (drawn from the catalog when the tier has none).
    pub fn ensemble(
        &self,
        cost: CostTier,
        agent_index: usize,
        domain: Option<&str>,
        complexity: Complexity,
        needs_vision: bool,
    ) -> Vec<String> {
        let primary = self.get_model(cost, agent_index, domain, complexity);
        let mut models = vec![primary.clone()];
        models.extend(self.get_alternatives(
            &primary,
            cost,
            agent_index,
            self.ensemble_size.saturating_sub(1),
        ));

        if needs_vision && !models.iter().any(|m| self.catalog.is_vision_capable(m)) {
            let catalog = self.catalog.snapshot();
            if let Some(vision) = catalog.vision_models().first() {
                if models.len() >= ENSEMBLE_MAX {
                    models.pop();
                }
                models.push(vision.id.clone());
            }
        }

        // Clamp to [2, 3]; pad from the catalog seed if the tiers are too
        // small to provide a second distinct model.
        if models.len() < ENSEMBLE_MIN {
            let catalog = self.catalog.snapshot();
            for entry in catalog.list() {
                if models.len() >= ENSEMBLE_MIN {
                    break;
                }
                if !models.contains(&entry.id) {
                    models.push(entry.id.clone());
                }
            }
        }
        models.truncate(ENSEMBLE_MAX);
        models
    }

    /// Advertised context window for a model.
    pub fn context_window(&self, model_id: &str) -> u32 {
        self.catalog.context_window(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_with(
        very_low: &[&str],
        low: &[&str],
        high: &[&str],
        ensemble_size: usize,
    ) -> ModelRouter {
        let mut config = OrchestratorConfig::default();
        config.very_low_cost_models = very_low.iter().map(|s| s.to_string()).collect();
        config.low_cost_models = low.iter().map(|s| s.to_string()).collect();
        config.high_cost_models = high.iter().map(|s| s.to_string()).collect();
        config.ensemble_size = ensemble_size;
        ModelRouter::new(&config, Arc::new(CatalogHandle::new(None)))
    }

    #[test]
    fn round_robin_is_deterministic() {
        let router = router_with(&[], &["a/1", "a/2", "a/3"], &[], 2);
        let m0 = router.get_model(CostTier::Low, 0, None, Complexity::Moderate);
        let m1 = router.get_model(CostTier::Low, 1, None, Complexity::Moderate);
        let m3 = router.get_model(CostTier::Low, 3, None, Complexity::Moderate);
        assert_eq!(m0, "a/1");
        assert_eq!(m1, "a/2");
        assert_eq!(m3, "a/1");
        // Repeated calls with the same index are identical.
        assert_eq!(
            m0,
            router.get_model(CostTier::Low, 0, None, Complexity::Moderate)
        );
    }

    #[test]
    fn simple_queries_use_very_low_cost_tier() {
        let router = router_with(&["cheap/1"], &["mid/1"], &["big/1"], 2);
        let model = router.get_model(CostTier::High, 0, None, Complexity::Simple);
        assert_eq!(model, "cheap/1");

        // Moderate complexity respects the cost preference.
        let model = router.get_model(CostTier::High, 0, None, Complexity::Moderate);
        assert_eq!(model, "big/1");
    }

    #[test]
    fn domain_preference_filters_tier() {
        // gpt-4o-mini serves "classification" in the built-in catalog.
        let router = router_with(
            &[],
            &["anthropic/claude-sonnet-4", "openai/gpt-4o-mini"],
            &[],
            2,
        );
        let model = router.get_model(
            CostTier::Low,
            0,
            Some("classification"),
            Complexity::Moderate,
        );
        assert_eq!(model, "openai/gpt-4o-mini");
    }

    #[test]
    fn alternatives_are_distinct_from_primary() {
        let router = router_with(&[], &["a/1", "a/2", "a/3"], &[], 3);
        let alternatives = router.get_alternatives("a/1", CostTier::Low, 0, 2);
        assert_eq!(alternatives, vec!["a/2".to_string(), "a/3".to_string()]);
    }

    #[test]
    fn ensemble_size_is_clamped() {
        let router = router_with(&[], &["a/1", "a/2", "a/3", "a/4"], &[], 3);
        for agent_index in 0..4 {
            let ensemble = router.ensemble(
                CostTier::Low,
                agent_index,
                None,
                Complexity::Moderate,
                false,
            );
            assert!(ensemble.len() >= ENSEMBLE_MIN && ensemble.len() <= ENSEMBLE_MAX);
            let distinct: std::collections::HashSet<_> = ensemble.iter().collect();
            assert_eq!(distinct.len(), ensemble.len());
        }
    }

    #[test]
    fn single_model_tier_pads_from_catalog() {
        let router = router_with(&[], &["only/model"], &[], 2);
        let ensemble = router.ensemble(CostTier::Low, 0, None, Complexity::Moderate, false);
        assert!(ensemble.len() >= ENSEMBLE_MIN);
        assert_eq!(ensemble[0], "only/model");
    }

    #[test]
    fn vision_requirement_adds_capable_model() {
        // claude-3-5-haiku is not vision-capable in the built-in catalog.
        let router = router_with(
            &[],
            &["anthropic/claude-3-5-haiku", "vendor/unknown"],
            &[],
            2,
        );
        let ensemble = router.ensemble(CostTier::Low, 0, None, Complexity::Moderate, true);
        assert!(ensemble
            .iter()
            .any(|m| router.catalog().is_vision_capable(m)));
        assert!(ensemble.len() <= ENSEMBLE_MAX);
    }

    #[test]
    fn context_window_falls_back_for_unknown_models() {
        let router = router_with(&[], &["x/y"], &[], 2);
        assert_eq!(router.context_window("x/y"), 32_000);
        assert_eq!(
            router.context_window("anthropic/claude-sonnet-4"),
            200_000
        );
    }
}
