//! Token/cost estimation, tier inference, and the per-query budget gate.
//!
//! Grounded on `original_source/graph/cost_guard.py` (`PRICING_PER_1M`,
//! `_get_tier_from_model`, `check_cost_limit`), generalized from env-var
//! model-id comparisons into pattern matching over `provider_model_name`
//! (spec §4.G tier inference) since this rewrite's Registry already carries
//! structured backend metadata instead of loose env vars per model slot.

use crate::classify::estimate_tokens;
use crate::domain::Tier;
use crate::registry::BackendEntry;

/// `$ per 1M tokens`, by tier. `local` is always free (spec §4.G).
fn price_per_million(tier: Tier) -> f64 {
    match tier {
        Tier::Mini => 0.50,
        Tier::Standard => 5.00,
        Tier::Reasoning => 10.00,
        Tier::Elite => 30.00,
        Tier::Local => 0.00,
    }
}

/// Infer a pricing tier from a backend's provider and model name (spec
/// §4.G: "reasoning-family -> reasoning; large cloud -> elite; mid cloud ->
/// standard; small cloud -> mini; local -> local/free").
pub fn infer_tier(entry: &BackendEntry) -> Tier {
    use crate::domain::ProviderKind;
    if entry.provider == ProviderKind::LocalGpu {
        return Tier::Local;
    }
    let name = entry.provider_model_name.to_lowercase();
    if name.contains("llama") || name.contains("deepseek") {
        return Tier::Local;
    }
    if is_reasoning_family(&name) {
        return Tier::Reasoning;
    }
    if name.contains("high") || name.contains("elite") || name == "gpt-5" {
        return Tier::Elite;
    }
    if name.contains("mini") || name.contains("nano") {
        return Tier::Mini;
    }
    Tier::Standard
}

/// Model families that take a `reasoning_effort` param instead of
/// `temperature` (spec §4.E), also used for tier inference.
pub fn is_reasoning_family(model_name_lower: &str) -> bool {
    ["o1", "o3", "o4"]
        .iter()
        .any(|prefix| model_name_lower.starts_with(prefix))
}

/// Completion-token multiplier by tier (spec §4.G / §4.E).
pub fn completion_multiplier(tier: Tier) -> f64 {
    match tier {
        Tier::Reasoning | Tier::Elite => 2.0,
        _ => 0.5,
    }
}

/// `ceil(chars/4)` applied to a whole message list (spec §4.G step 1).
pub fn estimate_prompt_tokens(messages: &[String]) -> u64 {
    estimate_tokens(&messages.join(""))
}

/// `cost_usd = (total_tokens / 1e6) * price_per_million[tier]`.
pub fn cost_usd(total_tokens: u64, tier: Tier) -> f64 {
    (total_tokens as f64 / 1_000_000.0) * price_per_million(tier)
}

/// Per-query USD ceiling for `tier`, read from
/// `MAX_COST_PER_QUERY_<TIER>_USD` (default 10.0) per spec §6.
pub fn per_query_limit(tier: Tier) -> f64 {
    let var = format!("MAX_COST_PER_QUERY_{}_USD", tier.to_string().to_uppercase());
    std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(10.0)
}

pub fn cost_protection_enabled() -> bool {
    std::env::var("ENABLE_COST_PROTECTION").as_deref() == Ok("1")
}

/// Result of the pre-invocation budget check (spec §4.E "Cost/budget gate").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetCheck {
    pub allowed: bool,
    pub estimated_cost_usd: f64,
    pub limit_usd: f64,
}

/// `estimated_cost = (prompt + prompt * completion_multiplier(tier)) priced
/// at tier`; refuses when it exceeds `per_query_limit(tier)`. Disabled
/// (always allowed) unless `ENABLE_COST_PROTECTION=1`.
pub fn check_budget(prompt_tokens: u64, tier: Tier) -> BudgetCheck {
    if !cost_protection_enabled() {
        return BudgetCheck { allowed: true, estimated_cost_usd: 0.0, limit_usd: f64::INFINITY };
    }
    let estimated_total = prompt_tokens as f64 + (prompt_tokens as f64 * completion_multiplier(tier));
    let cost = (estimated_total / 1_000_000.0) * price_per_million(tier);
    let limit = per_query_limit(tier);
    BudgetCheck { allowed: cost <= limit, estimated_cost_usd: cost, limit_usd: limit }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderKind;
    use std::collections::HashMap;

    fn entry(model: &str, provider: ProviderKind) -> BackendEntry {
        BackendEntry {
            id: "x".into(),
            provider,
            provider_model_name: model.into(),
            params: HashMap::new(),
            base_url: "http://x".into(),
            api_key_env: None,
            timeout_ms: 1000,
        }
    }

    #[test]
    fn local_provider_is_always_local_tier() {
        assert_eq!(infer_tier(&entry("qwen3:14b", ProviderKind::LocalGpu)), Tier::Local);
    }

    #[test]
    fn reasoning_family_prefix_detected() {
        assert!(is_reasoning_family("o3-mini-high"));
        assert!(is_reasoning_family("o1"));
        assert!(!is_reasoning_family("gpt-5-mini"));
        assert_eq!(infer_tier(&entry("o3-mini-high", ProviderKind::RemoteCloud)), Tier::Reasoning);
    }

    #[test]
    fn mini_and_elite_cloud_tiers() {
        assert_eq!(infer_tier(&entry("gpt-5-mini", ProviderKind::RemoteCloud)), Tier::Mini);
        assert_eq!(infer_tier(&entry("gpt-5-high", ProviderKind::RemoteCloud)), Tier::Elite);
        assert_eq!(infer_tier(&entry("gpt-5-codex", ProviderKind::RemoteCloud)), Tier::Standard);
    }

    #[test]
    fn cost_is_zero_for_local_tier() {
        assert_eq!(cost_usd(1_000_000, Tier::Local), 0.0);
    }

    #[test]
    fn cost_matches_pricing_table() {
        assert!((cost_usd(1_000_000, Tier::Mini) - 0.50).abs() < 1e-9);
        assert!((cost_usd(1_000_000, Tier::Elite) - 30.00).abs() < 1e-9);
    }

    #[test]
    fn completion_multiplier_is_higher_for_reasoning_and_elite() {
        assert_eq!(completion_multiplier(Tier::Reasoning), 2.0);
        assert_eq!(completion_multiplier(Tier::Elite), 2.0);
        assert_eq!(completion_multiplier(Tier::Mini), 0.5);
        assert_eq!(completion_multiplier(Tier::Local), 0.5);
    }

    #[test]
    fn budget_allows_everything_when_protection_disabled() {
        unsafe { std::env::remove_var("ENABLE_COST_PROTECTION") };
        let check = check_budget(1_000_000, Tier::Elite);
        assert!(check.allowed);
    }

    #[test]
    fn budget_blocks_when_estimate_exceeds_limit() {
        unsafe {
            std::env::set_var("ENABLE_COST_PROTECTION", "1");
            std::env::set_var("MAX_COST_PER_QUERY_ELITE_USD", "0.0001");
        }
        let check = check_budget(1_000_000, Tier::Elite);
        assert!(!check.allowed);
        unsafe {
            std::env::remove_var("ENABLE_COST_PROTECTION");
            std::env::remove_var("MAX_COST_PER_QUERY_ELITE_USD");
        }
    }
}
