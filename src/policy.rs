//! PolicySelector — turns a [`RoutingMeta`] into an ordered escalation ladder
//! of candidate backend ids.
//!
//! Grounded on `original_source/graph/router.py::pick_model_id`, generalized
//! from "pick one best-guess id" into the ordered `task → complexity →
//! [backend_id]` lookup spec §4.C describes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Complexity, ProviderKind, RoutingMeta, Task};
use crate::registry::Registry;

/// The `routing_policy` config table: `task name -> complexity -> ordered ids`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RoutingPolicy {
    #[serde(flatten)]
    pub by_task: HashMap<String, HashMap<Complexity, Vec<String>>>,
    /// Global fallback used when a task has no entry at all (spec §4.C step 2).
    #[serde(default = "default_fallback")]
    pub default: Vec<String>,
}

fn default_fallback() -> Vec<String> {
    vec!["local-chat".to_string()]
}

/// Last-resort candidate when even the filtered default list is empty
/// (spec §4.C step 5).
const LAST_RESORT: &[&str] = &["local-code", "local-chat"];

/// `select(meta, cloud_available) -> ordered_candidate_ids` (spec §4.C).
/// Never mutates `meta` — the quality-score override only affects the
/// lookup key.
pub fn select(policy: &RoutingPolicy, registry: &Registry, meta: &RoutingMeta, cloud_available: bool) -> Vec<String> {
    let lookup_complexity = if meta.quality_score >= 8 { Complexity::Critical } else { meta.complexity };

    let candidates = lookup(policy, &meta.task, lookup_complexity);

    let filtered: Vec<String> = candidates
        .into_iter()
        .filter(|id| registry.contains(id))
        .filter(|id| match registry.get(id) {
            Some(entry) => cloud_available || entry.provider != ProviderKind::RemoteCloud,
            None => false,
        })
        .collect();

    if !filtered.is_empty() {
        return filtered;
    }

    LAST_RESORT
        .iter()
        .find(|id| registry.contains(id))
        .map(|id| vec![id.to_string()])
        .unwrap_or_default()
}

fn lookup(policy: &RoutingPolicy, task: &Task, complexity: Complexity) -> Vec<String> {
    if let Some(by_complexity) = policy.by_task.get(task.as_str()) {
        if let Some(ids) = by_complexity.get(&complexity) {
            return ids.clone();
        }
        if let Some(ids) = by_complexity.get(&Complexity::Low) {
            return ids.clone();
        }
    }
    policy.default.clone()
}
