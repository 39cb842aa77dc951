//! In-memory backend catalog — loaded once at startup, read-only thereafter.
//!
//! Generalizes the teacher's `Config`/`BackendConfig`/`TierConfig` triad
//! (`config.rs`) from "named backend + tier ladder" into the spec's
//! `BackendEntry` model: one flat catalog of backends, each carrying its own
//! provider kind, concrete model name, and optional hyperparameters.

use std::collections::HashMap;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::domain::ProviderKind;

/// Immutable backend record. Identity is by `id`; constructed once at
/// startup from config + env, never mutated (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    pub id: String,
    pub provider: ProviderKind,
    pub provider_model_name: String,
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
    /// Base URL for this backend's HTTP endpoint. Local entries point at
    /// the Ollama-compatible server; remote entries at the cloud API root.
    pub base_url: String,
    /// Environment variable holding the API key, if this backend requires one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl BackendEntry {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }

    /// Read a string-valued param, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Read-only catalog of [`BackendEntry`] records, built from the `[models]`
/// section of the config document plus environment overrides.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: HashMap<String, BackendEntry>,
    /// Declaration order — preserved for tie-breaking and default fallback
    /// ordering (spec §4.B step 2, §4.C step 6).
    order: Vec<String>,
}

/// The small set of logical ids a deployment is expected to provide.
/// Missing ids are logged; whether that is fatal is a deployment policy
/// decision left to the caller of [`Registry::validate_required`].
pub const REQUIRED_IDS: &[&str] = &["local-chat", "local-code"];

impl Registry {
    pub fn from_entries(entries: Vec<BackendEntry>) -> Self {
        let mut map = HashMap::with_capacity(entries.len());
        let mut order = Vec::with_capacity(entries.len());
        for mut entry in entries {
            apply_env_overrides(&mut entry);
            order.push(entry.id.clone());
            map.insert(entry.id.clone(), entry);
        }
        Self { entries: map, order }
    }

    pub fn get(&self, id: &str) -> Option<&BackendEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Iterate entries in declaration order.
    pub fn iterate(&self) -> impl Iterator<Item = &BackendEntry> {
        self.order.iter().filter_map(move |id| self.entries.get(id))
    }

    /// Validate that `required` ids are present. Returns the missing subset;
    /// an empty return means validation passed. Callers decide whether a
    /// non-empty result is fatal (spec §4.A).
    pub fn validate_required(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|id| !self.entries.contains_key(**id))
            .map(|id| id.to_string())
            .collect()
    }

    /// Fail fast if any required id is missing. Used at startup; deployments
    /// that want soft-fail can call `validate_required` directly instead.
    pub fn require_or_bail(&self, required: &[&str]) -> anyhow::Result<()> {
        let missing = self.validate_required(required);
        anyhow::ensure!(
            missing.is_empty(),
            "registry missing required backend ids: {}",
            missing.join(", ")
        );
        Ok(())
    }
}

/// Apply per-entry env overrides to `provider_model_name` and local-backend
/// params. Naming convention: `LMR_MODEL_<ID>` (model alias remap) and
/// `LMR_PARAM_<ID>_<KEY>` (param remap), ids/keys upper-cased and
/// non-alphanumerics replaced with `_` — mirrors the teacher's
/// env-driven-secrets pattern (`BackendConfig::api_key_env`) extended to
/// cover the alias-remap use-case called out in spec §9.
fn apply_env_overrides(entry: &mut BackendEntry) {
    let slug = env_slug(&entry.id);

    if let Ok(name) = std::env::var(format!("LMR_MODEL_{slug}")) {
        if !name.is_empty() {
            entry.provider_model_name = name;
        }
    }

    let prefix = format!("LMR_PARAM_{slug}_");
    for (key, value) in std::env::vars() {
        if let Some(param_key) = key.strip_prefix(&prefix) {
            entry.params.insert(
                param_key.to_lowercase(),
                toml::Value::String(value),
            );
        }
    }
}

fn env_slug(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

mod defaults {
    pub fn timeout_ms() -> u64 {
        30_000
    }
}

/// Build a [`Registry`] from the raw `[[models]]` table parsed out of the
/// top-level config document.
pub fn load_registry(raw: Vec<BackendEntry>) -> anyhow::Result<Registry> {
    anyhow::ensure!(!raw.is_empty(), "config must declare at least one model");
    let ids: std::collections::HashSet<&str> = raw.iter().map(|e| e.id.as_str()).collect();
    anyhow::ensure!(
        ids.len() == raw.len(),
        "duplicate backend id in `models` config"
    );
    Ok(Registry::from_entries(raw))
}

/// Load and validate the registry, bailing with context on the common
/// misconfiguration cases surfaced during startup (spec §4.A).
pub fn load_registry_checked(raw: Vec<BackendEntry>, required: &[&str]) -> anyhow::Result<Registry> {
    let reg = load_registry(raw).context("loading backend registry")?;
    reg.require_or_bail(required)?;
    Ok(reg)
}
