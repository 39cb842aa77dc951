//! Top-level configuration document for the router.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [[models]]
//! id = "local-chat"
//! provider = "local_gpu"
//! provider_model_name = "qwen2.5:7b"
//! base_url = "http://localhost:11434"
//!
//! [classifier]
//! llm_refinement_enabled = false
//!
//! [routing_policy.chitchat]
//! low = ["local-chat"]
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::classify::{ClassifierSettings, TaskDef};
use crate::domain::Complexity;
use crate::policy::RoutingPolicy;
use crate::registry::{self, BackendEntry, Registry, REQUIRED_IDS};

/// Top-level config document (spec §6 "Config document top-level keys").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Backend catalog — the `[[models]]` array.
    #[serde(default)]
    pub models: Vec<BackendEntry>,

    /// Task definitions driving the heuristic classifier, keyed by task name.
    #[serde(default)]
    pub task_types: Vec<TaskDef>,

    /// Optional regex promoting any match straight to `Complexity::High`
    /// (spec §4.B step 5).
    #[serde(default)]
    pub high_complexity_pattern: Option<String>,

    #[serde(default)]
    pub classifier: ClassifierSettings,

    #[serde(default)]
    pub routing_policy: RoutingPolicy,

    #[serde(default)]
    pub sla: SlaConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let ids: std::collections::HashSet<&str> = self.models.iter().map(|m| m.id.as_str()).collect();
        anyhow::ensure!(ids.len() == self.models.len(), "duplicate backend id in `models` config");

        for (task, ladder) in self.routing_policy.by_task.iter() {
            for (complexity, candidates) in ladder.iter() {
                for id in candidates {
                    anyhow::ensure!(
                        ids.contains(id.as_str()),
                        "routing_policy[{task}][{complexity:?}] references unknown backend `{id}`"
                    );
                }
            }
        }
        for id in &self.routing_policy.default {
            anyhow::ensure!(ids.contains(id.as_str()), "routing_policy default references unknown backend `{id}`");
        }

        Ok(())
    }

    /// Build the [`Registry`] from this document's `[[models]]` section,
    /// applying env overrides and validating the required local ids are
    /// present (spec §4.A).
    pub fn build_registry(&self) -> anyhow::Result<Registry> {
        registry::load_registry_checked(self.models.clone(), REQUIRED_IDS)
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the agent-facing client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API + web UI (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Number of recent requests to keep in the in-memory telemetry ring
    /// buffer (default: 500).
    #[serde(default = "defaults::telemetry_capacity")]
    pub telemetry_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Maximum requests per minute per client IP on the client port.
    /// Leave unset (or 0) to disable rate limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication.
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Environment variable whose value is the shared API key required for
    /// client API requests (spec §6: `X-API-Key` or `Authorization: Bearer`).
    /// Leave unset to run the client API open.
    #[serde(default)]
    pub client_api_key_env: Option<String>,

    /// Redis URL for the GPU admission broker. Leave unset to run with
    /// admission disabled (pass-through).
    #[serde(default)]
    pub gpu_queue_redis_url: Option<String>,

    /// Maximum concurrent `local_gpu` invocations (default: 1).
    #[serde(default = "defaults::gpu_max_workers")]
    pub gpu_max_workers: u32,

    /// GPU admission queue wait timeout in milliseconds (default: 120 000).
    #[serde(default = "defaults::gpu_queue_timeout_ms")]
    pub gpu_queue_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client_port: defaults::client_port(),
            admin_port: defaults::admin_port(),
            telemetry_capacity: defaults::telemetry_capacity(),
            log_level: None,
            rate_limit_rpm: None,
            admin_token_env: None,
            client_api_key_env: None,
            gpu_queue_redis_url: None,
            gpu_max_workers: defaults::gpu_max_workers(),
            gpu_queue_timeout_ms: defaults::gpu_queue_timeout_ms(),
        }
    }
}

/// SLA/deadline settings shared by all requests (spec §4.F).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlaConfig {
    /// Per-attempt deadline in milliseconds before a candidate is considered
    /// failed and escalation is attempted (default: 30 000).
    #[serde(default = "defaults::attempt_deadline_ms")]
    pub attempt_deadline_ms: u64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self { attempt_deadline_ms: defaults::attempt_deadline_ms() }
    }
}

impl SlaConfig {
    pub fn attempt_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.attempt_deadline_ms)
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn telemetry_capacity() -> usize { 500 }
    pub fn gpu_max_workers() -> u32 { 1 }
    pub fn gpu_queue_timeout_ms() -> u64 { 120_000 }
    pub fn attempt_deadline_ms() -> u64 { 30_000 }
}

/// Not reachable from TOML deserialization directly — kept so
/// [`crate::domain::Complexity`] stays in scope for doc examples.
#[allow(dead_code)]
fn _complexity_in_scope(_c: Complexity) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [[models]]
            id = "local-chat"
            provider = "local_gpu"
            provider_model_name = "qwen2.5:7b"
            base_url = "http://localhost:11434"

            [[models]]
            id = "local-code"
            provider = "local_gpu"
            provider_model_name = "qwen2.5-coder:7b"
            base_url = "http://localhost:11434"
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn gateway_defaults_are_applied_when_section_is_minimal() {
        let config = minimal_config();
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.gateway.telemetry_capacity, 500);
        assert_eq!(config.gateway.gpu_max_workers, 1);
    }

    #[test]
    fn validation_rejects_duplicate_model_ids() {
        let mut config = minimal_config();
        let dup = config.models[0].clone();
        config.models.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_routing_policy_referencing_unknown_backend() {
        let mut config = minimal_config();
        config.routing_policy.default = vec!["no-such-backend".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_registry_succeeds_for_minimal_config() {
        let config = minimal_config();
        let reg = config.build_registry().expect("registry should build");
        assert!(reg.contains("local-chat"));
        assert!(reg.contains("local-code"));
    }
}
