//! Shared application state injected into every request handler.
//!
//! Grounded on the teacher's `router.rs::RouterState` — same role (one value
//! behind an `Arc`, cloned into every axum handler via `State`), generalized
//! from "holds a config snapshot + traffic log" to "owns the cascade engine
//! plus whatever ambient middleware state (rate limiter, admin/client keys)
//! the HTTP layer still needs."

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use anyhow::Context;

use crate::{
    admission::GpuAdmission,
    api::rate_limit::RateLimiter,
    auth_health::AuthHealth,
    backends::LiveInvoker,
    cascade::CascadeEngine,
    classify::Classifier,
    config::Config,
    registry::{self, Registry},
    telemetry::TelemetryEmitter,
};

/// Shared application state. One instance lives behind an `Arc` for the
/// lifetime of the process; handlers clone the `Arc`, never the value.
pub struct RouterState {
    /// Atomically-swappable live config, used only by the hot-reload task and
    /// `/admin/config` — the cascade engine itself is built once at startup
    /// from the config snapshot current at that time (registry/policy/
    /// classifier tables are read-only after startup per spec §5).
    config_lock: Arc<RwLock<Arc<Config>>>,
    /// Path to the config file on disk — used by the hot-reload background task.
    pub config_path: PathBuf,
    pub engine: CascadeEngine<LiveInvoker>,
    pub started_at: std::time::Instant,
    /// Optional per-IP rate limiter. `None` means rate limiting is disabled.
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Bearer token required for admin API access. `None` disables admin auth.
    pub admin_token: Option<String>,
    /// Single shared client API key (spec §6 auth model). `None` means the
    /// client API is open — no `X-API-Key`/`Authorization` header required.
    pub client_api_key: Option<String>,
}

impl RouterState {
    /// Build the full application state from a loaded config: registry,
    /// classifier, admission broker, auth-healthy cache, telemetry ring
    /// buffer, and the live-HTTP-backed cascade engine, plus the ambient
    /// middleware fields (rate limiter / admin+client keys).
    pub async fn new(config: Arc<Config>, config_path: PathBuf) -> anyhow::Result<Self> {
        let registry = config.build_registry().context("building backend registry")?;
        let classifier = Classifier::new(
            config.task_types.clone(),
            config.classifier.clone(),
            config.high_complexity_pattern.as_deref(),
        )
        .context("compiling classifier task patterns")?;

        let admission = if let Some(redis_url) = &config.gateway.gpu_queue_redis_url {
            GpuAdmission::connect(
                redis_url,
                config.gateway.gpu_max_workers,
                std::time::Duration::from_millis(config.gateway.gpu_queue_timeout_ms),
            )
            .await
        } else {
            GpuAdmission::disabled(
                config.gateway.gpu_max_workers,
                std::time::Duration::from_millis(config.gateway.gpu_queue_timeout_ms),
            )
        };

        let auth_health = Arc::new(AuthHealth::new());
        let telemetry = TelemetryEmitter::new(config.gateway.telemetry_capacity);

        let engine = CascadeEngine {
            registry,
            classifier,
            policy: config.routing_policy.clone(),
            admission,
            auth_health: Arc::clone(&auth_health),
            invoker: LiveInvoker { auth_health },
            telemetry,
            deadline: config.sla.attempt_deadline(),
        };

        let rate_limiter = config
            .gateway
            .rate_limit_rpm
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Arc::new(RateLimiter::new(rpm)));

        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());

        let client_api_key = config
            .gateway
            .client_api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());

        Ok(Self {
            config_lock: Arc::new(RwLock::new(config)),
            config_path,
            engine,
            started_at: std::time::Instant::now(),
            rate_limiter,
            admin_token,
            client_api_key,
        })
    }

    /// Returns a snapshot of the current live config.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock.read().expect("config lock poisoned").clone()
    }

    /// Atomically replaces the live config. Called only from the hot-reload
    /// task — per spec §5, the registry/policy/classifier tables owned by
    /// `engine` are read-only after startup, so a reload updates only the
    /// snapshot surfaced through `/admin/config`, not the running engine.
    /// A full pick-up of routing/backend changes requires a restart.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
    }

    /// Backend catalog, exposed for `/v1/models` and `/admin/backends/health`.
    pub fn registry(&self) -> &Registry {
        &self.engine.registry
    }

    /// Re-export the required-id list so handlers/tests don't need to import
    /// `registry` directly just to reference it.
    pub fn required_ids() -> &'static [&'static str] {
        registry::REQUIRED_IDS
    }
}
