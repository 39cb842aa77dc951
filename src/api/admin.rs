//! Admin API (port 8081) — operator-facing introspection endpoints.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from the internal Docker network, never exposed to the internet).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::{backends::BackendClient, state::RouterState};

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/telemetry", get(telemetry))
        .route("/admin/config", get(config))
        .route("/admin/backends/health", get(backends_health))
        .with_state(state)
}

/// `GET /admin/health` — liveness plus registry/uptime summary.
pub async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "backends": state.registry().iterate().count(),
        "admission_enabled": state.engine.admission.is_enabled(),
    }))
}

#[derive(Deserialize)]
pub struct TelemetryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// `GET /admin/telemetry?limit=N` — recent telemetry entries plus window stats.
pub async fn telemetry(
    State(state): State<Arc<RouterState>>,
    Query(q): Query<TelemetryQuery>,
) -> impl IntoResponse {
    let entries = state.engine.telemetry.recent(q.limit).await;
    let stats = state.engine.telemetry.stats().await;
    Json(json!({
        "stats": stats,
        "entries": entries,
    }))
}

/// `GET /admin/config` — current config with secrets redacted (env var names
/// are shown, resolved values never are).
pub async fn config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let cfg = state.config();

    let models: Vec<_> = cfg
        .models
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "provider": m.provider,
                "provider_model_name": m.provider_model_name,
                "base_url": m.base_url,
                "api_key_env": m.api_key_env,
            })
        })
        .collect();

    Json(json!({
        "gateway": {
            "client_port": cfg.gateway.client_port,
            "admin_port": cfg.gateway.admin_port,
            "telemetry_capacity": cfg.gateway.telemetry_capacity,
            "rate_limit_rpm": cfg.gateway.rate_limit_rpm,
            "admin_token_env": cfg.gateway.admin_token_env,
            "client_api_key_env": cfg.gateway.client_api_key_env,
            "gpu_queue_redis_url_set": cfg.gateway.gpu_queue_redis_url.is_some(),
            "gpu_max_workers": cfg.gateway.gpu_max_workers,
            "gpu_queue_timeout_ms": cfg.gateway.gpu_queue_timeout_ms,
        },
        "models": models,
        "task_types": cfg.task_types,
        "high_complexity_pattern": cfg.high_complexity_pattern,
        "routing_policy": cfg.routing_policy,
        "sla": cfg.sla,
    }))
}

/// `GET /admin/backends/health` — probe every configured backend.
pub async fn backends_health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let mut results = Vec::new();

    for entry in state.registry().iterate() {
        let client = match BackendClient::new(entry) {
            Ok(c) => c,
            Err(e) => {
                results.push(json!({
                    "backend": entry.id,
                    "status": "error",
                    "error": e.to_string(),
                }));
                continue;
            }
        };

        match client.health_check().await {
            Ok(_) => results.push(json!({ "backend": entry.id, "status": "ok" })),
            Err(e) => results.push(json!({
                "backend": entry.id,
                "status": "unreachable",
                "error": e.to_string(),
            })),
        }
    }

    let all_ok = results.iter().all(|r| r["status"] == "ok");
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };

    (status, Json(json!({ "backends": results })))
}
