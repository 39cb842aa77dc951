//! Prometheus-compatible `/metrics` endpoint.
//!
//! All metrics are derived from the in-memory telemetry ring-buffer window
//! (`TelemetryEmitter`, spec §4.G). Because the buffer has a fixed capacity,
//! values represent a **sliding window** of recent requests rather than
//! lifetime counters. Use `TYPE gauge` throughout for semantic accuracy —
//! values may decrease as old entries rotate out.
//!
//! Metric families, extended from the teacher's tier/backend-only set with
//! the router-specific series this gateway needs (cost, escalation reason):
//! - `lmr_window_size`              — entries currently in the ring buffer
//! - `lmr_requests`                 — per-task/backend/tier/outcome request counts
//! - `lmr_latency_ms_sum`/`_count`  — latency sum/count per task and backend
//! - `lmr_escalations_total`        — requests escalated beyond the first attempt
//! - `lmr_cost_usd_sum`             — estimated cost in the current window
//! - `lmr_errors_total`             — requests whose final attempt failed

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::state::RouterState;

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let entries = state.engine.telemetry.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut escalations: u64 = 0;
    let mut errors: u64 = 0;
    let mut cost_sum: f64 = 0.0;

    // (task, backend, tier, status) → count
    let mut request_counts: HashMap<(String, String, String, String), u64> = HashMap::new();
    // (task, backend) → (latency_sum_ms, count)
    let mut latency: HashMap<(String, String), (u64, u64)> = HashMap::new();

    for e in &entries {
        if e.escalated {
            escalations += 1;
        }
        if e.status != "success" {
            errors += 1;
        }
        cost_sum += e.cost_est_usd;

        *request_counts
            .entry((e.task.clone(), e.backend_id.clone(), e.tier.clone(), e.status.clone()))
            .or_default() += 1;

        let lat = latency.entry((e.task.clone(), e.backend_id.clone())).or_default();
        lat.0 += e.latency_ms;
        lat.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP lmr_window_size Number of requests currently held in the telemetry ring-buffer window.\n");
    out.push_str("# TYPE lmr_window_size gauge\n");
    out.push_str(&format!("lmr_window_size {window_size}\n\n"));

    out.push_str("# HELP lmr_requests Request count in the current window, labelled by task, backend, tier, and final attempt status.\n");
    out.push_str("# TYPE lmr_requests gauge\n");
    let mut req_rows: Vec<_> = request_counts.iter().collect();
    req_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((task, backend, tier, status), count) in req_rows {
        out.push_str(&format!(
            "lmr_requests{{task=\"{task}\",backend=\"{backend}\",tier=\"{tier}\",status=\"{status}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP lmr_latency_ms_sum Sum of request latency (ms) in the current window, grouped by task and backend.\n");
    out.push_str("# TYPE lmr_latency_ms_sum gauge\n");
    out.push_str("# HELP lmr_latency_ms_count Number of observations for the latency sum above.\n");
    out.push_str("# TYPE lmr_latency_ms_count gauge\n");
    let mut lat_rows: Vec<_> = latency.iter().collect();
    lat_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((task, backend), (sum, count)) in lat_rows {
        out.push_str(&format!("lmr_latency_ms_sum{{task=\"{task}\",backend=\"{backend}\"}} {sum}\n"));
        out.push_str(&format!("lmr_latency_ms_count{{task=\"{task}\",backend=\"{backend}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP lmr_escalations_total Requests escalated beyond the first attempt in the current window.\n");
    out.push_str("# TYPE lmr_escalations_total gauge\n");
    out.push_str(&format!("lmr_escalations_total {escalations}\n\n"));

    out.push_str("# HELP lmr_cost_usd_sum Estimated cost in USD accrued in the current window.\n");
    out.push_str("# TYPE lmr_cost_usd_sum gauge\n");
    out.push_str(&format!("lmr_cost_usd_sum {cost_sum}\n\n"));

    out.push_str("# HELP lmr_errors_total Requests whose final attempt did not succeed, in the current window.\n");
    out.push_str("# TYPE lmr_errors_total gauge\n");
    out.push_str(&format!("lmr_errors_total {errors}\n"));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}
