//! CostMeter + TelemetryEmitter (spec §4.G).
//!
//! The ring-buffer shape is kept from the teacher's `traffic.rs` almost
//! verbatim (`TrafficLog`/non-blocking `try_lock` push/`recent`/`stats`);
//! what changes is the record shape, which is now a one-line projection of
//! [`UsageRecord`] rather than the teacher's tier/profile-centric entry.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cost_guard;
use crate::domain::{Tier, UsageRecord};
use crate::registry::BackendEntry;

/// Computes `prompt_tokens_est`/`completion_tokens_est`/`total_tokens_est`
/// and `cost_est_usd` for a finished attempt (spec §4.G).
pub struct CostMeter;

impl CostMeter {
    /// `tokens = max(1, ceil(chars/4))`, applied separately to prompt and
    /// completion text (spec §4.G step 1).
    pub fn estimate(prompt: &str, completion: &str, backend: &BackendEntry) -> (u64, u64, u64, f64, Tier) {
        let prompt_tokens = crate::classify::estimate_tokens(prompt).max(1);
        let completion_tokens = crate::classify::estimate_tokens(completion).max(1);
        let total = prompt_tokens + completion_tokens;
        let tier = cost_guard::infer_tier(backend);
        let cost = cost_guard::cost_usd(total, tier);
        (prompt_tokens, completion_tokens, total, cost, tier)
    }
}

/// One line per completed request — the telemetry record shape the spec
/// fixes as the contract (§4.G), independent of sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub request_id: String,
    pub task: String,
    pub complexity: String,
    pub backend_id: String,
    pub tier: String,
    pub tokens_total: u64,
    pub latency_ms: u64,
    pub cost_est_usd: f64,
    pub status: String,
    pub escalated: bool,
}

impl From<&UsageRecord> for TelemetryRecord {
    fn from(u: &UsageRecord) -> Self {
        let status = u
            .attempts
            .last()
            .map(|a| a.status.label().to_string())
            .unwrap_or_else(|| "unknown".into());
        TelemetryRecord {
            ts: u.ts,
            request_id: u.request_id.clone(),
            task: u.routing_meta.task.to_string(),
            complexity: u.routing_meta.complexity.to_string(),
            backend_id: u.resolved_backend_id.clone(),
            tier: u.tier.to_string(),
            tokens_total: u.total_tokens_est,
            latency_ms: u.latency_ms,
            cost_est_usd: u.cost_est_usd,
            status,
            escalated: u.escalated,
        }
    }
}

/// Fixed-capacity ring-buffer of recent [`TelemetryRecord`]s, exposed through
/// the admin API, plus a `tracing`-event sink for every record emitted
/// (spec §4.G: "stdout log, file, metrics endpoint... interchangeable").
pub struct TelemetryEmitter {
    capacity: usize,
    entries: Mutex<VecDeque<TelemetryRecord>>,
}

impl TelemetryEmitter {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Emit exactly one telemetry record for a completed request. Called
    /// once per request by [`crate::cascade::CascadeEngine`] (spec §3
    /// invariant: "exactly one UsageRecord is emitted per completed
    /// request").
    #[tracing::instrument(skip_all, fields(request_id = %record.request_id, backend = %record.backend_id))]
    pub fn emit(&self, record: TelemetryRecord) {
        tracing::info!(
            task = %record.task,
            complexity = %record.complexity,
            tier = %record.tier,
            tokens_total = record.tokens_total,
            latency_ms = record.latency_ms,
            cost_est_usd = record.cost_est_usd,
            status = %record.status,
            escalated = record.escalated,
            "request completed"
        );
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(record);
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<TelemetryRecord> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> TelemetryStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };
        let total_cost_usd = entries.iter().map(|e| e.cost_est_usd).sum();
        let escalation_count = entries.iter().filter(|e| e.escalated).count();
        let mut tier_counts: HashMap<String, usize> = HashMap::new();
        for e in entries.iter() {
            *tier_counts.entry(e.tier.clone()).or_default() += 1;
        }
        TelemetryStats { total_requests: total, escalation_count, avg_latency_ms, total_cost_usd, tier_counts }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryStats {
    pub total_requests: usize,
    pub escalation_count: usize,
    pub avg_latency_ms: f64,
    pub total_cost_usd: f64,
    pub tier_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Attempt, AttemptStatus, ClassifierUsed, Complexity, RoutingMeta, Task};

    fn sample() -> UsageRecord {
        UsageRecord {
            prompt_tokens_est: 10,
            completion_tokens_est: 5,
            total_tokens_est: 15,
            resolved_backend_id: "local-chat".into(),
            latency_ms: 42,
            routing_meta: RoutingMeta {
                task: Task::Chitchat,
                complexity: Complexity::Low,
                confidence: 0.5,
                requires_long_context: false,
                quality_score: 5,
                classifier_used: ClassifierUsed::Heuristic,
            },
            attempts: vec![Attempt { backend_id: "local-chat".into(), status: AttemptStatus::Success }],
            escalated: false,
            escalation_reason: None,
            cost_est_usd: 0.0,
            tier: Tier::Local,
            ts: chrono::Utc::now(),
            request_id: "r-1".into(),
        }
    }

    #[test]
    fn telemetry_record_projects_last_attempt_status() {
        let rec: TelemetryRecord = (&sample()).into();
        assert_eq!(rec.status, "success");
        assert_eq!(rec.backend_id, "local-chat");
    }

    #[tokio::test]
    async fn emit_then_recent_round_trips() {
        let emitter = TelemetryEmitter::new(10);
        emitter.emit((&sample()).into());
        let recent = emitter.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].request_id, "r-1");
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest() {
        let emitter = TelemetryEmitter::new(2);
        for i in 0..3 {
            let mut rec = sample();
            rec.request_id = format!("r-{i}");
            emitter.emit((&rec).into());
        }
        let recent = emitter.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|r| r.request_id != "r-0"));
    }

    #[tokio::test]
    async fn stats_aggregate_escalation_and_cost() {
        let emitter = TelemetryEmitter::new(10);
        let mut escalated = sample();
        escalated.escalated = true;
        escalated.cost_est_usd = 0.02;
        emitter.emit((&escalated).into());
        emitter.emit((&sample()).into());
        let stats = emitter.stats().await;
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.escalation_count, 1);
        assert!((stats.total_cost_usd - 0.02).abs() < 1e-9);
    }
}
