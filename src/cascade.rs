//! CascadeEngine — orchestrates a single request end-to-end: classify,
//! select, attempt, quality-gate, optionally escalate once, emit (spec §4.F).
//!
//! Grounded on the teacher's `router.rs` (`route`, `dispatch`, `escalate`,
//! `is_sufficient`), generalized from "escalate through a fixed tier ladder
//! picking the first passable response" into the spec's task-specific
//! quality gates and strictly-bounded (at most one retry) escalation.

use std::time::{Duration, Instant};

use crate::admission::GpuAdmission;
use crate::auth_health::{AuthHealth, Gate};
use crate::classify::{self, Classifier};
use crate::cost_guard;
use crate::domain::{Attempt, AttemptStatus, ProviderKind, Task, UsageRecord};
use crate::policy::{self, RoutingPolicy};
use crate::registry::Registry;
use crate::telemetry::{CostMeter, TelemetryEmitter, TelemetryRecord};

/// Outcome of a single backend invocation, as distinguished by spec §4.F
/// step 4.
#[derive(Debug, Clone)]
pub enum InvokeResult {
    Success(String),
    /// Upstream returned a parseable HTTP status (400/401/402/403/404) —
    /// preserved verbatim, aborts the cascade (spec §7).
    UpstreamError { http_status: u16, detail: String },
    /// Timeout, connection failure, or any other non-HTTP-status error —
    /// counts as an attempt failure, cascade may escalate (spec §7).
    TransportError(String),
}

/// Abstraction over "call a backend". Generic (not `dyn`) so production code
/// uses the real `backends::BackendClient` with zero indirection, and tests
/// substitute a scripted fake — native `async fn` in a trait, static
/// dispatch only, matches how recent Rust expresses this without pulling in
/// `async-trait` (not part of the teacher's stack).
pub trait BackendInvoker {
    async fn invoke(
        &self,
        entry: &crate::registry::BackendEntry,
        messages: &[String],
        deadline: Duration,
    ) -> InvokeResult;

    /// Lightweight credential probe for the auth-healthy cache (spec §4.E).
    async fn probe_auth(&self, entry: &crate::registry::BackendEntry) -> bool;
}

/// Derive the cloud-availability gate consulted by both Classifier Stage 2
/// and PolicySelector (spec §4.B "Cloud-availability gate"): credentials
/// present in the environment AND the auth-healthy cache is not closed for
/// at least one remote backend.
pub async fn cloud_available(registry: &Registry, auth_health: &AuthHealth) -> bool {
    if std::env::var("ENABLE_OPENAI_FALLBACK").as_deref() == Ok("0") {
        return false;
    }
    for entry in registry.iterate() {
        if entry.provider != ProviderKind::RemoteCloud {
            continue;
        }
        if entry.api_key().is_none() {
            continue;
        }
        if auth_health.gate(&entry.id).await != Gate::Closed {
            return true;
        }
    }
    false
}

/// Task-specific, content-surface-only quality gate (spec §4.F).
/// Returns `Ok(())` on pass, `Err(reason)` on failure.
pub fn quality_gate(task: &Task, response_text: &str) -> Result<(), &'static str> {
    if response_text.trim().is_empty() {
        return Err("empty_response");
    }
    match task {
        Task::CodeGen => {
            if response_text.contains("```")
                || response_text.contains("def ")
                || response_text.contains("class ")
                || response_text.contains("import ")
            {
                Ok(())
            } else {
                Err("missing_code_block")
            }
        }
        Task::CodeReview => {
            let lower = response_text.to_lowercase();
            let markers = ["issue", "fix", "bug", "error", "suggestion", "correct"];
            if markers.iter().any(|m| lower.contains(m)) {
                Ok(())
            } else {
                Err("missing_review_content")
            }
        }
        Task::SystemDesign => {
            if response_text.contains('-') || response_text.contains('*') || response_text.contains('#') {
                Ok(())
            } else {
                Err("missing_structure_bullets")
            }
        }
        _ => Ok(()),
    }
}

/// Per-request overrides accepted by the native `/route` endpoint (spec §6
/// request shape: `prefer_code`, `critical`). `latency_ms_max`/`budget` are
/// parsed at the HTTP boundary but not modelled here — the cost guard and
/// SLA are process-wide settings, not per-request ones, in this design.
#[derive(Debug, Clone, Default)]
pub struct RouteHints {
    /// Force `complexity = critical` regardless of what Classify derived.
    pub critical: bool,
    /// Bias an otherwise chit/QA classification toward `code_gen`.
    pub prefer_code: bool,
}

pub struct CascadeEngine<I: BackendInvoker> {
    pub registry: Registry,
    pub classifier: Classifier,
    pub policy: RoutingPolicy,
    pub admission: GpuAdmission,
    /// Shared with `invoker` when `I` is the live HTTP invoker, which also
    /// needs to consult/update the cache on every remote call.
    pub auth_health: std::sync::Arc<AuthHealth>,
    pub invoker: I,
    pub telemetry: TelemetryEmitter,
    pub deadline: Duration,
}

/// Attempt cap of the spec's state machine: initial attempt + at most one
/// escalation (spec §4.F: "Escalation is bounded: at most one retry").
const MAX_ATTEMPTS: usize = 2;

impl<I: BackendInvoker> CascadeEngine<I> {
    #[tracing::instrument(skip(self, messages), fields(request_id = %request_id))]
    pub async fn run(&self, messages: Vec<String>, request_id: String, hints: RouteHints) -> (String, UsageRecord) {
        let t0 = Instant::now();
        let cloud_ok = cloud_available(&self.registry, &self.auth_health).await;

        let mut meta = self.classifier.classify_heuristic(&messages);
        if hints.prefer_code && matches!(meta.task, Task::Chitchat | Task::SimpleQa) {
            meta.task = Task::CodeGen;
        }
        if hints.critical {
            meta.complexity = crate::domain::Complexity::Critical;
            meta.confidence = meta.confidence.max(0.9);
        }
        if classify::should_refine(self.classifier.settings(), meta.confidence, cloud_ok) {
            if let Some(backend_id) = &self.classifier.settings().refinement_backend_id {
                if let Some(entry) = self.registry.get(backend_id) {
                    if let InvokeResult::Success(reply) =
                        self.invoker.invoke(entry, &messages, Duration::from_secs(10)).await
                    {
                        if let Some(parsed) = classify::parse_refinement_reply(&reply) {
                            meta = classify::apply_refinement(meta, parsed);
                        }
                    }
                }
            }
        }

        let candidates = policy::select(&self.policy, &self.registry, &meta, cloud_ok);
        let prompt_tokens = cost_guard::estimate_prompt_tokens(&messages);

        let mut attempts: Vec<Attempt> = Vec::with_capacity(MAX_ATTEMPTS);
        let mut escalation_reason: Option<String> = None;
        let mut final_text = String::new();
        let mut resolved_backend_id = candidates.first().cloned().unwrap_or_else(|| "local-chat".into());

        for (idx, backend_id) in candidates.iter().take(MAX_ATTEMPTS).enumerate() {
            let Some(entry) = self.registry.get(backend_id) else { continue };
            resolved_backend_id = backend_id.clone();

            if cost_guard::cost_protection_enabled() && entry.provider == ProviderKind::RemoteCloud {
                let tier = cost_guard::infer_tier(entry);
                let check = cost_guard::check_budget(prompt_tokens, tier);
                if !check.allowed {
                    attempts.push(Attempt {
                        backend_id: backend_id.clone(),
                        status: AttemptStatus::CostGuardBlocked,
                    });
                    break;
                }
            }

            let permit = if entry.provider == ProviderKind::LocalGpu {
                match self.admission.acquire().await {
                    Ok(p) => Some(p),
                    Err(_) => {
                        attempts.push(Attempt {
                            backend_id: backend_id.clone(),
                            status: AttemptStatus::AdmissionTimeout,
                        });
                        escalation_reason = Some("queue_timeout".into());
                        if idx + 1 >= candidates.len().min(MAX_ATTEMPTS) {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                None
            };

            let outcome = self.invoker.invoke(entry, &messages, self.deadline).await;

            if let Some(p) = &permit {
                self.admission.release(p).await;
            }

            match outcome {
                InvokeResult::Success(text) => match quality_gate(&meta.task, &text) {
                    Ok(()) => {
                        attempts.push(Attempt { backend_id: backend_id.clone(), status: AttemptStatus::Success });
                        final_text = text;
                        break;
                    }
                    Err(reason) => {
                        attempts.push(Attempt {
                            backend_id: backend_id.clone(),
                            status: AttemptStatus::QualityFailed { reason: reason.to_string() },
                        });
                        final_text = text;
                        escalation_reason = Some(reason.to_string());
                    }
                },
                InvokeResult::UpstreamError { http_status, .. } => {
                    attempts.push(Attempt {
                        backend_id: backend_id.clone(),
                        status: AttemptStatus::UpstreamError { http_status },
                    });
                    break;
                }
                InvokeResult::TransportError(_) => {
                    attempts.push(Attempt { backend_id: backend_id.clone(), status: AttemptStatus::TransportError });
                    escalation_reason = Some("transport_error".into());
                }
            }
        }

        if attempts.is_empty() {
            attempts.push(Attempt {
                backend_id: resolved_backend_id.clone(),
                status: AttemptStatus::TransportError,
            });
        }

        resolved_backend_id = attempts.last().unwrap().backend_id.clone();
        let escalated = attempts.len() > 1;
        if escalated && escalation_reason.is_none() {
            escalation_reason = Some("escalated".into());
        }
        if !escalated {
            escalation_reason = None;
        }

        let backend_entry = self.registry.get(&resolved_backend_id).cloned();
        let latency_ms = t0.elapsed().as_millis() as u64;

        let (prompt_tokens_est, completion_tokens_est, total_tokens_est, cost_est_usd, tier) =
            match &backend_entry {
                Some(entry) => CostMeter::estimate(&messages.join("\n"), &final_text, entry),
                None => (prompt_tokens.max(1), 1, prompt_tokens.max(1) + 1, 0.0, crate::domain::Tier::Local),
            };

        let record = UsageRecord {
            prompt_tokens_est,
            completion_tokens_est,
            total_tokens_est,
            resolved_backend_id,
            latency_ms,
            routing_meta: meta,
            attempts,
            escalated,
            escalation_reason,
            cost_est_usd,
            tier,
            ts: chrono::Utc::now(),
            request_id: request_id.clone(),
        };

        debug_assert!(record.check_invariants().is_ok(), "UsageRecord invariant violated");
        self.telemetry.emit(TelemetryRecord::from(&record));
        (final_text, record)
    }
}
