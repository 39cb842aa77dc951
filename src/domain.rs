//! Core data model — tagged records and enums for the routing pipeline.
//!
//! Mirrors the duck-typed dicts of the system this gateway replaces
//! (`RoutingMeta`, `UsageRecord`, `Attempt` as free-form maps) with explicit
//! Rust types, per the redesign direction: a systems-language rewrite should
//! use tagged records with explicit enums instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which API protocol family a backend belongs to.
///
/// `local_gpu` backends are admission-controlled (see [`crate::admission`])
/// and always free; `remote_cloud` backends are metered and subject to the
/// cost guard and auth-healthy cache.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    LocalGpu,
    RemoteCloud,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::LocalGpu => "local_gpu",
            Self::RemoteCloud => "remote_cloud",
        })
    }
}

/// Pricing/capability bucket used by the cost meter and budget gate.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Mini,
    Standard,
    Reasoning,
    Elite,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Mini => "mini",
            Self::Standard => "standard",
            Self::Reasoning => "reasoning",
            Self::Elite => "elite",
        })
    }
}

/// Closed (but config-extensible) task taxonomy. Unknown task names loaded
/// from config are accepted as [`Task::Other`] so a deployment can add task
/// types without a code change — the hard-coded variants below are the ones
/// spec'd as "critical by nature" or given special-cased quality gates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Task {
    Chitchat,
    SimpleQa,
    CodeGen,
    CodeReview,
    CodeCritDebug,
    SystemDesign,
    Reasoning,
    Research,
    DataAnalysis,
    MachineLearning,
    CreativeWriting,
    /// Any task name declared in config that isn't one of the built-ins above.
    Other(String),
}

impl Task {
    /// Parse a task name as it appears in config (`task_types` keys) or in an
    /// LLM classifier reply's `TASK:` field.
    pub fn parse(name: &str) -> Task {
        match name {
            "chitchat" => Task::Chitchat,
            "simple_qa" => Task::SimpleQa,
            "code_gen" => Task::CodeGen,
            "code_review" => Task::CodeReview,
            "code_crit_debug" => Task::CodeCritDebug,
            "system_design" => Task::SystemDesign,
            "reasoning" => Task::Reasoning,
            "research" => Task::Research,
            "data_analysis" => Task::DataAnalysis,
            "machine_learning" => Task::MachineLearning,
            "creative_writing" => Task::CreativeWriting,
            other => Task::Other(other.to_string()),
        }
    }

    /// Tasks that may not be downgraded below their configured default
    /// complexity by a short prompt (spec §3).
    pub fn critical_by_nature(&self) -> bool {
        matches!(
            self,
            Task::CodeCritDebug | Task::SystemDesign | Task::Reasoning | Task::Research
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Task::Chitchat => "chitchat",
            Task::SimpleQa => "simple_qa",
            Task::CodeGen => "code_gen",
            Task::CodeReview => "code_review",
            Task::CodeCritDebug => "code_crit_debug",
            Task::SystemDesign => "system_design",
            Task::Reasoning => "reasoning",
            Task::Research => "research",
            Task::DataAnalysis => "data_analysis",
            Task::MachineLearning => "machine_learning",
            Task::CreativeWriting => "creative_writing",
            Task::Other(s) => s.as_str(),
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Task {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Task::parse(&s))
    }
}

/// Total order `low < medium < high < critical`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

impl Complexity {
    /// Returns `self` promoted to at least `floor`, never downgraded.
    pub fn at_least(self, floor: Complexity) -> Complexity {
        self.max(floor)
    }
}

/// Which classification path produced a [`RoutingMeta`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierUsed {
    Heuristic,
    Llm,
}

/// Output of [`crate::classify::classify`] — immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMeta {
    pub task: Task,
    pub complexity: Complexity,
    pub confidence: f64,
    pub requires_long_context: bool,
    pub quality_score: u8,
    pub classifier_used: ClassifierUsed,
}

/// Outcome of a single backend invocation attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Success,
    QualityFailed { reason: String },
    /// A real upstream HTTP status (400/401/402/403/404) returned by the
    /// backend itself — preserved verbatim (spec §7, §8 Scenario 5).
    UpstreamError { http_status: u16 },
    TransportError,
    /// The cost guard blocked this candidate before it was ever dialed — a
    /// router-internal decision, not anything the backend said. Kept
    /// distinct from [`Self::UpstreamError`] so a genuine upstream 402 isn't
    /// conflated with this synthetic signal (spec §7).
    CostGuardBlocked,
    /// The GPU admission queue timed out waiting for a slot (spec §7).
    AdmissionTimeout,
}

impl AttemptStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Success => "success",
            AttemptStatus::QualityFailed { .. } => "quality_failed",
            AttemptStatus::UpstreamError { .. } => "upstream_error",
            AttemptStatus::TransportError => "transport_error",
            AttemptStatus::CostGuardBlocked => "cost_guard_blocked",
            AttemptStatus::AdmissionTimeout => "admission_timeout",
        }
    }
}

/// One entry in a [`UsageRecord::attempts`] ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub backend_id: String,
    pub status: AttemptStatus,
}

/// Produced exactly once per completed request (spec §3 invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens_est: u64,
    pub completion_tokens_est: u64,
    pub total_tokens_est: u64,
    pub resolved_backend_id: String,
    pub latency_ms: u64,
    pub routing_meta: RoutingMeta,
    pub attempts: Vec<Attempt>,
    pub escalated: bool,
    pub escalation_reason: Option<String>,
    pub cost_est_usd: f64,
    pub tier: Tier,
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
    pub request_id: String,
}

impl UsageRecord {
    /// Invariant check used in tests and defensively at the end of
    /// [`crate::cascade::CascadeEngine::run`] — see spec §3/§8 (P1-P3).
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.attempts.is_empty() {
            return Err("attempts must be non-empty".into());
        }
        if self.attempts.len() > 2 {
            return Err("attempts must not exceed the one-retry cap".into());
        }
        let last = self.attempts.last().unwrap();
        if last.backend_id != self.resolved_backend_id {
            return Err("resolved_backend_id must match the last attempt".into());
        }
        if self.attempts.len() > 1 && !self.escalated {
            return Err("escalated must be true when more than one attempt occurred".into());
        }
        if self.escalated
            && self
                .escalation_reason
                .as_deref()
                .unwrap_or("")
                .is_empty()
        {
            return Err("escalation_reason must be non-empty when escalated".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complexity_orders_as_spec_d() {
        assert!(Complexity::Low < Complexity::Medium);
        assert!(Complexity::Medium < Complexity::High);
        assert!(Complexity::High < Complexity::Critical);
    }

    #[test]
    fn at_least_never_downgrades() {
        assert_eq!(Complexity::High.at_least(Complexity::Medium), Complexity::High);
        assert_eq!(Complexity::Low.at_least(Complexity::Medium), Complexity::Medium);
    }

    #[test]
    fn critical_by_nature_tasks() {
        assert!(Task::SystemDesign.critical_by_nature());
        assert!(Task::Research.critical_by_nature());
        assert!(!Task::Chitchat.critical_by_nature());
        assert!(!Task::CodeGen.critical_by_nature());
    }

    fn sample_record(attempts: Vec<Attempt>, escalated: bool, reason: Option<&str>) -> UsageRecord {
        UsageRecord {
            prompt_tokens_est: 10,
            completion_tokens_est: 10,
            total_tokens_est: 20,
            resolved_backend_id: attempts.last().unwrap().backend_id.clone(),
            latency_ms: 5,
            routing_meta: RoutingMeta {
                task: Task::SimpleQa,
                complexity: Complexity::Low,
                confidence: 0.5,
                requires_long_context: false,
                quality_score: 5,
                classifier_used: ClassifierUsed::Heuristic,
            },
            attempts,
            escalated,
            escalation_reason: reason.map(String::from),
            cost_est_usd: 0.0,
            tier: Tier::Local,
            ts: Utc::now(),
            request_id: "r1".into(),
        }
    }

    #[test]
    fn invariants_reject_empty_attempts() {
        let mut rec = sample_record(
            vec![Attempt { backend_id: "a".into(), status: AttemptStatus::Success }],
            false,
            None,
        );
        rec.attempts.clear();
        assert!(rec.check_invariants().is_err());
    }

    #[test]
    fn invariants_reject_mismatched_resolved_id() {
        let mut rec = sample_record(
            vec![Attempt { backend_id: "a".into(), status: AttemptStatus::Success }],
            false,
            None,
        );
        rec.resolved_backend_id = "other".into();
        assert!(rec.check_invariants().is_err());
    }

    #[test]
    fn invariants_require_escalation_reason_when_escalated() {
        let rec = sample_record(
            vec![
                Attempt { backend_id: "a".into(), status: AttemptStatus::TransportError },
                Attempt { backend_id: "b".into(), status: AttemptStatus::Success },
            ],
            true,
            None,
        );
        assert!(rec.check_invariants().is_err());
    }

    #[test]
    fn invariants_pass_for_well_formed_escalation() {
        let rec = sample_record(
            vec![
                Attempt { backend_id: "a".into(), status: AttemptStatus::TransportError },
                Attempt { backend_id: "b".into(), status: AttemptStatus::Success },
            ],
            true,
            Some("transport_error"),
        );
        assert!(rec.check_invariants().is_ok());
    }

    #[test]
    fn invariants_pass_for_single_attempt() {
        let rec = sample_record(
            vec![Attempt { backend_id: "a".into(), status: AttemptStatus::Success }],
            false,
            None,
        );
        assert!(rec.check_invariants().is_ok());
    }
}
