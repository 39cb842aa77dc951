//! Two-stage classifier: heuristic scoring always runs, an optional cheap-LLM
//! refinement stage sharpens low-confidence heuristic results.
//!
//! Grounded on `original_source/router_contract.py` (`classify_task`,
//! `approx_tokens`, hint regexes) and `original_source/graph/router.py`
//! (`est_tokens`, `is_long_input`, critical-keyword promotion), generalized
//! from that module's fixed two-bucket (code/docs) taxonomy into the full
//! task enum declared in [`crate::domain::Task`].

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ClassifierUsed, Complexity, RoutingMeta, Task};

/// Per-task config: keyword set, compiled regex, default complexity. Loaded
/// from the `task_types` table of the config document (spec §3/§4.B).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskDef {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regex source; compiled once at load time via [`ClassifierConfig::compile`].
    #[serde(default)]
    pub pattern: Option<String>,
    pub complexity_default: Complexity,
}

/// Classifier-wide settings from the `classifier` config table.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierSettings {
    #[serde(default)]
    pub llm_refinement_enabled: bool,
    #[serde(default = "defaults::confidence_threshold")]
    pub confidence_threshold: f64,
    /// Backend id to use for the Stage 2 refinement call.
    #[serde(default)]
    pub refinement_backend_id: Option<String>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            llm_refinement_enabled: false,
            confidence_threshold: defaults::confidence_threshold(),
            refinement_backend_id: None,
        }
    }
}

mod defaults {
    pub fn confidence_threshold() -> f64 {
        0.7
    }
}

/// Compiled view of the `task_types` + `classifier` config, built once at
/// startup. `Regex` compilation is the reason this needs an explicit "compile"
/// step rather than deriving straight off the raw config structs.
pub struct Classifier {
    tasks: Vec<CompiledTask>,
    settings: ClassifierSettings,
    high_complexity_re: Option<Regex>,
    critical_keywords: Vec<String>,
    retask_keywords: Vec<String>,
}

struct CompiledTask {
    task: Task,
    keywords: Vec<String>,
    pattern: Option<Regex>,
    complexity_default: Complexity,
}

/// Keywords that, if present, force `complexity = critical` regardless of
/// token count (spec §4.B step 5).
const DEFAULT_CRITICAL_KEYWORDS: &[&str] = &[
    "deadlock",
    "production outage",
    "race condition",
    "security vulnerability",
];

/// Markers that re-task an otherwise chit/QA/code prompt into a debugging
/// task (spec §4.B step 6).
const DEFAULT_RETASK_KEYWORDS: &[&str] = &["traceback", "exception", "error:"];

impl Classifier {
    pub fn new(
        task_defs: Vec<TaskDef>,
        settings: ClassifierSettings,
        high_complexity_pattern: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut tasks = Vec::with_capacity(task_defs.len());
        for def in task_defs {
            let pattern = def
                .pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| anyhow::anyhow!("invalid regex for task {}: {e}", def.name))?;
            tasks.push(CompiledTask {
                task: Task::parse(&def.name),
                keywords: def.keywords.into_iter().map(|k| k.to_lowercase()).collect(),
                pattern,
                complexity_default: def.complexity_default,
            });
        }
        let high_complexity_re = high_complexity_pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| anyhow::anyhow!("invalid high-complexity regex: {e}"))?;
        Ok(Self {
            tasks,
            settings,
            high_complexity_re,
            critical_keywords: DEFAULT_CRITICAL_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            retask_keywords: DEFAULT_RETASK_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn settings(&self) -> &ClassifierSettings {
        &self.settings
    }

    /// Stage 1: heuristic classification. Always succeeds (spec §7: "never
    /// surfaces; heuristic always produces a default").
    #[tracing::instrument(skip_all)]
    pub fn classify_heuristic(&self, messages: &[String]) -> RoutingMeta {
        let text = messages.join("\n");
        let lower = text.to_lowercase();
        let tokens = estimate_tokens(&text);

        let (task, confidence, default_complexity, critical_by_nature) = self.pick_task(&lower);

        let mut complexity = default_complexity;
        if !critical_by_nature {
            complexity = self.adjust_by_token_count(complexity, tokens, &task);
        }

        if let Some(re) = &self.high_complexity_re {
            if re.is_match(&text) {
                complexity = complexity.at_least(Complexity::High);
            }
        }

        let mut confidence = confidence;
        if self.critical_keywords.iter().any(|kw| lower.contains(kw.as_str())) {
            complexity = Complexity::Critical;
            confidence = confidence.max(0.9);
        }

        let mut task = task;
        if self.retask_keywords.iter().any(|kw| lower.contains(kw.as_str()))
            && matches!(task, Task::Chitchat | Task::SimpleQa | Task::CodeGen)
        {
            task = if complexity >= Complexity::High {
                Task::CodeCritDebug
            } else {
                Task::CodeReview
            };
            complexity = complexity.at_least(Complexity::Medium);
        }

        RoutingMeta {
            task,
            complexity,
            confidence,
            requires_long_context: tokens > 4000,
            quality_score: 5,
            classifier_used: ClassifierUsed::Heuristic,
        }
    }

    fn pick_task(&self, lower: &str) -> (Task, f64, Complexity, bool) {
        let mut best: Option<(&CompiledTask, f64)> = None;
        for t in &self.tasks {
            let mut score = 0.0;
            for kw in &t.keywords {
                if lower.contains(kw.as_str()) {
                    score += 0.3;
                }
            }
            if let Some(re) = &t.pattern {
                if re.is_match(lower) {
                    score += 0.8;
                }
            }
            if score > 0.0 {
                match &best {
                    Some((_, best_score)) if score <= *best_score => {}
                    _ => best = Some((t, score)),
                }
            }
        }
        match best {
            Some((t, score)) => (
                t.task.clone(),
                score.min(1.0),
                t.complexity_default,
                t.task.critical_by_nature(),
            ),
            None => (Task::SimpleQa, 0.5, Complexity::Low, false),
        }
    }

    fn adjust_by_token_count(&self, default_complexity: Complexity, tokens: u64, task: &Task) -> Complexity {
        let code_ish = matches!(task, Task::CodeGen | Task::CodeReview | Task::CodeCritDebug);
        if tokens < 50 {
            Complexity::Low
        } else if tokens < 500 {
            if default_complexity == Complexity::Low && code_ish {
                Complexity::Medium
            } else {
                default_complexity
            }
        } else if tokens < 2000 {
            default_complexity.at_least(Complexity::Medium)
        } else {
            default_complexity.at_least(Complexity::High)
        }
    }
}

/// `ceil(chars/4)`, matching `original_source/graph/router.py:est_tokens` and
/// `original_source/graph/cost_guard.py:est_tokens` (spec §4.B step 1, §4.G).
pub fn estimate_tokens(text: &str) -> u64 {
    let len = text.chars().count() as u64;
    len.div_ceil(4).max(if text.is_empty() { 0 } else { 1 })
}

/// Parsed reply from the Stage 2 refinement backend:
/// `TASK: <name> COMPLEXITY: <level> QUALITY_SCORE: <int>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementReply {
    pub task: Task,
    pub complexity: Complexity,
    pub quality_score: u8,
}

/// Parse a Stage 2 refinement reply. Returns `None` on any malformed field —
/// Stage 2 falls back silently to the heuristic result on parse failure
/// (spec §4.B).
pub fn parse_refinement_reply(reply: &str) -> Option<RefinementReply> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for token in ["TASK:", "COMPLEXITY:", "QUALITY_SCORE:"] {
        let idx = reply.find(token)?;
        let rest = &reply[idx + token.len()..];
        let end = ["TASK:", "COMPLEXITY:", "QUALITY_SCORE:"]
            .iter()
            .filter_map(|t| rest.find(t))
            .min()
            .unwrap_or(rest.len());
        fields.insert(token.trim_end_matches(':'), rest[..end].trim());
    }

    let task = Task::parse(fields.get("TASK")?.to_lowercase().as_str());
    let complexity = match fields.get("COMPLEXITY")?.to_lowercase().as_str() {
        "low" => Complexity::Low,
        "medium" => Complexity::Medium,
        "high" => Complexity::High,
        "critical" => Complexity::Critical,
        _ => return None,
    };
    let quality_score: u8 = fields.get("QUALITY_SCORE")?.parse().ok()?;
    if !(1..=10).contains(&quality_score) {
        return None;
    }
    Some(RefinementReply { task, complexity, quality_score })
}

/// Apply a successfully-parsed Stage 2 reply on top of a Stage 1 result.
pub fn apply_refinement(mut meta: RoutingMeta, reply: RefinementReply) -> RoutingMeta {
    meta.task = reply.task;
    meta.complexity = reply.complexity;
    meta.quality_score = reply.quality_score;
    meta.classifier_used = ClassifierUsed::Llm;
    meta.confidence = 0.9;
    if meta.quality_score > 8 {
        meta.complexity = Complexity::Critical;
    }
    meta
}

/// Whether Stage 2 should run at all, given Stage 1's confidence and the
/// cloud-availability gate (spec §4.B "Cloud-availability gate").
pub fn should_refine(settings: &ClassifierSettings, heuristic_confidence: f64, cloud_available: bool) -> bool {
    settings.llm_refinement_enabled
        && heuristic_confidence < settings.confidence_threshold
        && cloud_available
        && settings.refinement_backend_id.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        let defs = vec![
            TaskDef {
                name: "code_gen".into(),
                keywords: vec!["function".into(), "implement".into()],
                pattern: Some(r"```|\bdef\s+\w+\(|\bclass\s+\w+".into()),
                complexity_default: Complexity::Low,
            },
            TaskDef {
                name: "code_crit_debug".into(),
                keywords: vec!["debug".into(), "stack trace".into()],
                pattern: Some(r"\btraceback\b".into()),
                complexity_default: Complexity::High,
            },
            TaskDef {
                name: "chitchat".into(),
                keywords: vec!["hello".into(), "hi there".into()],
                pattern: None,
                complexity_default: Complexity::Low,
            },
        ];
        Classifier::new(defs, ClassifierSettings {
            llm_refinement_enabled: true,
            confidence_threshold: 0.7,
            refinement_backend_id: Some("cloud-mini".into()),
        }, Some(r"(?i)architecture review|threat model"))
        .unwrap()
    }

    #[test]
    fn defaults_to_simple_qa_when_nothing_matches() {
        let c = Classifier::new(vec![], ClassifierSettings {
            llm_refinement_enabled: false,
            confidence_threshold: 0.7,
            refinement_backend_id: None,
        }, None).unwrap();
        let meta = c.classify_heuristic(&["what's the weather".into()]);
        assert_eq!(meta.task, Task::SimpleQa);
        assert_eq!(meta.confidence, 0.5);
        assert_eq!(meta.complexity, Complexity::Low);
    }

    #[test]
    fn keyword_and_regex_score_pick_best_task() {
        let c = classifier();
        let meta = c.classify_heuristic(&["please implement a function like this: ```fn foo() {}```".into()]);
        assert_eq!(meta.task, Task::CodeGen);
    }

    #[test]
    fn critical_by_nature_never_downgrades() {
        let c = classifier();
        let meta = c.classify_heuristic(&["debug this traceback please".into()]);
        assert_eq!(meta.task, Task::CodeCritDebug);
        assert!(meta.complexity >= Complexity::High);
    }

    #[test]
    fn critical_keyword_forces_critical_complexity() {
        let c = classifier();
        let meta = c.classify_heuristic(&["hello there, we have a production outage right now".into()]);
        assert_eq!(meta.complexity, Complexity::Critical);
        assert!(meta.confidence >= 0.9);
    }

    #[test]
    fn long_prompt_sets_requires_long_context() {
        let c = classifier();
        let long_text = "word ".repeat(3500);
        let meta = c.classify_heuristic(&[long_text]);
        assert!(meta.requires_long_context);
    }

    #[test]
    fn retask_on_error_markers() {
        let c = classifier();
        let meta = c.classify_heuristic(&["hello there, got this exception in my code".into()]);
        assert!(matches!(meta.task, Task::CodeReview | Task::CodeCritDebug));
        assert!(meta.complexity >= Complexity::Medium);
    }

    #[test]
    fn token_estimate_matches_ceil_chars_over_4() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn parse_refinement_reply_happy_path() {
        let reply = parse_refinement_reply("TASK: code_review COMPLEXITY: high QUALITY_SCORE: 7").unwrap();
        assert_eq!(reply.task, Task::CodeReview);
        assert_eq!(reply.complexity, Complexity::High);
        assert_eq!(reply.quality_score, 7);
    }

    #[test]
    fn parse_refinement_reply_rejects_malformed() {
        assert!(parse_refinement_reply("garbage").is_none());
        assert!(parse_refinement_reply("TASK: code_review COMPLEXITY: extreme QUALITY_SCORE: 7").is_none());
        assert!(parse_refinement_reply("TASK: code_review COMPLEXITY: high QUALITY_SCORE: 11").is_none());
    }

    #[test]
    fn apply_refinement_forces_critical_above_8() {
        let meta = RoutingMeta {
            task: Task::SimpleQa,
            complexity: Complexity::Low,
            confidence: 0.4,
            requires_long_context: false,
            quality_score: 5,
            classifier_used: ClassifierUsed::Heuristic,
        };
        let reply = RefinementReply { task: Task::Research, complexity: Complexity::Medium, quality_score: 9 };
        let updated = apply_refinement(meta, reply);
        assert_eq!(updated.complexity, Complexity::Critical);
        assert_eq!(updated.classifier_used, ClassifierUsed::Llm);
    }

    #[test]
    fn should_refine_requires_low_confidence_and_cloud() {
        let settings = ClassifierSettings {
            llm_refinement_enabled: true,
            confidence_threshold: 0.7,
            refinement_backend_id: Some("cloud-mini".into()),
        };
        assert!(should_refine(&settings, 0.5, true));
        assert!(!should_refine(&settings, 0.5, false));
        assert!(!should_refine(&settings, 0.9, true));
    }
}
