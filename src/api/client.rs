//! Client-facing API (default port 8080) — the OpenAI-compatible shim plus
//! the native `/route` and `/debug/router_decision` endpoints (spec §6).
//!
//! Thin layer: all routing/cascade logic lives in [`crate::cascade`]; handlers
//! here only translate HTTP concerns (bodies, headers, SSE framing) to and
//! from a plain `Vec<String>` of message contents.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde_json::{json, Value};

use crate::{
    cascade::RouteHints,
    domain::AttemptStatus,
    error::AppError,
    state::RouterState,
};

use super::request_id::RequestId;

/// Virtual model ids always advertised by `/v1/models`, independent of the
/// configured backend catalog (spec §6, supplemented feature).
const VIRTUAL_MODEL_IDS: &[&str] = &["router-auto", "router-local", "router-code"];

pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::api::health::healthz))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/route", post(route_native))
        .route("/debug/router_decision", post(debug_router_decision))
        .with_state(state)
}

/// `GET /v1/models` — virtual routing ids plus the real backend catalog.
async fn list_models(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let mut data: Vec<Value> = VIRTUAL_MODEL_IDS
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "owned_by": "ai-cascade-router" }))
        .collect();

    data.extend(state.registry().iterate().map(|entry| {
        json!({
            "id": entry.id,
            "object": "model",
            "owned_by": entry.provider.to_string(),
        })
    }));

    Json(json!({ "object": "list", "data": data }))
}

/// `POST /v1/chat/completions` — OpenAI chat shim.
async fn chat_completions(
    State(state): State<Arc<RouterState>>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<Value>,
) -> Response {
    let messages = match extract_chat_messages(&body) {
        Ok(m) => m,
        Err(e) => return e.into_response(),
    };

    let (text, record) = state.engine.run(messages, request_id.0.clone(), RouteHints::default()).await;

    let outcome = match cascade_outcome(&record) {
        Outcome::Error(app_err) => return app_err.into_response(),
        outcome => outcome,
    };

    let completion = json!({
        "id": format!("chatcmpl-{}", record.request_id),
        "object": "chat.completion",
        "model": record.resolved_backend_id,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": record.prompt_tokens_est,
            "completion_tokens": record.completion_tokens_est,
            "total_tokens": record.total_tokens_est,
        },
    });

    let mut response = (StatusCode::OK, Json(completion)).into_response();
    apply_router_headers(response.headers_mut(), &record);
    if let Outcome::QualityCompromised = outcome {
        response.headers_mut().insert(
            "x-ai-router-status",
            header::HeaderValue::from_static("quality_compromised"),
        );
    }
    response
}

/// `POST /v1/responses` — OpenAI Responses shim, with SSE streaming when
/// requested (spec §6: `stream=true` or `Accept: text/event-stream`).
async fn responses(
    State(state): State<Arc<RouterState>>,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let messages = match extract_responses_input(&body) {
        Ok(m) => m,
        Err(e) => return e.into_response(),
    };

    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false)
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"));

    let (text, record) = state.engine.run(messages, request_id.0.clone(), RouteHints::default()).await;

    if wants_stream {
        return responses_sse(text, record).into_response();
    }

    let outcome = match cascade_outcome(&record) {
        Outcome::Error(app_err) => return app_err.into_response(),
        outcome => outcome,
    };

    let status_str = if matches!(outcome, Outcome::QualityCompromised) { "quality_compromised" } else { "completed" };
    let body = json!({
        "id": format!("resp-{}", record.request_id),
        "object": "response",
        "model": record.resolved_backend_id,
        "status": status_str,
        "output": [{
            "type": "message",
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }],
        }],
        "usage": {
            "input_tokens": record.prompt_tokens_est,
            "output_tokens": record.completion_tokens_est,
            "total_tokens": record.total_tokens_est,
        },
    });

    let mut response = (StatusCode::OK, Json(body)).into_response();
    apply_router_headers(response.headers_mut(), &record);
    response
}

/// Build the SSE event stream for a response whose cascade has already
/// finished (spec §6 exact event sequence). The cascade's quality gate needs
/// the complete text before deciding whether to escalate, so true token-level
/// proxying from the backend isn't possible here — the finished text is
/// replayed as a handful of delta chunks instead.
fn responses_sse(text: String, record: crate::domain::UsageRecord) -> impl IntoResponse {
    let response_id = format!("resp-{}", record.request_id);
    let item_id = format!("item-{}", record.request_id);
    let failed = matches!(
        record.attempts.last().map(|a| &a.status),
        Some(
            AttemptStatus::UpstreamError { .. }
                | AttemptStatus::TransportError
                | AttemptStatus::CostGuardBlocked
                | AttemptStatus::AdmissionTimeout
        )
    );

    let mut events = Vec::new();
    let mut seq: u64 = 0;
    let mut push = |name: &str, data: Value| {
        events.push(sse_event(name, seq, data));
        seq += 1;
    };

    if failed {
        let (status, detail) = match record.attempts.last().map(|a| &a.status) {
            Some(AttemptStatus::UpstreamError { http_status }) => (*http_status, "upstream error"),
            Some(AttemptStatus::CostGuardBlocked) => (502, "cost guard blocked this request"),
            Some(AttemptStatus::AdmissionTimeout) => (502, "GPU admission queue timed out"),
            _ => (502, "transport error"),
        };
        push("error", json!({ "message": detail, "code": status }));
        return sse_stream(events);
    }

    push(
        "response.created",
        json!({ "response": { "id": response_id, "status": "in_progress" } }),
    );
    push(
        "response.output_item.added",
        json!({
            "output_index": 0,
            "item": { "id": item_id, "type": "message", "role": "assistant", "status": "in_progress", "content": [] },
        }),
    );
    push(
        "response.content_part.added",
        json!({
            "item_id": item_id, "output_index": 0, "content_index": 0,
            "part": { "type": "output_text", "text": "" },
        }),
    );

    for chunk in chunk_text(&text, 4) {
        push(
            "response.output_text.delta",
            json!({ "item_id": item_id, "output_index": 0, "content_index": 0, "delta": chunk }),
        );
    }

    push(
        "response.output_text.done",
        json!({ "item_id": item_id, "output_index": 0, "content_index": 0, "text": text }),
    );
    push(
        "response.output_item.done",
        json!({
            "output_index": 0,
            "item": {
                "id": item_id, "type": "message", "role": "assistant", "status": "completed",
                "content": [{ "type": "output_text", "text": text }],
            },
        }),
    );
    push(
        "response.completed",
        json!({
            "response": {
                "id": response_id, "status": "completed",
                "usage": {
                    "input_tokens": record.prompt_tokens_est,
                    "output_tokens": record.completion_tokens_est,
                    "total_tokens": record.total_tokens_est,
                },
            },
        }),
    );

    sse_stream(events)
}

fn sse_stream(events: Vec<Event>) -> Sse<impl stream::Stream<Item = Result<Event, Infallible>>> {
    Sse::new(stream::iter(events.into_iter().map(Ok))).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn sse_event(name: &str, sequence_number: u64, mut data: Value) -> Event {
    if let Some(obj) = data.as_object_mut() {
        obj.insert("sequence_number".into(), json!(sequence_number));
        obj.insert("type".into(), json!(name));
    }
    Event::default().event(name).data(data.to_string())
}

/// Split `text` into roughly `n` delta chunks along whitespace, never
/// returning zero chunks for non-empty text.
fn chunk_text(text: &str, n: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let words: Vec<&str> = text.split(' ').collect();
    let chunk_size = words.len().div_ceil(n.max(1)).max(1);
    words
        .chunks(chunk_size)
        .map(|c| c.join(" "))
        .collect()
}

#[derive(serde::Deserialize, Default)]
struct RouteRequest {
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    prefer_code: bool,
    #[serde(default)]
    critical: bool,
    /// Accepted for wire-compatibility with the native request shape (spec
    /// §6); not modelled — see [`crate::cascade::RouteHints`].
    #[serde(default)]
    #[allow(dead_code)]
    latency_ms_max: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    budget: Option<f64>,
}

/// `POST /route` — native request, returns the full [`crate::domain::UsageRecord`].
async fn route_native(
    State(state): State<Arc<RouterState>>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<RouteRequest>,
) -> Response {
    let messages = flatten_message_values(&body.messages);
    if messages.is_empty() {
        return AppError::with_status(StatusCode::BAD_REQUEST, "`messages` must contain at least one non-empty message")
            .into_response();
    }

    let hints = RouteHints { critical: body.critical, prefer_code: body.prefer_code };
    let (_text, record) = state.engine.run(messages, request_id.0.clone(), hints).await;

    if let Outcome::Error(app_err) = cascade_outcome(&record) {
        return app_err.into_response();
    }

    Json(record).into_response()
}

#[derive(serde::Deserialize)]
struct DebugRequest {
    messages: Vec<Value>,
}

/// `POST /debug/router_decision` — classify + select only, no invocation.
async fn debug_router_decision(
    State(state): State<Arc<RouterState>>,
    Json(body): Json<DebugRequest>,
) -> Response {
    let messages = flatten_message_values(&body.messages);
    if messages.is_empty() {
        return AppError::with_status(StatusCode::BAD_REQUEST, "`messages` must contain at least one non-empty message")
            .into_response();
    }

    let cloud_ok = crate::cascade::cloud_available(&state.engine.registry, &state.engine.auth_health).await;
    let meta = state.engine.classifier.classify_heuristic(&messages);
    let candidates = crate::policy::select(&state.engine.policy, &state.engine.registry, &meta, cloud_ok);

    Json(json!({
        "routing_meta": meta,
        "selected_backend_id": candidates.first(),
        "fallback_available": candidates.len() > 1,
    }))
    .into_response()
}

/// What the HTTP layer should do with a finished [`crate::domain::UsageRecord`]
/// (spec §7 propagation rule).
enum Outcome {
    Success,
    QualityCompromised,
    Error(AppError),
}

fn cascade_outcome(record: &crate::domain::UsageRecord) -> Outcome {
    match record.attempts.last().map(|a| &a.status) {
        Some(AttemptStatus::Success) => Outcome::Success,
        Some(AttemptStatus::QualityFailed { .. }) => Outcome::QualityCompromised,
        Some(AttemptStatus::UpstreamError { http_status }) => {
            Outcome::Error(AppError::from_upstream_status(*http_status, "upstream backend returned an error"))
        }
        Some(AttemptStatus::CostGuardBlocked) => Outcome::Error(
            AppError::with_status(StatusCode::BAD_GATEWAY, "request blocked by the cost guard")
                .with_reason("cost_guard_blocked"),
        ),
        Some(AttemptStatus::AdmissionTimeout) => Outcome::Error(AppError::queue_timeout()),
        Some(AttemptStatus::TransportError) | Some(AttemptStatus::Pending) | None => {
            Outcome::Error(AppError::with_status(StatusCode::BAD_GATEWAY, "no backend produced a usable response"))
        }
    }
}

fn apply_router_headers(headers: &mut HeaderMap, record: &crate::domain::UsageRecord) {
    let initial = record.attempts.first().map(|a| a.backend_id.as_str()).unwrap_or(&record.resolved_backend_id);
    insert_header(headers, "x-ai-router-initial-model", initial);
    insert_header(headers, "x-ai-router-final-model", &record.resolved_backend_id);
    insert_header(headers, "x-ai-router-escalated", if record.escalated { "true" } else { "false" });
    if let Some(reason) = &record.escalation_reason {
        insert_header(headers, "x-ai-router-escalation-reason", reason);
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = header::HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

/// Extract plain message contents from an OpenAI-shape `{messages: [...]}`
/// chat body.
fn extract_chat_messages(body: &Value) -> Result<Vec<String>, AppError> {
    let arr = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::with_status(StatusCode::BAD_REQUEST, "`messages` must be an array"))?;
    let out = flatten_message_values(arr);
    if out.is_empty() {
        return Err(AppError::with_status(StatusCode::BAD_REQUEST, "`messages` must contain at least one non-empty message"));
    }
    Ok(out)
}

/// Extract plain text from a Responses-API `input` field, which may be a
/// bare string, a list of strings, or a list of
/// `{type: message, role, content: [{type: input_text, text}]}` items.
fn extract_responses_input(body: &Value) -> Result<Vec<String>, AppError> {
    let bad_request = || AppError::with_status(StatusCode::BAD_REQUEST, "`input` must be a string or non-empty array");
    match body.get("input") {
        Some(Value::String(s)) if !s.is_empty() => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => {
            let out = flatten_message_values(items);
            if out.is_empty() {
                Err(bad_request())
            } else {
                Ok(out)
            }
        }
        _ => Err(bad_request()),
    }
}

/// Shared normalizer: each item may be a bare string, a chat-style
/// `{content: "..."}` / `{content: [{text: "..."}]}` object, or (degenerate)
/// any other value which is skipped.
fn flatten_message_values(items: &[Value]) -> Vec<String> {
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) if !s.is_empty() => out.push(s.clone()),
            Value::Object(_) => match item.get("content") {
                Some(Value::String(s)) if !s.is_empty() => out.push(s.clone()),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                out.push(text.to_string());
                            }
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_chat_messages_reads_plain_content() {
        let body = json!({ "messages": [{ "role": "user", "content": "hello there" }] });
        let out = extract_chat_messages(&body).unwrap();
        assert_eq!(out, vec!["hello there".to_string()]);
    }

    #[test]
    fn extract_chat_messages_rejects_missing_field() {
        let body = json!({});
        assert!(extract_chat_messages(&body).is_err());
    }

    #[test]
    fn extract_responses_input_accepts_bare_string() {
        let body = json!({ "input": "what's the weather" });
        assert_eq!(extract_responses_input(&body).unwrap(), vec!["what's the weather".to_string()]);
    }

    #[test]
    fn extract_responses_input_accepts_structured_parts() {
        let body = json!({
            "input": [{ "type": "message", "role": "user", "content": [{ "type": "input_text", "text": "hi" }] }],
        });
        assert_eq!(extract_responses_input(&body).unwrap(), vec!["hi".to_string()]);
    }

    #[test]
    fn chunk_text_never_returns_empty_for_nonempty_input() {
        let chunks = chunk_text("one two three four five six", 3);
        assert!(!chunks.is_empty());
        assert_eq!(chunks.join(" "), "one two three four five six");
    }

    #[test]
    fn chunk_text_handles_empty_text() {
        assert_eq!(chunk_text("", 4), vec!["".to_string()]);
    }
}
