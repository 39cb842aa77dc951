//! Backend client factory, request construction, and unified dispatch.
//!
//! [`BackendClient`] is an enum that wraps a concrete provider adapter chosen
//! at construction time from [`BackendEntry::provider`] — kept from the
//! teacher's enum-dispatch shape (`chat_completions`, `health_check`).
//! New here: [`BackendClient::invoke`], which builds the OpenAI-shape request
//! body from a plain message list plus a [`BackendEntry`]'s `params`
//! (reasoning-family vs temperature, per spec §4.E) and classifies the HTTP
//! outcome into [`crate::cascade::InvokeResult`].

mod anthropic;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::{json, Value};

use crate::cascade::InvokeResult;
use crate::cost_guard::is_reasoning_family;
use crate::domain::ProviderKind;
use crate::registry::BackendEntry;

/// A `Send`-able, heap-allocated SSE byte stream.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Unified backend client — enum dispatch over concrete provider adapters.
pub enum BackendClient {
    OpenAI(OpenAIAdapter),
    Anthropic(AnthropicAdapter),
    Ollama(OllamaAdapter),
}

impl BackendClient {
    /// Build a backend client from a [`BackendEntry`], resolving the API key
    /// from the environment.
    pub fn new(entry: &BackendEntry) -> anyhow::Result<Self> {
        let base_url = entry.base_url.trim_end_matches('/').to_string();
        let api_key = entry.api_key();

        Ok(match entry.provider {
            ProviderKind::LocalGpu => Self::Ollama(OllamaAdapter::new(base_url, entry.timeout_ms)),
            ProviderKind::RemoteCloud => {
                if entry.param_str("protocol") == Some("anthropic") {
                    let key = api_key.ok_or_else(|| {
                        let env_var = entry.api_key_env.as_deref().unwrap_or("<unset>");
                        anyhow::anyhow!(
                            "Anthropic backend `{}` requires an API key; set `{env_var}`",
                            entry.id
                        )
                    })?;
                    Self::Anthropic(AnthropicAdapter::new(base_url, entry.timeout_ms, key))
                } else {
                    Self::OpenAI(OpenAIAdapter::new(base_url, entry.timeout_ms, api_key))
                }
            }
        })
    }

    /// Build the OpenAI-shape request body for `messages` against `entry`,
    /// applying the per-family param rules from spec §4.E: reasoning-family
    /// models (`o1`/`o3`/`o4` prefix) take `reasoning_effort` instead of
    /// `temperature`.
    pub fn build_request(entry: &BackendEntry, messages: &[String]) -> Value {
        let chat_messages: Vec<Value> = messages
            .iter()
            .map(|m| json!({ "role": "user", "content": m }))
            .collect();

        let mut body = json!({
            "model": entry.provider_model_name,
            "messages": chat_messages,
        });

        let model_lower = entry.provider_model_name.to_lowercase();
        if let Some(obj) = body.as_object_mut() {
            if is_reasoning_family(&model_lower) {
                if let Some(effort) = entry.param_str("reasoning_effort") {
                    obj.insert("reasoning_effort".into(), Value::String(effort.to_string()));
                }
            } else if let Some(temp) = entry.params.get("temperature").and_then(|v| v.as_float()) {
                obj.insert("temperature".into(), json!(temp));
            }
            if let Some(ctx) = entry.params.get("num_ctx").and_then(|v| v.as_integer()) {
                obj.insert("num_ctx".into(), json!(ctx));
            }
        }

        body
    }

    /// Forward a `/v1/chat/completions` request to the configured backend.
    pub async fn chat_completions(&self, request: Value) -> anyhow::Result<Value> {
        match self {
            Self::OpenAI(a) => a.chat_completions(request).await,
            Self::Anthropic(a) => a.chat_completions(request).await,
            Self::Ollama(a) => a.chat_completions(request).await,
        }
    }

    pub async fn chat_completions_stream(&self, request: Value) -> anyhow::Result<SseStream> {
        match self {
            Self::OpenAI(a) => a.chat_completions_stream(request).await,
            Self::Ollama(a) => a.chat_completions_stream(request).await,
            Self::Anthropic(a) => a.chat_completions_stream(request).await,
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        match self {
            Self::OpenAI(a) => a.health_check().await,
            Self::Anthropic(a) => a.health_check().await,
            Self::Ollama(a) => a.health_check().await,
        }
    }

    /// Extract the assistant text from an OpenAI-shape response.
    fn extract_text(response: &Value) -> String {
        response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Live, HTTP-backed implementation of [`crate::cascade::BackendInvoker`],
/// gated by the auth-healthy cache (spec §4.E). Holds an `Arc` rather than a
/// reference so it can be owned by the same [`crate::cascade::CascadeEngine`]
/// that also owns the `AuthHealth` instance the cache lives in.
pub struct LiveInvoker {
    pub auth_health: std::sync::Arc<crate::auth_health::AuthHealth>,
}

impl crate::cascade::BackendInvoker for LiveInvoker {
    async fn invoke(&self, entry: &BackendEntry, messages: &[String], deadline: Duration) -> InvokeResult {
        if entry.provider == ProviderKind::RemoteCloud {
            if self.auth_health.gate(&entry.id).await == crate::auth_health::Gate::Closed {
                return InvokeResult::UpstreamError { http_status: 401, detail: "auth_disabled".into() };
            }
        }

        let client = match BackendClient::new(entry) {
            Ok(c) => c,
            Err(e) => return InvokeResult::TransportError(e.to_string()),
        };

        let body = BackendClient::build_request(entry, messages);
        let result = tokio::time::timeout(deadline, client.chat_completions(body)).await;

        match result {
            Ok(Ok(response)) => InvokeResult::Success(BackendClient::extract_text(&response)),
            Ok(Err(err)) => classify_error(entry, &self.auth_health, &err).await,
            Err(_) => InvokeResult::TransportError("request deadline exceeded".into()),
        }
    }

    async fn probe_auth(&self, entry: &BackendEntry) -> bool {
        let client = match BackendClient::new(entry) {
            Ok(c) => c,
            Err(_) => return false,
        };
        let ok = client.health_check().await.is_ok();
        self.auth_health.record(&entry.id, true, ok).await;
        ok
    }
}

/// Parse the `HTTP <status>` the adapters embed in their bail! messages and
/// classify into the spec's upstream-vs-transport split (§4.F step 4, §7).
async fn classify_error(entry: &BackendEntry, auth_health: &crate::auth_health::AuthHealth, err: &anyhow::Error) -> InvokeResult {
    let msg = err.to_string();
    if let Some(status) = parse_http_status(&msg) {
        if status == 401 {
            auth_health.mark_unauthorized(&entry.id).await;
        }
        if matches!(status, 400 | 401 | 402 | 403 | 404) {
            return InvokeResult::UpstreamError { http_status: status, detail: msg };
        }
    }
    InvokeResult::TransportError(msg)
}

fn parse_http_status(msg: &str) -> Option<u16> {
    let idx = msg.find("HTTP ")?;
    msg[idx + 5..].split_whitespace().next()?.trim_end_matches(':').parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_health::AuthHealth;
    use crate::cascade::BackendInvoker;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn entry_for(server: &MockServer, provider: ProviderKind) -> BackendEntry {
        BackendEntry {
            id: "test-backend".into(),
            provider,
            provider_model_name: "test-model".into(),
            params: HashMap::new(),
            base_url: server.uri(),
            api_key_env: None,
            timeout_ms: 5_000,
        }
    }

    fn ok_body() -> Value {
        json!({ "choices": [{ "message": { "content": "a response long enough to pass gates" } }] })
    }

    #[test]
    fn build_request_uses_reasoning_effort_for_o_family() {
        let mut params = HashMap::new();
        params.insert("reasoning_effort".to_string(), toml::Value::String("high".into()));
        let entry = BackendEntry {
            id: "x".into(),
            provider: ProviderKind::RemoteCloud,
            provider_model_name: "o3-mini".into(),
            params,
            base_url: "http://x".into(),
            api_key_env: None,
            timeout_ms: 1000,
        };
        let body = BackendClient::build_request(&entry, &["hi".into()]);
        assert_eq!(body["reasoning_effort"], "high");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn build_request_uses_temperature_for_non_reasoning_models() {
        let mut params = HashMap::new();
        params.insert("temperature".to_string(), toml::Value::Float(0.2));
        let entry = BackendEntry {
            id: "x".into(),
            provider: ProviderKind::RemoteCloud,
            provider_model_name: "gpt-5-mini".into(),
            params,
            base_url: "http://x".into(),
            api_key_env: None,
            timeout_ms: 1000,
        };
        let body = BackendClient::build_request(&entry, &["hi".into()]);
        assert!((body["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-9);
        assert!(body.get("reasoning_effort").is_none());
    }

    #[tokio::test]
    async fn live_invoker_success_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;

        let auth = std::sync::Arc::new(AuthHealth::new());
        let invoker = LiveInvoker { auth_health: auth };
        let entry = entry_for(&server, ProviderKind::LocalGpu);
        let outcome = invoker.invoke(&entry, &["hello".into()], Duration::from_secs(5)).await;
        assert!(matches!(outcome, InvokeResult::Success(ref s) if s.contains("response")));
    }

    #[tokio::test]
    async fn live_invoker_classifies_403_as_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let auth = std::sync::Arc::new(AuthHealth::new());
        let invoker = LiveInvoker { auth_health: auth };
        let entry = entry_for(&server, ProviderKind::LocalGpu);
        let outcome = invoker.invoke(&entry, &["hello".into()], Duration::from_secs(5)).await;
        assert!(matches!(outcome, InvokeResult::UpstreamError { http_status: 403, .. }));
    }

    #[tokio::test]
    async fn live_invoker_classifies_429_as_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let auth = std::sync::Arc::new(AuthHealth::new());
        let invoker = LiveInvoker { auth_health: auth };
        let entry = entry_for(&server, ProviderKind::LocalGpu);
        let outcome = invoker.invoke(&entry, &["hello".into()], Duration::from_secs(5)).await;
        assert!(matches!(outcome, InvokeResult::TransportError(_)));
    }

    #[tokio::test]
    async fn live_invoker_closed_gate_short_circuits_remote_call() {
        let server = MockServer::start().await;
        let auth = std::sync::Arc::new(AuthHealth::new());
        auth.mark_unauthorized("test-backend").await;
        let invoker = LiveInvoker { auth_health: auth };
        let entry = entry_for(&server, ProviderKind::RemoteCloud);
        let outcome = invoker.invoke(&entry, &["hello".into()], Duration::from_secs(5)).await;
        assert!(matches!(outcome, InvokeResult::UpstreamError { http_status: 401, .. }));
    }

    #[test]
    fn parse_http_status_extracts_code() {
        assert_eq!(parse_http_status("backend returned HTTP 403 Forbidden: nope"), Some(403));
        assert_eq!(parse_http_status("connection refused"), None);
    }
}
