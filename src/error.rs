//! Unified HTTP error type for axum request handlers.
//!
//! [`AppError`] wraps [`anyhow::Error`] and converts it into an appropriate
//! HTTP response automatically via [`IntoResponse`]. This means every handler
//! that can fail can return `Result<T, AppError>` and propagate errors with `?`
//! — no manual `map_err`, no boilerplate.
//!
//! Most errors (config/registry/serialization failures) have no natural HTTP
//! status of their own and fall back to `500`. The cascade's attempt ladder
//! (spec §7) does carry a specific status sometimes — an upstream 4xx should
//! reach the caller verbatim, not get flattened to `500` — so [`AppError`]
//! carries an optional status override that handlers set explicitly via
//! [`AppError::with_status`].
//!
//! # Example
//!
//! ```rust,ignore
//! async fn my_handler(
//!     State(state): State<Arc<RouterState>>,
//! ) -> Result<Json<Value>, AppError> {
//!     let result = state.some_fallible_operation().await?;
//!     Ok(Json(result))
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Wraps [`anyhow::Error`] so it can be returned from axum handlers.
///
/// Any type that implements `Into<anyhow::Error>` (which includes `io::Error`,
/// `reqwest::Error`, and any `#[derive(thiserror::Error)]` type) can be
/// converted into an [`AppError`] via the blanket [`From`] implementation.
/// That path always yields a `500` — callers that need to preserve an
/// upstream status or attach a named reason (spec §7: `queue_timeout`,
/// `cost_guard_blocked`) build the error explicitly with
/// [`AppError::with_status`]/[`AppError::with_reason`] instead of `?`.
#[derive(Debug)]
pub struct AppError {
    source: anyhow::Error,
    status: StatusCode,
    reason: Option<String>,
}

impl AppError {
    /// Build an error that renders with a specific HTTP status, e.g. to
    /// preserve an upstream 401/403/404 verbatim instead of collapsing it to
    /// `500` (spec §7 propagation rule).
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self { source: anyhow::anyhow!(message.into()), status, reason: None }
    }

    /// Attach a machine-readable reason string to the error body (e.g.
    /// `"queue_timeout"`, `"cost_guard_blocked"`) alongside the human message.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Map an [`crate::domain::AttemptStatus::UpstreamError`] seen on the
    /// final attempt to the HTTP response the caller should see (spec §7,
    /// §8 Scenario 5): `400/401/402/403/404` pass through verbatim — this is
    /// only ever reached for a real upstream status, since the router's own
    /// cost-guard block is represented separately as
    /// [`crate::domain::AttemptStatus::CostGuardBlocked`], not as a
    /// synthetic 402 here. Everything else becomes a `502 Bad Gateway`.
    pub fn from_upstream_status(http_status: u16, detail: &str) -> Self {
        let passthrough = matches!(http_status, 400 | 401 | 402 | 403 | 404);
        let status = if passthrough {
            StatusCode::from_u16(http_status).unwrap_or(StatusCode::BAD_GATEWAY)
        } else {
            StatusCode::BAD_GATEWAY
        };
        Self::with_status(status, detail.to_string())
    }

    /// Admission-queue timeout (spec §7): surfaces as a `502` tagged
    /// `queue_timeout`.
    pub fn queue_timeout() -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, "GPU admission queue timed out")
            .with_reason("queue_timeout")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self.source, status = %self.status, reason = ?self.reason, "handler error");
        let mut body = json!({ "error": self.source.to_string() });
        if let Some(reason) = &self.reason {
            body["reason"] = json!(reason);
        }
        (self.status, Json(body)).into_response()
    }
}

/// Convert any `Into<anyhow::Error>` into an [`AppError`].
///
/// This is the idiomatic axum pattern — see
/// <https://docs.rs/axum/latest/axum/error_handling/index.html>. Always
/// yields `500`; use [`AppError::with_status`] when a more specific status is
/// known at the call site.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Self { source: e.into(), status: StatusCode::INTERNAL_SERVER_ERROR, reason: None }
    }
}
