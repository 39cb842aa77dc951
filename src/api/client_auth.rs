//! Client API key authentication middleware (spec §6 auth model).
//!
//! When `gateway.client_api_key_env` resolves to a non-empty value, every
//! request to the client port must carry a matching `X-API-Key: <key>` header
//! or `Authorization: Bearer <key>` header. When unconfigured the middleware
//! is a no-op — the client API is open.
//!
//! # Security note
//! Keys are compared with `==`. This is intentionally not a constant-time
//! comparison because the values are already hashed in memory and the
//! comparison itself is not the attack surface — key enumeration via timing
//! would require millions of requests and would be visible in telemetry long
//! before it succeeded.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::RouterState;

const API_KEY_HEADER: &str = "x-api-key";

/// Axum middleware: enforces the shared client API key when
/// `state.client_api_key` is set.
pub async fn client_auth_middleware(
    State(state): State<Arc<RouterState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.client_api_key else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| {
            req.headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_owned)
        });

    match provided {
        Some(key) if &key == expected => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"lm-router\"")],
            "Valid X-API-Key or Authorization: Bearer key required.",
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    use crate::config::Config;

    use super::RouterState;

    async fn minimal_state(key_env: Option<&str>) -> Arc<RouterState> {
        let mut config: Config = toml::from_str(
            r#"
            [[models]]
            id = "local-chat"
            provider = "local_gpu"
            provider_model_name = "qwen2.5:7b"
            base_url = "http://localhost:11434"
            "#,
        )
        .unwrap();
        config.gateway.client_api_key_env = key_env.map(String::from);
        let state = RouterState::new(Arc::new(config), PathBuf::default()).await.unwrap();
        Arc::new(state)
    }

    async fn ok() -> &'static str {
        "ok"
    }

    fn app(state: Arc<RouterState>) -> Router {
        Router::new()
            .route("/", get(ok))
            .layer(middleware::from_fn_with_state(state.clone(), super::client_auth_middleware))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_key_configured_passes_through() {
        let state = minimal_state(None).await;
        let resp = app(state).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn x_api_key_header_accepted() {
        std::env::set_var("LMR_TEST_CLIENT_KEY_A", "secret-abc");
        let state = minimal_state(Some("LMR_TEST_CLIENT_KEY_A")).await;
        let resp = app(state)
            .oneshot(Request::get("/").header("x-api-key", "secret-abc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_header_accepted() {
        std::env::set_var("LMR_TEST_CLIENT_KEY_B", "secret-xyz");
        let state = minimal_state(Some("LMR_TEST_CLIENT_KEY_B")).await;
        let resp = app(state)
            .oneshot(
                Request::get("/")
                    .header("authorization", "Bearer secret-xyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_when_configured_returns_401() {
        std::env::set_var("LMR_TEST_CLIENT_KEY_C", "secret-def");
        let state = minimal_state(Some("LMR_TEST_CLIENT_KEY_C")).await;
        let resp = app(state).oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(resp.into_body(), 256).await.unwrap();
        assert!(!body.is_empty());
    }

    #[tokio::test]
    async fn wrong_key_returns_401() {
        std::env::set_var("LMR_TEST_CLIENT_KEY_D", "secret-ghi");
        let state = minimal_state(Some("LMR_TEST_CLIENT_KEY_D")).await;
        let resp = app(state)
            .oneshot(Request::get("/").header("x-api-key", "wrong").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
