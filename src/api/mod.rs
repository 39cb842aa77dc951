//! HTTP layer — one axum `Router` per listener (client-facing, admin-facing),
//! built in `main.rs` and layered with the middleware in this module.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod client_auth;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;
