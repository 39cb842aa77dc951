//! GpuAdmission — a process-external FIFO admission queue with bounded
//! concurrency, used solely for `local_gpu` invocations (spec §4.D).
//!
//! Grounded on `original_source/services/gpu_queue.py` (`GpuQueue`): same
//! Redis list-as-queue + set-as-active-set model, same pass-through
//! degradation when Redis is unreachable. Unlike the Python version's
//! `lpop`+`sadd` pipeline (two round-trips, racy under concurrent pollers),
//! the head-match+capacity-check+promote step here runs as a single Lua
//! script — the spec's "must be a single linearisable operation" requirement
//! (§4.D) is stricter than what the pipeline approximates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

const QUEUE_KEY: &str = "gpu:queue";
const ACTIVE_KEY: &str = "gpu:active";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Atomically: if `token` is at the head of `queue_key` and
/// `scard(active_key) < max`, pop the head and add it to the active set,
/// returning 1. Otherwise return 0 with no side effects.
const ACQUIRE_SCRIPT: &str = r#"
local queue_key = KEYS[1]
local active_key = KEYS[2]
local token = ARGV[1]
local max_workers = tonumber(ARGV[2])

local head = redis.call('LINDEX', queue_key, 0)
if head ~= token then
    return 0
end
local active_count = redis.call('SCARD', active_key)
if active_count >= max_workers then
    return 0
end
redis.call('LPOP', queue_key)
redis.call('SADD', active_key, token)
return 1
"#;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("GPU queue timeout after waiting for a slot")]
    QueueTimeout,
}

/// A held admission slot. Dropping it without calling [`GpuAdmission::release`]
/// explicitly still releases at the broker on the next `release` call made
/// with the same token; callers are expected to release in a `finally`-style
/// path (spec §4.D: "guaranteed to execute on every exit path").
pub struct Permit {
    token: String,
}

impl Permit {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AdmissionMetrics {
    pub enabled: bool,
    pub queue_depth: u64,
    pub active: u64,
    pub max: u32,
}

/// Cross-process FIFO admission queue. Holds a lazily-validated connection
/// handle — one of the three allowed pieces of process-wide shared state
/// (spec §5 item 3).
pub struct GpuAdmission {
    conn: Option<ConnectionManager>,
    max_workers: u32,
    timeout: Duration,
    /// Flipped to `false` permanently once the broker is found unreachable;
    /// `acquire`/`release` become no-ops (spec §4.D "Degradation").
    enabled: AtomicBool,
}

impl GpuAdmission {
    /// Attempt to connect to `redis_url`. On failure, returns a
    /// pass-through instance rather than an error — GPU admission must never
    /// prevent the router from serving requests (spec §4.D).
    pub async fn connect(redis_url: &str, max_workers: u32, timeout: Duration) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(conn) => {
                    tracing::info!(redis_url, "connected to GPU admission broker");
                    Self { conn: Some(conn), max_workers, timeout, enabled: AtomicBool::new(true) }
                }
                Err(err) => {
                    tracing::warn!(%err, "GPU admission broker unreachable at startup, running pass-through");
                    Self { conn: None, max_workers, timeout, enabled: AtomicBool::new(false) }
                }
            },
            Err(err) => {
                tracing::warn!(%err, "invalid GPU admission broker URL, running pass-through");
                Self { conn: None, max_workers, timeout, enabled: AtomicBool::new(false) }
            }
        }
    }

    /// Construct a queue that is pass-through from the start (no `REDIS_URL`
    /// configured — the Python original's `ENABLED` gate).
    pub fn disabled(max_workers: u32, timeout: Duration) -> Self {
        Self { conn: None, max_workers, timeout, enabled: AtomicBool::new(false) }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// `acquire(token)` per spec §4.D. Returns immediately with a permit in
    /// pass-through mode. A broker error encountered mid-wait (not just at
    /// startup) degrades the queue to pass-through for the rest of the
    /// process, the same as an unreachable broker at startup — GPU admission
    /// must never turn into a request failure (spec §4.D "Degradation").
    pub async fn acquire(&self) -> Result<Permit, AdmissionError> {
        let Some(conn) = self.conn_if_enabled() else {
            return Ok(Permit { token: Uuid::new_v4().to_string() });
        };
        let mut conn = conn.clone();
        let token = Uuid::new_v4().to_string();

        if let Err(err) = conn.rpush::<_, _, ()>(QUEUE_KEY, &token).await {
            tracing::warn!(%err, "GPU admission broker unreachable, degrading to pass-through");
            self.enabled.store(false, Ordering::Relaxed);
            return Ok(Permit { token });
        }

        let script = Script::new(ACQUIRE_SCRIPT);
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                let _: () = conn.lrem(QUEUE_KEY, 0, &token).await.unwrap_or(());
                return Err(AdmissionError::QueueTimeout);
            }

            let acquired: Result<i32, _> = script
                .key(QUEUE_KEY)
                .key(ACTIVE_KEY)
                .arg(&token)
                .arg(self.max_workers)
                .invoke_async(&mut conn)
                .await;

            let acquired = match acquired {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(%err, "GPU admission broker unreachable, degrading to pass-through");
                    self.enabled.store(false, Ordering::Relaxed);
                    return Ok(Permit { token });
                }
            };

            if acquired == 1 {
                return Ok(Permit { token });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// `release(token)`. Safe to call more than once, and safe to call on a
    /// pass-through permit (no-op).
    pub async fn release(&self, permit: &Permit) {
        let Some(conn) = self.conn_if_enabled() else {
            return;
        };
        let mut conn = conn.clone();
        let _: Result<i32, _> = conn.srem(ACTIVE_KEY, permit.token()).await;
    }

    fn conn_if_enabled(&self) -> Option<&ConnectionManager> {
        if self.enabled.load(Ordering::Relaxed) { self.conn.as_ref() } else { None }
    }

    pub async fn metrics(&self) -> AdmissionMetrics {
        let Some(conn) = self.conn_if_enabled() else {
            return AdmissionMetrics { enabled: false, queue_depth: 0, active: 0, max: self.max_workers };
        };
        let mut conn = conn.clone();
        let queue_depth: u64 = conn.llen(QUEUE_KEY).await.unwrap_or(0);
        let active: u64 = conn.scard(ACTIVE_KEY).await.unwrap_or(0);
        AdmissionMetrics { enabled: true, queue_depth, active, max: self.max_workers }
    }
}
