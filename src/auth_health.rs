//! Process-wide auth-healthy cache — one of the three pieces of shared
//! mutable state the spec allows (§5, §4.E, §7).
//!
//! A lightweight GET against a provider's model-list endpoint establishes
//! whether credentials work; the result is cached for 300s so remote calls
//! don't re-probe on every request, and a 401 flips `available := false`
//! until expiry so the gateway stops spamming a broken credential.

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

const TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    validated: bool,
    available: bool,
    checked_at: Instant,
}

/// Per-backend auth-health state. One instance is shared process-wide
/// (constructed once, held in `RouterState`); tests reset it between cases
/// via [`AuthHealth::reset`].
#[derive(Debug, Default)]
pub struct AuthHealth {
    entries: RwLock<std::collections::HashMap<String, CacheEntry>>,
}

/// What a caller should do before dialing out to a remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// No cached entry, or the cached entry expired — probe now.
    NeedsProbe,
    /// Cached and healthy — proceed.
    Open,
    /// Cached and unhealthy (last probe 401'd) — short-circuit.
    Closed,
}

impl AuthHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consult the cache for `backend_id` without probing.
    pub async fn gate(&self, backend_id: &str) -> Gate {
        let entries = self.entries.read().await;
        match entries.get(backend_id) {
            Some(e) if e.checked_at.elapsed() < TTL => {
                if e.available {
                    Gate::Open
                } else {
                    Gate::Closed
                }
            }
            _ => Gate::NeedsProbe,
        }
    }

    /// Record the outcome of a probe (or of a live call that surfaced a 401).
    pub async fn record(&self, backend_id: &str, validated: bool, available: bool) {
        let mut entries = self.entries.write().await;
        entries.insert(
            backend_id.to_string(),
            CacheEntry { validated, available, checked_at: Instant::now() },
        );
    }

    /// A 401 on a live call flips `available := false` immediately, without
    /// waiting for the next scheduled probe (spec §4.E).
    pub async fn mark_unauthorized(&self, backend_id: &str) {
        self.record(backend_id, true, false).await;
    }

    /// Test-only: drop all cached state so each test starts from a clean
    /// `NeedsProbe` gate (spec §4.E: "tests must be able to reset this cache").
    pub async fn reset(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_cache_needs_probe() {
        let cache = AuthHealth::new();
        assert_eq!(cache.gate("openai").await, Gate::NeedsProbe);
    }

    #[tokio::test]
    async fn healthy_probe_opens_gate() {
        let cache = AuthHealth::new();
        cache.record("openai", true, true).await;
        assert_eq!(cache.gate("openai").await, Gate::Open);
    }

    #[tokio::test]
    async fn unauthorized_closes_gate() {
        let cache = AuthHealth::new();
        cache.record("openai", true, true).await;
        cache.mark_unauthorized("openai").await;
        assert_eq!(cache.gate("openai").await, Gate::Closed);
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let cache = AuthHealth::new();
        cache.record("openai", true, true).await;
        cache.reset().await;
        assert_eq!(cache.gate("openai").await, Gate::NeedsProbe);
    }

    #[tokio::test]
    async fn entries_are_independent_per_backend() {
        let cache = AuthHealth::new();
        cache.record("openai", true, true).await;
        cache.mark_unauthorized("anthropic").await;
        assert_eq!(cache.gate("openai").await, Gate::Open);
        assert_eq!(cache.gate("anthropic").await, Gate::Closed);
    }
}
