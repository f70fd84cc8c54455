use super::store::{unix_millis, BucketState, BucketStore, ConsumeOutcome};
use super::types::RateLimitPolicy;
use crate::error::RateLimitError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// In-process bucket store.
///
/// Each key is updated under its map shard's write lock, which makes
/// check-and-consume atomic for every task in this process. Buckets are
/// not shared between instances; use it for single-instance deployments
/// and tests.
#[derive(Clone, Default)]
pub struct InMemoryBucketStore {
    buckets: Arc<DashMap<String, BucketState>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buckets (for testing/monitoring)
    pub fn active_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Current state of a bucket
    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        self.buckets.get(key).map(|entry| entry.value().clone())
    }

    /// Drop buckets whose last refill is older than `idle_ms`
    pub fn evict_idle(&self, now: SystemTime, idle_ms: u64) -> usize {
        let now_ms = unix_millis(now);
        let before = self.buckets.len();
        self.buckets
            .retain(|_, state| now_ms.saturating_sub(state.last_refill_ms) < idle_ms);
        before - self.buckets.len()
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn check_and_consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        cost: u32,
        now: SystemTime,
        request_id: &str,
    ) -> Result<ConsumeOutcome, RateLimitError> {
        let now_ms = unix_millis(now);

        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, "Creating new bucket");
            BucketState::full(policy.capacity, now_ms)
        });
        let outcome = entry.consume(policy, cost, now_ms, request_id);

        debug!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "Token bucket check"
        );
        Ok(outcome)
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        self.buckets.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), RateLimitError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
