//! Bucket store contract and the token bucket arithmetic shared by the
//! in-process store. The Redis Lua script in `lua_scripts` mirrors
//! [`BucketState::consume`] step for step.

use super::types::{RateLimitPolicy, WindowKind};
use crate::error::RateLimitError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Slack for floating point drift when comparing tokens against cost
pub const TOKEN_EPSILON: f64 = 1e-9;

/// Applied request ids remembered per bucket for retry deduplication
pub const RECENT_REQUESTS: usize = 64;

/// Result of one atomic check-and-consume
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub remaining: f64,
    pub retry_after: Duration,
}

impl ConsumeOutcome {
    pub fn granted(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    pub fn rejected(remaining: f64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after,
        }
    }
}

/// Shared bucket storage.
///
/// `check_and_consume` must run read, refill and decrement as one atomic
/// step for every caller of every instance. Implementations never retry
/// internally and never invent bucket values: any failure to reach the
/// backing store is `RateLimitError::StoreUnavailable`.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill the bucket at `key` up to `now`, then take `cost` tokens if
    /// they are available.
    ///
    /// A repeated call carrying the `request_id` of a recently applied call
    /// returns the recorded outcome without consuming again, even when
    /// other requests hit the bucket in between.
    async fn check_and_consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        cost: u32,
        now: SystemTime,
        request_id: &str,
    ) -> Result<ConsumeOutcome, RateLimitError>;

    /// Drop the bucket so the next request starts from a full bucket
    async fn reset(&self, key: &str) -> Result<(), RateLimitError>;

    /// Check connectivity
    async fn ping(&self) -> Result<(), RateLimitError>;

    /// Short name for logs and metrics
    fn name(&self) -> &'static str;
}

/// Milliseconds since the unix epoch, zero for times before it
pub fn unix_millis(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
struct AppliedRequest {
    id: String,
    outcome: ConsumeOutcome,
}

/// Persisted state of one bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketState {
    /// Tokens left, always within `[0, capacity]`
    pub tokens: f64,
    /// Time of the last refill, unix milliseconds
    pub last_refill_ms: u64,
    /// Capacity of the policy that last wrote this bucket
    pub capacity: u32,
    recent: VecDeque<AppliedRequest>,
}

impl BucketState {
    /// A full bucket as first seen at `now_ms`
    pub fn full(capacity: u32, now_ms: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_ms: now_ms,
            capacity,
            recent: VecDeque::new(),
        }
    }

    /// Refill up to `now_ms` and try to take `cost` tokens
    pub fn consume(
        &mut self,
        policy: &RateLimitPolicy,
        cost: u32,
        now_ms: u64,
        request_id: &str,
    ) -> ConsumeOutcome {
        if let Some(applied) = self.recent.iter().find(|applied| applied.id == request_id) {
            return applied.outcome.clone();
        }

        let capacity = policy.capacity as f64;
        if self.capacity != policy.capacity {
            self.tokens = self.tokens.min(capacity);
            self.capacity = policy.capacity;
        }

        // Another instance may have written a later timestamp; never refill backwards.
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let period_ms = capacity * 1000.0 / policy.refill_rate;

        match policy.window {
            WindowKind::Rolling => {
                self.tokens =
                    (self.tokens + elapsed_ms as f64 * policy.refill_rate / 1000.0).min(capacity);
                self.last_refill_ms = self.last_refill_ms.max(now_ms);
            }
            WindowKind::Fixed => {
                if elapsed_ms as f64 >= period_ms {
                    self.tokens = capacity;
                    self.last_refill_ms = now_ms;
                }
            }
        }

        let cost = cost as f64;
        let outcome = if self.tokens + TOKEN_EPSILON >= cost {
            self.tokens = (self.tokens - cost).max(0.0);
            ConsumeOutcome::granted(self.tokens)
        } else {
            let wait_ms = match policy.window {
                WindowKind::Rolling => (cost - self.tokens) * 1000.0 / policy.refill_rate,
                WindowKind::Fixed => period_ms - elapsed_ms as f64,
            };
            ConsumeOutcome::rejected(
                self.tokens,
                Duration::from_millis(wait_ms.ceil().max(1.0) as u64),
            )
        };

        if self.recent.len() >= RECENT_REQUESTS {
            self.recent.pop_front();
        }
        self.recent.push_back(AppliedRequest {
            id: request_id.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }
}
