use super::lua_scripts::TOKEN_BUCKET_SCRIPT;
use super::store::{unix_millis, BucketStore, ConsumeOutcome};
use super::types::RateLimitPolicy;
use crate::error::RateLimitError;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// Redis-backed bucket store shared by every instance
///
/// The connection manager is cloned per call, so concurrent requests
/// pipeline over one multiplexed connection without an in-process lock.
#[derive(Clone)]
pub struct RedisBucketStore {
    /// Redis connection manager
    connection: ConnectionManager,
    /// Loaded once; invoked by SHA with a transparent EVAL fallback
    script: Script,
}

impl RedisBucketStore {
    /// Connect to Redis
    pub async fn connect(redis_url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url).map_err(store_error)?;
        let connection = ConnectionManager::new(client).await.map_err(store_error)?;

        Ok(Self {
            connection,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        })
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn check_and_consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        cost: u32,
        now: SystemTime,
        request_id: &str,
    ) -> Result<ConsumeOutcome, RateLimitError> {
        let mut connection = self.connection.clone();
        let ttl_ms = u64::try_from(policy.state_ttl().as_millis()).unwrap_or(u64::MAX);

        let (allowed, remaining, retry_ms) = self
            .script
            .key(key)
            .key(request_record_key(key, request_id))
            .arg(policy.capacity)
            .arg(policy.refill_rate)
            .arg(unix_millis(now))
            .arg(cost)
            .arg(policy.window.as_str())
            .arg(request_id)
            .arg(ttl_ms)
            .invoke_async::<_, (i64, String, i64)>(&mut connection)
            .await
            .map_err(|e| {
                error!(key = %key, error = %e, "Redis error during bucket update");
                store_error(e)
            })?;

        let remaining: f64 = remaining.parse().map_err(|_| {
            RateLimitError::StoreUnavailable(format!(
                "unparseable token count '{}' for key {}",
                remaining, key
            ))
        })?;

        debug!(
            key = %key,
            allowed = allowed == 1,
            remaining,
            retry_ms,
            "Token bucket check"
        );

        if allowed == 1 {
            Ok(ConsumeOutcome::granted(remaining))
        } else {
            Ok(ConsumeOutcome::rejected(
                remaining,
                Duration::from_millis(retry_ms.max(1) as u64),
            ))
        }
    }

    async fn reset(&self, key: &str) -> Result<(), RateLimitError> {
        let mut connection = self.connection.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(store_error)
    }

    async fn ping(&self) -> Result<(), RateLimitError> {
        let mut connection = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut connection)
            .await
            .map(|_| ())
            .map_err(store_error)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Key holding the outcome of one applied request against `key`
pub fn request_record_key(key: &str, request_id: &str) -> String {
    format!("{}:req:{}", key, request_id)
}

fn store_error(e: redis::RedisError) -> RateLimitError {
    RateLimitError::StoreUnavailable(e.to_string())
}
