use super::store::{BucketStore, ConsumeOutcome};
use super::types::{Decision, FallbackMode, RateLimitDimension, RateLimitKey, RateLimitPolicy};
use crate::auth::CallerIdentity;
use crate::circuit_breaker::{CircuitBreaker, CircuitState, RetryExecutor};
use crate::config::RateLimitingConfig;
use crate::error::RateLimitError;
use crate::metrics::{record_rate_limited, record_store_latency, record_store_unavailable};
use crate::policy::{PolicyResolver, RouteDescriptor};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

/// Resolves the policy for a request, derives its bucket key and asks the
/// store for a decision.
///
/// Store calls are bounded by a timeout and optionally retried and guarded
/// by a circuit breaker. When the store cannot answer, the configured
/// [`FallbackMode`] decides.
pub struct RateLimiter {
    resolver: Arc<PolicyResolver>,
    store: Arc<dyn BucketStore>,
    fallback: FallbackMode,
    store_timeout: Duration,
    key_prefix: String,
    retry: RetryExecutor,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl RateLimiter {
    pub fn new(
        resolver: Arc<PolicyResolver>,
        store: Arc<dyn BucketStore>,
        config: &RateLimitingConfig,
    ) -> Self {
        let breaker = config
            .circuit_breaker
            .clone()
            .map(|breaker| Arc::new(CircuitBreaker::new(store.name(), breaker)));

        Self {
            resolver,
            fallback: config.fallback,
            store_timeout: config.store_timeout(),
            key_prefix: config.key_prefix.clone(),
            retry: RetryExecutor::new(config.retry.clone()),
            breaker,
            store,
        }
    }

    pub fn fallback(&self) -> FallbackMode {
        self.fallback
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Decide whether `identity` may call `route` at `now`
    pub async fn evaluate(
        &self,
        identity: &CallerIdentity,
        route: &RouteDescriptor,
        now: SystemTime,
    ) -> Result<Decision, RateLimitError> {
        let policy = self.resolver.resolve(identity, route);
        let key = self
            .derive_key(&policy, identity, route)
            .to_store_key(&self.key_prefix);
        // One id for every attempt, so a retried call is applied at most once.
        let request_id = Uuid::new_v4().to_string();

        match self.consume(&key, &policy, now, &request_id).await {
            Ok(outcome) if outcome.allowed => {
                debug!(key = %key, remaining = outcome.remaining, "Request within rate limit");
                Ok(Decision::allowed(key, policy.capacity, outcome.remaining))
            }
            Ok(outcome) => {
                debug!(
                    key = %key,
                    retry_after_ms = outcome.retry_after.as_millis() as u64,
                    "Rate limit exceeded"
                );
                record_rate_limited(&policy.name);
                Ok(Decision::denied(
                    key,
                    policy.capacity,
                    outcome.remaining,
                    outcome.retry_after,
                ))
            }
            Err(e) => {
                record_store_unavailable(self.store.name());
                match self.fallback {
                    FallbackMode::Open => {
                        warn!(key = %key, error = %e, "Bucket store unavailable, failing open");
                        Ok(Decision::fail_open(key, policy.capacity))
                    }
                    FallbackMode::Closed => {
                        warn!(key = %key, error = %e, "Bucket store unavailable, failing closed");
                        Err(e)
                    }
                }
            }
        }
    }

    /// Clear the bucket `identity` uses on `route`, e.g. after a successful
    /// verification step
    pub async fn reset(
        &self,
        identity: &CallerIdentity,
        route: &RouteDescriptor,
    ) -> Result<(), RateLimitError> {
        let policy = self.resolver.resolve(identity, route);
        let key = self
            .derive_key(&policy, identity, route)
            .to_store_key(&self.key_prefix);

        tokio::time::timeout(self.store_timeout, self.store.reset(&key))
            .await
            .map_err(|_| self.timed_out())??;
        debug!(key = %key, "Bucket reset");
        Ok(())
    }

    /// Check store connectivity
    pub async fn ping(&self) -> Result<(), RateLimitError> {
        tokio::time::timeout(self.store_timeout, self.store.ping())
            .await
            .map_err(|_| self.timed_out())?
    }

    /// Key components for `identity` on `route` under `policy`.
    ///
    /// Anonymous callers are keyed by address in the identity dimension,
    /// so they never share a bucket with each other or with a subject.
    pub fn derive_key(
        &self,
        policy: &RateLimitPolicy,
        identity: &CallerIdentity,
        route: &RouteDescriptor,
    ) -> RateLimitKey {
        let ip = route
            .client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let parts = policy
            .scope
            .dimensions()
            .iter()
            .map(|dimension| match dimension {
                RateLimitDimension::Identity => match &identity.subject {
                    Some(subject) => subject.clone(),
                    None => format!("anon:{}", ip),
                },
                RateLimitDimension::Ip => ip.clone(),
                RateLimitDimension::Route => route.label(),
            })
            .collect();

        RateLimitKey::new(&policy.scope, &policy.name, parts)
    }

    async fn consume(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        now: SystemTime,
        request_id: &str,
    ) -> Result<ConsumeOutcome, RateLimitError> {
        let store = self.store.as_ref();
        let breaker = self.breaker.as_deref();
        let timeout = self.store_timeout;

        self.retry
            .execute_with_predicate(
                || async move {
                    // Dropping this future mid-call hands a half-open slot back.
                    let permit = match breaker {
                        Some(breaker) => match breaker.try_acquire() {
                            Some(permit) => Some(permit),
                            None => {
                                return Err(RateLimitError::StoreUnavailable(
                                    "circuit open".to_string(),
                                ))
                            }
                        },
                        None => None,
                    };

                    let started = Instant::now();
                    let result = match tokio::time::timeout(
                        timeout,
                        store.check_and_consume(key, policy, policy.cost, now, request_id),
                    )
                    .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(RateLimitError::StoreUnavailable(format!(
                            "timed out after {}ms",
                            timeout.as_millis()
                        ))),
                    };
                    record_store_latency(store.name(), started.elapsed().as_secs_f64());

                    if let Some(permit) = permit {
                        match &result {
                            Ok(_) => permit.record_success(),
                            Err(_) => permit.record_failure(),
                        }
                    }
                    result
                },
                |_| breaker.map_or(true, |breaker| breaker.state() != CircuitState::Open),
            )
            .await
    }

    fn timed_out(&self) -> RateLimitError {
        RateLimitError::StoreUnavailable(format!(
            "timed out after {}ms",
            self.store_timeout.as_millis()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, RetryConfig};
    use crate::config::PoliciesConfig;
    use crate::policy::PolicySet;
    use crate::rate_limit::local::InMemoryBucketStore;
    use crate::rate_limit::types::{RateLimitScope, WindowKind};
    use async_trait::async_trait;
    use http::Method;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::UNIX_EPOCH;

    /// Store double that fails every call
    struct DownStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BucketStore for DownStore {
        async fn check_and_consume(
            &self,
            _key: &str,
            _policy: &RateLimitPolicy,
            _cost: u32,
            _now: SystemTime,
            _request_id: &str,
        ) -> Result<ConsumeOutcome, RateLimitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RateLimitError::StoreUnavailable("connection refused".to_string()))
        }

        async fn reset(&self, _key: &str) -> Result<(), RateLimitError> {
            Err(RateLimitError::StoreUnavailable("connection refused".to_string()))
        }

        async fn ping(&self) -> Result<(), RateLimitError> {
            Err(RateLimitError::StoreUnavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    /// Store double that never answers in time
    struct SlowStore;

    #[async_trait]
    impl BucketStore for SlowStore {
        async fn check_and_consume(
            &self,
            _key: &str,
            _policy: &RateLimitPolicy,
            _cost: u32,
            _now: SystemTime,
            _request_id: &str,
        ) -> Result<ConsumeOutcome, RateLimitError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ConsumeOutcome::granted(1.0))
        }

        async fn reset(&self, _key: &str) -> Result<(), RateLimitError> {
            Ok(())
        }

        async fn ping(&self) -> Result<(), RateLimitError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn settings(fallback: FallbackMode) -> RateLimitingConfig {
        RateLimitingConfig {
            redis: None,
            fallback,
            store_timeout_ms: 20,
            key_prefix: "ratelimit".to_string(),
            retry: RetryConfig::default(),
            circuit_breaker: None,
        }
    }

    fn resolver(capacity: u32, scope: RateLimitScope) -> Arc<PolicyResolver> {
        let policies = PoliciesConfig {
            default: Some(RateLimitPolicy {
                name: "default".to_string(),
                capacity,
                refill_rate: 1.0,
                window: WindowKind::Rolling,
                scope,
                cost: 1,
            }),
            rules: vec![],
        };
        Arc::new(PolicyResolver::new(
            PolicySet::from_config(&policies, &[]).unwrap(),
        ))
    }

    fn identity(subject: &str) -> CallerIdentity {
        let mut identity = CallerIdentity::anonymous();
        identity.subject = Some(subject.to_string());
        identity
    }

    fn route() -> RouteDescriptor {
        RouteDescriptor::new(Method::GET, "/api/items/7")
            .with_matched("/api/items/:id")
            .with_client_ip("10.0.0.1".parse().unwrap())
    }

    fn at(millis: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(millis)
    }

    #[tokio::test]
    async fn test_capacity_then_reject() {
        let limiter = RateLimiter::new(
            resolver(5, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(InMemoryBucketStore::new()),
            &settings(FallbackMode::Closed),
        );
        let caller = identity("user-1");

        let first = limiter.evaluate(&caller, &route(), at(1_000)).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining_whole(), 4);
        assert_eq!(first.limit, 5);
        assert_eq!(first.key, "ratelimit:identity:default:user-1");

        for _ in 0..4 {
            assert!(limiter.evaluate(&caller, &route(), at(1_000)).await.unwrap().allowed);
        }

        let rejected = limiter.evaluate(&caller, &route(), at(1_000)).await.unwrap();
        assert!(!rejected.allowed);
        assert!(rejected.retry_after > Duration::ZERO);
        assert_eq!(rejected.fallback, None);
    }

    #[tokio::test]
    async fn test_callers_do_not_share_buckets() {
        let limiter = RateLimiter::new(
            resolver(1, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(InMemoryBucketStore::new()),
            &settings(FallbackMode::Closed),
        );

        assert!(limiter.evaluate(&identity("a"), &route(), at(0)).await.unwrap().allowed);
        assert!(limiter.evaluate(&identity("b"), &route(), at(0)).await.unwrap().allowed);
        assert!(!limiter.evaluate(&identity("a"), &route(), at(0)).await.unwrap().allowed);
    }

    #[test]
    fn test_derive_key_dimensions() {
        let limiter = RateLimiter::new(
            resolver(1, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(InMemoryBucketStore::new()),
            &settings(FallbackMode::Closed),
        );
        let policy = RateLimitPolicy {
            name: "orders".to_string(),
            capacity: 1,
            refill_rate: 1.0,
            window: WindowKind::Rolling,
            scope: RateLimitScope::Composite(vec![
                RateLimitDimension::Identity,
                RateLimitDimension::Ip,
                RateLimitDimension::Route,
            ]),
            cost: 1,
        };

        let key = limiter.derive_key(&policy, &identity("u1"), &route());
        assert_eq!(
            key.to_store_key("ratelimit"),
            "ratelimit:identity+ip+route:orders:u1:10.0.0.1:GET /api/items/%3Aid"
        );

        let anonymous = limiter.derive_key(&policy, &CallerIdentity::anonymous(), &route());
        assert_eq!(anonymous.parts[0], "anon:10.0.0.1");

        let no_ip = RouteDescriptor::new(Method::POST, "/login");
        let key = limiter.derive_key(&policy, &identity("u1"), &no_ip);
        assert_eq!(key.parts, vec!["u1", "unknown", "POST /login"]);
    }

    #[tokio::test]
    async fn test_fallback_modes_under_outage() {
        let open = RateLimiter::new(
            resolver(5, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(DownStore {
                calls: AtomicU32::new(0),
            }),
            &settings(FallbackMode::Open),
        );
        let decision = open.evaluate(&identity("u"), &route(), at(0)).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.fallback, Some(FallbackMode::Open));

        let closed = RateLimiter::new(
            resolver(5, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(DownStore {
                calls: AtomicU32::new(0),
            }),
            &settings(FallbackMode::Closed),
        );
        assert!(matches!(
            closed.evaluate(&identity("u"), &route(), at(0)).await,
            Err(RateLimitError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_store_timeout_is_unavailable() {
        let limiter = RateLimiter::new(
            resolver(5, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(SlowStore),
            &settings(FallbackMode::Closed),
        );

        let started = Instant::now();
        let result = limiter.evaluate(&identity("u"), &route(), at(0)).await;
        assert!(matches!(result, Err(RateLimitError::StoreUnavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_then_breaker_short_circuits() {
        let store = Arc::new(DownStore {
            calls: AtomicU32::new(0),
        });
        let mut config = settings(FallbackMode::Closed);
        config.retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        };
        config.circuit_breaker = Some(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown_ms: 60_000,
            half_open_requests: 1,
        });
        let limiter = RateLimiter::new(
            resolver(5, RateLimitScope::Single(RateLimitDimension::Identity)),
            store.clone(),
            &config,
        );

        // First request: one call plus two retries, which opens the circuit.
        assert!(limiter.evaluate(&identity("u"), &route(), at(0)).await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);

        // Circuit open: no store call at all.
        assert!(limiter.evaluate(&identity("u"), &route(), at(0)).await.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reset_refills_bucket() {
        let limiter = RateLimiter::new(
            resolver(1, RateLimitScope::Single(RateLimitDimension::Identity)),
            Arc::new(InMemoryBucketStore::new()),
            &settings(FallbackMode::Closed),
        );
        let caller = identity("u");

        assert!(limiter.evaluate(&caller, &route(), at(0)).await.unwrap().allowed);
        assert!(!limiter.evaluate(&caller, &route(), at(0)).await.unwrap().allowed);

        limiter.reset(&caller, &route()).await.unwrap();
        assert!(limiter.evaluate(&caller, &route(), at(0)).await.unwrap().allowed);
    }
}
