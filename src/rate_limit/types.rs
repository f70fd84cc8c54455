use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted time for an empty bucket to become full
pub const MAX_REFILL_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Request attribute a bucket key is derived from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitDimension {
    /// Caller subject from the verified token (client IP for anonymous callers)
    Identity,
    /// Client IP address
    Ip,
    /// Method and route pattern
    Route,
}

impl RateLimitDimension {
    fn label(&self) -> &'static str {
        match self {
            RateLimitDimension::Identity => "identity",
            RateLimitDimension::Ip => "ip",
            RateLimitDimension::Route => "route",
        }
    }
}

/// Which dimensions participate in a bucket key.
///
/// Written as a single dimension (`scope: identity`) or a list for a
/// composite key (`scope: [identity, route]`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RateLimitScope {
    Single(RateLimitDimension),
    Composite(Vec<RateLimitDimension>),
}

impl RateLimitScope {
    pub fn dimensions(&self) -> &[RateLimitDimension] {
        match self {
            RateLimitScope::Single(dimension) => std::slice::from_ref(dimension),
            RateLimitScope::Composite(dimensions) => dimensions,
        }
    }

    /// Scope segment of the store key, e.g. `identity` or `identity+route`
    pub fn label(&self) -> String {
        self.dimensions()
            .iter()
            .map(|d| d.label())
            .collect::<Vec<_>>()
            .join("+")
    }
}

/// How a bucket regains tokens
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Tokens accumulate continuously at `refill_rate`
    #[default]
    Rolling,
    /// The bucket refills completely once per `capacity / refill_rate` seconds
    Fixed,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Rolling => "rolling",
            WindowKind::Fixed => "fixed",
        }
    }
}

/// What to do when the shared store cannot answer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// Admit the request and keep serving
    Open,
    /// Reject the request and keep protecting the backend
    Closed,
}

/// A token bucket policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitPolicy {
    /// Policy name, part of every bucket key evaluated against it
    pub name: String,
    /// Maximum number of tokens
    pub capacity: u32,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Refill behaviour
    #[serde(default)]
    pub window: WindowKind,
    /// Key dimensions
    pub scope: RateLimitScope,
    /// Tokens consumed by one request
    #[serde(default = "default_cost")]
    pub cost: u32,
}

fn default_cost() -> u32 {
    1
}

impl RateLimitPolicy {
    /// Time for an empty bucket to become full
    ///
    /// Saturates at [`MAX_REFILL_PERIOD`]; `validate` rejects policies that
    /// would exceed it.
    pub fn refill_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.capacity as f64 / self.refill_rate)
            .unwrap_or(MAX_REFILL_PERIOD)
            .min(MAX_REFILL_PERIOD)
    }

    /// Time-to-live for idle bucket state in the store
    pub fn state_ttl(&self) -> Duration {
        self.refill_period()
            .saturating_mul(2)
            .max(Duration::from_secs(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidPolicy(
                "policy name cannot be empty".to_string(),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::InvalidPolicy(format!(
                "capacity must be > 0 for policy: {}",
                self.name
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(ConfigError::InvalidPolicy(format!(
                "refill_rate must be a positive number for policy: {}",
                self.name
            )));
        }
        if self.capacity as f64 / self.refill_rate > MAX_REFILL_PERIOD.as_secs_f64() {
            return Err(ConfigError::InvalidPolicy(format!(
                "refill_rate too small, the bucket would take more than {} days to refill for policy: {}",
                MAX_REFILL_PERIOD.as_secs() / 86_400,
                self.name
            )));
        }
        if self.cost == 0 || self.cost > self.capacity {
            return Err(ConfigError::InvalidPolicy(format!(
                "cost must be between 1 and capacity ({}) for policy: {}",
                self.capacity, self.name
            )));
        }
        if self.scope.dimensions().is_empty() {
            return Err(ConfigError::InvalidPolicy(format!(
                "scope cannot be empty for policy: {}",
                self.name
            )));
        }
        Ok(())
    }
}

/// Bucket key components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Dimensions the identifier was built from
    pub scope: String,
    /// Policy the bucket belongs to
    pub policy: String,
    /// One value per dimension, in scope order
    pub parts: Vec<String>,
}

impl RateLimitKey {
    pub fn new(scope: &RateLimitScope, policy: &str, parts: Vec<String>) -> Self {
        Self {
            scope: scope.label(),
            policy: policy.to_string(),
            parts,
        }
    }

    /// The identifier segment: policy name followed by the dimension values.
    ///
    /// Each segment is escaped so a `:` inside a value (an IPv6 address, a
    /// subject, a route parameter) cannot shift the segment boundaries.
    pub fn identifier(&self) -> String {
        let mut identifier = escape_segment(&self.policy);
        for part in &self.parts {
            identifier.push(':');
            identifier.push_str(&escape_segment(part));
        }
        identifier
    }

    /// Convert to a store key, `{prefix}:{scope}:{identifier}`
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.scope, self.identifier())
    }
}

fn escape_segment(value: &str) -> String {
    value.replace('%', "%25").replace(':', "%3A")
}

/// Outcome of one rate limit evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Tokens left after this request
    pub remaining: f64,
    /// Bucket capacity
    pub limit: u32,
    /// How long to wait before retrying (zero when allowed)
    pub retry_after: Duration,
    /// Store key the request was evaluated against
    pub key: String,
    /// Set when the store was unavailable and a fallback mode decided
    pub fallback: Option<FallbackMode>,
}

impl Decision {
    pub fn allowed(key: String, limit: u32, remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            retry_after: Duration::ZERO,
            key,
            fallback: None,
        }
    }

    pub fn denied(key: String, limit: u32, remaining: f64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            limit,
            retry_after,
            key,
            fallback: None,
        }
    }

    /// Admission granted without consulting the store
    pub fn fail_open(key: String, limit: u32) -> Self {
        Self {
            allowed: true,
            remaining: 0.0,
            limit,
            retry_after: Duration::ZERO,
            key,
            fallback: Some(FallbackMode::Open),
        }
    }

    /// Whole tokens left, as reported in `X-RateLimit-Remaining`
    pub fn remaining_whole(&self) -> u64 {
        self.remaining.max(0.0).floor() as u64
    }

    /// Retry-after rounded up to whole seconds, at least 1 for rejections
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        self.retry_after.as_secs_f64().ceil().max(1.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy {
            name: "default".to_string(),
            capacity: 10,
            refill_rate: 2.0,
            window: WindowKind::Rolling,
            scope: RateLimitScope::Single(RateLimitDimension::Identity),
            cost: 1,
        }
    }

    #[test]
    fn test_rate_limit_key_to_store_key() {
        let key = RateLimitKey::new(
            &RateLimitScope::Single(RateLimitDimension::Ip),
            "anon",
            vec!["192.168.1.1".to_string()],
        );
        assert_eq!(key.to_store_key("ratelimit"), "ratelimit:ip:anon:192.168.1.1");

        let composite = RateLimitKey::new(
            &RateLimitScope::Composite(vec![
                RateLimitDimension::Identity,
                RateLimitDimension::Route,
            ]),
            "orders",
            vec!["user123".to_string(), "GET /api/orders".to_string()],
        );
        assert_eq!(
            composite.to_store_key("ratelimit"),
            "ratelimit:identity+route:orders:user123:GET /api/orders"
        );
    }

    #[test]
    fn test_key_segments_cannot_collide() {
        let scope = RateLimitScope::Composite(vec![
            RateLimitDimension::Identity,
            RateLimitDimension::Ip,
        ]);
        let left = RateLimitKey::new(&scope, "p", vec!["a:b".to_string(), "c".to_string()]);
        let right = RateLimitKey::new(&scope, "p", vec!["a".to_string(), "b:c".to_string()]);
        assert_ne!(left.to_store_key("ratelimit"), right.to_store_key("ratelimit"));

        let ipv6 = RateLimitKey::new(
            &RateLimitScope::Single(RateLimitDimension::Ip),
            "p",
            vec!["2001:db8::1".to_string()],
        );
        assert_eq!(
            ipv6.to_store_key("ratelimit"),
            "ratelimit:ip:p:2001%3Adb8%3A%3A1"
        );

        // A literal escape sequence stays distinct from an escaped colon
        let literal = RateLimitKey::new(&scope, "p", vec!["a%3Ab".to_string(), "c".to_string()]);
        assert_ne!(literal.to_store_key("ratelimit"), left.to_store_key("ratelimit"));
    }

    #[test]
    fn test_scope_deserializes_single_and_composite() {
        let single: RateLimitScope = serde_yaml::from_str("identity").unwrap();
        assert_eq!(single, RateLimitScope::Single(RateLimitDimension::Identity));

        let composite: RateLimitScope = serde_yaml::from_str("[identity, ip]").unwrap();
        assert_eq!(
            composite.dimensions(),
            &[RateLimitDimension::Identity, RateLimitDimension::Ip]
        );
        assert_eq!(composite.label(), "identity+ip");
    }

    #[test]
    fn test_policy_defaults() {
        let yaml = r#"
name: otp-verify
capacity: 5
refill_rate: 0.5
scope: identity
"#;
        let policy: RateLimitPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.cost, 1);
        assert_eq!(policy.window, WindowKind::Rolling);
        assert_eq!(policy.refill_period(), Duration::from_secs(10));
        assert_eq!(policy.state_ttl(), Duration::from_secs(20));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_validation() {
        let mut bad = policy();
        bad.capacity = 0;
        assert!(bad.validate().is_err());

        let mut bad = policy();
        bad.refill_rate = 0.0;
        assert!(bad.validate().is_err());

        let mut bad = policy();
        bad.refill_rate = f64::NAN;
        assert!(bad.validate().is_err());

        let mut bad = policy();
        bad.refill_rate = 1e-300;
        assert!(bad.validate().is_err());

        let mut bad = policy();
        bad.cost = 11;
        assert!(bad.validate().is_err());

        let mut bad = policy();
        bad.scope = RateLimitScope::Composite(vec![]);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_tiny_refill_rate_does_not_overflow() {
        let mut slow = policy();
        slow.capacity = 1;
        slow.refill_rate = 1e-300;

        assert_eq!(slow.refill_period(), MAX_REFILL_PERIOD);
        assert_eq!(slow.state_ttl(), MAX_REFILL_PERIOD * 2);
    }

    #[test]
    fn test_decision_headers() {
        let allowed = Decision::allowed("k".to_string(), 5, 3.7);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining_whole(), 3);
        assert_eq!(allowed.retry_after_secs(), 0);

        let denied = Decision::denied("k".to_string(), 5, 0.4, Duration::from_millis(300));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining_whole(), 0);
        assert_eq!(denied.retry_after_secs(), 1);

        let denied = Decision::denied("k".to_string(), 5, 0.0, Duration::from_millis(2500));
        assert_eq!(denied.retry_after_secs(), 3);
    }

    #[test]
    fn test_fail_open_decision() {
        let decision = Decision::fail_open("k".to_string(), 5);
        assert!(decision.allowed);
        assert_eq!(decision.fallback, Some(FallbackMode::Open));
    }
}
