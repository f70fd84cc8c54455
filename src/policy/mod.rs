//! Maps a caller and a route to the rate limit policy that governs them.
//!
//! Rules are grouped in tiers by specificity. The first matching rule of
//! the first tier with a match wins; within a tier, configuration order
//! decides:
//!
//! 1. route and identity matcher
//! 2. route matcher only
//! 3. identity matcher only
//! 4. the default policy
//!
//! The resolver holds the whole set behind one `Arc`, so a reload swaps
//! every rule at once and a request never sees half of an update.

pub mod matcher;

pub use matcher::RouteMatcher;

use crate::auth::CallerIdentity;
use crate::config::{PoliciesConfig, PolicyRuleConfig};
use crate::error::ConfigError;
use crate::rate_limit::types::{
    RateLimitDimension, RateLimitPolicy, RateLimitScope, WindowKind,
};
use http::Method;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// The request as the routing layer sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub method: Method,
    /// Concrete request path
    pub path: String,
    /// Route pattern the router matched, when there is one
    pub matched: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl RouteDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            matched: None,
            client_ip: None,
        }
    }

    pub fn with_matched(mut self, pattern: impl Into<String>) -> Self {
        self.matched = Some(pattern.into());
        self
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// Route label used in bucket keys, e.g. `GET /api/items/:id`.
    /// Uses the matched pattern so all ids of one route share a bucket.
    pub fn label(&self) -> String {
        format!(
            "{} {}",
            self.method,
            self.matched.as_deref().unwrap_or(&self.path)
        )
    }
}

#[derive(Debug)]
struct PolicyRule {
    route: Option<RouteMatcher>,
    roles: HashSet<String>,
    subjects: HashSet<String>,
    policy: Arc<RateLimitPolicy>,
}

impl PolicyRule {
    fn from_config(config: &PolicyRuleConfig) -> Result<Self, ConfigError> {
        let route = config
            .matcher
            .route
            .as_deref()
            .map(|pattern| RouteMatcher::new(pattern, &config.matcher.methods))
            .transpose()?;

        Ok(Self {
            route,
            roles: config.matcher.roles.iter().cloned().collect(),
            subjects: config.matcher.subjects.iter().cloned().collect(),
            policy: Arc::new(config.policy.clone()),
        })
    }

    fn has_identity_matcher(&self) -> bool {
        !self.roles.is_empty() || !self.subjects.is_empty()
    }

    fn matches_identity(&self, identity: &CallerIdentity) -> bool {
        let subject_match = identity
            .subject
            .as_ref()
            .is_some_and(|subject| self.subjects.contains(subject));
        subject_match || identity.roles.iter().any(|role| self.roles.contains(role))
    }

    fn matches_route(&self, route: &RouteDescriptor) -> bool {
        self.route
            .as_ref()
            .is_some_and(|matcher| matcher.matches(&route.method, &route.path))
    }
}

/// An immutable, validated set of policies
#[derive(Debug)]
pub struct PolicySet {
    route_and_identity: Vec<PolicyRule>,
    route_only: Vec<PolicyRule>,
    identity_only: Vec<PolicyRule>,
    default: Arc<RateLimitPolicy>,
    public: Vec<RouteMatcher>,
}

impl PolicySet {
    /// Build and validate a policy set
    pub fn from_config(
        policies: &PoliciesConfig,
        public_routes: &[String],
    ) -> Result<Self, ConfigError> {
        let default = match &policies.default {
            Some(policy) => {
                policy.validate()?;
                policy.clone()
            }
            None => {
                info!("No default rate limit policy configured, using the restrictive built-in");
                Self::restrictive_default()
            }
        };

        let mut names = HashSet::new();
        names.insert(default.name.clone());

        let mut set = Self {
            route_and_identity: Vec::new(),
            route_only: Vec::new(),
            identity_only: Vec::new(),
            default: Arc::new(default),
            public: public_routes
                .iter()
                .map(|pattern| RouteMatcher::new(pattern, &[]))
                .collect::<Result<Vec<_>, _>>()?,
        };

        for config in &policies.rules {
            config.policy.validate()?;
            if !names.insert(config.policy.name.clone()) {
                return Err(ConfigError::InvalidPolicy(format!(
                    "Duplicate policy name: {}",
                    config.policy.name
                )));
            }

            let rule = PolicyRule::from_config(config)?;
            match (rule.route.is_some(), rule.has_identity_matcher()) {
                (true, true) => set.route_and_identity.push(rule),
                (true, false) => set.route_only.push(rule),
                (false, true) => set.identity_only.push(rule),
                (false, false) => {
                    return Err(ConfigError::InvalidPolicy(format!(
                        "Rule for policy '{}' needs a route, roles or subjects",
                        config.policy.name
                    )))
                }
            }
        }

        debug!(
            rules = policies.rules.len(),
            public_routes = set.public.len(),
            default = %set.default.name,
            "Policy set built"
        );
        Ok(set)
    }

    /// Used when no default policy is configured: 10 tokens, 1 per second,
    /// per caller and address.
    pub fn restrictive_default() -> RateLimitPolicy {
        RateLimitPolicy {
            name: "default".to_string(),
            capacity: 10,
            refill_rate: 1.0,
            window: WindowKind::Rolling,
            scope: RateLimitScope::Composite(vec![
                RateLimitDimension::Identity,
                RateLimitDimension::Ip,
            ]),
            cost: 1,
        }
    }

    /// Policy governing `identity` on `route`. Never fails.
    pub fn resolve(&self, identity: &CallerIdentity, route: &RouteDescriptor) -> Arc<RateLimitPolicy> {
        let matched = self
            .route_and_identity
            .iter()
            .find(|rule| rule.matches_route(route) && rule.matches_identity(identity))
            .or_else(|| self.route_only.iter().find(|rule| rule.matches_route(route)))
            .or_else(|| {
                self.identity_only
                    .iter()
                    .find(|rule| rule.matches_identity(identity))
            });

        match matched {
            Some(rule) => Arc::clone(&rule.policy),
            None => Arc::clone(&self.default),
        }
    }

    /// Whether the route admits callers without a token
    pub fn is_public(&self, route: &RouteDescriptor) -> bool {
        self.public
            .iter()
            .any(|matcher| matcher.matches(&route.method, &route.path))
    }

    /// Longest bucket TTL of any policy in the set
    pub fn max_state_ttl(&self) -> Duration {
        self.route_and_identity
            .iter()
            .chain(&self.route_only)
            .chain(&self.identity_only)
            .map(|rule| rule.policy.state_ttl())
            .fold(self.default.state_ttl(), Duration::max)
    }
}

/// Shared, swappable policy set
#[derive(Debug)]
pub struct PolicyResolver {
    current: RwLock<Arc<PolicySet>>,
}

impl PolicyResolver {
    pub fn new(set: PolicySet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// The set in force right now. Hold on to it for the rest of a request.
    pub fn snapshot(&self) -> Arc<PolicySet> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*guard)
    }

    /// Replace the whole policy set
    pub fn swap(&self, set: PolicySet) {
        let set = Arc::new(set);
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = set;
        info!("Rate limit policy set replaced");
    }

    pub fn resolve(&self, identity: &CallerIdentity, route: &RouteDescriptor) -> Arc<RateLimitPolicy> {
        self.snapshot().resolve(identity, route)
    }

    pub fn is_public(&self, route: &RouteDescriptor) -> bool {
        self.snapshot().is_public(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleMatchConfig;

    fn policy(name: &str) -> RateLimitPolicy {
        RateLimitPolicy {
            name: name.to_string(),
            capacity: 5,
            refill_rate: 1.0,
            window: WindowKind::Rolling,
            scope: RateLimitScope::Single(RateLimitDimension::Identity),
            cost: 1,
        }
    }

    fn rule(name: &str, route: Option<&str>, roles: &[&str]) -> PolicyRuleConfig {
        PolicyRuleConfig {
            matcher: RuleMatchConfig {
                route: route.map(str::to_string),
                methods: vec![],
                roles: roles.iter().map(|r| r.to_string()).collect(),
                subjects: vec![],
            },
            policy: policy(name),
        }
    }

    fn user(roles: &[&str]) -> CallerIdentity {
        let mut identity = CallerIdentity::anonymous();
        identity.subject = Some("user-1".to_string());
        identity.roles = roles.iter().map(|r| r.to_string()).collect();
        identity
    }

    fn config(rules: Vec<PolicyRuleConfig>) -> PoliciesConfig {
        PoliciesConfig {
            default: Some(policy("fallback")),
            rules,
        }
    }

    #[test]
    fn test_tier_order() {
        // Declared least specific first; tiers must still win by specificity.
        let set = PolicySet::from_config(
            &config(vec![
                rule("admins", None, &["ADMIN"]),
                rule("items", Some("/api/items/:id"), &[]),
                rule("admin-items", Some("/api/items/:id"), &["ADMIN"]),
            ]),
            &[],
        )
        .unwrap();

        let items = RouteDescriptor::new(Method::GET, "/api/items/7");
        let other = RouteDescriptor::new(Method::GET, "/api/other");

        assert_eq!(set.resolve(&user(&["ADMIN"]), &items).name, "admin-items");
        assert_eq!(set.resolve(&user(&["USER"]), &items).name, "items");
        assert_eq!(set.resolve(&user(&["ADMIN"]), &other).name, "admins");
        assert_eq!(set.resolve(&user(&["USER"]), &other).name, "fallback");
    }

    #[test]
    fn test_configuration_order_within_tier() {
        let set = PolicySet::from_config(
            &config(vec![
                rule("first", Some("/api/*rest"), &[]),
                rule("second", Some("/api/items"), &[]),
            ]),
            &[],
        )
        .unwrap();

        let route = RouteDescriptor::new(Method::GET, "/api/items");
        assert_eq!(set.resolve(&user(&[]), &route).name, "first");
    }

    #[test]
    fn test_subject_matcher() {
        let mut by_subject = rule("vip", None, &[]);
        by_subject.matcher.subjects = vec!["user-1".to_string()];
        let set = PolicySet::from_config(&config(vec![by_subject]), &[]).unwrap();

        let route = RouteDescriptor::new(Method::GET, "/");
        assert_eq!(set.resolve(&user(&[]), &route).name, "vip");
        assert_eq!(
            set.resolve(&CallerIdentity::anonymous(), &route).name,
            "fallback"
        );
    }

    #[test]
    fn test_restrictive_default_when_unconfigured() {
        let set = PolicySet::from_config(&PoliciesConfig::default(), &[]).unwrap();
        let resolved = set.resolve(&user(&[]), &RouteDescriptor::new(Method::GET, "/"));

        assert_eq!(resolved.capacity, 10);
        assert_eq!(resolved.refill_rate, 1.0);
        assert_eq!(resolved.scope.label(), "identity+ip");
    }

    #[test]
    fn test_invalid_sets_are_rejected() {
        assert!(PolicySet::from_config(
            &config(vec![rule("dup", Some("/a"), &[]), rule("dup", Some("/b"), &[])]),
            &[]
        )
        .is_err());

        assert!(PolicySet::from_config(&config(vec![rule("bare", None, &[])]), &[]).is_err());

        let mut bad = rule("bad", Some("/a"), &[]);
        bad.policy.refill_rate = -1.0;
        assert!(PolicySet::from_config(&config(vec![bad]), &[]).is_err());

        assert!(PolicySet::from_config(&config(vec![]), &["no-slash".to_string()]).is_err());
    }

    #[test]
    fn test_public_routes() {
        let set = PolicySet::from_config(
            &config(vec![]),
            &["/api/auth/*rest".to_string(), "/health".to_string()],
        )
        .unwrap();

        assert!(set.is_public(&RouteDescriptor::new(Method::POST, "/api/auth/otp/send")));
        assert!(set.is_public(&RouteDescriptor::new(Method::GET, "/health")));
        assert!(!set.is_public(&RouteDescriptor::new(Method::GET, "/api/items")));
    }

    #[test]
    fn test_swap_replaces_whole_set() {
        let resolver = PolicyResolver::new(
            PolicySet::from_config(&config(vec![rule("old", Some("/api/items"), &[])]), &[])
                .unwrap(),
        );
        let route = RouteDescriptor::new(Method::GET, "/api/items");
        let before = resolver.snapshot();

        resolver.swap(
            PolicySet::from_config(&config(vec![rule("new", Some("/api/items"), &[])]), &[])
                .unwrap(),
        );

        assert_eq!(resolver.resolve(&user(&[]), &route).name, "new");
        // A snapshot taken before the swap keeps answering from the old set.
        assert_eq!(before.resolve(&user(&[]), &route).name, "old");
    }

    #[test]
    fn test_max_state_ttl() {
        let mut slow = rule("slow", Some("/slow"), &[]);
        slow.policy.refill_rate = 0.1;
        let set = PolicySet::from_config(&config(vec![slow]), &[]).unwrap();

        // 5 tokens at 0.1/s refill in 50s; state is kept twice that.
        assert_eq!(set.max_state_ttl(), Duration::from_secs(100));
    }

    #[test]
    fn test_route_label_prefers_pattern() {
        let route = RouteDescriptor::new(Method::GET, "/api/items/7");
        assert_eq!(route.label(), "GET /api/items/7");
        assert_eq!(
            route.with_matched("/api/items/:id").label(),
            "GET /api/items/:id"
        );
    }
}
