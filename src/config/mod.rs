use crate::circuit_breaker::{CircuitBreakerConfig, RetryConfig};
use crate::error::ConfigError;
use crate::hotreload::HotReloadConfig;
use crate::rate_limit::types::{FallbackMode, RateLimitPolicy};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthGateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Token verification
    pub auth: AuthConfig,
    /// Bucket store and fallback behaviour
    pub rate_limiting: RateLimitingConfig,
    /// Rate limit policies
    #[serde(default)]
    pub policies: PoliciesConfig,
    /// Route patterns that admit requests without a token
    #[serde(default)]
    pub public_routes: Vec<String>,
    /// Config file watching
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Take the client IP from `X-Forwarded-For` (only behind a trusted proxy)
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt: JwtConfig,
}

/// JWT verification configuration.
///
/// `secret` and `public_key` accept a literal value, `env://VAR` or
/// `file:///path/to/key`.
#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Shared secret for HS256/HS384/HS512
    #[serde(default)]
    pub secret: Option<SecretString>,
    /// PEM public key for RS*/ES* algorithms
    #[serde(default)]
    pub public_key: Option<String>,
    /// Algorithm tokens must be signed with
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    /// Issuer to validate
    #[serde(default)]
    pub issuer: Option<String>,
    /// Audience to validate
    #[serde(default)]
    pub audience: Option<String>,
    /// Tolerance for clock differences with the token issuer, in seconds
    #[serde(default)]
    pub clock_skew_secs: u64,
    /// Additional keys selected by the token header `kid`
    #[serde(default)]
    pub keys: Vec<JwtKeyConfig>,
}

/// A key selected by `kid`, using the same algorithm as the primary key
#[derive(Debug, Clone, Deserialize)]
pub struct JwtKeyConfig {
    pub kid: String,
    #[serde(default)]
    pub secret: Option<SecretString>,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitingConfig {
    /// Shared store; without it buckets live in this process only
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    /// Behaviour while the store is unavailable. Required.
    pub fallback: FallbackMode,
    /// Upper bound for one store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Prefix of every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Store call retries
    #[serde(default)]
    pub retry: RetryConfig,
    /// Store circuit breaker
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl RateLimitingConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Redis configuration for rate limiting
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    pub url: String,
}

/// Policy set: ordered rules plus a default
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoliciesConfig {
    /// Policy for requests no rule matches
    #[serde(default)]
    pub default: Option<RateLimitPolicy>,
    /// Rules, in priority order within their tier
    #[serde(default)]
    pub rules: Vec<PolicyRuleConfig>,
}

/// One policy rule
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRuleConfig {
    #[serde(rename = "match")]
    pub matcher: RuleMatchConfig,
    pub policy: RateLimitPolicy,
}

/// Conditions a request must meet for a rule to apply.
///
/// The identity condition holds when the caller's subject is listed in
/// `subjects` or the caller carries any role in `roles`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleMatchConfig {
    /// Route pattern (e.g. `/api/items/:id`)
    #[serde(default)]
    pub route: Option<String>,
    /// Methods the route pattern applies to (empty means all)
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub subjects: Vec<String>,
}

impl RuleMatchConfig {
    pub fn has_identity_matcher(&self) -> bool {
        !self.roles.is_empty() || !self.subjects.is_empty()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trust_forwarded_for: false,
        }
    }
}

impl AuthGateConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Read(format!("{}: {}", path.as_ref().display(), e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration. Key material and route patterns are checked
    /// again when the verifier and policy set are built from it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let jwt = &self.auth.jwt;
        if jwt.algorithm.trim().is_empty() {
            return Err(ConfigError::Invalid("JWT algorithm cannot be empty".to_string()));
        }
        if jwt.secret.is_none() && jwt.public_key.is_none() {
            return Err(ConfigError::MissingKeyMaterial(
                "auth.jwt needs a secret or a public_key".to_string(),
            ));
        }

        let mut kids = HashSet::new();
        for key in &jwt.keys {
            if key.kid.trim().is_empty() {
                return Err(ConfigError::Invalid("JWT key id cannot be empty".to_string()));
            }
            if !kids.insert(key.kid.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate JWT key id: {}",
                    key.kid
                )));
            }
            if key.secret.is_none() && key.public_key.is_none() {
                return Err(ConfigError::MissingKeyMaterial(format!(
                    "JWT key '{}' needs a secret or a public_key",
                    key.kid
                )));
            }
        }

        let rate_limiting = &self.rate_limiting;
        if rate_limiting.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "store_timeout_ms must be > 0".to_string(),
            ));
        }
        if rate_limiting.key_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("key_prefix cannot be empty".to_string()));
        }
        if let Some(redis) = &rate_limiting.redis {
            if !redis.url.starts_with("redis://") && !redis.url.starts_with("rediss://") {
                return Err(ConfigError::Invalid(format!(
                    "Redis URL must start with redis:// or rediss://: {}",
                    redis.url
                )));
            }
        }
        if let Some(breaker) = &rate_limiting.circuit_breaker {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(ConfigError::Invalid(
                    "circuit breaker thresholds must be > 0".to_string(),
                ));
            }
        }

        if let Some(default) = &self.policies.default {
            default.validate()?;
        }

        let mut names = HashSet::new();
        for rule in &self.policies.rules {
            rule.policy.validate()?;
            if !names.insert(rule.policy.name.as_str()) {
                return Err(ConfigError::InvalidPolicy(format!(
                    "Duplicate policy name: {}",
                    rule.policy.name
                )));
            }
            if rule.matcher.route.is_none() && !rule.matcher.has_identity_matcher() {
                return Err(ConfigError::InvalidPolicy(format!(
                    "Rule for policy '{}' needs a route, roles or subjects",
                    rule.policy.name
                )));
            }
            if rule.matcher.route.is_none() && !rule.matcher.methods.is_empty() {
                return Err(ConfigError::InvalidPolicy(format!(
                    "Rule for policy '{}' lists methods without a route",
                    rule.policy.name
                )));
            }
        }

        for route in &self.public_routes {
            if !route.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "Public route must start with '/': {}",
                    route
                )));
            }
        }

        Ok(())
    }
}
