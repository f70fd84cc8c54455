//! The per-request gate: verify the caller, then rate limit them.
//!
//! ```text
//! Unauthenticated --verify--> Verified --evaluate--> Limited --> Admitted
//!        |                                              |
//!        +--------------------> Rejected <--------------+
//! ```
//!
//! Every path ends in a [`Verdict`]. The gate never retries; dropping the
//! `handle` future abandons the request with nothing committed beyond what
//! the store already applied.

pub mod middleware;

pub use middleware::{auth_gate_middleware, GateLayerState};

use crate::auth::{CallerIdentity, TokenVerifier};
use crate::error::{AuthError, RateLimitError};
use crate::metrics::{record_auth_failure, record_decision};
use crate::policy::{PolicyResolver, RouteDescriptor};
use crate::rate_limit::{Decision, RateLimiter};
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidToken,
    TokenExpired,
    InvalidIssuer,
    RateLimited,
    ServiceUnavailable,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidToken => "InvalidToken",
            RejectReason::TokenExpired => "TokenExpired",
            RejectReason::InvalidIssuer => "InvalidIssuer",
            RejectReason::RateLimited => "RateLimited",
            RejectReason::ServiceUnavailable => "ServiceUnavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RejectReason::InvalidToken
            | RejectReason::TokenExpired
            | RejectReason::InvalidIssuer => StatusCode::UNAUTHORIZED,
            RejectReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            RejectReason::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<AuthError> for RejectReason {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::InvalidToken => RejectReason::InvalidToken,
            AuthError::TokenExpired => RejectReason::TokenExpired,
            AuthError::InvalidIssuer => RejectReason::InvalidIssuer,
        }
    }
}

/// A rejected request
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
    /// Set for rate limit rejections
    pub retry_after: Option<Duration>,
    /// Bucket capacity, for rate limit rejections
    pub limit: Option<u32>,
}

impl Rejection {
    fn auth(error: AuthError) -> Self {
        Self {
            reason: error.into(),
            message: error.to_string(),
            retry_after: None,
            limit: None,
        }
    }

    fn rate_limited(decision: &Decision) -> Self {
        Self {
            reason: RejectReason::RateLimited,
            message: "Rate limit exceeded".to_string(),
            retry_after: Some(decision.retry_after),
            limit: Some(decision.limit),
        }
    }

    fn unavailable() -> Self {
        Self {
            reason: RejectReason::ServiceUnavailable,
            message: "Rate limiting is temporarily unavailable".to_string(),
            retry_after: None,
            limit: None,
        }
    }

    /// `Retry-After` value: whole seconds, rounded up, at least 1
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|retry| retry.as_secs_f64().ceil().max(1.0) as u64)
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.reason.status_code();
        let retry_after = self.retry_after_secs();
        let mut headers = HeaderMap::new();

        if let Some(secs) = retry_after {
            headers.insert("Retry-After", HeaderValue::from(secs));
        }
        if let Some(limit) = self.limit {
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
        }
        if status == StatusCode::UNAUTHORIZED {
            headers.insert("WWW-Authenticate", HeaderValue::from_static("Bearer"));
        }

        let body = Json(json!({
            "error": self.reason.code(),
            "message": self.message,
            "status": status.as_u16(),
            "retry_after": retry_after,
        }));

        (status, headers, body).into_response()
    }
}

/// Final answer for one request
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Admitted {
        identity: CallerIdentity,
        decision: Decision,
    },
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted { .. })
    }
}

#[derive(Debug)]
enum GateState {
    Unauthenticated,
    Verified(CallerIdentity),
    Limited(CallerIdentity, Result<Decision, RateLimitError>),
    Admitted(CallerIdentity, Decision),
    Rejected(Rejection),
}

/// Token verification followed by rate limiting
pub struct AuthGate {
    verifier: Arc<TokenVerifier>,
    resolver: Arc<PolicyResolver>,
    limiter: Arc<RateLimiter>,
}

impl AuthGate {
    pub fn new(
        verifier: Arc<TokenVerifier>,
        resolver: Arc<PolicyResolver>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            verifier,
            resolver,
            limiter,
        }
    }

    pub fn verifier(&self) -> &Arc<TokenVerifier> {
        &self.verifier
    }

    pub fn resolver(&self) -> &Arc<PolicyResolver> {
        &self.resolver
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Run one request through the gate. `raw_token` is the bearer token
    /// without its scheme, `None` when the request carried none.
    pub async fn handle(
        &self,
        raw_token: Option<&str>,
        route: &RouteDescriptor,
        now: SystemTime,
    ) -> Verdict {
        let mut state = GateState::Unauthenticated;

        loop {
            state = match state {
                GateState::Unauthenticated => self.authenticate(raw_token, route, now),
                GateState::Verified(identity) => {
                    let result = self.limiter.evaluate(&identity, route, now).await;
                    GateState::Limited(identity, result)
                }
                GateState::Limited(identity, result) => limit_transition(identity, result),
                GateState::Admitted(identity, decision) => {
                    record_decision(if decision.fallback.is_some() {
                        "fail_open"
                    } else {
                        "admitted"
                    });
                    return Verdict::Admitted { identity, decision };
                }
                GateState::Rejected(rejection) => {
                    record_decision(match rejection.reason {
                        RejectReason::RateLimited => "rate_limited",
                        RejectReason::ServiceUnavailable => "unavailable",
                        _ => "unauthenticated",
                    });
                    return Verdict::Rejected(rejection);
                }
            };
        }
    }

    fn authenticate(
        &self,
        raw_token: Option<&str>,
        route: &RouteDescriptor,
        now: SystemTime,
    ) -> GateState {
        let public = self.resolver.is_public(route);

        let Some(token) = raw_token else {
            if public {
                return GateState::Verified(CallerIdentity::anonymous());
            }
            debug!(path = %route.path, "Missing bearer token");
            record_auth_failure(AuthError::InvalidToken.code());
            return GateState::Rejected(Rejection::auth(AuthError::InvalidToken));
        };

        match self.verifier.verify(token, now) {
            Ok(identity) => GateState::Verified(identity),
            // Public routes serve callers whose token is stale, as anonymous.
            Err(e) if public => {
                debug!(path = %route.path, reason = e.code(), "Ignoring invalid token on public route");
                GateState::Verified(CallerIdentity::anonymous())
            }
            Err(e) => {
                debug!(path = %route.path, reason = e.code(), "Token rejected");
                record_auth_failure(e.code());
                GateState::Rejected(Rejection::auth(e))
            }
        }
    }
}

fn limit_transition(
    identity: CallerIdentity,
    result: Result<Decision, RateLimitError>,
) -> GateState {
    match result {
        Ok(decision) if decision.allowed => GateState::Admitted(identity, decision),
        Ok(decision) => GateState::Rejected(Rejection::rate_limited(&decision)),
        Err(e) => {
            warn!(error = %e, "Rejecting request while the bucket store is unavailable");
            GateState::Rejected(Rejection::unavailable())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn decision(allowed: bool, retry_ms: u64) -> Decision {
        if allowed {
            Decision::allowed("k".to_string(), 5, 4.0)
        } else {
            Decision::denied("k".to_string(), 5, 0.0, Duration::from_millis(retry_ms))
        }
    }

    #[test]
    fn test_limit_transitions() {
        let identity = CallerIdentity::anonymous();

        assert!(matches!(
            limit_transition(identity.clone(), Ok(decision(true, 0))),
            GateState::Admitted(_, _)
        ));

        match limit_transition(identity.clone(), Ok(decision(false, 1500))) {
            GateState::Rejected(rejection) => {
                assert_eq!(rejection.reason, RejectReason::RateLimited);
                assert_eq!(rejection.retry_after_secs(), Some(2));
                assert_eq!(rejection.limit, Some(5));
            }
            other => panic!("unexpected state: {:?}", other),
        }

        match limit_transition(
            identity,
            Err(RateLimitError::StoreUnavailable("down".to_string())),
        ) {
            GateState::Rejected(rejection) => {
                assert_eq!(rejection.reason, RejectReason::ServiceUnavailable);
                assert!(!rejection.message.contains("down"));
            }
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn test_reason_status_codes() {
        assert_eq!(RejectReason::InvalidToken.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(RejectReason::TokenExpired.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(RejectReason::InvalidIssuer.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RejectReason::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RejectReason::ServiceUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(RejectReason::from(AuthError::TokenExpired).code(), "TokenExpired");
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = Rejection::rate_limited(&decision(false, 200)).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "1");
        assert_eq!(response.headers()["X-RateLimit-Limit"], "5");
        assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "RateLimited");
        assert_eq!(json["status"], 429);
        assert_eq!(json["retry_after"], 1);
    }

    #[tokio::test]
    async fn test_auth_response() {
        let response = Rejection::auth(AuthError::TokenExpired).into_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()["WWW-Authenticate"], "Bearer");
        assert!(response.headers().get("Retry-After").is_none());

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "TokenExpired");
        assert!(json["retry_after"].is_null());
    }
}
