use super::{AuthGate, Verdict};
use crate::policy::RouteDescriptor;
use crate::rate_limit::Decision;
use axum::{
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;

/// Shared state for [`auth_gate_middleware`]
#[derive(Clone)]
pub struct GateLayerState {
    pub gate: Arc<AuthGate>,
    /// Take the client IP from `X-Forwarded-For`
    pub trust_forwarded_for: bool,
}

/// Run every request through the gate.
///
/// Admitted requests reach the handler with the caller's
/// [`CallerIdentity`](crate::auth::CallerIdentity) in the request
/// extensions, and the response carries `X-RateLimit-*` headers.
pub async fn auth_gate_middleware(
    State(state): State<GateLayerState>,
    mut request: Request,
    next: Next,
) -> Response {
    let route = route_descriptor(&request, state.trust_forwarded_for);
    let token = bearer_token(request.headers()).map(str::to_string);

    match state.gate.handle(token.as_deref(), &route, SystemTime::now()).await {
        Verdict::Admitted { identity, decision } => {
            request.extensions_mut().insert(identity);
            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), &decision);
            response
        }
        Verdict::Rejected(rejection) => rejection.into_response(),
    }
}

/// Build the route descriptor for a request
pub fn route_descriptor(request: &Request, trust_forwarded_for: bool) -> RouteDescriptor {
    let mut route = RouteDescriptor::new(request.method().clone(), request.uri().path());

    if let Some(matched) = request.extensions().get::<MatchedPath>() {
        route = route.with_matched(matched.as_str());
    }
    if let Some(ip) = client_ip(request, trust_forwarded_for) {
        route = route.with_client_ip(ip);
    }
    route
}

/// The token from `Authorization: Bearer <token>`.
///
/// A header with any other scheme is handed over whole, so it fails
/// verification instead of looking like a request without credentials.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?;
    // Non-ASCII header: pass a value that can never verify.
    let value = value.to_str().unwrap_or("");

    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    Some(token)
}

fn client_ip(request: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Add rate limit headers to an admitted response. Fail-open decisions
/// carry no bucket numbers and get none.
pub fn add_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    if decision.fallback.is_some() {
        return;
    }
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from(decision.remaining_whole()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Method;
    use std::time::Duration;

    fn request(headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().method(Method::POST).uri("/api/items/7?x=1");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_token_extraction() {
        let req = request(&[("authorization", "Bearer abc.def.ghi")]);
        assert_eq!(bearer_token(req.headers()), Some("abc.def.ghi"));

        let req = request(&[("authorization", "bearer abc")]);
        assert_eq!(bearer_token(req.headers()), Some("abc"));

        let req = request(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(bearer_token(req.headers()), Some("Basic dXNlcjpwYXNz"));

        let req = request(&[]);
        assert_eq!(bearer_token(req.headers()), None);
    }

    #[test]
    fn test_route_descriptor_from_request() {
        let mut req = request(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));

        let route = route_descriptor(&req, false);
        assert_eq!(route.method, Method::POST);
        assert_eq!(route.path, "/api/items/7");
        assert_eq!(route.client_ip, Some("10.0.0.2".parse().unwrap()));

        let route = route_descriptor(&req, true);
        assert_eq!(route.client_ip, Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_rate_limit_headers() {
        let mut headers = HeaderMap::new();
        add_rate_limit_headers(
            &mut headers,
            &Decision::allowed("k".to_string(), 10, 6.5),
        );
        assert_eq!(headers["X-RateLimit-Limit"], "10");
        assert_eq!(headers["X-RateLimit-Remaining"], "6");

        let mut headers = HeaderMap::new();
        add_rate_limit_headers(&mut headers, &Decision::fail_open("k".to_string(), 10));
        assert!(headers.is_empty());

        let denied = Decision::denied("k".to_string(), 10, 0.0, Duration::from_secs(1));
        let mut headers = HeaderMap::new();
        add_rate_limit_headers(&mut headers, &denied);
        assert_eq!(headers["X-RateLimit-Remaining"], "0");
    }
}
