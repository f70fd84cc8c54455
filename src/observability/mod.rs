use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::{info, info_span, Span};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::error::{GateError, Result};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Environment variable selecting the log format (`compact` or `json`)
pub const LOG_FORMAT_ENV: &str = "AUTHGATE_LOG_FORMAT";

const DEFAULT_FILTER: &str = "authgate=debug,tower_http=debug";

/// Initialize the tracing subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to
/// `authgate=debug,tower_http=debug`.
pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init()
    };
    result.map_err(|e| GateError::Internal(format!("Failed to initialize tracing: {}", e)))?;

    info!(json, "Tracing initialized");
    Ok(())
}

/// Span for one HTTP request, used by the trace layer.
///
/// `request_id` starts empty and is filled in by [`request_id_middleware`]
/// once the id is known.
pub fn make_request_span(request: &Request) -> Span {
    info_span!(
        "request",
        method = %request.method(),
        uri = %request.uri(),
        request_id = tracing::field::Empty,
    )
}

/// Middleware to add request ID to requests
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    // Keep a caller-supplied id so logs line up across services
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Span::current().record("request_id", request_id.as_str());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Request ID extension type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);
