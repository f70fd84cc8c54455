pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod gate;
pub mod hotreload;
pub mod metrics;
pub mod observability;
pub mod policy;
pub mod rate_limit;
pub mod secrets;

use crate::auth::{CallerIdentity, TokenVerifier};
use crate::config::AuthGateConfig;
use crate::error::{GateError, Result};
use crate::gate::{auth_gate_middleware, AuthGate, GateLayerState};
use crate::policy::{PolicyResolver, PolicySet};
use crate::rate_limit::{BucketStore, InMemoryBucketStore, RateLimiter, RedisBucketStore};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub use observability::init_tracing;

const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Build the gate described by `config`: verifier, policy set, bucket store
/// and rate limiter.
pub async fn build_gate(config: &AuthGateConfig) -> Result<AuthGate> {
    config.validate()?;

    let verifier = Arc::new(TokenVerifier::new(&config.auth.jwt)?);
    let resolver = Arc::new(PolicyResolver::new(PolicySet::from_config(
        &config.policies,
        &config.public_routes,
    )?));

    let settings = &config.rate_limiting;
    let store: Arc<dyn BucketStore> = match &settings.redis {
        Some(redis) => {
            let store = RedisBucketStore::connect(&redis.url).await?;
            info!(fallback = ?settings.fallback, "Using Redis bucket store");
            Arc::new(store)
        }
        None => {
            warn!("No Redis configured, rate limit buckets are local to this instance");
            let store = InMemoryBucketStore::new();
            spawn_eviction(store.clone(), Arc::clone(&resolver));
            Arc::new(store)
        }
    };

    let limiter = Arc::new(RateLimiter::new(Arc::clone(&resolver), store, settings));
    Ok(AuthGate::new(verifier, resolver, limiter))
}

/// Periodically drop in-process buckets that have refilled completely
fn spawn_eviction(store: InMemoryBucketStore, resolver: Arc<PolicyResolver>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        return;
    };
    runtime.spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let idle_ms = resolver.snapshot().max_state_ttl().as_millis() as u64;
            let evicted = store.evict_idle(SystemTime::now(), idle_ms);
            if evicted > 0 {
                debug!(evicted, remaining = store.active_buckets(), "Evicted idle buckets");
            }
        }
    });
}

/// HTTP router: `/health` is open, every other route passes the gate
pub fn build_router(gate: Arc<AuthGate>, trust_forwarded_for: bool) -> Router {
    let state = GateLayerState {
        gate: Arc::clone(&gate),
        trust_forwarded_for,
    };

    let protected = Router::new()
        .route("/whoami", get(whoami))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state, auth_gate_middleware));

    Router::new()
        .route("/health", get(health))
        .with_state(gate)
        .merge(protected)
        .layer(middleware::from_fn(observability::request_id_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(observability::make_request_span))
}

async fn health(State(gate): State<Arc<AuthGate>>) -> impl IntoResponse {
    let limiter = gate.limiter();
    match limiter.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": limiter.store_name() })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check: bucket store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "store": limiter.store_name() })),
            )
        }
    }
}

async fn whoami(Extension(identity): Extension<CallerIdentity>) -> Json<CallerIdentity> {
    Json(identity)
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "NotFound", "status": 404 })),
    )
}

/// Build the gate and serve until ctrl-c
pub async fn init_server(config: AuthGateConfig, config_path: Option<PathBuf>) -> Result<()> {
    crate::metrics::register_metrics();

    info!("Starting authgate");
    let gate = Arc::new(build_gate(&config).await?);

    if config.hot_reload.enabled {
        if let Some(path) = config_path {
            hotreload::watch_config_file(path, Arc::clone(&gate), config.hot_reload.debounce_ms)
                .await?;
        }
    }

    let app = build_router(gate, config.server.trust_forwarded_for);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GateError::Io)?;

    info!(addr = %addr, "authgate ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GateError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
