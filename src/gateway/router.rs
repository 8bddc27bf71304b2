//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::gate::{TrustGate, trust_gate_middleware};
use crate::cert::ValidationCache;
use crate::forward::Dispatcher;
use crate::Result;

/// Shared application state
pub struct AppState {
    /// Upstream dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Client-certificate gate
    pub gate: Arc<TrustGate>,
    /// Verdict cache, shared with the gate
    pub cache: Arc<ValidationCache>,
}

/// Create the router
///
/// `/`, `/ping` and `/health` answer locally for `GET`; every other method and
/// path is forwarded upstream. The trust gate wraps all of it, so local routes
/// only skip verification when they are on the exclusion list.
pub fn create_router(state: Arc<AppState>) -> Router {
    let gate = Arc::clone(&state.gate);

    Router::new()
        .route("/", get(root_handler).fallback(proxy_handler))
        .route("/ping", get(ping_handler).fallback(proxy_handler))
        .route("/health", get(health_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .layer(middleware::from_fn_with_state(gate, trust_gate_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET / - load-balancer health check, empty 200
async fn root_handler() -> StatusCode {
    StatusCode::OK
}

/// GET /ping - liveness
async fn ping_handler() -> impl IntoResponse {
    Json(json!({ "active": true }))
}

/// GET /health - status, verification mode, upstream slots and cache counters
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "verification": if state.gate.is_enabled() { "enabled" } else { "disabled" },
        "targets": state.dispatcher.selector().len(),
        "upstream_slots_free": state.dispatcher.available_slots(),
        "cache": state.cache.stats(),
    }))
}

/// Everything else - forward upstream
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Result<Response> {
    state.dispatcher.forward(request).await
}
