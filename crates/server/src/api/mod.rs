use crate::config::{AppState, ServerConfig};
use crate::middleware::auth;
use anyhow::Result;
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use geoscope_mcp::protocol::JsonRpcResponse;
use geoscope_mcp::UserContext;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

const CACHE_STATUS_HEADER: &str = "x-cache-status";
const STALE_WARNING: &str = "110 geoscope \"Response is Stale\"";

/// Start the API server
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config)?;

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/mcp", post(mcp_endpoint))
        .layer(middleware::from_fn(auth::attach_user))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "geoscope",
        "version": env!("CARGO_PKG_VERSION"),
        "sessionId": state.dispatcher.session_id().to_string(),
        "activeRequests": state.dispatcher.active_requests().len(),
    }))
}

/// JSON-RPC over HTTP. The raw body goes to the dispatcher so malformed
/// JSON is answered with a protocol-level parse error.
async fn mcp_endpoint(
    State(state): State<Arc<AppState>>,
    user: Option<Extension<UserContext>>,
    body: String,
) -> Response {
    let user = user.map(|Extension(user)| user);

    match state.dispatcher.handle_raw(&body, user).await {
        // Notifications get no body
        None => StatusCode::ACCEPTED.into_response(),
        Some(response) => {
            let stale = is_degraded(&response);
            let mut http_response = Json(response).into_response();
            if stale {
                let headers = http_response.headers_mut();
                headers.insert(header::WARNING, HeaderValue::from_static(STALE_WARNING));
                headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static("stale"));
            }
            http_response
        }
    }
}

/// Whether the result was served from the stale cache
fn is_degraded(response: &JsonRpcResponse) -> bool {
    response
        .result
        .as_ref()
        .and_then(|result| result.get("_meta"))
        .and_then(|meta| meta.get("degraded"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}
