use anyhow::Result;
use axum::{
    extract::Extension,
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use bridge_core::config::ServerConfig;
use bridge_core::BridgeContext;
use bridge_session::SessionRegistry;
use bridge_watch::SubscriptionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing;

use crate::handlers;

/// Everything the handlers read. Shared through an `Extension` layer.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: BridgeContext,
    pub registry: Arc<SessionRegistry>,
    pub subscriptions: Arc<SubscriptionManager>,
}

pub fn router(state: ApiState) -> Router {
    let cors_layer = cors_layer(&state.ctx.config.server);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/sessions", get(handlers::list_sessions))
        .route(
            "/api/v1/sessions/:tenant_id",
            get(handlers::get_session).post(handlers::request_session),
        )
        .route(
            "/api/v1/sessions/:tenant_id/inbound",
            get(handlers::list_inbound),
        )
        .route("/api/v1/messages", post(handlers::send_message))
        .route("/api/v1/subscriptions", get(handlers::subscription_stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(Extension(state))
                .layer(cors_layer),
        )
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.cors_origins.is_empty() {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS");
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serves the API until `shutdown` is cancelled.
pub async fn run(state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let server = &state.ctx.config.server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.api_port).parse()?;
    let app = router(state);

    tracing::info!("Starting API server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
