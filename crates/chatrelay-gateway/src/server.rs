//! Gateway server: chat upgrade endpoint and health check

use crate::auth::{AuthGate, TokenVerifier};
use crate::hub::{Hub, HubHandle};
use crate::identity::HttpIdentityProvider;
use crate::ws::handle_connection;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chatrelay_core::{ConnectionLimits, GatewayConfig, TransportConfig};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for every connection.
pub struct GatewayState {
    pub hub: HubHandle,
    /// Key material and identity client, loaded once and shared.
    pub gate: Arc<AuthGate>,
    pub limits: ConnectionLimits,
    /// Upgrade sizing, applied per accepted socket.
    pub transport: TransportConfig,
    pub strict_decoding: bool,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(hub: HubHandle, gate: AuthGate, config: &GatewayConfig) -> Self {
        Self {
            hub,
            gate: Arc::new(gate),
            limits: config.limits.clone(),
            transport: config.transport.clone(),
            strict_decoding: config.strict_decoding,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/chat", get(chat_handler))
        .route("/health", get(health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any)),
        )
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: Arc<GatewayState>) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub async fn start_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    config.limits.validate()?;
    if config.identity_url.is_empty() {
        anyhow::bail!("identity provider URL not set");
    }

    let verifier = TokenVerifier::load(&config.public_key_path)?;
    let provider = HttpIdentityProvider::new(&config.identity_url, config.limits.identity_timeout)?;
    let gate = AuthGate::new(verifier, Arc::new(provider));
    let state = Arc::new(GatewayState::new(Hub::spawn(), gate, &config));

    info!("Chatrelay Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", config.listen);
    info!("  WebSocket: ws://{}/chat", config.listen);
    info!("  Profile: {}", config.profile);
    info!("  Identity provider: {}", config.identity_url);
    info!(
        "  Pong wait: {:?}, ping period: {:?}",
        config.limits.pong_wait, config.limits.ping_period
    );

    let listener = TcpListener::bind(config.listen).await?;
    serve(listener, state).await
}

async fn chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.limits.max_message_size)
        .max_frame_size(state.transport.max_frame_size)
        .read_buffer_size(state.transport.read_buffer_size)
        .write_buffer_size(state.transport.write_buffer_size)
        .max_write_buffer_size(state.transport.max_write_buffer_size)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let connections = state.hub.member_count().await;
    Json(serde_json::json!({
        "status": if connections.is_some() { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "connections": connections,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
