//! Freespeak relay.
//!
//! The relay:
//! 1. Maps short peer ids to live WebSocket connections
//! 2. Forwards handshake and message frames between them verbatim
//! 3. Never holds key material beyond registered public keys

#![forbid(unsafe_code)]

pub mod config;
pub mod registry;
pub mod router;
pub mod signal;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

pub use config::{Args, RelayConfig};
pub use registry::{Registry, SharedRegistry};
pub use router::{Connection, RouteError};

#[derive(Clone)]
pub struct RelayState {
    pub registry: SharedRegistry,
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Registry::shared(),
            config: Arc::new(config),
        }
    }
}

impl axum::extract::FromRef<RelayState> for SharedRegistry {
    fn from_ref(state: &RelayState) -> Self {
        state.registry.clone()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    registered: usize,
}

async fn health(State(registry): State<SharedRegistry>) -> Json<Health> {
    let registered = registry.read().await.len();
    Json(Health {
        status: "ok",
        registered,
    })
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/", get(|| async { "Freespeak Relay Online" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = app(RelayState::new(config));
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
