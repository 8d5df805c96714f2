//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::error::ExpositionError;
use crate::registry::SharedRegistry;
use crate::supervisor::wait_for_shutdown;

/// Liveness probe path.
pub const HEALTH_PATH: &str = "/health";
/// Readiness probe path.
pub const READY_PATH: &str = "/ready";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
}

/// Create the HTTP router.
pub fn create_router(registry: SharedRegistry, metrics_path: &str) -> Router {
    let state = AppState { registry };

    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route(HEALTH_PATH, get(health_handler))
        .route(READY_PATH, get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = state.registry.render();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Ready once any target has completed a cycle.
async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.registry.has_successful_poll() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready - no target polled successfully yet\n",
        )
            .into_response()
    }
}

/// HTTP server configuration.
pub struct HttpServer {
    registry: SharedRegistry,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(registry: SharedRegistry, listen_addr: SocketAddr, metrics_path: String) -> Self {
        Self {
            registry,
            listen_addr,
            metrics_path,
        }
    }

    /// Bind the listening socket.
    pub async fn bind(self) -> Result<BoundHttpServer, ExpositionError> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| ExpositionError::Bind {
                addr: self.listen_addr,
                source,
            })?;

        let local_addr = listener.local_addr().map_err(ExpositionError::Serve)?;

        info!(
            addr = %local_addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        Ok(BoundHttpServer {
            router: create_router(self.registry, &self.metrics_path),
            listener,
            local_addr,
        })
    }
}

/// An HTTP server with its socket bound.
pub struct BoundHttpServer {
    router: Router,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundHttpServer {
    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve requests until the shutdown signal is received.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ExpositionError> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                wait_for_shutdown(&mut shutdown).await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(ExpositionError::Serve)?;

        info!("HTTP server stopped");
        Ok(())
    }
}
