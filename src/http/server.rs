//! HTTP server wiring and lifecycle.

use std::net::SocketAddr;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{Result, TurnstileError};

use super::middleware::{enforce_rate_limit, AppState};

/// Demo handler sitting behind the rate limiter.
async fn hello() -> &'static str {
    "Hello World"
}

/// Build the application router, with the admission gate in front of every
/// route (used by main and tests).
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ratelimit", get(hello))
        .layer(from_fn_with_state(state, enforce_rate_limit))
        .layer(TraceLayer::new_for_http())
}

/// HTTP server hosting the rate limited routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared middleware state
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// Serves until the provided signal resolves, then drains in-flight
    /// requests. The listener records each connection's peer address, which
    /// the admission middleware uses as the client identifier.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = build_router(self.state);

        info!(addr = %self.addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
