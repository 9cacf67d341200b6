//! Request admission middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::MockConnectInfo;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::ratelimit::BucketRegistry;

/// Shared state handed to the admission middleware.
#[derive(Clone)]
pub struct AppState {
    /// Registry of per-client token buckets.
    pub registry: Arc<BucketRegistry>,
}

/// Admission gate applied in front of every route.
///
/// The client identifier is the peer socket address as reported by the
/// listener (`host:port`). Identifiers are taken verbatim, so a client
/// reconnecting from a new source port is metered as a new client.
pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    // Same lookup the `ConnectInfo` extractor performs: the extension that
    // `into_make_service_with_connect_info` inserts takes precedence, then
    // the `MockConnectInfo` layer tests install.
    let Some(ConnectInfo(peer)) = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .copied()
        .or_else(|| {
            request
                .extensions()
                .get::<MockConnectInfo<SocketAddr>>()
                .map(|&MockConnectInfo(peer)| ConnectInfo(peer))
        })
    else {
        // Serving without connect info is a wiring bug; refuse rather than
        // hand out an unmetered pass.
        error!(
            uri = %request.uri(),
            "Peer address missing from request extensions, refusing request"
        );
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Unable to determine client address" })),
        )
            .into_response();
    };

    if !state.registry.check_rate_limit(&peer.to_string()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too many requests" })),
        )
            .into_response();
    }

    next.run(request).await
}
