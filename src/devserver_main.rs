//! Trip chat development server.
//!
//! Serves the trip chat REST routes over an in-memory backend so the
//! `trip-chat` client can be exercised locally. State is lost on exit.
//!
//! Usage:
//!   TRIP_CHAT_DEV_PORT=8080 trip-chat-devserver
//!
//! Endpoints:
//!   GET  /api/trips/:trip_id/messages                   - thread snapshot
//!   POST /api/trips/:trip_id/messages                   - send message
//!   POST /api/trips/:trip_id/messages/:message_id/read  - mark read
//!
//! Auth: `Authorization: Bearer <user id>`.

use anyhow::Result;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;
use trip_chat_sync::{dev_server, ChatConfig, MemoryBackend};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trip_chat_sync=info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let config = ChatConfig::from_env();
    let backend = MemoryBackend::new();

    let app = dev_server::router(backend).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.dev_port));
    info!("Trip chat dev server listening on http://{}", addr);
    info!("Try: curl -H 'Authorization: Bearer driver' http://{}/api/trips/demo/messages", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
