//! REST surface for the browser client

pub mod api;
pub mod dto;
pub mod error;

pub use api::app_router;
pub use error::{ApiError, ApiResult};

use crate::engine::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub async fn serve(
    engine: Arc<Engine>,
    listen: SocketAddr,
    request_timeout: Duration,
) -> anyhow::Result<()> {
    let router = app_router(engine, request_timeout);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Could not listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
