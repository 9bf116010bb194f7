//! HTTP server lifecycle.
//!
//! Binds the API router and serves it until the cancellation token fires,
//! then drains in-flight requests.

use crate::api::{self, AppState};
use crate::error::AppError;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

/// Handle to a running server.
pub struct ServerHandle {
    cancel_token: CancellationToken,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address actually bound (useful when listening on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for the server task to finish.
    pub async fn shutdown(self) {
        log::info!("Stopping server on {}", self.local_addr);
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            log::error!("Server task failed: {}", e);
        }
    }
}

/// Start serving the API on `addr`.
pub async fn start(
    addr: SocketAddr,
    state: AppState,
    cancel_token: CancellationToken,
) -> Result<ServerHandle, AppError> {
    let app = api::router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::internal(format!("Failed to bind to {}: {}", addr, e)))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| AppError::internal(format!("Failed to read bound address: {}", e)))?;

    log::info!("Server listening on http://{}", local_addr);

    let shutdown = cancel_token.clone();
    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        });

        if let Err(e) = server.await {
            log::error!("Server error: {}", e);
        }

        log::info!("Server stopped");
    });

    Ok(ServerHandle {
        cancel_token,
        local_addr,
        task,
    })
}
