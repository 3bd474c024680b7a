//! HTTP and WebSocket adapter for Crewbridge.
//!
//! Exposes [`Controller`](crewbridge_core::Controller) operations as
//! `POST /api/invoke/{command}` and session event streams as
//! `GET /ws/sessions/{session_id}`.

mod routes;
mod state;
mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

pub use routes::InvokeResponse;
pub use state::SharedState;

/// Build the router with all routes.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/invoke/{command}", post(routes::invoke_handler))
        .route("/ws/sessions/{session_id}", get(websocket::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Handle to a running HTTP server.
#[derive(Default)]
pub struct HttpServerHandle {
    addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl HttpServerHandle {
    /// Check if the server is running.
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stop the server gracefully and wait for it to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Bind to `host:port` and serve on the current tokio runtime.
///
/// Binding happens before this returns, so an occupied port is reported
/// here rather than logged from the background task.
pub async fn start(
    state: Arc<SharedState>,
    host: &str,
    port: u16,
) -> std::io::Result<HttpServerHandle> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse().map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("Invalid address: {}", e))
    })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("HTTP server listening on http://{}", local_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(state);
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
                log::info!("HTTP server shutting down");
            })
            .await;
        if let Err(e) = result {
            log::error!("HTTP server error: {}", e);
        }
    });

    Ok(HttpServerHandle {
        addr: Some(local_addr),
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

// ============================================================================
// TESTS
// ============================================================================
