//! HTTP server with graceful shutdown

use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{error::Result, observability::shutdown_tracing, state::AppState};

const BODY_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Server instance
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server instance
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run the server with the given router
    pub async fn serve(self, app: Router) -> Result<()> {
        let config = self.state.config();
        let addr = SocketAddr::from(([127, 0, 0, 1], config.service.port));

        tracing::info!("Starting {} on {}", config.service.name, addr);

        // Layers are applied in reverse order (bottom layer is innermost).
        let app = app
            .layer(CorsLayer::permissive())
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(config.service.timeout_secs),
            ))
            .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Server listening on {}", addr);

        let state = self.state.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(state))
            .await?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Wait for SIGINT/SIGTERM, then stop background loops before the listener
/// drains.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }

    // Refresh scheduler and cache sweeper stop; captures get cancelled.
    state.begin_shutdown();
    shutdown_tracing();
}
