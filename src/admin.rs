//! Admin HTTP server
//!
//! Serves the operational endpoints on the admin port: `/healthz`,
//! `/version` and the Prometheus exposition at `/metrics`.

use std::future::Future;
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::PipedError;
use crate::version;

struct AdminState {
    prometheus: PrometheusHandle,
}

/// Start the admin server, returning its task handle.
pub async fn serve(
    port: u16,
    prometheus: PrometheusHandle,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PipedError>>, PipedError> {
    let state = Arc::new(AdminState { prometheus });
    let app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/version", get(version_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    info!("Starting admin server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PipedError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PipedError::ServerError(e.to_string()))
    });

    Ok(handle)
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn version_handler() -> String {
    version::get().version
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.prometheus.render()
}
