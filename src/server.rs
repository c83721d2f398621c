//! HTTP server for the Prometheus scrape endpoint.
//!
//! Thin wrapper over the metrics facade: `/metrics` renders the registry,
//! `/health` answers 200 while the process is alive, `/` points humans at
//! both.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::watch;
use tracing::{error, info};

use crate::metrics::Metrics;

#[derive(Clone)]
struct AppState {
    metrics: Metrics,
}

/// Bind and serve until shutdown. A bind failure propagates and is fatal.
pub async fn serve(
    listen_host: &str,
    listen_port: u16,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let state = AppState { metrics };

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = format!("{listen_host}:{listen_port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("metrics server listening on http://{addr}/metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    "Shelly Exporter\n\nEndpoints:\n  /metrics - Prometheus metrics\n  /health - Health check\n"
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => body.into_response(),
        Err(e) => {
            error!("failed to render metrics: {e}");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("error rendering metrics: {e}"),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}
