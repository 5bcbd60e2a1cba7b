//! Prometheus scrape endpoint.

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{MaildirError, Result};
use crate::sink::PrometheusSink;

/// Router serving the sink's registry at `metrics_path`.
pub fn router(metrics_path: &str, sink: PrometheusSink) -> Router {
    Router::new()
        .route(metrics_path, get(metrics))
        .with_state(sink)
}

async fn metrics(State(sink): State<PrometheusSink>) -> Response {
    match sink.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve metrics on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    metrics_path: &str,
    sink: PrometheusSink,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, path = %metrics_path, "serving metrics");
    }
    axum::serve(listener, router(metrics_path, sink))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| MaildirError::Server(e.to_string()))
}
