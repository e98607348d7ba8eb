//! Prometheus exposition endpoint.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{error, info};

/// Serve `/metrics` and `/healthz` until the shutdown signal fires.
pub async fn serve(
    listen_addr: &str,
    registry: Registry,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!(addr = %listen_addr, "Serving metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("Metrics server failed")?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// One scrape cycle. Gathering runs on the blocking pool because each
/// registered collector's collect phase drives its own fan-out of HTTP
/// requests to the monitored servers.
async fn metrics(State(registry): State<Registry>) -> Response {
    let encoded = tokio::task::spawn_blocking(move || {
        let families = registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        Ok::<_, anyhow::Error>(buf)
    })
    .await;

    match encoded {
        Ok(Ok(buf)) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buf).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(e) => {
            error!(error = %e, "Scrape task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metrics_endpoint_encodes_registry_content() {
        let registry = Registry::new();
        let gauge = prometheus::Gauge::new("up", "whether the exporter is up").unwrap();
        gauge.set(1.0);
        registry.register(Box::new(gauge)).unwrap();

        let resp = metrics(State(registry)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("up 1"));
    }

    #[tokio::test]
    async fn healthz_answers() {
        assert_eq!(healthz().await, "ok");
    }
}
