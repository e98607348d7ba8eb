//! In-process HTTP fixtures standing in for monitored servers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn json_handler(State(payload): State<Value>) -> Json<Value> {
    Json(payload)
}

/// Serve a fixed JSON payload on every path, returning the base URL.
pub async fn serve_json(payload: Value) -> String {
    let app = Router::new()
        .route("/*path", get(json_handler))
        .with_state(payload);
    spawn(app).await
}

/// Serve a fixed non-JSON body with status 200 on every path.
pub async fn serve_text(body: &'static str) -> String {
    let app = Router::new().route("/*path", get(move || async move { body }));
    spawn(app).await
}

/// Answer 500 on every path.
pub async fn serve_error() -> String {
    let app = Router::new().route(
        "/*path",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    spawn(app).await
}

#[derive(Clone)]
struct FlakyState {
    payload: Value,
    failures_left: Arc<AtomicUsize>,
}

async fn flaky_handler(State(state): State<FlakyState>) -> Result<Json<Value>, StatusCode> {
    if state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Ok(Json(state.payload))
}

/// Fail the first `failures` requests with 500, then serve the payload.
pub async fn serve_failing_then(payload: Value, failures: usize) -> String {
    let app = Router::new()
        .route("/*path", get(flaky_handler))
        .with_state(FlakyState {
            payload,
            failures_left: Arc::new(AtomicUsize::new(failures)),
        });
    spawn(app).await
}
