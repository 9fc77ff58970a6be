use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};

use crate::error::ThrottleError;
use crate::throttle::{ApiThrottler, BucketSnapshot};

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "api-throttle",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn all_buckets(State(throttler): State<Arc<ApiThrottler>>) -> Json<Vec<BucketSnapshot>> {
    Json(throttler.snapshot())
}

/// Read-only: an unknown name gets a 404 rather than a new bucket.
async fn one_bucket(
    State(throttler): State<Arc<ApiThrottler>>,
    Path(provider): Path<String>,
) -> Result<Json<BucketSnapshot>, (StatusCode, Json<Value>)> {
    throttler.peek(&provider).map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown_provider", "provider": provider })),
        )
    })
}

/// A timed-out acquisition is "busy, retry later", not a server fault.
impl IntoResponse for ThrottleError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": "service_busy",
            "provider": self.provider(),
            "message": self.to_string(),
        }));
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            body,
        )
            .into_response()
    }
}

pub fn router(throttler: Arc<ApiThrottler>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/throttle", get(all_buckets))
        .route("/throttle/{provider}", get(one_bucket))
        .with_state(throttler)
}

pub async fn run(bind: &str, throttler: Arc<ApiThrottler>) -> anyhow::Result<()> {
    let app = router(throttler);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("api-throttle gateway listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}
