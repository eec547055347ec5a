//! Health surface for the notifier process
//!
//! `GET /health` probes the work queue, the notifier's only hard
//! dependency. 200 when reachable, 503 with an itemized `errors` array
//! otherwise.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use pixelpipe_common::queue::WorkQueue;

#[derive(Clone)]
pub struct HealthState {
    pub queue: Arc<dyn WorkQueue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    queue: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

/// Build the health router.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> Response {
    let mut errors = Vec::new();

    let queue = match state.queue.ping().await {
        Ok(()) => "connected",
        Err(e) => {
            warn!(error = %e, "Health probe: work queue unreachable");
            errors.push(format!("work queue: {}", e));
            "disconnected"
        },
    };

    let healthy = errors.is_empty();
    let report = HealthReport {
        status: if healthy { "healthy" } else { "unhealthy" },
        queue,
        errors,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(report)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use pixelpipe_common::queue::MemoryWorkQueue;

    #[tokio::test]
    async fn healthy_when_queue_responds() {
        let app = router(HealthState {
            queue: Arc::new(MemoryWorkQueue::new()),
        });

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["queue"], "connected");
    }
}
