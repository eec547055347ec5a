//! Health surface for the worker process
//!
//! A single `GET /health` endpoint reporting connectivity to the state
//! store and the work queue. Healthy dependencies yield 200; any failed
//! probe yields 503 with an itemized `errors` array so an operator can
//! see which dependency is down without reading logs.

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
use pixelpipe_common::store::ImageStore;

/// Dependencies probed by the health endpoint.
#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn ImageStore>,
    pub queue: Arc<dyn WorkQueue>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    store: &'static str,
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

    let store = match state.store.ping().await {
        Ok(()) => "connected",
        Err(e) => {
            warn!(error = %e, "Health probe: state store unreachable");
            errors.push(format!("state store: {}", e));
            "disconnected"
        },
    };

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
        store,
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
    use pixelpipe_common::store::MemoryImageStore;

    async fn request_health(state: HealthState) -> (StatusCode, serde_json::Value) {
        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthy_when_both_dependencies_respond() {
        let state = HealthState {
            store: Arc::new(MemoryImageStore::new()),
            queue: Arc::new(MemoryWorkQueue::new()),
        };

        let (status, body) = request_health(state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "connected");
        assert_eq!(body["queue"], "connected");
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn unhealthy_with_itemized_errors_when_store_fails() {
        let store = MemoryImageStore::new();
        store.set_fail_pings(true);
        let state = HealthState {
            store: Arc::new(store),
            queue: Arc::new(MemoryWorkQueue::new()),
        };

        let (status, body) = request_health(state).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["store"], "disconnected");
        assert_eq!(body["queue"], "connected");
        let errors = body["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].as_str().unwrap().starts_with("state store:"));
    }
}
