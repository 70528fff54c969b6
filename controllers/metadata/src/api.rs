//! Metadata HTTP API.
//!
//! Serves the services of a pod from the bundle cache, plus liveness and
//! readiness endpoints.

use crate::bundle::BundleCache;
use crate::error::ControllerError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, trace};

/// Shared state of the API handlers.
#[derive(Debug, Clone)]
pub struct ApiState {
    /// Per-node bundles served by the metadata route
    pub bundles: BundleCache,
    /// Set once the controller's stores completed their initial listing
    pub ready: Arc<AtomicBool>,
}

/// Error payload of non-200 metadata responses
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}

/// Build the API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/metadata/{node}/{namespace}/{pod}", get(pod_metadata))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn pod_metadata(
    State(state): State<ApiState>,
    Path((node, namespace, pod)): Path<(String, String, String)>,
) -> Response {
    match state.bundles.pod_metadata_names(&node, &namespace, &pod) {
        Ok(Some(names)) => (StatusCode::OK, Json(names)).into_response(),
        Ok(None) => {
            trace!("No metadata for pod {}/{} on node {}", namespace, pod, node);
            error_response(
                StatusCode::NOT_FOUND,
                format!("no metadata found for the pod {namespace}/{pod} on the node {node}"),
            )
        }
        Err(e) => {
            error!("Could not read metadata of pod {}/{} on node {}: {}", namespace, pod, node, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ApiState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

/// Serve the API on `addr` until `cancel` fires.
pub async fn serve(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Api(format!("Failed to bind {addr}: {e}")))?;
    info!("Metadata API listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ControllerError::Api(e.to_string()))?;

    info!("Metadata API stopped");
    Ok(())
}
