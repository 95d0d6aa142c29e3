//! HTTP command handlers
//!
//! Routes callers use to manage streams and to fetch their HLS output.

pub mod streams;

pub use streams::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

/// Build the application router
pub fn router(state: AppState) -> Router {
    // Players are usually served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/stream/add/", post(streams::add_stream))
        .route("/stream/remove/:id", post(streams::remove_stream))
        .route("/streams", get(streams::list_streams))
        .route("/stream/:id/:file", get(streams::stream_artifact))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryStore;
    use crate::supervisor::{FfmpegBackend, StreamSupervisor, SupervisorOptions};
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = StreamSupervisor::new(
            SupervisorOptions::new(dir.path().join("stream")),
            RegistryStore::new(dir.path().join("stream.json")),
            Arc::new(FfmpegBackend::new("ffmpeg", "ffprobe", Duration::from_secs(1))),
        )
        .unwrap();
        (dir, router(AppState::new(Arc::new(supervisor))))
    }

    #[tokio::test]
    async fn test_list_allows_any_origin() {
        let (_dir, app) = app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/streams")
                    .header(header::ORIGIN, "http://player.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn test_preflight_is_answered() {
        let (_dir, app) = app();

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/stream/add/")
                    .header(header::ORIGIN, "http://player.example")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }
}
