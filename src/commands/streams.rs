//! Stream HTTP handlers
//!
//! Thin request/response glue over the supervisor.

use crate::encoder::PLAYLIST_FILE;
use crate::supervisor::{validate_stream_id, StreamListing, StreamSupervisor};
use crate::utils::{AppError, AppResult};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<StreamSupervisor>,
}

impl AppState {
    pub fn new(supervisor: Arc<StreamSupervisor>) -> Self {
        Self { supervisor }
    }
}

/// Body of `POST /stream/add/`
#[derive(Debug, Deserialize)]
pub struct AddStreamRequest {
    pub id: String,

    #[serde(alias = "source_url", alias = "sourceUrl")]
    pub rtsp_url: String,
}

/// Acknowledgement for mutating requests
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamListing>,
}

impl StatusResponse {
    fn success(stream: Option<StreamListing>) -> Self {
        Self {
            status: "success",
            stream,
        }
    }
}

/// Add a stream and start relaying it
pub async fn add_stream(
    State(state): State<AppState>,
    Json(request): Json<AddStreamRequest>,
) -> AppResult<Json<StatusResponse>> {
    tracing::info!("Add stream request: {} -> {}", request.id, request.rtsp_url);

    let listing = state
        .supervisor
        .add_stream(&request.id, &request.rtsp_url)
        .await?;

    Ok(Json(StatusResponse::success(Some(listing))))
}

/// Remove a stream; unknown ids succeed
pub async fn remove_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<StatusResponse> {
    state.supervisor.remove_stream(&id).await;
    Json(StatusResponse::success(None))
}

/// Registered streams keyed by id
pub async fn list_streams(State(state): State<AppState>) -> Json<BTreeMap<String, StreamListing>> {
    Json(state.supervisor.list_streams())
}

/// Serve a playlist or segment from a stream's output directory
pub async fn stream_artifact(
    State(state): State<AppState>,
    Path((id, file)): Path<(String, String)>,
) -> AppResult<Response> {
    validate_stream_id(&id)?;
    let content_type = artifact_content_type(&file)
        .ok_or_else(|| AppError::NotFound(format!("{}/{}", id, file)))?;

    let path = state.supervisor.output_dir(&id).join(&file);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!("{}/{}", id, file)));
        }
        Err(e) => return Err(e.into()),
    };

    let cache = if file == PLAYLIST_FILE || file.ends_with(".m3u8") {
        "no-cache"
    } else {
        "max-age=60"
    };

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, cache),
        ],
        bytes,
    )
        .into_response())
}

/// Content type for a servable artifact, `None` for anything else
fn artifact_content_type(file: &str) -> Option<&'static str> {
    if file.is_empty() || file.starts_with('.') || file.contains(['/', '\\']) {
        return None;
    }

    match file.rsplit_once('.').map(|(_, ext)| ext) {
        Some("m3u8") => Some("application/x-mpegURL"),
        Some("ts") => Some("video/mp2t"),
        _ => None,
    }
}
