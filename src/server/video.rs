//! Video-facing HTTP server: WebSocket upgrades for MSE viewers and static
//! HLS files.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::registry::StreamRegistry;

use super::ws;

#[derive(Clone)]
pub struct VideoState {
    pub registry: Arc<StreamRegistry>,
    pub hls_directory: PathBuf,
}

pub fn router(state: VideoState) -> Router {
    Router::new()
        .route("/ws/:stream_id", get(upgrade_viewer))
        .route("/hls/:file", get(serve_hls_file))
        .with_state(state)
}

async fn upgrade_viewer(
    Path(stream_id): Path<String>,
    State(state): State<VideoState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| ws::serve_viewer(socket, state.registry, stream_id))
}

/// HLS files are only served when the name leads with a canonical stream
/// UUID; anything else is a bad request before the filesystem is touched.
async fn serve_hls_file(
    Path(file): Path<String>,
    State(state): State<VideoState>,
) -> Response {
    // `get` refuses short names and multibyte names where byte 36 is not a
    // char boundary.
    if !file
        .get(..36)
        .is_some_and(|prefix| Uuid::parse_str(prefix).is_ok())
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "not a valid stream UUID"})),
        )
            .into_response();
    }
    if file.contains('/') || file.contains("..") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid file name"})),
        )
            .into_response();
    }
    let content_type = if file.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if file.ends_with(".ts") {
        "video/mp2t"
    } else {
        "application/octet-stream"
    };
    match tokio::fs::read(state.hls_directory.join(&file)).await {
        Ok(data) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            data,
        )
            .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no such file: {file}")})),
        )
            .into_response(),
    }
}
