//! Control-plane API: list streams, read statuses, enable/disable cameras
//! at runtime.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::media::{parse_output_type, StreamType, VerboseLevel};
use crate::registry::StreamRegistry;
use crate::source::Supervisor;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<StreamRegistry>,
    pub supervisor: Arc<Supervisor>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/list", get(list_streams))
        .route("/status", get(stream_statuses))
        .route("/enable_camera", post(enable_camera))
        .route("/disable_camera", post(disable_camera))
        .with_state(state)
}

async fn list_streams(State(state): State<ApiState>) -> Json<Vec<Uuid>> {
    Json(state.registry.all_ids())
}

async fn stream_statuses(State(state): State<ApiState>) -> Response {
    Json(state.registry.statuses()).into_response()
}

#[derive(Debug, Deserialize)]
struct EnableCameraRequest {
    guid: Uuid,
    url: String,
    #[serde(default)]
    output_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DisableCameraRequest {
    guid: Uuid,
}

async fn enable_camera(
    State(state): State<ApiState>,
    Json(request): Json<EnableCameraRequest>,
) -> Response {
    let mut outputs: Vec<StreamType> = Vec::with_capacity(request.output_types.len());
    for name in &request.output_types {
        match parse_output_type(name) {
            Ok(ty) => outputs.push(ty),
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
                    .into_response()
            }
        }
    }
    if state.registry.insert(
        request.guid,
        request.url.clone(),
        outputs,
        VerboseLevel::None,
    ) {
        tracing::info!(stream_id = %request.guid, url = %request.url, "camera enabled");
        Arc::clone(&state.supervisor).start_stream(request.guid);
    }
    Json(state.registry.statuses()).into_response()
}

async fn disable_camera(
    State(state): State<ApiState>,
    Json(request): Json<DisableCameraRequest>,
) -> Response {
    if state.registry.remove(request.guid) {
        tracing::info!(stream_id = %request.guid, "camera disabled");
    }
    Json(state.registry.statuses()).into_response()
}
