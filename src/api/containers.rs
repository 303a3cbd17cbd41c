//! Container endpoints.

use super::{reply_error, reply_fail, reply_success, ApiReply, AppState};
use crate::container::CreateRequest;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct CreateContainerRequest {
    image: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    port: Vec<String>,
    #[serde(default)]
    mount: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct StartContainerRequest {
    #[serde(default)]
    interactive: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ExecContainerRequest {
    command: Vec<String>,
}

pub(super) async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CreateContainerRequest>, JsonRejection>,
) -> ApiReply {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return reply_fail(StatusCode::BAD_REQUEST, format!("invalid json: {rejection}"));
        }
    };

    let create = CreateRequest {
        image: request.image,
        command: request.command,
        port: request.port,
        mount: request.mount,
    };

    match state.containers.create(create).await {
        Ok(container_id) => reply_success(
            "container created",
            Some(json!({ "containerId": container_id })),
        ),
        Err(err) => reply_error(err),
    }
}

pub(super) async fn start(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    payload: Option<Json<StartContainerRequest>>,
) -> ApiReply {
    let request = payload.map(|Json(body)| body).unwrap_or_default();

    match state.containers.start(&container_id, request.interactive).await {
        Ok(container_id) => reply_success(
            "container started",
            Some(json!({ "containerId": container_id })),
        ),
        Err(err) => reply_error(err),
    }
}

pub(super) async fn stop(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiReply {
    match state.containers.stop(&container_id).await {
        Ok(container_id) => reply_success(
            "container stopped",
            Some(json!({ "containerId": container_id })),
        ),
        Err(err) => reply_error(err),
    }
}

pub(super) async fn exec(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    payload: Result<Json<ExecContainerRequest>, JsonRejection>,
) -> ApiReply {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return reply_fail(StatusCode::BAD_REQUEST, format!("invalid json: {rejection}"));
        }
    };

    match state.containers.exec(&container_id, &request.command).await {
        Ok(container_id) => reply_success(
            "exec completed",
            Some(json!({ "containerId": container_id })),
        ),
        Err(err) => reply_error(err),
    }
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> ApiReply {
    match state.containers.delete(&container_id).await {
        Ok(container_id) => reply_success(
            "container deleted",
            Some(json!({ "containerId": container_id })),
        ),
        Err(err) => reply_error(err),
    }
}
