//! Image endpoints.

use super::{reply_error, reply_fail, reply_success, ApiReply, AppState};
use crate::image::PullRequest;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct PullImageRequest {
    image: String,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    arch: Option<String>,
}

pub(super) async fn pull(
    State(state): State<AppState>,
    payload: Result<Json<PullImageRequest>, JsonRejection>,
) -> ApiReply {
    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return reply_fail(StatusCode::BAD_REQUEST, format!("invalid json: {rejection}"));
        }
    };

    let image = request.image.clone();
    let pull = PullRequest {
        image: request.image,
        os: request.os,
        arch: request.arch,
    };

    match state.images.pull(pull).await {
        Ok(()) => reply_success("pull completed", Some(json!({ "image": image }))),
        Err(err) => reply_error(err),
    }
}
