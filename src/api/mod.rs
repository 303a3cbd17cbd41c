//! HTTP front: the control API and the hook endpoint.
//!
//! Two separate routers share one [`AppState`]:
//!
//! - the **control API** (`/v1/containers`, `/v1/images`) drives the
//!   container and image services;
//! - the **hook endpoint** (`/v1/hooks/droplet`) receives the curl
//!   callbacks the droplet executor fires at each OCI lifecycle stage,
//!   and is bound separately so it can sit on the host interface.
//!
//! Every response uses the `{status, message, data}` envelope with
//! `status` either `success` or `fail`. Validation errors map to 400,
//! everything else to 500.

mod containers;
mod hooks;
mod images;

use crate::constants::MAX_HOOK_BODY;
use crate::container::ContainerService;
use crate::error::Error;
use crate::hook::HookService;
use crate::image::ImageService;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Services shared with the handlers.
#[derive(Clone)]
pub struct AppState {
    /// Container lifecycle service.
    pub containers: Arc<ContainerService>,
    /// Image pull/remove service.
    pub images: Arc<ImageService>,
    /// Hook callback service.
    pub hooks: Arc<HookService>,
}

/// The response envelope every endpoint wraps its payload in.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    /// `success` or `fail`.
    pub status: &'static str,
    /// Human-readable outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Endpoint-specific payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub(crate) type ApiReply = (StatusCode, Json<ApiResponse>);

pub(crate) fn reply_success(message: impl Into<String>, data: Option<Value>) -> ApiReply {
    (
        StatusCode::OK,
        Json(ApiResponse {
            status: "success",
            message: Some(message.into()),
            data,
        }),
    )
}

pub(crate) fn reply_fail(code: StatusCode, message: impl Into<String>) -> ApiReply {
    (
        code,
        Json(ApiResponse {
            status: "fail",
            message: Some(message.into()),
            data: None,
        }),
    )
}

pub(crate) fn reply_error(err: Error) -> ApiReply {
    let code = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!(%err, status = code.as_u16(), "request failed");
    reply_fail(code, err.to_string())
}

/// The control API router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/containers", post(containers::create))
        .route(
            "/v1/containers/:container_id/actions/start",
            post(containers::start),
        )
        .route(
            "/v1/containers/:container_id/actions/stop",
            post(containers::stop),
        )
        .route(
            "/v1/containers/:container_id/actions/exec",
            post(containers::exec),
        )
        .route(
            "/v1/containers/:container_id/actions/delete",
            delete(containers::remove),
        )
        .route("/v1/images", post(images::pull))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The hook endpoint router, bound to the host interface.
pub fn hook_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/hooks/droplet", post(hooks::apply))
        .layer(DefaultBodyLimit::max(MAX_HOOK_BODY))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
