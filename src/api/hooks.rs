//! The droplet hook endpoint.

use super::{reply_error, reply_fail, reply_success, ApiReply, AppState};
use crate::constants::HOOK_EVENT_HEADER;
use crate::hook::{DropletState, HookEvent};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use serde_json::json;

pub(super) async fn apply(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiReply {
    let event_name = headers
        .get(HOOK_EVENT_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let event: HookEvent = match event_name.parse() {
        Ok(event) => event,
        Err(err) => return reply_error(err),
    };

    let droplet_state: DropletState = match serde_json::from_slice(&body) {
        Ok(doc) => doc,
        Err(err) => {
            return reply_fail(StatusCode::BAD_REQUEST, format!("invalid json: {err}"));
        }
    };

    match state.hooks.apply(event, &droplet_state) {
        Ok(status) => reply_success(
            "hook applied",
            Some(json!({
                "containerId": droplet_state.id,
                "status": status.map(|s| s.to_string()),
            })),
        ),
        Err(err) => reply_error(err),
    }
}
