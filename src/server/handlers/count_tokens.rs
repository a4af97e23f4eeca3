//! POST /v1/messages/count_tokens

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::parse_body;
use crate::models::anthropic::{CountTokensRequest, CountTokensResponse};
use crate::server::AppState;

/// 本地估算，不访问上游
pub async fn handle_count_tokens(State(state): State<AppState>, body: Bytes) -> Response {
    let request: CountTokensRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let target = state.config.resolve_model(&request.model);
    let input_tokens = state
        .estimator
        .estimate_count_request(&request, Some(&target));
    tracing::debug!(
        "[PROXY] count_tokens: model={} target={} tokens={}",
        request.model,
        target,
        input_tokens
    );

    Json(CountTokensResponse { input_tokens }).into_response()
}
