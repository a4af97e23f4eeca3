//! 健康检查与服务信息

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "model": state.config.display_model(),
        "port": state.config.server.port,
    }))
}

pub async fn service_info(State(state): State<AppState>) -> Json<Value> {
    let models = &state.config.models;
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "upstream": state.upstream.url(),
        "models": {
            "default": models.default,
            "opus": models.opus,
            "sonnet": models.sonnet,
            "haiku": models.haiku,
            "subagent": models.subagent,
        },
        "endpoints": [
            "POST /v1/messages",
            "POST /v1/messages/count_tokens",
            "GET /health",
        ],
    }))
}
