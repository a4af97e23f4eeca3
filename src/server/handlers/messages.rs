//! POST /v1/messages
//!
//! 请求流程：
//! 1. 解析 Anthropic 请求，映射目标模型
//! 2. 选择适配器并转换为 OpenRouter 请求
//! 3. 执行中间件 before_request
//! 4. 发送上游请求
//! 5. 流式：交给 StreamSession；非流式：转换完整响应

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;

use super::parse_body;
use crate::adapters::{select_adapter, Adapter};
use crate::error::ProxyError;
use crate::middleware::{NonStreamingResponseContext, RequestContext};
use crate::models::anthropic::MessagesRequest;
use crate::models::openai::{ChatCompletionRequest, ChatCompletionResponse};
use crate::server::AppState;
use crate::stream::{error_stream, generate_message_id, sse_response, StreamSession, StreamTranslator};
use crate::translator::{convert_messages_request, translate_response};

pub async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    let request: MessagesRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    match process(state, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn process(state: AppState, request: MessagesRequest) -> Result<Response, ProxyError> {
    let target = state.config.resolve_model(&request.model);
    let adapter = select_adapter(&target);
    tracing::info!(
        "[PROXY] /v1/messages: model={} -> {} stream={} messages={} tools={} adapter={}",
        request.model,
        target,
        request.stream,
        request.messages.len(),
        request.tools.as_ref().map_or(0, Vec::len),
        adapter.name()
    );

    let mut translated = convert_messages_request(&request, &target, &adapter)?.request;
    run_before_request(&state, &target, &mut translated).await;

    if request.stream {
        Ok(stream_messages(state, request, target, adapter, translated).await)
    } else {
        complete_messages(state, request, target, adapter, translated).await
    }
}

async fn run_before_request(state: &AppState, target: &str, request: &mut ChatCompletionRequest) {
    let stream = request.stream;
    let mut ctx = RequestContext {
        model_id: target,
        messages: &mut request.messages,
        tools: request.tools.as_mut(),
        stream,
    };
    state.middleware.before_request(&mut ctx).await;
}

/// 流式请求：上游失败时仍以 SSE 形式返回错误
async fn stream_messages(
    state: AppState,
    request: MessagesRequest,
    target: String,
    adapter: Adapter,
    translated: ChatCompletionRequest,
) -> Response {
    let estimate = state.estimator.estimate_request(&request, Some(&target));
    let translator = StreamTranslator::new(generate_message_id(), &request.model, estimate, adapter)
        .with_usage_file(state.usage_file.clone());

    let upstream = match state.upstream.send(&translated).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("[STREAM] 上游请求失败: {}", e);
            return sse_response(error_stream(translator, e.error_type(), &e.stream_message()));
        }
    };

    let keepalive = Duration::from_millis(state.config.streaming.keepalive_interval_ms);
    let session = StreamSession::new(translator, target, state.middleware.clone(), keepalive);
    sse_response(session.spawn(upstream.bytes_stream()))
}

async fn complete_messages(
    state: AppState,
    request: MessagesRequest,
    target: String,
    mut adapter: Adapter,
    translated: ChatCompletionRequest,
) -> Result<Response, ProxyError> {
    let upstream = state.upstream.send(&translated).await?;
    let completion: ChatCompletionResponse = upstream
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamTransport(format!("上游响应解析失败: {}", e)))?;

    let response = translate_response(&completion, &request.model, &mut adapter);
    let thought_signatures = adapter.take_thought_signatures();
    state
        .middleware
        .after_response(&NonStreamingResponseContext {
            model_id: &target,
            response: &completion,
            thought_signatures: &thought_signatures,
        })
        .await;

    state
        .usage_file
        .record(response.usage.input_tokens, response.usage.output_tokens);

    tracing::info!(
        "[PROXY] 非流式响应完成: blocks={} stop={:?} usage={}/{}",
        response.content.len(),
        response.stop_reason,
        response.usage.input_tokens,
        response.usage.output_tokens
    );
    Ok(Json(response).into_response())
}
