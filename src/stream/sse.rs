//! Anthropic SSE 帧构造
//!
//! 每个函数返回一个完整的 `event: X\ndata: {...}\n\n` 帧。

use serde_json::{json, Value};

use super::events::StopReason;

/// 下游流结束标记
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

fn frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

pub fn message_start(message_id: &str, model: &str, input_tokens: u32) -> String {
    frame(
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": Value::Null,
                "stop_sequence": Value::Null,
                "usage": {
                    "input_tokens": input_tokens,
                    "output_tokens": 1
                }
            }
        }),
    )
}

pub fn content_block_start_text(index: usize) -> String {
    frame(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "text", "text": "" }
        }),
    )
}

pub fn content_block_start_thinking(index: usize) -> String {
    frame(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": index,
            "content_block": { "type": "thinking", "thinking": "" }
        }),
    )
}

pub fn content_block_start_tool(index: usize, id: &str, name: &str) -> String {
    frame(
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": index,
            "content_block": {
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": {}
            }
        }),
    )
}

pub fn text_delta(index: usize, text: &str) -> String {
    frame(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "text_delta", "text": text }
        }),
    )
}

pub fn thinking_delta(index: usize, thinking: &str) -> String {
    frame(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "thinking_delta", "thinking": thinking }
        }),
    )
}

pub fn input_json_delta(index: usize, partial_json: &str) -> String {
    frame(
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": index,
            "delta": { "type": "input_json_delta", "partial_json": partial_json }
        }),
    )
}

pub fn content_block_stop(index: usize) -> String {
    frame(
        "content_block_stop",
        &json!({ "type": "content_block_stop", "index": index }),
    )
}

pub fn message_delta(stop_reason: &StopReason, input_tokens: u32, output_tokens: u32) -> String {
    frame(
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": stop_reason.to_anthropic_str(),
                "stop_sequence": Value::Null
            },
            "usage": {
                "input_tokens": input_tokens,
                "output_tokens": output_tokens
            }
        }),
    )
}

pub fn message_stop() -> String {
    frame("message_stop", &json!({ "type": "message_stop" }))
}

pub fn ping() -> String {
    frame("ping", &json!({ "type": "ping" }))
}

pub fn error(error_type: &str, message: &str) -> String {
    frame(
        "error",
        &json!({
            "type": "error",
            "error": { "type": error_type, "message": message }
        }),
    )
}
