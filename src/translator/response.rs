//! OpenRouter 非流式响应转换为 Anthropic 响应
//!
//! 内容块顺序：思考 → 文本 → 工具调用（适配器提取的在前，原生的在后）。

use serde_json::{json, Value};
use std::collections::HashSet;

use crate::adapters::Adapter;
use crate::models::anthropic::{MessagesResponse, ResponseContentBlock, Usage};
use crate::models::openai::{ChatCompletionResponse, ToolCall};
use crate::stream::events::{generate_message_id, generate_tool_use_id, StopReason};

/// 转换整个响应
///
/// `requested_model` 是客户端请求时使用的模型名，原样回显。
pub fn translate_response(
    response: &ChatCompletionResponse,
    requested_model: &str,
    adapter: &mut Adapter,
) -> MessagesResponse {
    let mut content = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut finish_reason = None;

    if let Some(choice) = response.choices.first() {
        let message = &choice.message;
        finish_reason = choice.finish_reason.as_deref();

        if let Some(details) = &message.reasoning_details {
            adapter.observe_reasoning_details(details);
        }

        if let Some(reasoning) = message.reasoning.as_deref().filter(|r| !r.is_empty()) {
            content.push(ResponseContentBlock::Thinking {
                thinking: reasoning.to_string(),
                signature: String::new(),
            });
        }

        if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
            let mut result = adapter.process_text_content(text);
            let rest = adapter.flush();
            result.cleaned_text.push_str(&rest.cleaned_text);
            result.extracted_tool_calls.extend(rest.extracted_tool_calls);

            if !result.cleaned_text.trim().is_empty() {
                content.push(ResponseContentBlock::Text {
                    text: result.cleaned_text,
                });
            }
            for call in result.extracted_tool_calls {
                content.push(ResponseContentBlock::ToolUse {
                    id: unique_id(&mut seen_ids, Some(&call.id)),
                    name: call.name,
                    input: call.arguments,
                });
            }
        }

        let mut renamed = Vec::new();
        for call in message.tool_calls.iter().flatten() {
            let id = unique_id(&mut seen_ids, Some(&call.id));
            if id != call.id {
                renamed.push((call.id.as_str(), id.clone()));
            }
            content.push(ResponseContentBlock::ToolUse {
                id,
                name: call.function.name.clone(),
                input: parse_arguments(call),
            });
        }
        adapter.alias_thought_signatures(
            renamed
                .iter()
                .map(|(upstream, emitted)| (*upstream, emitted.as_str())),
        );
    }

    let has_tool_use = content
        .iter()
        .any(|b| matches!(b, ResponseContentBlock::ToolUse { .. }));

    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = if has_tool_use {
        StopReason::ToolUse
    } else {
        StopReason::from_finish_reason(finish_reason.unwrap_or("stop"))
    };

    let usage = response
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: response
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_message_id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: requested_model.to_string(),
        content,
        stop_reason: Some(stop_reason.to_anthropic_str().to_string()),
        stop_sequence: None,
        usage,
    }
}

/// 解析工具参数；非法 JSON 记录警告并使用空对象
fn parse_arguments(call: &ToolCall) -> Value {
    let raw = call.function.arguments.trim();
    if raw.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value) if value.is_object() => value,
        Ok(other) => {
            tracing::warn!(
                "[TRANSLATOR] 工具 {} 的参数不是对象: {}",
                call.function.name,
                other
            );
            json!({})
        }
        Err(e) => {
            tracing::warn!(
                "[TRANSLATOR] 工具 {} 的参数解析失败: {} - {}",
                call.function.name,
                e,
                raw
            );
            json!({})
        }
    }
}

fn unique_id(seen: &mut HashSet<String>, candidate: Option<&str>) -> String {
    let base = candidate
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_tool_use_id);
    let mut id = base.clone();
    let mut suffix = 1;
    while !seen.insert(id.clone()) {
        id = format!("{}_{}", base, suffix);
        suffix += 1;
    }
    id
}
