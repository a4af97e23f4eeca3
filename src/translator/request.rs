//! Anthropic 请求转换为 OpenRouter (OpenAI Chat Completions) 请求
//!
//! - system 提示词：拼接文本块，改写身份声明，追加身份说明
//! - user 消息中的 tool_result 拆分为独立的 tool 消息
//! - assistant 消息中的 tool_use 转为 tool_calls
//! - 图片转为 data URI
//! - 思考预算交给适配器重映射，默认丢弃

use serde_json::{json, Map, Value};
use std::collections::HashSet;

use super::identity::rewrite_system_prompt;
use super::traits::{RequestTranslator, TranslateError};
use crate::adapters::{Adapter, THINKING_KEY};
use crate::models::anthropic::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, Role, SystemPrompt,
    Tool, ToolChoice, ToolResultContent,
};
use crate::models::openai::{
    ChatCompletionRequest, ChatContent, ChatMessage, ContentPart, FunctionDefinition, ImageUrl,
    ToolCall, ToolDefinition,
};

/// 上游允许的最小 max_tokens
pub const MIN_MAX_TOKENS: u32 = 16;

/// 上游没有对应物的内置批处理工具
pub const BATCH_TOOL_NAME: &str = "BatchTool";

/// 转换结果
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub request: ChatCompletionRequest,
    /// 没有对应参数而被丢弃的字段
    pub dropped: Vec<String>,
}

/// Anthropic → OpenRouter 请求转换器
pub struct AnthropicToOpenRouter<'a> {
    target_model: &'a str,
    adapter: &'a Adapter,
}

impl<'a> AnthropicToOpenRouter<'a> {
    pub fn new(target_model: &'a str, adapter: &'a Adapter) -> Self {
        Self {
            target_model,
            adapter,
        }
    }
}

impl<'a> RequestTranslator for AnthropicToOpenRouter<'a> {
    type Input = &'a MessagesRequest;
    type Output = TranslatedRequest;
    type Error = TranslateError;

    fn translate_request(&self, request: Self::Input) -> Result<Self::Output, Self::Error> {
        convert_messages_request(request, self.target_model, self.adapter)
    }
}

/// 转换整个请求
pub fn convert_messages_request(
    request: &MessagesRequest,
    target_model: &str,
    adapter: &Adapter,
) -> Result<TranslatedRequest, TranslateError> {
    if request.messages.is_empty() {
        return Err(TranslateError::missing_field("messages"));
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        let text = extract_system_text(system);
        messages.push(ChatMessage::system(rewrite_system_prompt(&text)));
    }
    for message in &request.messages {
        convert_message(message, &mut messages)?;
    }

    let tools = convert_tools(request.tools.as_deref());
    let tool_choice = convert_tool_choice(request.tool_choice.as_ref(), tools.is_some());

    let mut extra = Map::new();
    if request.stream {
        // 让 OpenRouter 在流末尾附带 usage
        extra.insert("usage".to_string(), json!({ "include": true }));
    }

    let mut dropped = Vec::new();
    if let Some(budget) = request.thinking_budget() {
        extra.insert(
            THINKING_KEY.to_string(),
            json!({ "type": "enabled", "budget_tokens": budget }),
        );
    } else if request.thinking.is_some() {
        dropped.push("thinking".to_string());
    }
    if request.top_k.is_some() {
        dropped.push("top_k".to_string());
    }
    if request.metadata.is_some() {
        dropped.push("metadata".to_string());
    }

    let mut out = ChatCompletionRequest {
        model: target_model.to_string(),
        messages,
        max_tokens: request.max_tokens.map(|t| t.max(MIN_MAX_TOKENS)),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone().filter(|s| !s.is_empty()),
        stream: request.stream,
        tools,
        tool_choice,
        extra,
    };

    adapter.prepare_request(&mut out);

    // 适配器未消费的思考配置直接丢弃
    if out.extra.remove(THINKING_KEY).is_some() {
        dropped.push("thinking".to_string());
    }

    if !dropped.is_empty() {
        tracing::debug!(
            "[TRANSLATE] 丢弃无对应的参数: {:?} (adapter={})",
            dropped,
            adapter.name()
        );
    }

    Ok(TranslatedRequest {
        request: out,
        dropped,
    })
}

/// 提取 system 文本（块列表按换行拼接）
pub fn extract_system_text(system: &SystemPrompt) -> String {
    match system {
        SystemPrompt::Text(text) => text.clone(),
        SystemPrompt::Blocks(blocks) => join_text_blocks(blocks),
    }
}

fn join_text_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn convert_message(message: &Message, out: &mut Vec<ChatMessage>) -> Result<(), TranslateError> {
    match (message.role, &message.content) {
        (Role::System, MessageContent::Text(text)) => out.push(ChatMessage::system(text.clone())),
        (Role::System, MessageContent::Blocks(blocks)) => {
            out.push(ChatMessage::system(join_text_blocks(blocks)))
        }
        (Role::User, MessageContent::Text(text)) => {
            out.push(ChatMessage::user(ChatContent::Text(text.clone())))
        }
        (Role::User, MessageContent::Blocks(blocks)) => convert_user_blocks(blocks, out)?,
        (Role::Assistant, MessageContent::Text(text)) => {
            out.push(ChatMessage::assistant(Some(text.clone()), Vec::new()))
        }
        (Role::Assistant, MessageContent::Blocks(blocks)) => {
            out.push(convert_assistant_blocks(blocks))
        }
    }
    Ok(())
}

/// user 内容块：tool_result 拆分为 tool 消息，剩余文本/图片合成一条 user 消息
fn convert_user_blocks(
    blocks: &[ContentBlock],
    out: &mut Vec<ChatMessage>,
) -> Result<(), TranslateError> {
    let mut seen_results = HashSet::new();
    let mut parts = Vec::new();
    let mut has_image = false;

    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if !seen_results.insert(tool_use_id.as_str()) {
                    tracing::warn!("[TRANSLATE] 跳过重复的 tool_result: {}", tool_use_id);
                    continue;
                }
                let mut text = tool_result_text(content.as_ref());
                if *is_error == Some(true) {
                    text = format!("Error: {}", text);
                }
                out.push(ChatMessage::tool(tool_use_id.clone(), text));
            }
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => {
                parts.push(image_part(source)?);
                has_image = true;
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        return Ok(());
    }

    let content = if has_image {
        ChatContent::Parts(parts)
    } else {
        ChatContent::Text(
            parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        )
    };
    out.push(ChatMessage::user(content));
    Ok(())
}

/// assistant 内容块：文本拼接，tool_use 转为 tool_calls（跳过重复 ID）
fn convert_assistant_blocks(blocks: &[ContentBlock]) -> ChatMessage {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut seen_ids = HashSet::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => texts.push(text.as_str()),
            ContentBlock::ToolUse { id, name, input } => {
                if !seen_ids.insert(id.as_str()) {
                    tracing::warn!("[TRANSLATE] 跳过重复的 tool_use: {}", id);
                    continue;
                }
                let arguments = if input.is_null() {
                    "{}".to_string()
                } else {
                    input.to_string()
                };
                tool_calls.push(ToolCall::function(id.clone(), name.clone(), arguments));
            }
            // 历史中的思考内容不回传
            _ => {}
        }
    }

    let text = texts.join("\n");
    let content = if text.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(text)
    };
    ChatMessage::assistant(content, tool_calls)
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => join_text_blocks(blocks),
    }
}

fn image_part(source: &ImageSource) -> Result<ContentPart, TranslateError> {
    let url = match source.source_type.as_str() {
        "url" => source
            .url
            .clone()
            .ok_or_else(|| TranslateError::missing_field("image.source.url"))?,
        // 缺省按 base64 处理
        "base64" | "" => {
            if source.data.is_empty() {
                return Err(TranslateError::missing_field("image.source.data"));
            }
            if source.media_type.is_empty() {
                return Err(TranslateError::missing_field("image.source.media_type"));
            }
            format!("data:{};base64,{}", source.media_type, source.data)
        }
        other => {
            return Err(TranslateError::unsupported(&format!(
                "image source type {}",
                other
            )))
        }
    };
    Ok(ContentPart::ImageUrl {
        image_url: ImageUrl { url },
    })
}

fn convert_tools(tools: Option<&[Tool]>) -> Option<Vec<ToolDefinition>> {
    let definitions: Vec<ToolDefinition> = tools?
        .iter()
        .filter(|t| t.name != BATCH_TOOL_NAME)
        .map(|t| ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: sanitize_schema(&t.input_schema),
            },
        })
        .collect();

    if definitions.is_empty() {
        None
    } else {
        Some(definitions)
    }
}

/// 清理工具 schema：缺省时补空对象，递归移除 `format: "uri"`
pub fn sanitize_schema(schema: &Value) -> Value {
    if schema.is_null() {
        return json!({ "type": "object", "properties": {} });
    }
    let mut cleaned = schema.clone();
    strip_uri_format(&mut cleaned);
    cleaned
}

fn strip_uri_format(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("format").and_then(Value::as_str) == Some("uri") {
                map.remove("format");
            }
            for child in map.values_mut() {
                strip_uri_format(child);
            }
        }
        Value::Array(items) => {
            for child in items {
                strip_uri_format(child);
            }
        }
        _ => {}
    }
}

fn convert_tool_choice(choice: Option<&ToolChoice>, has_tools: bool) -> Option<Value> {
    if !has_tools {
        return None;
    }
    let value = match choice {
        None | Some(ToolChoice::Auto) => json!("auto"),
        Some(ToolChoice::Any) => json!("required"),
        Some(ToolChoice::Tool { name }) => json!({
            "type": "function",
            "function": { "name": name }
        }),
        Some(ToolChoice::None) => json!("none"),
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::select_adapter;
    use crate::translator::identity::IDENTITY_INSTRUCTION;
    use crate::translator::TranslateErrorKind;

    fn parse(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    fn translate(value: Value) -> TranslatedRequest {
        let request = parse(value);
        convert_messages_request(&request, "openai/gpt-5", &Adapter::default()).unwrap()
    }

    #[test]
    fn test_simple_text_message() {
        let out = translate(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(out.request.model, "openai/gpt-5");
        assert_eq!(out.request.messages.len(), 1);
        assert_eq!(out.request.messages[0].role, "user");
        assert_eq!(out.request.messages[0].text(), "hi");
        assert_eq!(out.request.max_tokens, Some(1024));
        assert!(out.request.tools.is_none());
        assert!(out.request.tool_choice.is_none());
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn test_system_blocks_joined_and_rewritten() {
        let out = translate(json!({
            "model": "claude",
            "system": [
                {"type": "text", "text": "You are Claude Code, Anthropic's official CLI for Claude."},
                {"type": "text", "text": "Be brief."}
            ],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let system = out.request.messages[0].text();
        assert_eq!(out.request.messages[0].role, "system");
        assert!(system.starts_with("This is Claude Code, an AI-powered CLI tool."));
        assert!(system.contains("\nBe brief."));
        assert!(system.ends_with(IDENTITY_INSTRUCTION));
    }

    #[test]
    fn test_max_tokens_floor() {
        let out = translate(json!({
            "model": "claude",
            "max_tokens": 1,
            "temperature": 0.2,
            "top_p": 0.9,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert_eq!(out.request.max_tokens, Some(MIN_MAX_TOKENS));
        assert_eq!(out.request.temperature, Some(0.2));
        assert_eq!(out.request.top_p, Some(0.9));
    }

    #[test]
    fn test_image_and_text_preserve_order() {
        let out = translate(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "iVBORw0KGgo="}},
                {"type": "text", "text": "What is this?"}
            ]}]
        }));
        let content = out.request.messages[0].content.clone().unwrap();
        match content {
            ChatContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(
                    parts[0],
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,iVBORw0KGgo=".to_string()
                        }
                    }
                );
                assert_eq!(
                    parts[1],
                    ContentPart::Text {
                        text: "What is this?".to_string()
                    }
                );
            }
            other => panic!("expected parts, got {:?}", other),
        }
    }

    #[test]
    fn test_image_without_data_is_rejected() {
        let request = parse(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "base64", "media_type": "image/png"}}
            ]}]
        }));
        let err = convert_messages_request(&request, "m", &Adapter::default()).unwrap_err();
        assert!(err.message.contains("image.source.data"));
    }

    #[test]
    fn test_image_source_kinds() {
        let out = translate(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "url", "url": "https://example.com/a.png"}}
            ]}]
        }));
        match out.request.messages[0].content.clone().unwrap() {
            ChatContent::Parts(parts) => assert_eq!(
                parts[0],
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: "https://example.com/a.png".to_string()
                    }
                }
            ),
            other => panic!("expected parts, got {:?}", other),
        }

        let request = parse(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "file", "file_id": "file_1"}}
            ]}]
        }));
        let err = convert_messages_request(&request, "m", &Adapter::default()).unwrap_err();
        assert_eq!(err.kind, TranslateErrorKind::UnsupportedFeature);
        assert!(err.message.contains("image source type file"));
    }

    #[test]
    fn test_tool_result_only_turn() {
        let out = translate(json!({
            "model": "claude",
            "messages": [
                {"role": "user", "content": "read it"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {"file_path": "/a"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "file body"},
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "duplicate"}
                ]}
            ]
        }));
        let messages = &out.request.messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2].role, "tool");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("toolu_1"));
        assert_eq!(messages[2].text(), "file body");
    }

    #[test]
    fn test_tool_result_followed_by_text() {
        let out = translate(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "a", "content": [{"type": "text", "text": "x"}], "is_error": true},
                {"type": "tool_result", "tool_use_id": "b"},
                {"type": "text", "text": "continue"}
            ]}]
        }));
        let messages = &out.request.messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), "Error: x");
        assert_eq!(messages[1].tool_call_id.as_deref(), Some("b"));
        assert_eq!(messages[2].role, "user");
        assert_eq!(messages[2].content, Some(ChatContent::Text("continue".to_string())));
    }

    #[test]
    fn test_assistant_tool_use_dedup_and_null_content() {
        let out = translate(json!({
            "model": "claude",
            "messages": [{"role": "assistant", "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "s"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}},
                {"type": "tool_use", "id": "t2", "name": "Glob"}
            ]}]
        }));
        let message = &out.request.messages[0];
        assert!(message.content.is_none());
        let calls = message.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.arguments, r#"{"command":"ls"}"#);
        assert_eq!(calls[1].function.arguments, "{}");
    }

    #[test]
    fn test_tools_filtered_and_sanitized() {
        let out = translate(json!({
            "model": "claude",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"name": "BatchTool", "input_schema": {"type": "object"}},
                {"name": "WebFetch", "description": "fetch", "input_schema": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "format": "uri"},
                        "format": {"type": "string"},
                        "links": {"type": "array", "items": {"type": "string", "format": "uri"}}
                    }
                }}
            ]
        }));
        let tools = out.request.tools.unwrap();
        assert_eq!(tools.len(), 1);
        let params = &tools[0].function.parameters;
        assert!(params["properties"]["url"].get("format").is_none());
        assert!(params["properties"]["links"]["items"].get("format").is_none());
        assert_eq!(params["properties"]["format"]["type"], "string");
        assert_eq!(out.request.tool_choice, Some(json!("auto")));
    }

    #[test]
    fn test_tool_choice_mapping() {
        let tools = vec![Tool {
            name: "Bash".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }];
        let defs = convert_tools(Some(tools.as_slice()));
        assert!(defs.is_some());
        assert_eq!(
            convert_tool_choice(Some(&ToolChoice::Any), true),
            Some(json!("required"))
        );
        assert_eq!(
            convert_tool_choice(
                Some(&ToolChoice::Tool {
                    name: "Bash".to_string()
                }),
                true
            ),
            Some(json!({"type": "function", "function": {"name": "Bash"}}))
        );
        assert_eq!(convert_tool_choice(Some(&ToolChoice::Auto), false), None);
    }

    #[test]
    fn test_thinking_dropped_by_default_adapter() {
        let out = translate(json!({
            "model": "claude",
            "stream": true,
            "top_k": 5,
            "thinking": {"type": "enabled", "budget_tokens": 10000},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(!out.request.extra.contains_key(THINKING_KEY));
        assert!(out.dropped.contains(&"thinking".to_string()));
        assert!(out.dropped.contains(&"top_k".to_string()));
        assert_eq!(out.request.extra["usage"], json!({"include": true}));
    }

    #[test]
    fn test_thinking_remapped_by_gemini_adapter() {
        let request = parse(json!({
            "model": "claude",
            "thinking": {"type": "enabled", "budget_tokens": 30000},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let adapter = select_adapter("google/gemini-2.5-pro");
        let translator = AnthropicToOpenRouter::new("google/gemini-2.5-pro", &adapter);
        let out = translator.translate_request(&request).unwrap();
        assert_eq!(out.request.extra["thinking_config"]["thinking_budget"], 24576);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn test_empty_messages_rejected() {
        let request = parse(json!({"model": "claude", "messages": []}));
        assert!(convert_messages_request(&request, "m", &Adapter::default()).is_err());
    }
}
