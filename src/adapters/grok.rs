//! Grok 适配器
//!
//! Grok 有时不使用结构化 tool_calls，而是在正文中输出 xAI 内联 XML：
//!
//! ```text
//! <xai:function_call name="Read"><xai:parameter name="file_path">/a.txt</xai:parameter></xai:function_call>
//! ```
//!
//! 标签可能跨越多个 chunk，因此需要缓冲到标签闭合后再提取。

use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde_json::{Map, Value};

use super::{AdapterResult, ExtractedToolCall, ModelAdapter, THINKING_KEY};
use crate::models::openai::{ChatCompletionRequest, ChatContent, ChatMessage};

const OPEN_TAG: &str = "<xai:function_call";

/// 禁止内联 XML 的系统指令
pub const NO_XML_INSTRUCTION: &str = "IMPORTANT: When calling tools, you MUST use the OpenAI tool_calls format with JSON. NEVER use XML format like <xai:function_call>. Use only the structured tool_calls field for every tool invocation.";

static FUNCTION_CALL_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?s)<xai:function_call\s+name="([^"]+)"\s*>(.*?)</xai:function_call>"#).ok()
});

static PARAMETER_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?s)<xai:parameter\s+name="([^"]+)"\s*>(.*?)</xai:parameter>"#).ok()
});

/// Grok 内联 XML 工具调用适配器
#[derive(Debug, Default)]
pub struct GrokAdapter {
    /// 尚未输出的文本（可能包含未闭合的标签）
    buffer: String,
}

impl GrokAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelAdapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "GrokAdapter"
    }

    fn should_handle(model_id: &str) -> bool {
        let lower = model_id.to_lowercase();
        lower.contains("grok") || lower.starts_with("x-ai/")
    }

    fn process_text_content(&mut self, new_text: &str) -> AdapterResult {
        self.buffer.push_str(new_text);
        let buffer = std::mem::take(&mut self.buffer);

        let mut cleaned = String::new();
        let mut calls = Vec::new();
        let mut cursor = 0;

        if let Some(re) = FUNCTION_CALL_RE.as_ref() {
            for cap in re.captures_iter(&buffer) {
                let (Some(full), Some(name)) = (cap.get(0), cap.get(1)) else {
                    continue;
                };
                let body = cap.get(2).map(|m| m.as_str()).unwrap_or_default();
                cleaned.push_str(&buffer[cursor..full.start()]);
                cursor = full.end();

                let call = ExtractedToolCall {
                    id: generate_tool_id(),
                    name: name.as_str().to_string(),
                    arguments: parse_parameters(body),
                };
                tracing::info!(
                    "[GROK_ADAPTER] 提取内联工具调用: name={}, id={}",
                    call.name,
                    call.id
                );
                calls.push(call);
            }
        }

        let rest = &buffer[cursor..];
        let hold_from = incomplete_tag_start(rest);
        cleaned.push_str(&rest[..hold_from]);
        self.buffer = rest[hold_from..].to_string();

        if !self.buffer.is_empty() {
            tracing::debug!("[GROK_ADAPTER] 缓冲未闭合标签 {} 字节", self.buffer.len());
        }

        AdapterResult {
            cleaned_text: cleaned,
            was_transformed: !calls.is_empty(),
            extracted_tool_calls: calls,
        }
    }

    fn flush(&mut self) -> AdapterResult {
        // 流已结束，未闭合的标签按普通文本输出
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            tracing::warn!("[GROK_ADAPTER] 流结束时仍有未闭合标签，按文本输出");
        }
        AdapterResult::passthrough(&rest)
    }

    fn prepare_request(&self, request: &mut ChatCompletionRequest) {
        request.extra.remove(THINKING_KEY);

        if request.tools.as_ref().map_or(true, |t| t.is_empty()) {
            return;
        }

        match request.messages.first_mut() {
            Some(first) if first.role == "system" => {
                let text = first.text();
                first.content = Some(ChatContent::Text(format!(
                    "{}\n\n{}",
                    text, NO_XML_INSTRUCTION
                )));
            }
            _ => request
                .messages
                .insert(0, ChatMessage::system(NO_XML_INSTRUCTION)),
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// 返回未闭合标签（或标签前缀）的起始位置，没有则返回文本长度
fn incomplete_tag_start(text: &str) -> usize {
    if let Some(pos) = text.find(OPEN_TAG) {
        return pos;
    }
    // 结尾可能是 "<xai:fun" 这样的前缀
    for (pos, _) in text.match_indices('<') {
        if OPEN_TAG.starts_with(&text[pos..]) {
            return pos;
        }
    }
    text.len()
}

fn parse_parameters(body: &str) -> Value {
    let mut args = Map::new();
    if let Some(re) = PARAMETER_RE.as_ref() {
        for cap in re.captures_iter(body) {
            if let (Some(name), Some(value)) = (cap.get(1), cap.get(2)) {
                args.insert(
                    name.as_str().to_string(),
                    parse_parameter_value(value.as_str()),
                );
            }
        }
    }
    Value::Object(args)
}

/// JSON 优先，其次数字，最后原样字符串
fn parse_parameter_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(n) {
            return Value::Number(number);
        }
    }
    Value::String(raw.to_string())
}

fn generate_tool_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("grok_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}
