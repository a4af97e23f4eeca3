//! 流式响应状态机
//!
//! 消费 OpenAI 风格的上游 chunk，产出 Anthropic SSE 帧。
//!
//! # 状态
//!
//! `NotStarted → Streaming → Finalized`
//!
//! - `start()` 发送 message_start、占位文本块（index 0）和首个 ping
//! - `process_chunk()` 处理单个上游 chunk
//! - `finalize()` 关闭所有未关闭的块并发送唯一一次终止序列，重复调用无副作用
//!
//! 文本块与思考块互斥；工具块打开期间可以穿插文本或思考，
//! 工具块只在 `finish_reason: tool_calls` 或 `finalize()` 时关闭，
//! 以免同一工具调用后续的参数片段被丢弃。
//!
//! 状态机本身不做 IO，只返回待写出的帧，由 `session` 负责写出。

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::events::{generate_tool_use_id, StopReason};
use super::sse;
use crate::adapters::{Adapter, AdapterResult};
use crate::telemetry::UsageFile;

/// 流状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    NotStarted,
    Streaming,
    Finalized,
}

/// 结束方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    /// 正常完成（上游 [DONE] 或连接正常结束）
    Normal,
    /// 以错误事件结束
    Error { error_type: String, message: String },
}

impl FinishOutcome {
    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// 单个工具调用的累积状态（按上游 tool_calls[].index 分组）
#[derive(Debug, Default)]
struct ToolAccumulator {
    upstream_id: Option<String>,
    id: String,
    name: String,
    arguments: String,
    block_index: usize,
    started: bool,
    closed: bool,
    /// 名称到达前收到的参数片段
    pending_args: String,
}

/// 流式状态机
pub struct StreamTranslator {
    message_id: String,
    model: String,
    estimated_input_tokens: u32,
    phase: StreamPhase,
    next_index: usize,
    text_block: Option<usize>,
    thinking_block: Option<usize>,
    tools: BTreeMap<u64, ToolAccumulator>,
    seen_tool_ids: HashSet<String>,
    usage: Option<(u32, u32)>,
    stop_reason: Option<StopReason>,
    saw_tool_use: bool,
    output_chars: usize,
    content_since_tick: bool,
    adapter: Adapter,
    usage_file: Option<UsageFile>,
}

impl StreamTranslator {
    /// # 参数
    ///
    /// - `model`: 回显给客户端的模型名（客户端请求时的名字）
    /// - `estimated_input_tokens`: message_start 中的预估输入 token，仅供参考
    pub fn new(
        message_id: String,
        model: impl Into<String>,
        estimated_input_tokens: u32,
        mut adapter: Adapter,
    ) -> Self {
        adapter.reset();
        Self {
            message_id,
            model: model.into(),
            estimated_input_tokens,
            phase: StreamPhase::NotStarted,
            next_index: 0,
            text_block: None,
            thinking_block: None,
            tools: BTreeMap::new(),
            seen_tool_ids: HashSet::new(),
            usage: None,
            stop_reason: None,
            saw_tool_use: false,
            output_chars: 0,
            content_since_tick: false,
            adapter,
            usage_file: None,
        }
    }

    /// 设置 token 统计侧文件
    pub fn with_usage_file(mut self, usage_file: UsageFile) -> Self {
        self.usage_file = Some(usage_file);
        self
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == StreamPhase::Finalized
    }

    /// 取走本流捕获的 thought signature，键为下发给客户端的工具调用 ID
    pub fn take_thought_signatures(&mut self) -> HashMap<String, String> {
        let tool_ids = self
            .tools
            .values()
            .filter(|acc| acc.started)
            .filter_map(|acc| Some((acc.upstream_id.as_deref()?, acc.id.as_str())));
        self.adapter.alias_thought_signatures(tool_ids);
        self.adapter.take_thought_signatures()
    }

    /// 进入 Streaming 状态
    pub fn start(&mut self) -> Vec<String> {
        if self.phase != StreamPhase::NotStarted {
            return Vec::new();
        }
        self.phase = StreamPhase::Streaming;

        let mut frames = vec![sse::message_start(
            &self.message_id,
            &self.model,
            self.estimated_input_tokens,
        )];
        // 客户端要求在其他事件之前至少存在一个内容块
        self.open_text_block(&mut frames);
        frames.push(sse::ping());
        frames
    }

    /// 处理一个上游 chunk
    pub fn process_chunk(&mut self, chunk: &Value) -> Vec<String> {
        let mut frames = Vec::new();
        match self.phase {
            StreamPhase::Finalized => return frames,
            StreamPhase::NotStarted => frames.extend(self.start()),
            StreamPhase::Streaming => {}
        }

        if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            tracing::error!("[STREAM] 上游在流中返回错误: {}", message);
            frames.extend(self.finalize(FinishOutcome::error("api_error", message)));
            return frames;
        }

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.record_usage(usage);
        }

        let Some(choice) = chunk.pointer("/choices/0") else {
            return frames;
        };

        if let Some(delta) = choice.get("delta") {
            if let Some(details) = delta.get("reasoning_details").filter(|d| !d.is_null()) {
                self.adapter.observe_reasoning_details(details);
            }

            let reasoning = delta
                .get("reasoning")
                .or_else(|| delta.get("reasoning_content"))
                .and_then(|r| r.as_str())
                .filter(|r| !r.is_empty());
            if let Some(reasoning) = reasoning {
                self.emit_thinking(reasoning, &mut frames);
            }

            if let Some(content) = delta
                .get("content")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
            {
                self.close_thinking_block(&mut frames);
                let result = self.adapter.process_text_content(content);
                self.emit_adapter_result(result, &mut frames);
            }

            if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                for (position, tool_call) in tool_calls.iter().enumerate() {
                    self.process_tool_call_delta(position, tool_call, &mut frames);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            let stop_reason = StopReason::from_finish_reason(reason);
            if stop_reason == StopReason::ToolUse {
                self.close_tool_blocks(&mut frames);
            }
            self.stop_reason = Some(stop_reason);
        }

        frames
    }

    /// 结束流。只有第一次调用会产生输出。
    pub fn finalize(&mut self, outcome: FinishOutcome) -> Vec<String> {
        let mut frames = Vec::new();
        match self.phase {
            StreamPhase::Finalized => return frames,
            StreamPhase::NotStarted => frames.extend(self.start()),
            StreamPhase::Streaming => {}
        }

        // 适配器缓冲区里残留的内容（例如未闭合的内联标签）按普通文本输出
        let leftover = self.adapter.flush();
        if !leftover.cleaned_text.is_empty() || !leftover.extracted_tool_calls.is_empty() {
            self.close_thinking_block(&mut frames);
            self.emit_adapter_result(leftover, &mut frames);
        }

        self.close_thinking_block(&mut frames);
        self.close_text_block(&mut frames);
        self.close_tool_blocks(&mut frames);

        match outcome {
            FinishOutcome::Normal => {
                let stop_reason = self
                    .stop_reason
                    .clone()
                    .unwrap_or_default()
                    .with_tool_use(self.saw_tool_use);
                let (input_tokens, output_tokens) = self.final_usage();
                tracing::info!(
                    "[STREAM] 流结束: stop_reason={}, input_tokens={}, output_tokens={}",
                    stop_reason.to_anthropic_str(),
                    input_tokens,
                    output_tokens
                );
                frames.push(sse::message_delta(&stop_reason, input_tokens, output_tokens));
                frames.push(sse::message_stop());
            }
            FinishOutcome::Error {
                error_type,
                message,
            } => {
                frames.push(sse::error(&error_type, &message));
            }
        }
        frames.push(sse::DONE_FRAME.to_string());

        self.phase = StreamPhase::Finalized;
        frames
    }

    /// 心跳检查：上一周期没有内容输出时返回 ping
    pub fn tick(&mut self) -> Option<String> {
        if self.phase != StreamPhase::Streaming {
            return None;
        }
        if std::mem::take(&mut self.content_since_tick) {
            None
        } else {
            Some(sse::ping())
        }
    }

    /// 最终用量：优先使用上游报告值，否则按字符数粗略估算
    pub fn final_usage(&self) -> (u32, u32) {
        match self.usage {
            Some(usage) => usage,
            None => (
                self.estimated_input_tokens,
                (self.output_chars / 4).max(1) as u32,
            ),
        }
    }

    fn record_usage(&mut self, usage: &Value) {
        let input = usage
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        let output = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32;
        if input == 0 && output == 0 {
            return;
        }
        self.usage = Some((input, output));
        if let Some(file) = &self.usage_file {
            file.record(input, output);
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn open_text_block(&mut self, frames: &mut Vec<String>) -> usize {
        if let Some(index) = self.text_block {
            return index;
        }
        let index = self.allocate_index();
        frames.push(sse::content_block_start_text(index));
        self.text_block = Some(index);
        index
    }

    fn close_text_block(&mut self, frames: &mut Vec<String>) {
        if let Some(index) = self.text_block.take() {
            frames.push(sse::content_block_stop(index));
        }
    }

    fn close_thinking_block(&mut self, frames: &mut Vec<String>) {
        if let Some(index) = self.thinking_block.take() {
            frames.push(sse::content_block_stop(index));
        }
    }

    fn emit_thinking(&mut self, reasoning: &str, frames: &mut Vec<String>) {
        let index = match self.thinking_block {
            Some(index) => index,
            None => {
                self.close_text_block(frames);
                let index = self.allocate_index();
                frames.push(sse::content_block_start_thinking(index));
                self.thinking_block = Some(index);
                index
            }
        };
        frames.push(sse::thinking_delta(index, reasoning));
        self.output_chars += reasoning.len();
        self.content_since_tick = true;
    }

    fn emit_text(&mut self, text: &str, frames: &mut Vec<String>) {
        let index = self.open_text_block(frames);
        frames.push(sse::text_delta(index, text));
        self.output_chars += text.len();
        self.content_since_tick = true;
    }

    fn emit_adapter_result(&mut self, result: AdapterResult, frames: &mut Vec<String>) {
        for call in result.extracted_tool_calls {
            self.close_text_block(frames);
            let id = self.register_tool_id(Some(&call.id));
            let index = self.allocate_index();
            let arguments = call.arguments.to_string();
            tracing::debug!("[STREAM] 适配器提取工具调用: {} ({})", call.name, id);
            frames.push(sse::content_block_start_tool(index, &id, &call.name));
            frames.push(sse::input_json_delta(index, &arguments));
            frames.push(sse::content_block_stop(index));
            self.saw_tool_use = true;
            self.output_chars += arguments.len();
            self.content_since_tick = true;
        }
        if !result.cleaned_text.is_empty() {
            self.emit_text(&result.cleaned_text, frames);
        }
    }

    fn process_tool_call_delta(&mut self, position: usize, tool_call: &Value, frames: &mut Vec<String>) {
        let key = tool_call
            .get("index")
            .and_then(|i| i.as_u64())
            .unwrap_or(position as u64);
        let id = tool_call.get("id").and_then(|i| i.as_str()).filter(|s| !s.is_empty());
        let function = tool_call.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .filter(|s| !s.is_empty());
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .and_then(|a| a.as_str())
            .unwrap_or("");

        let acc = self.tools.entry(key).or_default();
        if acc.closed {
            tracing::warn!(
                "[STREAM] 工具调用 {} 已关闭，丢弃迟到的参数片段: {}",
                acc.name,
                arguments
            );
            return;
        }
        if acc.upstream_id.is_none() {
            acc.upstream_id = id.map(str::to_string);
        }
        if acc.name.is_empty() {
            if let Some(name) = name {
                acc.name = name.to_string();
            }
        }

        if acc.started {
            if !arguments.is_empty() {
                acc.arguments.push_str(arguments);
                let index = acc.block_index;
                frames.push(sse::input_json_delta(index, arguments));
                self.output_chars += arguments.len();
                self.content_since_tick = true;
            }
            return;
        }

        acc.pending_args.push_str(arguments);
        if acc.name.is_empty() {
            return;
        }

        // 第一次拿到名称：打开工具块
        let upstream_id = acc.upstream_id.clone();
        self.close_text_block(frames);
        self.close_thinking_block(frames);
        let id = self.register_tool_id(upstream_id.as_deref());
        let index = self.allocate_index();

        let Some(acc) = self.tools.get_mut(&key) else {
            return;
        };
        acc.id = id;
        acc.block_index = index;
        acc.started = true;
        frames.push(sse::content_block_start_tool(index, &acc.id, &acc.name));
        tracing::debug!("[STREAM] 开始工具调用: {} ({}) index={}", acc.name, acc.id, index);

        let pending = std::mem::take(&mut acc.pending_args);
        if !pending.is_empty() {
            acc.arguments.push_str(&pending);
            frames.push(sse::input_json_delta(index, &pending));
            self.output_chars += pending.len();
        }
        self.saw_tool_use = true;
        self.content_since_tick = true;
    }

    fn close_tool_blocks(&mut self, frames: &mut Vec<String>) {
        for acc in self.tools.values_mut() {
            if !acc.started || acc.closed {
                continue;
            }
            if !acc.arguments.trim().is_empty() {
                if let Err(e) = serde_json::from_str::<Value>(&acc.arguments) {
                    tracing::warn!(
                        "[STREAM] 工具 {} ({}) 的参数不是合法 JSON: {} - {}",
                        acc.name,
                        acc.id,
                        e,
                        acc.arguments
                    );
                }
            }
            frames.push(sse::content_block_stop(acc.block_index));
            acc.closed = true;
        }
    }

    /// 分配流内唯一的工具调用 ID
    fn register_tool_id(&mut self, candidate: Option<&str>) -> String {
        let base = candidate
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_tool_use_id);
        let mut id = base.clone();
        let mut suffix = 1;
        while self.seen_tool_ids.contains(&id) {
            tracing::warn!("[STREAM] 重复的工具调用 ID: {}", id);
            id = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        self.seen_tool_ids.insert(id.clone());
        id
    }
}
