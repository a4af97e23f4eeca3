//! Token 估算
//!
//! 上游不提供 count_tokens 接口，`/v1/messages/count_tokens` 和流开始时的
//! 预估输入 token 都由本地 tiktoken 估算。结果只是近似值。

use serde_json::Value;
use thiserror::Error;

use crate::models::anthropic::{
    ContentBlock, CountTokensRequest, Message, MessageContent, MessagesRequest, SystemPrompt,
    Tool, ToolResultContent,
};

/// 每条消息的格式化开销（role + 分隔符）
const TOKENS_PER_MESSAGE: u32 = 4;
/// 回复前缀开销
const REPLY_PRIMING_TOKENS: u32 = 3;
/// 单张图片的固定估算值
const IMAGE_TOKENS: u32 = 1600;

/// Token 估算器错误
#[derive(Error, Debug, Clone)]
pub enum TokenEstimatorError {
    #[error("Token 估算器初始化失败: {0}")]
    Initialization(String),
}

/// Token 估算器
pub struct TokenEstimator {
    /// cl100k_base，适用于大多数模型
    default_bpe: tiktoken_rs::CoreBPE,
    /// o200k_base，适用于 GPT-4o / o 系列
    o200k_bpe: tiktoken_rs::CoreBPE,
}

impl TokenEstimator {
    pub fn new() -> Result<Self, TokenEstimatorError> {
        let default_bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| TokenEstimatorError::Initialization(e.to_string()))?;
        let o200k_bpe = tiktoken_rs::o200k_base()
            .map_err(|e| TokenEstimatorError::Initialization(e.to_string()))?;

        Ok(Self {
            default_bpe,
            o200k_bpe,
        })
    }

    /// 估算文本的 Token 数量
    pub fn estimate(&self, text: &str, model: Option<&str>) -> u32 {
        if text.is_empty() {
            return 0;
        }
        self.select_bpe(model).encode_with_special_tokens(text).len() as u32
    }

    /// 估算 Messages 请求的输入 token
    pub fn estimate_request(&self, request: &MessagesRequest, model: Option<&str>) -> u32 {
        self.estimate_parts(
            request.system.as_ref(),
            &request.messages,
            request.tools.as_deref(),
            model,
        )
    }

    /// 估算 count_tokens 请求
    pub fn estimate_count_request(&self, request: &CountTokensRequest, model: Option<&str>) -> u32 {
        self.estimate_parts(
            request.system.as_ref(),
            &request.messages,
            request.tools.as_deref(),
            model,
        )
    }

    fn estimate_parts(
        &self,
        system: Option<&SystemPrompt>,
        messages: &[Message],
        tools: Option<&[Tool]>,
        model: Option<&str>,
    ) -> u32 {
        let mut total = 0u32;

        if let Some(system) = system {
            total += TOKENS_PER_MESSAGE;
            total += match system {
                SystemPrompt::Text(text) => self.estimate(text, model),
                SystemPrompt::Blocks(blocks) => self.estimate_blocks(blocks, model),
            };
        }

        for message in messages {
            total += TOKENS_PER_MESSAGE;
            total += match &message.content {
                MessageContent::Text(text) => self.estimate(text, model),
                MessageContent::Blocks(blocks) => self.estimate_blocks(blocks, model),
            };
        }

        for tool in tools.unwrap_or_default() {
            total += self.estimate(&tool.name, model);
            if let Some(description) = &tool.description {
                total += self.estimate(description, model);
            }
            total += self.estimate(&tool.input_schema.to_string(), model);
        }

        total + REPLY_PRIMING_TOKENS
    }

    fn estimate_blocks(&self, blocks: &[ContentBlock], model: Option<&str>) -> u32 {
        blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => self.estimate(text, model),
                ContentBlock::Image { .. } => IMAGE_TOKENS,
                ContentBlock::ToolUse { name, input, .. } => {
                    self.estimate(name, model) + self.estimate_value(input, model)
                }
                ContentBlock::ToolResult { content, .. } => match content {
                    Some(ToolResultContent::Text(text)) => self.estimate(text, model),
                    Some(ToolResultContent::Blocks(inner)) => self.estimate_blocks(inner, model),
                    None => 0,
                },
                ContentBlock::Thinking { thinking, .. } => self.estimate(thinking, model),
                ContentBlock::RedactedThinking { .. } | ContentBlock::Unknown => 0,
            })
            .sum()
    }

    fn estimate_value(&self, value: &Value, model: Option<&str>) -> u32 {
        match value {
            Value::Null => 0,
            Value::String(s) => self.estimate(s, model),
            other => self.estimate(&other.to_string(), model),
        }
    }

    /// 根据模型名称选择合适的 BPE 编码器
    fn select_bpe(&self, model: Option<&str>) -> &tiktoken_rs::CoreBPE {
        match model {
            Some(m) if m.contains("gpt-4o") || m.contains("o1") || m.contains("o3") => {
                &self.o200k_bpe
            }
            _ => &self.default_bpe,
        }
    }
}
