//! 中间件类型定义
//!
//! 定义 ModelMiddleware trait、各钩子的上下文以及执行结果。

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::openai::{ChatCompletionResponse, ChatMessage, ToolDefinition};

/// 单个流共享的元数据（流结束即丢弃）
pub type StreamMetadata = HashMap<String, Value>;

/// 流元数据中存放本流 thought signature 的键，值为 `{ tool_use_id: signature }`
pub const THOUGHT_SIGNATURES_KEY: &str = "thought_signatures";

/// 中间件错误
#[derive(Error, Debug, Clone)]
pub enum MiddlewareError {
    #[error("中间件初始化失败: {0}")]
    Init(String),

    #[error("中间件执行失败: {0}")]
    Hook(String),
}

/// beforeRequest 上下文：可原地修改出站消息和工具列表
pub struct RequestContext<'a> {
    pub model_id: &'a str,
    pub messages: &'a mut Vec<ChatMessage>,
    pub tools: Option<&'a mut Vec<ToolDefinition>>,
    pub stream: bool,
}

/// afterResponse 上下文（非流式）
pub struct NonStreamingResponseContext<'a> {
    pub model_id: &'a str,
    pub response: &'a ChatCompletionResponse,
    /// 适配器捕获的签名，键为返回给客户端的 tool_use ID
    pub thought_signatures: &'a HashMap<String, String>,
}

/// afterStreamChunk 上下文
pub struct StreamChunkContext<'a> {
    pub model_id: &'a str,
    /// 原始上游 chunk
    pub chunk: &'a mut Value,
    pub metadata: &'a mut StreamMetadata,
}

impl StreamChunkContext<'_> {
    /// `choices[0].delta`
    pub fn delta_mut(&mut self) -> Option<&mut Value> {
        self.chunk.pointer_mut("/choices/0/delta")
    }
}

/// 钩子执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct HookResult {
    /// 中间件名称
    pub middleware: String,
    pub success: bool,
    pub error: Option<String>,
    /// 执行时间 (毫秒)
    pub duration_ms: u64,
}

impl HookResult {
    pub fn success(middleware: &str, duration_ms: u64) -> Self {
        Self {
            middleware: middleware.to_string(),
            success: true,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(middleware: &str, error: String, duration_ms: u64) -> Self {
        Self {
            middleware: middleware.to_string(),
            success: false,
            error: Some(error),
            duration_ms,
        }
    }
}

/// 模型中间件
///
/// 所有钩子都有空的默认实现，中间件只需覆盖关心的部分。
#[async_trait]
pub trait ModelMiddleware: Send + Sync {
    fn name(&self) -> &str;

    /// 是否对该模型生效
    fn should_handle(&self, model_id: &str) -> bool;

    /// 启动时调用一次
    async fn on_init(&self) -> Result<(), MiddlewareError> {
        Ok(())
    }

    async fn before_request(&self, _ctx: &mut RequestContext<'_>) -> Result<(), MiddlewareError> {
        Ok(())
    }

    async fn after_response(
        &self,
        _ctx: &NonStreamingResponseContext<'_>,
    ) -> Result<(), MiddlewareError> {
        Ok(())
    }

    async fn after_stream_chunk(
        &self,
        _ctx: &mut StreamChunkContext<'_>,
    ) -> Result<(), MiddlewareError> {
        Ok(())
    }

    async fn after_stream_complete(
        &self,
        _model_id: &str,
        _metadata: &StreamMetadata,
    ) -> Result<(), MiddlewareError> {
        Ok(())
    }
}
