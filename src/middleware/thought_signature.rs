//! Gemini thought signature 中间件
//!
//! Gemini 3 要求在后续请求中回传每个工具调用的 thought signature。
//! 签名由 Gemini 适配器在单次交换内捕获，交换结束后交给本中间件：
//! 流式经由流元数据 `THOUGHT_SIGNATURES_KEY`，非流式经由
//! `NonStreamingResponseContext::thought_signatures`。
//! 下一次请求时注入到 assistant 的 tool_calls 和对应的 tool 消息上：
//!
//! ```text
//! "extra_content": { "google": { "thought_signature": "<sig>" } }
//! ```
//!
//! 缓存有容量上限，超出时淘汰最久未使用的条目。

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::types::{
    MiddlewareError, ModelMiddleware, NonStreamingResponseContext, RequestContext,
    StreamMetadata, THOUGHT_SIGNATURES_KEY,
};
use crate::adapters::{GeminiAdapter, ModelAdapter};

/// 默认最多缓存的签名数
pub const DEFAULT_MAX_SIGNATURES: usize = 4096;

fn signature_payload(signature: &str) -> Value {
    json!({ "google": { "thought_signature": signature } })
}

#[derive(Debug)]
struct CachedSignature {
    signature: String,
    /// 最近一次写入或回传的序号
    last_used: u64,
}

/// 跨请求的签名缓存
#[derive(Debug)]
pub struct ThoughtSignatureMiddleware {
    /// tool_use_id -> signature
    signatures: DashMap<String, CachedSignature>,
    clock: AtomicU64,
    capacity: usize,
}

impl Default for ThoughtSignatureMiddleware {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_SIGNATURES)
    }
}

impl ThoughtSignatureMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            signatures: DashMap::new(),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn signature(&self, tool_call_id: &str) -> Option<String> {
        self.signatures
            .get(tool_call_id)
            .map(|entry| entry.signature.clone())
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// 写入一批签名，之后按容量淘汰
    fn commit<'a>(&self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> usize {
        let mut committed = 0;
        for (id, signature) in entries {
            let last_used = self.tick();
            self.signatures.insert(
                id.to_string(),
                CachedSignature {
                    signature: signature.to_string(),
                    last_used,
                },
            );
            committed += 1;
        }
        self.evict_overflow();
        committed
    }

    fn evict_overflow(&self) {
        let len = self.signatures.len();
        if len <= self.capacity {
            return;
        }
        let mut by_age: Vec<(u64, String)> = self
            .signatures
            .iter()
            .map(|entry| (entry.last_used, entry.key().clone()))
            .collect();
        by_age.sort_unstable();
        let excess = len - self.capacity;
        for (_, id) in by_age.into_iter().take(excess) {
            self.signatures.remove(&id);
        }
        tracing::debug!("[THOUGHT_SIGNATURE] 缓存超出上限，淘汰 {} 个签名", excess);
    }

    /// 取出签名并刷新使用序号
    fn replay(&self, tool_call_id: &str) -> Option<Value> {
        let last_used = self.tick();
        let mut entry = self.signatures.get_mut(tool_call_id)?;
        entry.last_used = last_used;
        Some(signature_payload(&entry.signature))
    }
}

#[async_trait]
impl ModelMiddleware for ThoughtSignatureMiddleware {
    fn name(&self) -> &str {
        "gemini-thought-signature"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        GeminiAdapter::should_handle(model_id)
    }

    async fn on_init(&self) -> Result<(), MiddlewareError> {
        tracing::debug!(
            "[THOUGHT_SIGNATURE] 中间件已就绪，容量 {}",
            self.capacity
        );
        Ok(())
    }

    async fn before_request(&self, ctx: &mut RequestContext<'_>) -> Result<(), MiddlewareError> {
        if self.signatures.is_empty() {
            return Ok(());
        }

        let mut injected = 0usize;
        for message in ctx.messages.iter_mut() {
            match message.role.as_str() {
                "assistant" => {
                    for call in message.tool_calls.iter_mut().flatten() {
                        if let Some(payload) = self.replay(&call.id) {
                            call.extra_content = Some(payload);
                            injected += 1;
                        }
                    }
                }
                "tool" => {
                    let payload = message
                        .tool_call_id
                        .as_deref()
                        .and_then(|id| self.replay(id));
                    if let Some(payload) = payload {
                        message.extra_content = Some(payload);
                        injected += 1;
                    }
                }
                _ => {}
            }
        }

        if injected > 0 {
            tracing::debug!("[THOUGHT_SIGNATURE] 注入 {} 个签名", injected);
        }
        Ok(())
    }

    async fn after_response(
        &self,
        ctx: &NonStreamingResponseContext<'_>,
    ) -> Result<(), MiddlewareError> {
        let committed = self.commit(
            ctx.thought_signatures
                .iter()
                .map(|(id, sig)| (id.as_str(), sig.as_str())),
        );
        if committed > 0 {
            tracing::debug!("[THOUGHT_SIGNATURE] 非流式响应提交 {} 个签名", committed);
        }
        Ok(())
    }

    async fn after_stream_complete(
        &self,
        _model_id: &str,
        metadata: &StreamMetadata,
    ) -> Result<(), MiddlewareError> {
        let Some(pending) = metadata.get(THOUGHT_SIGNATURES_KEY) else {
            return Ok(());
        };
        let Some(pending) = pending.as_object() else {
            return Err(MiddlewareError::Hook(format!(
                "{} 元数据不是对象",
                THOUGHT_SIGNATURES_KEY
            )));
        };
        let committed = self.commit(
            pending
                .iter()
                .filter_map(|(id, sig)| Some((id.as_str(), sig.as_str()?))),
        );
        tracing::info!(
            "[THOUGHT_SIGNATURE] 流结束，提交 {} 个签名（缓存共 {} 个）",
            committed,
            self.signatures.len()
        );
        Ok(())
    }
}
