//! 中间件管理器
//!
//! 按注册顺序执行中间件钩子。每次钩子调用单独隔离：
//! 返回错误或 panic 都只记录日志，不影响其他中间件和主流程。

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::thought_signature::ThoughtSignatureMiddleware;
use super::types::{
    HookResult, MiddlewareError, ModelMiddleware, NonStreamingResponseContext, RequestContext,
    StreamChunkContext, StreamMetadata,
};

/// 中间件管理器
#[derive(Default)]
pub struct MiddlewareManager {
    middlewares: Vec<Arc<dyn ModelMiddleware>>,
    initialized: AtomicBool,
}

impl MiddlewareManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册内置中间件
    pub fn with_defaults() -> Self {
        let mut manager = Self::new();
        manager.register(Arc::new(ThoughtSignatureMiddleware::new()));
        manager
    }

    /// 追加到链尾
    pub fn register(&mut self, middleware: Arc<dyn ModelMiddleware>) {
        tracing::debug!("[MIDDLEWARE] 注册中间件: {}", middleware.name());
        self.middlewares.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// 执行所有中间件的 on_init，只执行一次
    pub async fn initialize(&self) -> Vec<HookResult> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let mut results = Vec::with_capacity(self.middlewares.len());
        for middleware in &self.middlewares {
            results.push(run_hook(middleware.name(), "on_init", middleware.on_init()).await);
        }
        tracing::info!(
            "[MIDDLEWARE] 初始化完成: {}/{} 成功",
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        results
    }

    /// 对该模型生效的中间件（保持注册顺序）
    pub fn active_middlewares(&self, model_id: &str) -> Vec<Arc<dyn ModelMiddleware>> {
        self.middlewares
            .iter()
            .filter(|m| m.should_handle(model_id))
            .cloned()
            .collect()
    }

    pub async fn before_request(&self, ctx: &mut RequestContext<'_>) -> Vec<HookResult> {
        let mut results = Vec::new();
        for middleware in self.active_middlewares(ctx.model_id) {
            results.push(
                run_hook(
                    middleware.name(),
                    "before_request",
                    middleware.before_request(ctx),
                )
                .await,
            );
        }
        results
    }

    pub async fn after_response(&self, ctx: &NonStreamingResponseContext<'_>) -> Vec<HookResult> {
        let mut results = Vec::new();
        for middleware in self.active_middlewares(ctx.model_id) {
            results.push(
                run_hook(
                    middleware.name(),
                    "after_response",
                    middleware.after_response(ctx),
                )
                .await,
            );
        }
        results
    }

    pub async fn after_stream_chunk(&self, ctx: &mut StreamChunkContext<'_>) -> Vec<HookResult> {
        let mut results = Vec::new();
        for middleware in self.active_middlewares(ctx.model_id) {
            results.push(
                run_hook(
                    middleware.name(),
                    "after_stream_chunk",
                    middleware.after_stream_chunk(ctx),
                )
                .await,
            );
        }
        results
    }

    pub async fn after_stream_complete(
        &self,
        model_id: &str,
        metadata: &StreamMetadata,
    ) -> Vec<HookResult> {
        let mut results = Vec::new();
        for middleware in self.active_middlewares(model_id) {
            results.push(
                run_hook(
                    middleware.name(),
                    "after_stream_complete",
                    middleware.after_stream_complete(model_id, metadata),
                )
                .await,
            );
        }
        results
    }
}

/// 执行单个钩子，捕获错误和 panic
async fn run_hook<F>(name: &str, hook: &str, fut: F) -> HookResult
where
    F: Future<Output = Result<(), MiddlewareError>>,
{
    let start = Instant::now();
    let outcome = AssertUnwindSafe(fut).catch_unwind().await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(())) => HookResult::success(name, duration_ms),
        Ok(Err(e)) => {
            tracing::warn!("[MIDDLEWARE] {} 的 {} 钩子失败: {}", name, hook, e);
            HookResult::failure(name, e.to_string(), duration_ms)
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("[MIDDLEWARE] {} 的 {} 钩子 panic: {}", name, hook, message);
            HookResult::failure(name, message, duration_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::{ChatContent, ChatMessage};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// 记录调用顺序的测试中间件
    struct Recorder {
        name: &'static str,
        pattern: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
        panic: bool,
    }

    impl Recorder {
        fn new(name: &'static str, pattern: &'static str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                pattern,
                log,
                fail: false,
                panic: false,
            }
        }
    }

    #[async_trait]
    impl ModelMiddleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn should_handle(&self, model_id: &str) -> bool {
            model_id.contains(self.pattern)
        }

        async fn on_init(&self) -> Result<(), MiddlewareError> {
            self.log.lock().push(format!("{}:init", self.name));
            if self.fail {
                return Err(MiddlewareError::Init("boom".to_string()));
            }
            Ok(())
        }

        async fn before_request(&self, ctx: &mut RequestContext<'_>) -> Result<(), MiddlewareError> {
            self.log.lock().push(format!("{}:before", self.name));
            if self.panic {
                panic!("middleware exploded");
            }
            if self.fail {
                return Err(MiddlewareError::Hook("bad".to_string()));
            }
            ctx.messages.push(ChatMessage::system(self.name));
            Ok(())
        }

        async fn after_stream_chunk(
            &self,
            ctx: &mut StreamChunkContext<'_>,
        ) -> Result<(), MiddlewareError> {
            if let Some(delta) = ctx.delta_mut() {
                delta["seen_by"] = json!(self.name);
            }
            let count = ctx
                .metadata
                .get("chunks")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            ctx.metadata.insert("chunks".to_string(), json!(count + 1));
            Ok(())
        }
    }

    fn request_ctx<'a>(model_id: &'a str, messages: &'a mut Vec<ChatMessage>) -> RequestContext<'a> {
        RequestContext {
            model_id,
            messages,
            tools: None,
            stream: true,
        }
    }

    #[tokio::test]
    async fn test_hooks_run_in_registration_order_for_matching_models() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MiddlewareManager::new();
        manager.register(Arc::new(Recorder::new("first", "gemini", log.clone())));
        manager.register(Arc::new(Recorder::new("other", "grok", log.clone())));
        manager.register(Arc::new(Recorder::new("second", "gemini", log.clone())));

        let mut messages = Vec::new();
        let results = manager
            .before_request(&mut request_ctx("google/gemini-2.5-pro", &mut messages))
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(
            *log.lock(),
            vec!["first:before".to_string(), "second:before".to_string()]
        );
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, Some(ChatContent::Text("second".to_string())));
    }

    #[tokio::test]
    async fn test_failure_and_panic_do_not_block_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("failing", "m", log.clone());
        failing.fail = true;
        let mut panicking = Recorder::new("panicking", "m", log.clone());
        panicking.panic = true;

        let mut manager = MiddlewareManager::new();
        manager.register(Arc::new(failing));
        manager.register(Arc::new(panicking));
        manager.register(Arc::new(Recorder::new("healthy", "m", log.clone())));

        let mut messages = Vec::new();
        let results = manager
            .before_request(&mut request_ctx("m", &mut messages))
            .await;

        assert_eq!(results.len(), 3);
        assert!(!results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("middleware exploded"));
        assert!(results[2].success);
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_runs_once_and_tolerates_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recorder::new("failing", "m", log.clone());
        failing.fail = true;

        let mut manager = MiddlewareManager::new();
        manager.register(Arc::new(failing));
        manager.register(Arc::new(Recorder::new("ok", "m", log.clone())));

        let first = manager.initialize().await;
        assert_eq!(first.len(), 2);
        assert!(!first[0].success);
        assert!(first[1].success);

        assert!(manager.initialize().await.is_empty());
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stream_chunk_metadata_is_shared() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = MiddlewareManager::new();
        manager.register(Arc::new(Recorder::new("a", "m", log.clone())));
        manager.register(Arc::new(Recorder::new("b", "m", log)));

        let mut metadata = StreamMetadata::new();
        let mut chunk = json!({"choices": [{"delta": {"content": "hi"}}]});
        for _ in 0..2 {
            let mut ctx = StreamChunkContext {
                model_id: "m",
                chunk: &mut chunk,
                metadata: &mut metadata,
            };
            manager.after_stream_chunk(&mut ctx).await;
        }

        assert_eq!(metadata["chunks"], 4);
        assert_eq!(chunk["choices"][0]["delta"]["seen_by"], "b");
    }

    #[test]
    fn test_with_defaults_registers_thought_signature() {
        let manager = MiddlewareManager::with_defaults();
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.active_middlewares("google/gemini-2.5-pro").len(), 1);
        assert!(manager.active_middlewares("openai/gpt-4o").is_empty());
    }
}
