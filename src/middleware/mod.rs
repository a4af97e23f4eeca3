//! 中间件模块
//!
//! 按模型过滤的钩子链，承载模型专属的请求/响应修正逻辑，
//! 与流式状态机解耦。

pub mod manager;
pub mod thought_signature;
pub mod types;

pub use manager::MiddlewareManager;
pub use thought_signature::ThoughtSignatureMiddleware;
pub use types::{
    HookResult, MiddlewareError, ModelMiddleware, NonStreamingResponseContext, RequestContext,
    StreamChunkContext, StreamMetadata, THOUGHT_SIGNATURES_KEY,
};
