//! 协议转换层
//!
//! Anthropic Messages API 与 OpenRouter（OpenAI Chat Completions）之间的转换。
//!
//! ```text
//! translator/
//! ├── traits.rs     # 转换器 trait 与错误类型
//! ├── identity.rs   # system 提示词身份改写
//! ├── request.rs    # Anthropic → OpenRouter 请求
//! └── response.rs   # OpenRouter → Anthropic 非流式响应
//! ```
//!
//! 流式响应由 `stream` 模块的状态机处理。

pub mod identity;
pub mod request;
pub mod response;
pub mod traits;

pub use request::{convert_messages_request, AnthropicToOpenRouter, TranslatedRequest};
pub use response::translate_response;
pub use traits::{RequestTranslator, TranslateError, TranslateErrorKind};
