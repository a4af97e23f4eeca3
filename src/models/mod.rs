//! 协议数据模型
//!
//! - `anthropic`: 下游 Messages API
//! - `openai`: 上游 OpenAI 兼容 Chat Completions API

pub mod anthropic;
pub mod openai;
