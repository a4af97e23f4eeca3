//! 协议转换器 Trait 定义
//!
//! `RequestTranslator` 把下游协议请求转换为上游协议请求。
//! 响应方向没有统一 trait：非流式是纯函数，流式由 `stream` 模块的状态机负责。

use thiserror::Error;

/// 请求转换器 Trait
///
/// # 类型参数
///
/// - `Input`: 下游请求类型（Anthropic MessagesRequest）
/// - `Output`: 上游请求类型（及附带信息）
/// - `Error`: 转换错误类型
pub trait RequestTranslator {
    type Input;
    type Output;
    type Error: std::error::Error + Send + Sync + 'static;

    fn translate_request(&self, request: Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 转换错误类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateErrorKind {
    /// 缺少必要字段
    MissingField,
    /// 不支持的功能
    UnsupportedFeature,
}

impl std::fmt::Display for TranslateErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField => write!(f, "MissingField"),
            Self::UnsupportedFeature => write!(f, "UnsupportedFeature"),
        }
    }
}

/// 转换错误
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct TranslateError {
    pub kind: TranslateErrorKind,
    pub message: String,
}

impl TranslateError {
    pub fn new(kind: TranslateErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            TranslateErrorKind::MissingField,
            format!("Missing required field: {}", field),
        )
    }

    pub fn unsupported(feature: &str) -> Self {
        Self::new(
            TranslateErrorKind::UnsupportedFeature,
            format!("Unsupported feature: {}", feature),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_error_display() {
        let err = TranslateError::missing_field("messages");
        assert_eq!(err.kind, TranslateErrorKind::MissingField);
        assert_eq!(
            err.to_string(),
            "MissingField: Missing required field: messages"
        );
    }
}
