//! 请求处理器

pub mod count_tokens;
pub mod health;
pub mod messages;

use axum::body::Bytes;
use serde::de::DeserializeOwned;

use crate::error::ProxyError;

/// 从原始字节解析请求体；格式错误返回 400
pub(crate) fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ProxyError> {
    serde_json::from_slice(body).map_err(|e| ProxyError::InvalidRequest(format!("请求体解析失败: {}", e)))
}
