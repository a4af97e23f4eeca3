//! 代理错误类型
//!
//! 所有错误都以 Anthropic 错误格式返回给客户端：
//! `{"type":"error","error":{"type":..,"message":..}}`

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{json, Value};
use thiserror::Error;

use crate::translator::TranslateError;

/// 代理错误
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 请求格式错误
    #[error("无效请求: {0}")]
    InvalidRequest(String),

    /// 上游返回非 2xx
    #[error("上游返回错误 {status}: {body}")]
    Upstream { status: u16, body: String },

    /// 上游连接失败
    #[error("上游连接失败: {0}")]
    UpstreamTransport(String),

    /// 协议转换失败
    #[error("协议转换失败: {0}")]
    Translate(#[from] TranslateError),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 路由不存在
    #[error("未找到: {0}")]
    NotFound(String),
}

impl ProxyError {
    /// 获取对应的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::InvalidRequest(_) => 400,
            ProxyError::Upstream { status, .. } => *status,
            ProxyError::UpstreamTransport(_) => 502,
            ProxyError::Translate(_) => 400,
            ProxyError::Internal(_) => 500,
            ProxyError::NotFound(_) => 404,
        }
    }

    /// Anthropic 错误类型字符串
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::Translate(_) => "invalid_request_error",
            ProxyError::Upstream { status, .. } => match status {
                400 => "invalid_request_error",
                401 => "authentication_error",
                403 => "permission_error",
                404 => "not_found_error",
                413 => "request_too_large",
                429 => "rate_limit_error",
                529 => "overloaded_error",
                _ => "api_error",
            },
            ProxyError::NotFound(_) => "not_found_error",
            ProxyError::UpstreamTransport(_) | ProxyError::Internal(_) => "api_error",
        }
    }

    /// 转换为 JSON 错误响应
    ///
    /// 上游错误体若本身是 JSON 则原样透传。
    pub fn to_json(&self) -> Value {
        if let ProxyError::Upstream { body, .. } = self {
            if let Ok(value) = serde_json::from_str::<Value>(body) {
                if value.is_object() {
                    return value;
                }
            }
        }
        json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string()
            }
        })
    }

    /// 流式场景下的错误消息（不含上游 JSON 结构）
    pub fn stream_message(&self) -> String {
        match self {
            ProxyError::Upstream { body, .. } => serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| self.to_string()),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("[PROXY] {}", self);
        } else {
            tracing::warn!("[PROXY] {}", self);
        }
        (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            self.to_json().to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ProxyError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(ProxyError::UpstreamTransport("x".into()).status_code(), 502);
        assert_eq!(ProxyError::Internal("x".into()).status_code(), 500);
        assert_eq!(ProxyError::NotFound("x".into()).status_code(), 404);
        assert_eq!(
            ProxyError::Upstream {
                status: 429,
                body: String::new()
            }
            .status_code(),
            429
        );
        assert_eq!(
            ProxyError::Translate(TranslateError::missing_field("messages")).status_code(),
            400
        );
    }

    #[test]
    fn test_error_envelope() {
        let json = ProxyError::InvalidRequest("bad json".into()).to_json();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert!(json["error"]["message"].as_str().unwrap().contains("bad json"));
    }

    #[test]
    fn test_upstream_json_body_passthrough() {
        let err = ProxyError::Upstream {
            status: 401,
            body: r#"{"error":{"message":"No auth credentials found","code":401}}"#.into(),
        };
        assert_eq!(err.to_json()["error"]["code"], 401);
        assert_eq!(err.error_type(), "authentication_error");
        assert_eq!(err.stream_message(), "No auth credentials found");
    }

    #[test]
    fn test_upstream_text_body_wrapped() {
        let err = ProxyError::Upstream {
            status: 503,
            body: "Service Unavailable".into(),
        };
        let json = err.to_json();
        assert_eq!(json["error"]["type"], "api_error");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Service Unavailable"));
    }

    #[test]
    fn test_into_response_status() {
        let response = ProxyError::NotFound("/nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
