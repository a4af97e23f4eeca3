//! OpenRouter chat-completions 客户端
//!
//! 核心层不做重试：非 2xx 直接转换为 `ProxyError::Upstream`，由调用方决定如何呈现。

use reqwest::Client;
use std::time::Duration;

use crate::config::UpstreamConfig;
use crate::error::ProxyError;
use crate::logger::sanitize_log_message;
use crate::models::openai::ChatCompletionRequest;

/// 上游客户端
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    url: String,
    api_key: String,
    referer: String,
    title: String,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90)) // 连接池空闲超时
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| ProxyError::Internal(format!("创建 HTTP 客户端失败: {}", e)))?;

        Ok(Self {
            client,
            url: config.chat_completions_url(),
            api_key: config.api_key.clone(),
            referer: config.referer.clone(),
            title: config.title.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 发送请求；2xx 返回原始响应（流式时由调用方读取 body）
    pub async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProxyError> {
        tracing::info!(
            "[UPSTREAM] 发送请求: url={} model={} stream={}",
            self.url,
            request.model,
            request.stream
        );

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| ProxyError::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        tracing::info!(
            "[UPSTREAM] 响应状态: status={} model={}",
            status,
            request.model
        );

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        tracing::error!(
            "[UPSTREAM] 上游返回错误: status={} body={}",
            status,
            sanitize_log_message(&body)
        );
        Err(ProxyError::Upstream {
            status: status.as_u16(),
            body,
        })
    }
}
