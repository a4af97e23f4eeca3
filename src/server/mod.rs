//! HTTP 服务
//!
//! 对外暴露 Anthropic 兼容端点：
//! - `POST /v1/messages`
//! - `POST /v1/messages/count_tokens`
//! - `GET /health`
//! - `GET /`

pub mod handlers;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, Uri};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::config::Config;
use crate::error::ProxyError;
use crate::middleware::MiddlewareManager;
use crate::telemetry::{TokenEstimator, UsageFile};
use crate::upstream::UpstreamClient;

/// 共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: UpstreamClient,
    pub middleware: Arc<MiddlewareManager>,
    pub estimator: Arc<TokenEstimator>,
    pub usage_file: UsageFile,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config.upstream).context("创建上游客户端失败")?;
        let estimator = TokenEstimator::new().context("初始化 Token 估算器失败")?;
        let usage_file = UsageFile::new(
            config.token_file_path(),
            config.models.context_window,
            config.models.pricing,
        );

        Ok(Self {
            config: Arc::new(config),
            upstream,
            middleware: Arc::new(MiddlewareManager::with_defaults()),
            estimator: Arc::new(estimator),
            usage_file,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    let body_limit = state.config.server.body_limit_bytes;

    Router::new()
        .route("/", get(handlers::health::service_info))
        .route("/health", get(handlers::health::health))
        .route("/v1/messages", post(handlers::messages::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::count_tokens::handle_count_tokens),
        )
        .fallback(not_found)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .with_state(state)
}

async fn not_found(uri: Uri) -> ProxyError {
    ProxyError::NotFound(uri.path().to_string())
}

/// 构建状态、初始化中间件并开始监听，Ctrl-C 时优雅退出
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config)?;
    state.middleware.initialize().await;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定 {} 失败", addr))?;
    tracing::info!(
        "[PROXY] 服务已启动: http://{} -> {} (model={})",
        addr,
        state.upstream.url(),
        state.config.display_model()
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务运行失败")?;

    tracing::info!("[PROXY] 服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("[PROXY] 监听 Ctrl-C 失败: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("[PROXY] 收到退出信号");
}
