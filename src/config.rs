//! 配置
//!
//! 配置来源（后者覆盖前者）：
//!
//! 1. 内置默认值
//! 2. YAML 配置文件（`--config` 指定，或 `~/.claudish/config.yaml`）
//! 3. 环境变量（`OPENROUTER_API_KEY`、`CLAUDISH_MODEL`、`CLAUDISH_PORT` 等）
//!
//! ```yaml
//! server:
//!   port: 3000
//! upstream:
//!   api_key: sk-or-...
//! models:
//!   default: x-ai/grok-code-fast-1
//!   haiku: google/gemini-2.5-flash
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::telemetry::{default_usage_path, Pricing};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_REFERER: &str = "https://github.com/MadAppGang/claude-code";
pub const DEFAULT_TITLE: &str = "Claude Code Proxy";
pub const DEFAULT_CONTEXT_WINDOW: u32 = 200_000;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("解析配置文件失败: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    Invalid(String),
}

/// 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub models: ModelsConfig,
    pub streaming: StreamingConfig,
    pub logging: LoggingConfig,
}

/// 监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 请求体上限（字节）
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            body_limit_bytes: 32 * 1024 * 1024,
        }
    }
}

/// 上游（聚合 API）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_key: String,
    pub base_url: String,
    /// `HTTP-Referer` 头
    pub referer: String,
    /// `X-Title` 头
    pub title: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl UpstreamConfig {
    /// `POST {base}/chat/completions`
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            title: DEFAULT_TITLE.to_string(),
            connect_timeout_secs: 30,
            request_timeout_secs: 600,
        }
    }
}

/// 模型映射
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// 默认目标模型；为空时原样转发客户端请求的模型名
    pub default: Option<String>,
    pub opus: Option<String>,
    pub sonnet: Option<String>,
    pub haiku: Option<String>,
    /// 未命中任何档位时使用（子代理请求）
    pub subagent: Option<String>,
    pub context_window: u32,
    pub pricing: Pricing,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default: None,
            opus: None,
            sonnet: None,
            haiku: None,
            subagent: None,
            context_window: DEFAULT_CONTEXT_WINDOW,
            pricing: Pricing::default(),
        }
    }
}

/// 流式配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// 心跳间隔（毫秒）
    pub keepalive_interval_ms: u64,
    /// token 统计侧文件；为空时使用 `<tmp>/claudish-tokens-<port>.json`
    pub token_file: Option<PathBuf>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 1000,
            token_file: None,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// 同时写入调试日志文件
    pub debug: bool,
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            debug: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// 加载配置：文件 + 环境变量
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_yaml_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!("[CONFIG] 读取配置文件: {}", path.display());
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// 应用环境变量覆盖
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OPENROUTER_API_KEY") {
            self.upstream.api_key = v;
        }
        if let Some(v) = get("OPENROUTER_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = get("CLAUDISH_MODEL") {
            self.models.default = Some(v);
        }
        if let Some(v) = get("CLAUDISH_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("CLAUDISH_PORT") {
            self.server.port = v
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("CLAUDISH_PORT 不是合法端口: {}", v)))?;
        }
        if let Some(v) = get("CLAUDISH_MODEL_OPUS") {
            self.models.opus = Some(v);
        }
        if let Some(v) = get("CLAUDISH_MODEL_SONNET") {
            self.models.sonnet = Some(v);
        }
        if let Some(v) = get("CLAUDISH_MODEL_HAIKU") {
            self.models.haiku = Some(v);
        }
        if let Some(v) = get("CLAUDISH_MODEL_SUBAGENT") {
            self.models.subagent = Some(v);
        }
        if let Some(v) = get("CLAUDISH_DEBUG") {
            self.logging.debug = matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("CLAUDISH_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("CLAUDISH_CONTEXT_WINDOW") {
            self.models.context_window = v.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("CLAUDISH_CONTEXT_WINDOW 不是合法数字: {}", v))
            })?;
        }
        Ok(())
    }

    /// 校验必填项
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "缺少 OpenRouter API Key（设置 OPENROUTER_API_KEY）".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("端口不能为 0".to_string()));
        }
        if self.streaming.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid("心跳间隔必须大于 0".to_string()));
        }
        Ok(())
    }

    /// 把客户端请求的模型名映射为上游模型 ID
    ///
    /// 档位覆盖（opus/sonnet/haiku，然后 subagent）优先，其次默认模型，最后原样转发。
    pub fn resolve_model(&self, requested: &str) -> String {
        let lower = requested.to_lowercase();
        let tiers: [(&str, Option<&String>); 3] = [
            ("opus", self.models.opus.as_ref()),
            ("sonnet", self.models.sonnet.as_ref()),
            ("haiku", self.models.haiku.as_ref()),
        ];
        let tier = tiers
            .into_iter()
            .find_map(|(name, model)| model.filter(|_| lower.contains(name)).cloned());

        tier.or_else(|| self.models.subagent.clone())
            .or_else(|| self.models.default.clone())
            .unwrap_or_else(|| requested.to_string())
    }

    /// 对外展示的默认模型
    pub fn display_model(&self) -> &str {
        self.models.default.as_deref().unwrap_or("passthrough")
    }

    pub fn token_file_path(&self) -> PathBuf {
        self.streaming
            .token_file
            .clone()
            .unwrap_or_else(|| default_usage_path(self.server.port))
    }
}

/// `~/.claudish/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claudish").join("config.yaml"))
}
