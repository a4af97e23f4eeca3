//! 日志管理模块
//!
//! 基于 tracing-subscriber：终端输出 + 调试模式下的日志文件。
//! 记录上游响应体之前先经过 `sanitize_log_message` 脱敏。

use anyhow::{Context, Result};
use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// 初始化全局日志
///
/// 优先使用 `RUST_LOG`，否则使用配置的级别；调试模式下级别提升为 debug，
/// 并额外写入 `<log_dir>/claudish_<时间戳>.log`，返回该文件路径。
pub fn init_logging(config: &LoggingConfig) -> Result<Option<PathBuf>> {
    let level = if config.debug {
        "debug"
    } else {
        config.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, log_path) = if config.debug {
        fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("创建日志目录失败: {}", config.log_dir.display()))?;
        let path = debug_log_path(&config.log_dir, &Local::now());
        let file = fs::File::create(&path)
            .with_context(|| format!("创建日志文件失败: {}", path.display()))?;
        let layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Arc::new(file));
        (Some(layer), Some(path))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("日志系统已初始化")?;

    Ok(log_path)
}

/// 调试日志文件路径
pub fn debug_log_path(dir: &Path, now: &chrono::DateTime<Local>) -> PathBuf {
    dir.join(format!("claudish_{}.log", now.format("%Y-%m-%d_%H-%M-%S")))
}

static SANITIZE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // Bearer token
        (r"Bearer\s+[A-Za-z0-9._-]+", "Bearer ***"),
        // OpenRouter key
        (r"sk-or-[A-Za-z0-9_-]+", "sk-or-***"),
        // API key 各种格式
        (
            r#"api[_-]?key["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "api_key: ***",
        ),
        // 通用 token
        (r#"token["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#, "token: ***"),
        (
            r#"access[_-]?token["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "access_token: ***",
        ),
        (
            r#"refresh[_-]?token["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "refresh_token: ***",
        ),
        (
            r#"client[_-]?secret["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "client_secret: ***",
        ),
        (
            r#"[Aa]uthorization["']?\s*[:=]\s*["']?[A-Za-z0-9._\s-]+"#,
            "authorization: ***",
        ),
        (r#"password["']?\s*[:=]\s*["']?[^\s"',}]+"#, "password: ***"),
        (
            r#"secret["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "secret: ***",
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// 日志脱敏
pub fn sanitize_log_message(message: &str) -> String {
    let mut sanitized = message.to_string();
    for (re, replacement) in SANITIZE_PATTERNS.iter() {
        sanitized = re.replace_all(&sanitized, *replacement).to_string();
    }
    sanitized
}
