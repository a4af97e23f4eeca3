//! claudish 入口
//!
//! 配置文件路径：第一个命令行参数，其次 `CLAUDISH_CONFIG`，最后 `~/.claudish/config.yaml`。

use std::path::PathBuf;
use std::process::ExitCode;

use claudish_lib::{config::Config, logger, start_server};

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CLAUDISH_CONFIG").ok())
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[CONFIG] 加载配置失败: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match logger::init_logging(&config.logging) {
        Ok(Some(path)) => tracing::info!("[CONFIG] 调试日志: {}", path.display()),
        Ok(None) => {}
        Err(e) => eprintln!("[CONFIG] 日志初始化失败: {:#}", e),
    }

    if let Err(e) = config.validate() {
        tracing::error!("[CONFIG] {}", e);
        return ExitCode::FAILURE;
    }

    match start_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("[PROXY] {:#}", e);
            ExitCode::FAILURE
        }
    }
}
