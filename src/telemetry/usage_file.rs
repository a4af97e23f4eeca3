//! Token 统计侧文件
//!
//! 写入 `<tmp>/claudish-tokens-<port>.json`，供外部状态栏显示费用和剩余上下文。
//! 写入失败只记录日志，不影响转换流程。
//!
//! 在 tokio 运行时内，文件写入交给 `spawn_blocking`，不占用异步工作线程；
//! 并发写入按版本号丢弃过期快照，文件内容只会前进。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 每百万 token 价格（美元）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_per_million: f64,
    #[serde(default)]
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// 侧文件内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub context_window: u32,
    pub context_left_percent: u32,
    /// Unix 毫秒时间戳
    pub updated_at: i64,
}

/// 默认路径：系统临时目录下按端口区分
pub fn default_usage_path(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("claudish-tokens-{}.json", port))
}

#[derive(Debug, Default)]
struct Totals {
    snapshot: UsageSnapshot,
    version: u64,
}

/// 侧文件写入器（克隆后共享累计值）
#[derive(Debug, Clone)]
pub struct UsageFile {
    path: PathBuf,
    context_window: u32,
    pricing: Pricing,
    totals: Arc<Mutex<Totals>>,
    /// 已落盘的最新版本
    written: Arc<Mutex<u64>>,
}

impl UsageFile {
    pub fn new(path: impl Into<PathBuf>, context_window: u32, pricing: Pricing) -> Self {
        Self {
            path: path.into(),
            context_window,
            pricing,
            totals: Arc::new(Mutex::new(Totals {
                snapshot: UsageSnapshot {
                    context_window,
                    context_left_percent: 100,
                    ..Default::default()
                },
                version: 0,
            })),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 累计一次请求的用量并写入文件
    ///
    /// 返回更新后的累计值；运行时内文件写入在后台完成。
    pub fn record(&self, input_tokens: u32, output_tokens: u32) -> UsageSnapshot {
        let (snapshot, version) = {
            let mut guard = self.totals.lock();
            guard.version += 1;
            let version = guard.version;
            let totals = &mut guard.snapshot;
            totals.input_tokens += input_tokens as u64;
            totals.output_tokens += output_tokens as u64;
            totals.total_tokens = totals.input_tokens + totals.output_tokens;
            totals.total_cost += self.pricing.cost(input_tokens, output_tokens);
            totals.context_window = self.context_window;
            // 当前上下文占用 = 本次请求的输入 + 输出
            totals.context_left_percent =
                context_left_percent(input_tokens as u64 + output_tokens as u64, self.context_window);
            totals.updated_at = chrono::Utc::now().timestamp_millis();
            (totals.clone(), version)
        };

        let path = self.path.clone();
        let written = self.written.clone();
        let pending = snapshot.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || write_snapshot(&path, &written, version, &pending));
            }
            Err(_) => write_snapshot(&path, &written, version, &pending),
        }
        snapshot
    }
}

/// 写入快照；比已落盘版本旧的快照直接丢弃
fn write_snapshot(path: &Path, written: &Mutex<u64>, version: u64, snapshot: &UsageSnapshot) {
    let mut last = written.lock();
    if version <= *last {
        tracing::debug!("[TELEMETRY] 跳过过期的 token 统计快照 v{}", version);
        return;
    }
    match serde_json::to_vec_pretty(snapshot) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(path, bytes) {
                tracing::warn!("[TELEMETRY] 写入 token 文件失败 {}: {}", path.display(), e);
                return;
            }
            *last = version;
        }
        Err(e) => tracing::warn!("[TELEMETRY] 序列化 token 统计失败: {}", e),
    }
}

fn context_left_percent(used: u64, context_window: u32) -> u32 {
    if context_window == 0 {
        return 0;
    }
    let left = (context_window as u64).saturating_sub(used);
    ((left * 100) / context_window as u64) as u32
}
