//! 用量统计模块
//!
//! 提供 Token 估算和 token 统计侧文件

mod tokens;
mod usage_file;

pub use tokens::{TokenEstimator, TokenEstimatorError};
pub use usage_file::{default_usage_path, Pricing, UsageFile, UsageSnapshot};
